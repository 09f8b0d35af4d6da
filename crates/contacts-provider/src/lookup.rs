use crate::ProviderError;
use contacts_core::lookup_key::{account_hash, LookupKey, LookupKeyBuilder, SegmentKind};
use contacts_core::{ContactId, ContextKind};
use contacts_storage::{ContactsStore, StoredRawContact};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Found(ContactId),
    NotFound,
}

impl LookupOutcome {
    pub fn contact_id(&self) -> Option<ContactId> {
        match self {
            LookupOutcome::Found(contact_id) => Some(*contact_id),
            LookupOutcome::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, LookupOutcome::Found(_))
    }

    fn from_option(contact_id: Option<ContactId>) -> Self {
        contact_id.map_or(LookupOutcome::NotFound, LookupOutcome::Found)
    }
}

pub struct LookupResolver<'a> {
    store: &'a ContactsStore,
    context: ContextKind,
}

impl<'a> LookupResolver<'a> {
    /// `context` names the store behind `store`; profile segments only resolve there.
    pub fn new(store: &'a ContactsStore, context: ContextKind) -> Self {
        Self { store, context }
    }

    /// Skips segment matching when `hint` still carries exactly this key.
    pub fn resolve_with_hint(
        &self,
        key: &str,
        hint: ContactId,
    ) -> Result<LookupOutcome, ProviderError> {
        if let Some(contact) = self.store.contact(hint)? {
            if contact.lookup.as_deref() == Some(key) {
                return Ok(LookupOutcome::Found(hint));
            }
        }
        self.resolve(&LookupKey::parse(key))
    }

    pub fn resolve(&self, key: &LookupKey) -> Result<LookupOutcome, ProviderError> {
        if key.is_empty() {
            return Ok(LookupOutcome::NotFound);
        }

        if key.has_kind(SegmentKind::Profile) {
            if self.context != ContextKind::Profile {
                debug!(
                    event = "profile_key_outside_profile",
                    context = %self.context,
                    "profile lookup key used against a non-profile store"
                );
                return Ok(LookupOutcome::NotFound);
            }
            let contact_id = self.store.contact_ids()?.into_iter().next();
            return Ok(LookupOutcome::from_option(contact_id));
        }

        // Scratch state of this resolution: segment index to matched contact.
        let mut resolved = vec![None; key.segments().len()];

        if key.has_kind(SegmentKind::SourceId) {
            if let Some(contact_id) = self.resolve_by_source_id(key, &mut resolved)? {
                return Ok(LookupOutcome::Found(contact_id));
            }
        }

        if key.has_kind(SegmentKind::RawContactId) {
            if let Some(contact_id) = self.resolve_by_raw_contact_id(key, &mut resolved)? {
                return Ok(LookupOutcome::Found(contact_id));
            }
        }

        if let Some(contact_id) = self.resolve_by_display_name(key, &mut resolved)? {
            return Ok(LookupOutcome::Found(contact_id));
        }

        warn!(event = "lookup_identity_lost", key = %key);
        Ok(LookupOutcome::NotFound)
    }

    fn resolve_by_source_id(
        &self,
        key: &LookupKey,
        resolved: &mut [Option<ContactId>],
    ) -> Result<Option<ContactId>, ProviderError> {
        let source_ids = key
            .segments()
            .iter()
            .filter(|segment| segment.kind == SegmentKind::SourceId)
            .map(|segment| segment.key.as_str())
            .collect::<Vec<_>>();

        for candidate in self.store.lookup_candidates_by_source_id(&source_ids)? {
            let hash = account_hash(candidate.account.as_ref());
            for (index, segment) in key.segments().iter().enumerate() {
                if segment.kind == SegmentKind::SourceId
                    && segment.account_hash == hash
                    && candidate.source_id.as_deref() == Some(segment.key.as_str())
                {
                    resolved[index] = candidate.contact_id;
                }
            }
        }

        let contact_id = most_referenced_contact(resolved);
        debug!(event = "lookup_by_source_id", found = contact_id.is_some());
        Ok(contact_id)
    }

    fn resolve_by_raw_contact_id(
        &self,
        key: &LookupKey,
        resolved: &mut [Option<ContactId>],
    ) -> Result<Option<ContactId>, ProviderError> {
        let raw_contact_ids = key
            .segments()
            .iter()
            .filter(|segment| segment.kind == SegmentKind::RawContactId)
            .filter_map(|segment| segment.raw_contact_id)
            .collect::<Vec<_>>();

        for candidate in self.store.lookup_candidates_by_id(&raw_contact_ids)? {
            let hash = account_hash(candidate.account.as_ref());
            for (index, segment) in key.segments().iter().enumerate() {
                if segment.kind == SegmentKind::RawContactId
                    && segment.account_hash == hash
                    && segment.raw_contact_id == Some(candidate.id)
                {
                    resolved[index] = candidate.contact_id;
                }
            }
        }

        Ok(most_referenced_contact(resolved))
    }

    /// Display-name segments, plus raw-contact segments matched by their
    /// embedded name instead of their id.
    fn resolve_by_display_name(
        &self,
        key: &LookupKey,
        resolved: &mut [Option<ContactId>],
    ) -> Result<Option<ContactId>, ProviderError> {
        let names = key
            .segments()
            .iter()
            .filter(|segment| uses_name_lookup(segment.kind) && !segment.key.is_empty())
            .map(|segment| segment.key.as_str())
            .collect::<Vec<_>>();
        if names.is_empty() {
            return Ok(None);
        }

        for candidate in self.store.lookup_candidates_by_name(&names)? {
            let hash = account_hash(candidate.raw_contact.account.as_ref());
            for (index, segment) in key.segments().iter().enumerate() {
                if uses_name_lookup(segment.kind)
                    && segment.account_hash == hash
                    && segment.key == candidate.normalized_name
                {
                    resolved[index] = candidate.raw_contact.contact_id;
                }
            }
        }

        Ok(most_referenced_contact(resolved))
    }
}

fn uses_name_lookup(kind: SegmentKind) -> bool {
    matches!(kind, SegmentKind::DisplayName | SegmentKind::RawContactId)
}

/// Picks the contact id most segments agree on.
///
/// Ids are sorted and scanned in runs. A closed run only replaces the best
/// run when strictly longer, while the run still open at the end of the scan
/// wins ties: `[5, 5, 7]` yields 5 but `[5, 7]` yields 7.
pub fn most_referenced_contact(resolved: &[Option<ContactId>]) -> Option<ContactId> {
    let mut ids = resolved.iter().flatten().copied().collect::<Vec<_>>();
    ids.sort();

    let mut best: Option<(ContactId, usize)> = None;
    let mut run: Option<(ContactId, usize)> = None;
    for id in ids {
        match run {
            Some((current, count)) if current == id => run = Some((current, count + 1)),
            _ => {
                if let Some((current, count)) = run {
                    if best.map_or(true, |(_, best_count)| count > best_count) {
                        best = Some((current, count));
                    }
                }
                run = Some((id, 1));
            }
        }
    }

    if let Some((current, count)) = run {
        if best.map_or(true, |(_, best_count)| count >= best_count) {
            best = Some((current, count));
        }
    }
    best.map(|(contact_id, _)| contact_id)
}

/// Builds the key of an aggregate from its live raw contacts, in id order.
pub fn lookup_key_for(raw_contacts: &[StoredRawContact]) -> LookupKey {
    let mut members = raw_contacts
        .iter()
        .filter(|raw_contact| !raw_contact.deleted)
        .collect::<Vec<_>>();
    members.sort_by_key(|raw_contact| raw_contact.id);

    let mut builder = LookupKeyBuilder::new();
    for raw_contact in members {
        match raw_contact
            .source_id
            .as_deref()
            .filter(|source_id| !source_id.is_empty())
        {
            Some(source_id) => {
                builder.push_source_id(raw_contact.account.as_ref(), source_id);
            }
            None => {
                builder.push_raw_contact(
                    raw_contact.account.as_ref(),
                    raw_contact.id,
                    raw_contact.display_name.as_deref(),
                );
            }
        }
    }
    builder.build()
}
