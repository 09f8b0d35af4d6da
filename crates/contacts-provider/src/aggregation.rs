use crate::lookup::lookup_key_for;
use crate::transaction::TransactionContext;
use crate::ProviderError;
use contacts_core::lookup_key::LookupKey;
use contacts_core::name::normalize;
use contacts_core::{AggregationMode, AttributeKind, ContactId, RawContactId};
use contacts_storage::{ContactSummary, ContactsStore, StoredRawContact};
use std::cmp::Reverse;
use tracing::debug;

const PROFILE_LOOKUP: &str = "profile";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub joined: usize,
    pub created: usize,
    pub detached: usize,
    pub recomputed: usize,
    pub deleted: usize,
}

impl AggregationReport {
    fn changed_membership(&self) -> bool {
        self.joined + self.created + self.detached + self.deleted > 0
    }
}

/// Places raw contacts into aggregates at commit time.
pub trait Aggregator: Send + Sync {
    fn mark_for_aggregation(
        &self,
        txn: &mut TransactionContext,
        store: &ContactsStore,
        raw_contact_id: RawContactId,
        mode: AggregationMode,
        force: bool,
    ) -> Result<(), ProviderError> {
        txn.mark_for_aggregation(raw_contact_id, mode, force);
        store.mark_aggregation_needed(raw_contact_id)?;
        Ok(())
    }

    fn aggregate_in_transaction(
        &self,
        txn: &mut TransactionContext,
        store: &ContactsStore,
    ) -> Result<AggregationReport, ProviderError>;
}

/// Joins raw contacts whose normalized display names are identical.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactNameAggregator;

impl ExactNameAggregator {
    fn find_match(
        store: &ContactsStore,
        normalized: &str,
        exclude: Option<ContactId>,
    ) -> Result<Option<ContactId>, ProviderError> {
        if normalized.is_empty() {
            return Ok(None);
        }
        Ok(store
            .contact_display_names()?
            .into_iter()
            .filter(|(contact_id, _)| Some(*contact_id) != exclude)
            .find(|(_, display_name)| {
                display_name.as_deref().map(normalize).as_deref() == Some(normalized)
            })
            .map(|(contact_id, _)| contact_id))
    }

    /// A raw contact stays in its aggregate while it is alone there or some
    /// other member still carries the same name.
    fn fits_current(
        store: &ContactsStore,
        raw: &StoredRawContact,
        contact_id: ContactId,
        normalized: &str,
    ) -> Result<bool, ProviderError> {
        let others = store
            .raw_contacts_for_contact(contact_id)?
            .into_iter()
            .filter(|member| member.id != raw.id)
            .collect::<Vec<_>>();
        Ok(others.is_empty()
            || others
                .iter()
                .any(|member| member.display_name.as_deref().map(normalize).as_deref() == Some(normalized)))
    }
}

impl Aggregator for ExactNameAggregator {
    fn aggregate_in_transaction(
        &self,
        txn: &mut TransactionContext,
        store: &ContactsStore,
    ) -> Result<AggregationReport, ProviderError> {
        let marked = txn.take_marked_for_aggregation();
        let mut touched = txn.take_stale_aggregates();
        let mut report = AggregationReport::default();

        for (raw_contact_id, requested) in marked {
            let Some(raw) = store.raw_contact(raw_contact_id)? else {
                continue;
            };
            let mode = effective_mode(requested, raw.aggregation_mode);
            let current = raw.contact_id;
            touched.extend(current);

            if raw.deleted || mode == AggregationMode::Disabled {
                if current.is_some() {
                    store.set_raw_contact_aggregate(raw_contact_id, None)?;
                    report.detached += 1;
                }
                continue;
            }

            let normalized = raw.display_name.as_deref().map(normalize).unwrap_or_default();
            if let Some(contact_id) = current {
                if mode == AggregationMode::Suspended
                    || Self::fits_current(store, &raw, contact_id, &normalized)?
                {
                    store.set_raw_contact_aggregate(raw_contact_id, Some(contact_id))?;
                    continue;
                }
                store.set_raw_contact_aggregate(raw_contact_id, None)?;
                recompute_contact(store, contact_id, None)?;
                report.detached += 1;
            }

            let matched = if mode == AggregationMode::Suspended {
                None
            } else {
                Self::find_match(store, &normalized, current)?
            };
            let target = match matched {
                Some(contact_id) => {
                    report.joined += 1;
                    contact_id
                }
                None => {
                    report.created += 1;
                    store.insert_contact()?
                }
            };
            store.set_raw_contact_aggregate(raw_contact_id, Some(target))?;
            for kind in store.conflicting_super_primary_kinds(target)? {
                store.clear_super_primary_for_contact(target, &kind)?;
            }
            recompute_contact(store, target, None)?;
            touched.insert(target);
        }

        for contact_id in touched {
            if recompute_contact(store, contact_id, None)? {
                report.recomputed += 1;
                txn.invalidate_search_index_for_contact(contact_id);
            } else {
                report.deleted += 1;
            }
        }
        if report.changed_membership() {
            txn.request_fast_index_invalidation();
        }
        debug!(
            event = "aggregation_pass",
            joined = report.joined,
            created = report.created,
            detached = report.detached,
            recomputed = report.recomputed,
            deleted = report.deleted
        );
        Ok(report)
    }
}

/// Every live raw contact of the profile store belongs to the one profile
/// contact.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProfileAggregator;

impl Aggregator for ProfileAggregator {
    fn aggregate_in_transaction(
        &self,
        txn: &mut TransactionContext,
        store: &ContactsStore,
    ) -> Result<AggregationReport, ProviderError> {
        let marked = txn.take_marked_for_aggregation();
        let mut touched = txn.take_stale_aggregates();
        let mut report = AggregationReport::default();

        for (raw_contact_id, requested) in marked {
            let Some(raw) = store.raw_contact(raw_contact_id)? else {
                continue;
            };
            touched.extend(raw.contact_id);
            if raw.deleted || effective_mode(requested, raw.aggregation_mode) == AggregationMode::Disabled {
                if raw.contact_id.is_some() {
                    store.set_raw_contact_aggregate(raw_contact_id, None)?;
                    report.detached += 1;
                }
                continue;
            }

            let profile = match store.contact_by_lookup(PROFILE_LOOKUP)? {
                Some(contact_id) => contact_id,
                None => {
                    report.created += 1;
                    store.insert_contact()?
                }
            };
            if raw.contact_id != Some(profile) {
                report.joined += 1;
            }
            store.set_raw_contact_aggregate(raw_contact_id, Some(profile))?;
            // Stamp the lookup now so later rows in this pass find it.
            recompute_contact(store, profile, Some(PROFILE_LOOKUP))?;
            touched.insert(profile);
        }

        for contact_id in touched {
            if recompute_contact(store, contact_id, Some(PROFILE_LOOKUP))? {
                report.recomputed += 1;
                txn.invalidate_search_index_for_contact(contact_id);
            } else {
                report.deleted += 1;
            }
        }
        if report.changed_membership() {
            txn.request_fast_index_invalidation();
        }
        Ok(report)
    }
}

/// `Immediate` behaves like `Default`; a default request defers to the
/// mode stored on the row.
fn effective_mode(requested: AggregationMode, stored: AggregationMode) -> AggregationMode {
    match requested {
        AggregationMode::Default | AggregationMode::Immediate => match stored {
            AggregationMode::Immediate => AggregationMode::Default,
            other => other,
        },
        other => other,
    }
}

/// Rewrites the aggregate's summary from its live members, deleting the
/// aggregate when none are left. Returns whether it still exists.
pub fn recompute_contact(
    store: &ContactsStore,
    contact_id: ContactId,
    lookup_override: Option<&str>,
) -> Result<bool, ProviderError> {
    if store.contact(contact_id)?.is_none() {
        return Ok(false);
    }
    let members = store.raw_contacts_for_contact(contact_id)?;
    if members.is_empty() {
        store.delete_contact(contact_id)?;
        debug!(event = "aggregate_removed", contact_id = contact_id.0);
        return Ok(false);
    }

    let name_raw_contact = members
        .iter()
        .max_by_key(|member| (member.display_name_source, member.name_verified, Reverse(member.id)));
    let lookup = match lookup_override {
        Some(lookup) => lookup.to_string(),
        None => lookup_key_for(&members).to_string(),
    };
    let summary = ContactSummary {
        name_raw_contact_id: name_raw_contact.map(|member| member.id),
        display_name: name_raw_contact.and_then(|member| member.display_name.clone()),
        display_name_alt: name_raw_contact.and_then(|member| member.display_name_alt.clone()),
        sort_key: name_raw_contact.and_then(|member| member.sort_key.clone()),
        sort_key_alt: name_raw_contact.and_then(|member| member.sort_key_alt.clone()),
        starred: members.iter().any(|member| member.starred),
        pinned: members.iter().map(|member| member.pinned).max().unwrap_or_default(),
        has_phone_number: store.contact_has_data_of_kind(contact_id, &AttributeKind::Phone)?,
        lookup: Some(lookup),
    };
    store.update_contact_summary(contact_id, &summary)?;
    Ok(true)
}

/// Lookup key of an aggregate as it would be stored on recompute.
pub fn lookup_key_for_contact(
    store: &ContactsStore,
    contact_id: ContactId,
) -> Result<LookupKey, ProviderError> {
    Ok(lookup_key_for(&store.raw_contacts_for_contact(contact_id)?))
}
