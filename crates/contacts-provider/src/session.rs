use crate::aggregation::{self, AggregationReport, Aggregator};
use crate::display_name::refresh_raw_contact_display_name;
use crate::fast_index::{address_book_index, IndexBuckets, QuerySignature};
use crate::handlers::{DataPatch, DataRowHandler, HandlerContext, HandlerRegistry};
use crate::lookup::{LookupOutcome, LookupResolver};
use crate::transaction::{FlushReport, MutationEffects, TransactionContext};
use crate::ProviderError;
use chrono::{DateTime, Utc};
use contacts_core::lookup_key::LookupKey;
use contacts_core::name::NameSplitter;
use contacts_core::operation::{
    attr_bool, attr_i64, attr_string, AttributeMap, EntityKind, OperationAction, OperationDescriptor,
    Selection,
};
use contacts_core::{
    Account, AggregationMode, AttributeKind, ContactId, ContextKind, DataId, RawContactId,
    SyncStateId,
};
use contacts_storage::{ContactsStore, NewRawContactRow, RawContactChanges};
use std::sync::Arc;
use tracing::debug;

pub type RawContactUpdate = RawContactChanges;

const DATA_ROUTING_KEYS: [&str; 3] = ["raw_contact_id", "mimetype", "kind"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewRawContact {
    pub account: Option<Account>,
    pub source_id: Option<String>,
    pub aggregation_mode: AggregationMode,
    pub starred: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactUpdate {
    pub starred: Option<bool>,
    pub pinned: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Inserted(i64),
    Affected(usize),
}

/// What the commit step did with the transaction's deferred work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub flush: FlushReport,
    pub aggregation: AggregationReport,
    pub invalidate_fast_index: bool,
}

/// Everything one transaction on one context may touch. Helpers that work
/// across contexts take a session explicitly, never an ambient binding.
pub struct Session<'a> {
    kind: ContextKind,
    store: &'a ContactsStore,
    txn: &'a mut TransactionContext,
    handlers: &'a HandlerRegistry,
    aggregator: &'a dyn Aggregator,
    splitter: &'a dyn NameSplitter,
    caller_is_sync_adapter: bool,
}

impl<'a> Session<'a> {
    pub fn new(
        kind: ContextKind,
        store: &'a ContactsStore,
        txn: &'a mut TransactionContext,
        handlers: &'a HandlerRegistry,
        aggregator: &'a dyn Aggregator,
        splitter: &'a dyn NameSplitter,
    ) -> Self {
        Self {
            kind,
            store,
            txn,
            handlers,
            aggregator,
            splitter,
            caller_is_sync_adapter: false,
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Reads inside a transaction body go through here; the bindings' own
    /// read methods would wait on the lock this session runs under.
    pub fn store(&self) -> &ContactsStore {
        self.store
    }

    /// Uncached, and sees this transaction's uncommitted writes.
    pub fn fast_index(&self, signature: &QuerySignature) -> Result<IndexBuckets, ProviderError> {
        address_book_index(self.store, signature)
    }

    pub fn transaction_context(&self) -> &TransactionContext {
        &*self.txn
    }

    pub fn handler(&self, kind: &AttributeKind) -> Arc<dyn DataRowHandler> {
        self.handlers.get(kind)
    }

    pub fn caller_is_sync_adapter(&self) -> bool {
        self.caller_is_sync_adapter
    }

    pub fn set_caller_is_sync_adapter(&mut self, caller_is_sync_adapter: bool) {
        self.caller_is_sync_adapter = caller_is_sync_adapter;
    }

    pub fn insert_raw_contact(&mut self, new: NewRawContact) -> Result<RawContactId, ProviderError> {
        let account_id = new
            .account
            .as_ref()
            .map(|account| self.store.ensure_account(account))
            .transpose()?;
        let raw_contact_id = self.store.insert_raw_contact(&NewRawContactRow {
            account_id,
            source_id: new.source_id,
            aggregation_mode: new.aggregation_mode,
            starred: new.starred,
            pinned: 0,
        })?;

        self.txn.raw_contact_inserted(raw_contact_id, account_id);
        self.txn
            .mark_dirty_and_changed(raw_contact_id, self.caller_is_sync_adapter);
        self.aggregator.mark_for_aggregation(
            self.txn,
            self.store,
            raw_contact_id,
            new.aggregation_mode,
            false,
        )?;
        self.txn.request_fast_index_invalidation();
        debug!(
            event = "raw_contact_inserted",
            context = %self.kind,
            raw_contact_id = raw_contact_id.0
        );
        Ok(raw_contact_id)
    }

    pub fn update_raw_contact(
        &mut self,
        raw_contact_id: RawContactId,
        update: RawContactUpdate,
    ) -> Result<usize, ProviderError> {
        let Some(existing) = self.store.raw_contact(raw_contact_id)? else {
            return Ok(0);
        };
        if update.is_empty() {
            return Ok(0);
        }

        let updated = self.store.update_raw_contact(raw_contact_id, &update)?;
        self.txn.raw_contact_updated(raw_contact_id);
        self.txn
            .mark_dirty_and_changed(raw_contact_id, self.caller_is_sync_adapter);

        if update.starred.is_some() || update.pinned.is_some() {
            self.txn.request_fast_index_invalidation();
            if let Some(contact_id) = existing.contact_id {
                self.txn.mark_aggregate_stale(contact_id);
            }
        }
        if update.name_verified == Some(true) {
            self.store.reset_name_verified_for_siblings(raw_contact_id)?;
            if let Some(contact_id) = existing.contact_id {
                self.txn.mark_aggregate_stale(contact_id);
            }
        }
        if let Some(mode) = update.aggregation_mode {
            self.aggregator
                .mark_for_aggregation(self.txn, self.store, raw_contact_id, mode, true)?;
        }
        Ok(updated)
    }

    /// Sync adapters remove the row outright; everyone else leaves a
    /// tombstone for the next sync.
    pub fn delete_raw_contact(&mut self, raw_contact_id: RawContactId) -> Result<usize, ProviderError> {
        let Some(existing) = self.store.raw_contact(raw_contact_id)? else {
            return Ok(0);
        };

        let deleted = if self.caller_is_sync_adapter {
            let deleted = self.store.purge_raw_contact(raw_contact_id)?;
            self.txn.raw_contact_purged(raw_contact_id);
            deleted
        } else {
            let deleted = self.store.mark_raw_contact_deleted(raw_contact_id)?;
            self.txn.raw_contact_updated(raw_contact_id);
            self.txn.mark_dirty_and_changed(raw_contact_id, false);
            self.aggregator.mark_for_aggregation(
                self.txn,
                self.store,
                raw_contact_id,
                AggregationMode::Disabled,
                true,
            )?;
            deleted
        };
        if let Some(contact_id) = existing.contact_id {
            self.txn.mark_aggregate_stale(contact_id);
        }
        self.txn.request_fast_index_invalidation();
        debug!(
            event = "raw_contact_deleted",
            context = %self.kind,
            raw_contact_id = raw_contact_id.0,
            purged = self.caller_is_sync_adapter
        );
        Ok(deleted)
    }

    pub fn insert_data(
        &mut self,
        raw_contact_id: RawContactId,
        kind: &AttributeKind,
        patch: &DataPatch,
    ) -> Result<DataId, ProviderError> {
        let handler = self.handlers.get(kind);
        let (data_id, effects) = handler.insert(&self.handler_context(), raw_contact_id, patch)?;
        self.absorb(effects)?;
        Ok(data_id)
    }

    pub fn update_data(&mut self, data_id: DataId, patch: &DataPatch) -> Result<usize, ProviderError> {
        let Some(previous) = self.store.data_row(data_id)? else {
            return Ok(0);
        };
        let handler = self.handlers.get(&previous.kind);
        let effects = handler.update(&self.handler_context(), &previous, patch)?;
        self.absorb(effects)?;
        Ok(1)
    }

    pub fn delete_data(&mut self, data_id: DataId) -> Result<usize, ProviderError> {
        let Some(row) = self.store.data_row(data_id)? else {
            return Ok(0);
        };
        let handler = self.handlers.get(&row.kind);
        let effects = handler.delete(&self.handler_context(), &row)?;
        self.absorb(effects)?;
        Ok(1)
    }

    /// Writes the aggregate's flags and pushes them down to every member.
    pub fn update_contact(
        &mut self,
        contact_id: ContactId,
        update: ContactUpdate,
    ) -> Result<usize, ProviderError> {
        if self.store.contact(contact_id)?.is_none() {
            return Ok(0);
        }
        let updated = self
            .store
            .set_contact_flags(contact_id, update.starred, update.pinned)?;
        for member in self.store.raw_contacts_for_contact(contact_id)? {
            self.update_raw_contact(
                member.id,
                RawContactChanges {
                    starred: update.starred,
                    pinned: update.pinned,
                    ..RawContactChanges::default()
                },
            )?;
        }
        Ok(updated)
    }

    pub fn delete_contact(&mut self, contact_id: ContactId) -> Result<usize, ProviderError> {
        if self.store.contact(contact_id)?.is_none() {
            return Ok(0);
        }
        for member in self.store.raw_contacts_for_contact(contact_id)? {
            self.delete_raw_contact(member.id)?;
        }
        self.txn.mark_aggregate_stale(contact_id);
        Ok(1)
    }

    /// A key that no longer resolves affects nothing.
    pub fn update_contact_by_lookup_key(
        &mut self,
        key: &str,
        update: ContactUpdate,
    ) -> Result<usize, ProviderError> {
        match self.resolve_lookup_key(key)? {
            LookupOutcome::Found(contact_id) => self.update_contact(contact_id, update),
            LookupOutcome::NotFound => Ok(0),
        }
    }

    pub fn delete_contact_by_lookup_key(&mut self, key: &str) -> Result<usize, ProviderError> {
        match self.resolve_lookup_key(key)? {
            LookupOutcome::Found(contact_id) => self.delete_contact(contact_id),
            LookupOutcome::NotFound => Ok(0),
        }
    }

    pub fn insert_sync_state(&mut self, account: &Account) -> Result<SyncStateId, ProviderError> {
        let account_id = self.store.ensure_account(account)?;
        Ok(self.store.insert_sync_state(account_id)?)
    }

    /// Written at commit; a row that is gone by then fails the transaction.
    pub fn set_sync_state(&mut self, sync_state_id: SyncStateId, data: Vec<u8>) {
        self.txn.set_sync_state(sync_state_id, data);
    }

    pub fn sync_state(&self, sync_state_id: SyncStateId) -> Result<Option<Vec<u8>>, ProviderError> {
        Ok(self.store.sync_state(sync_state_id)?)
    }

    pub fn resolve_lookup_key(&self, key: &str) -> Result<LookupOutcome, ProviderError> {
        LookupResolver::new(self.store, self.kind).resolve(&LookupKey::parse(key))
    }

    pub fn resolve_lookup_key_with_hint(
        &self,
        key: &str,
        hint: ContactId,
    ) -> Result<LookupOutcome, ProviderError> {
        LookupResolver::new(self.store, self.kind).resolve_with_hint(key, hint)
    }

    pub fn lookup_key_for_contact(&self, contact_id: ContactId) -> Result<LookupKey, ProviderError> {
        aggregation::lookup_key_for_contact(self.store, contact_id)
    }

    /// Runs one descriptor with the caller's sync-adapter flag in effect.
    pub fn apply(&mut self, operation: &OperationDescriptor) -> Result<ApplyResult, ProviderError> {
        let previous = self.caller_is_sync_adapter;
        self.caller_is_sync_adapter = previous || operation.caller_is_sync_adapter;
        let result = self.dispatch(operation);
        self.caller_is_sync_adapter = previous;
        result
    }

    fn dispatch(&mut self, operation: &OperationDescriptor) -> Result<ApplyResult, ProviderError> {
        let attributes = &operation.attributes;
        match (operation.entity_kind, operation.action) {
            (EntityKind::RawContact, OperationAction::Insert) => {
                let aggregation_mode = attr_i64(attributes, "aggregation_mode")?
                    .map(AggregationMode::from_code)
                    .transpose()?
                    .unwrap_or_default();
                let raw_contact_id = self.insert_raw_contact(NewRawContact {
                    account: account_from(attributes)?,
                    source_id: attr_string(attributes, "source_id")?,
                    aggregation_mode,
                    starred: attr_bool(attributes, "starred")?.unwrap_or(false),
                })?;
                Ok(ApplyResult::Inserted(raw_contact_id.0))
            }
            (EntityKind::RawContact, OperationAction::Update) => {
                let raw_contact_id = raw_contact_target(operation)?;
                let update = raw_contact_update_from(attributes)?;
                Ok(ApplyResult::Affected(self.update_raw_contact(raw_contact_id, update)?))
            }
            (EntityKind::RawContact, OperationAction::Delete) => {
                let raw_contact_id = raw_contact_target(operation)?;
                Ok(ApplyResult::Affected(self.delete_raw_contact(raw_contact_id)?))
            }
            (EntityKind::Data, OperationAction::Insert) => {
                let raw_contact_id = match attr_i64(attributes, "raw_contact_id")? {
                    Some(id) => RawContactId(id),
                    None => raw_contact_target(operation)?,
                };
                let kind = attr_string(attributes, "mimetype")?
                    .or(attr_string(attributes, "kind")?)
                    .map(|kind| AttributeKind::parse(&kind))
                    .ok_or_else(|| ProviderError::invalid_attribute("mimetype", "required"))?;
                let patch = DataPatch::from_attributes(attributes, &DATA_ROUTING_KEYS)?;
                let data_id = self.insert_data(raw_contact_id, &kind, &patch)?;
                Ok(ApplyResult::Inserted(data_id.0))
            }
            (EntityKind::Data, OperationAction::Update) => {
                let data_id = DataId(required_id(operation)?);
                let patch = DataPatch::from_attributes(attributes, &DATA_ROUTING_KEYS)?;
                Ok(ApplyResult::Affected(self.update_data(data_id, &patch)?))
            }
            (EntityKind::Data, OperationAction::Delete) => {
                let data_id = DataId(required_id(operation)?);
                Ok(ApplyResult::Affected(self.delete_data(data_id)?))
            }
            (EntityKind::Contact, OperationAction::Insert) => Err(ProviderError::invalid_attribute(
                "entity_kind",
                "contacts are created by aggregation",
            )),
            (EntityKind::Contact, OperationAction::Update) => {
                let update = ContactUpdate {
                    starred: attr_bool(attributes, "starred")?,
                    pinned: attr_i64(attributes, "pinned")?,
                };
                let affected = match contact_target(operation)? {
                    ContactTarget::LookupKey(key) => self.update_contact_by_lookup_key(&key, update)?,
                    ContactTarget::Id(contact_id) => self.update_contact(contact_id, update)?,
                };
                Ok(ApplyResult::Affected(affected))
            }
            (EntityKind::Contact, OperationAction::Delete) => {
                let affected = match contact_target(operation)? {
                    ContactTarget::LookupKey(key) => self.delete_contact_by_lookup_key(&key)?,
                    ContactTarget::Id(contact_id) => self.delete_contact(contact_id)?,
                };
                Ok(ApplyResult::Affected(affected))
            }
            (EntityKind::SyncState, OperationAction::Insert) => {
                let account = account_from(attributes)?
                    .ok_or_else(|| ProviderError::invalid_attribute("account_type", "required"))?;
                Ok(ApplyResult::Inserted(self.insert_sync_state(&account)?.0))
            }
            (EntityKind::SyncState, OperationAction::Update) => {
                let sync_state_id = SyncStateId(required_id(operation)?);
                let data = attr_string(attributes, "data")?.unwrap_or_default();
                self.set_sync_state(sync_state_id, data.into_bytes());
                Ok(ApplyResult::Affected(1))
            }
            (EntityKind::SyncState, OperationAction::Delete) => {
                let sync_state_id = SyncStateId(required_id(operation)?);
                Ok(ApplyResult::Affected(self.store.delete_sync_state(sync_state_id)?))
            }
        }
    }

    /// Display names first, then aggregation, then the batched flush.
    pub fn finish(&mut self, now: DateTime<Utc>) -> Result<CommitSummary, ProviderError> {
        for raw_contact_id in self.txn.take_display_name_refresh() {
            let Some(raw) = self.store.raw_contact(raw_contact_id)? else {
                continue;
            };
            refresh_raw_contact_display_name(self.store, self.splitter, raw_contact_id)?;
            if let Some(contact_id) = raw.contact_id {
                self.txn.mark_aggregate_stale(contact_id);
            }
        }

        let aggregation = self.aggregator.aggregate_in_transaction(self.txn, self.store)?;
        let invalidate_fast_index = self.txn.take_fast_index_invalidation();
        let flush = self.txn.flush(self.store, now)?;
        Ok(CommitSummary {
            flush,
            aggregation,
            invalidate_fast_index,
        })
    }

    fn handler_context(&self) -> HandlerContext<'_> {
        HandlerContext {
            store: self.store,
            splitter: self.splitter,
        }
    }

    fn absorb(&mut self, mut effects: MutationEffects) -> Result<(), ProviderError> {
        for (raw_contact_id, (mode, force)) in std::mem::take(&mut effects.aggregation) {
            self.aggregator
                .mark_for_aggregation(self.txn, self.store, raw_contact_id, mode, force)?;
        }
        self.txn.apply(effects, self.caller_is_sync_adapter);
        Ok(())
    }
}

enum ContactTarget {
    LookupKey(String),
    Id(ContactId),
}

fn required_id(operation: &OperationDescriptor) -> Result<i64, ProviderError> {
    operation
        .id
        .ok_or_else(|| ProviderError::invalid_attribute("id", "required"))
}

fn raw_contact_target(operation: &OperationDescriptor) -> Result<RawContactId, ProviderError> {
    match (&operation.selection, operation.id) {
        (Some(Selection::RawContact(raw_contact_id)), _) => Ok(*raw_contact_id),
        (_, Some(id)) => Ok(RawContactId(id)),
        _ => Err(ProviderError::invalid_attribute("raw_contact_id", "required")),
    }
}

fn contact_target(operation: &OperationDescriptor) -> Result<ContactTarget, ProviderError> {
    match (&operation.selection, operation.id) {
        (Some(Selection::LookupKey(key)), _) => Ok(ContactTarget::LookupKey(key.clone())),
        (Some(Selection::Contact(contact_id)), _) => Ok(ContactTarget::Id(*contact_id)),
        (_, Some(id)) => Ok(ContactTarget::Id(ContactId(id))),
        _ => Err(ProviderError::invalid_attribute("contact_id", "required")),
    }
}

fn account_from(attributes: &AttributeMap) -> Result<Option<Account>, ProviderError> {
    let account_type = attr_string(attributes, "account_type")?;
    let account_name = attr_string(attributes, "account_name")?;
    match (account_type, account_name) {
        (Some(account_type), Some(account_name)) => {
            let account = Account::new(account_type, account_name);
            Ok(Some(match attr_string(attributes, "data_set")? {
                Some(data_set) => account.with_data_set(data_set),
                None => account,
            }))
        }
        (None, None) => Ok(None),
        _ => Err(ProviderError::invalid_attribute(
            "account",
            "account_type and account_name go together",
        )),
    }
}

fn raw_contact_update_from(attributes: &AttributeMap) -> Result<RawContactUpdate, ProviderError> {
    Ok(RawContactUpdate {
        source_id: if attributes.contains_key("source_id") {
            Some(attr_string(attributes, "source_id")?)
        } else {
            None
        },
        aggregation_mode: attr_i64(attributes, "aggregation_mode")?
            .map(AggregationMode::from_code)
            .transpose()?,
        starred: attr_bool(attributes, "starred")?,
        pinned: attr_i64(attributes, "pinned")?,
        name_verified: attr_bool(attributes, "name_verified")?,
    })
}
