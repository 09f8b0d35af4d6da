use crate::search::SearchIndexer;
use crate::ProviderError;
use chrono::{DateTime, Utc};
use contacts_core::{AccountId, AggregationMode, ContactId, RawContactId, SyncStateId};
use contacts_storage::ContactsStore;
use std::collections::{BTreeMap, BTreeSet};

/// What one row mutation wants recorded for the rest of the transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationEffects {
    pub dirty_and_changed: BTreeSet<RawContactId>,
    pub updated: BTreeSet<RawContactId>,
    pub stale_search: BTreeSet<RawContactId>,
    pub display_name_refresh: BTreeSet<RawContactId>,
    pub aggregation: BTreeMap<RawContactId, (AggregationMode, bool)>,
    pub invalidate_fast_index: bool,
}

impl MutationEffects {
    /// Dirty, changed and version-bumped: the baseline for any data row write.
    pub fn touched(raw_contact_id: RawContactId) -> Self {
        let mut effects = Self::default();
        effects.dirty_and_changed.insert(raw_contact_id);
        effects.updated.insert(raw_contact_id);
        effects
    }

    pub fn stale_search(&mut self, raw_contact_id: RawContactId) -> &mut Self {
        self.stale_search.insert(raw_contact_id);
        self
    }

    pub fn refresh_display_name(&mut self, raw_contact_id: RawContactId) -> &mut Self {
        self.display_name_refresh.insert(raw_contact_id);
        self
    }

    pub fn aggregate(&mut self, raw_contact_id: RawContactId) -> &mut Self {
        self.aggregation
            .entry(raw_contact_id)
            .or_insert((AggregationMode::Default, false));
        self
    }

    pub fn invalidate_fast_index(&mut self) -> &mut Self {
        self.invalidate_fast_index = true;
        self
    }

    pub fn merge(&mut self, other: MutationEffects) {
        self.dirty_and_changed.extend(other.dirty_and_changed);
        self.updated.extend(other.updated);
        self.stale_search.extend(other.stale_search);
        self.display_name_refresh.extend(other.display_name_refresh);
        for (raw_contact_id, request) in other.aggregation {
            self.aggregation.insert(raw_contact_id, request);
        }
        self.invalidate_fast_index |= other.invalidate_fast_index;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub dirty_rows: usize,
    pub version_bumps: usize,
    pub contacts_touched: usize,
    pub sync_states_written: usize,
    pub search_index_contacts: usize,
    pub search_index_raw_contacts: usize,
}

/// Deferred side effects of the transaction in flight on one context.
#[derive(Debug, Default)]
pub struct TransactionContext {
    inserted_raw_contacts: BTreeMap<RawContactId, Option<AccountId>>,
    dirty_raw_contacts: BTreeSet<RawContactId>,
    updated_raw_contacts: BTreeSet<RawContactId>,
    changed_raw_contacts: BTreeSet<RawContactId>,
    stale_search_raw_contacts: BTreeSet<RawContactId>,
    stale_search_contacts: BTreeSet<ContactId>,
    marked_for_aggregation: BTreeMap<RawContactId, AggregationMode>,
    stale_aggregates: BTreeSet<ContactId>,
    display_name_refresh: BTreeSet<RawContactId>,
    pending_sync_state: BTreeMap<SyncStateId, Vec<u8>>,
    invalidate_fast_index: bool,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Search staleness survives: a quick follow-up transaction must not
    /// swallow an index invalidation that has not been flushed yet.
    pub fn begin(&mut self) {
        self.clear_except_search_index();
    }

    pub fn raw_contact_inserted(&mut self, raw_contact_id: RawContactId, account_id: Option<AccountId>) {
        self.inserted_raw_contacts.insert(raw_contact_id, account_id);
        self.mark_changed_or_deleted_or_inserted(raw_contact_id);
    }

    pub fn is_new_raw_contact(&self, raw_contact_id: RawContactId) -> bool {
        self.inserted_raw_contacts.contains_key(&raw_contact_id)
    }

    pub fn inserted_account(&self, raw_contact_id: RawContactId) -> Option<AccountId> {
        self.inserted_raw_contacts
            .get(&raw_contact_id)
            .copied()
            .flatten()
    }

    pub fn mark_dirty_and_changed(&mut self, raw_contact_id: RawContactId, caller_is_sync_adapter: bool) {
        if !caller_is_sync_adapter {
            self.dirty_raw_contacts.insert(raw_contact_id);
        }
        self.mark_changed_or_deleted_or_inserted(raw_contact_id);
    }

    /// Version bumps only apply to rows that existed before this transaction.
    pub fn raw_contact_updated(&mut self, raw_contact_id: RawContactId) {
        if !self.is_new_raw_contact(raw_contact_id) {
            self.updated_raw_contacts.insert(raw_contact_id);
        }
    }

    pub fn mark_changed_or_deleted_or_inserted(&mut self, raw_contact_id: RawContactId) {
        self.changed_raw_contacts.insert(raw_contact_id);
    }

    pub fn invalidate_search_index_for_raw_contact(&mut self, raw_contact_id: RawContactId) {
        self.stale_search_raw_contacts.insert(raw_contact_id);
    }

    pub fn invalidate_search_index_for_contact(&mut self, contact_id: ContactId) {
        self.stale_search_contacts.insert(contact_id);
    }

    /// A plain `Default` request does not override a mode already recorded
    /// in this transaction unless forced.
    pub fn mark_for_aggregation(&mut self, raw_contact_id: RawContactId, mode: AggregationMode, force: bool) {
        match self.marked_for_aggregation.get(&raw_contact_id) {
            Some(_) if !force && mode == AggregationMode::Default => {}
            _ => {
                self.marked_for_aggregation.insert(raw_contact_id, mode);
            }
        }
    }

    pub fn marked_for_aggregation(&self) -> &BTreeMap<RawContactId, AggregationMode> {
        &self.marked_for_aggregation
    }

    pub fn take_marked_for_aggregation(&mut self) -> BTreeMap<RawContactId, AggregationMode> {
        std::mem::take(&mut self.marked_for_aggregation)
    }

    /// For aggregates that lost a member without the member surviving to
    /// point back at them (hard deletes).
    pub fn mark_aggregate_stale(&mut self, contact_id: ContactId) {
        self.stale_aggregates.insert(contact_id);
    }

    pub fn take_stale_aggregates(&mut self) -> BTreeSet<ContactId> {
        std::mem::take(&mut self.stale_aggregates)
    }

    pub fn request_display_name_refresh(&mut self, raw_contact_id: RawContactId) {
        self.display_name_refresh.insert(raw_contact_id);
    }

    pub fn take_display_name_refresh(&mut self) -> BTreeSet<RawContactId> {
        std::mem::take(&mut self.display_name_refresh)
    }

    pub fn set_sync_state(&mut self, sync_state_id: SyncStateId, data: Vec<u8>) {
        self.pending_sync_state.insert(sync_state_id, data);
    }

    pub fn request_fast_index_invalidation(&mut self) {
        self.invalidate_fast_index = true;
    }

    pub fn take_fast_index_invalidation(&mut self) -> bool {
        std::mem::take(&mut self.invalidate_fast_index)
    }

    /// Forgets a hard-deleted raw contact so flush does not touch it.
    pub fn raw_contact_purged(&mut self, raw_contact_id: RawContactId) {
        self.inserted_raw_contacts.remove(&raw_contact_id);
        self.dirty_raw_contacts.remove(&raw_contact_id);
        self.updated_raw_contacts.remove(&raw_contact_id);
        self.changed_raw_contacts.remove(&raw_contact_id);
        self.marked_for_aggregation.remove(&raw_contact_id);
        self.display_name_refresh.remove(&raw_contact_id);
    }

    pub fn apply(&mut self, effects: MutationEffects, caller_is_sync_adapter: bool) {
        for raw_contact_id in effects.dirty_and_changed {
            self.mark_dirty_and_changed(raw_contact_id, caller_is_sync_adapter);
        }
        for raw_contact_id in effects.updated {
            self.raw_contact_updated(raw_contact_id);
        }
        for raw_contact_id in effects.stale_search {
            self.invalidate_search_index_for_raw_contact(raw_contact_id);
        }
        for raw_contact_id in effects.display_name_refresh {
            self.request_display_name_refresh(raw_contact_id);
        }
        if effects.invalidate_fast_index {
            self.request_fast_index_invalidation();
        }
    }

    pub fn dirty_raw_contacts(&self) -> &BTreeSet<RawContactId> {
        &self.dirty_raw_contacts
    }

    pub fn updated_raw_contacts(&self) -> &BTreeSet<RawContactId> {
        &self.updated_raw_contacts
    }

    pub fn changed_raw_contacts(&self) -> &BTreeSet<RawContactId> {
        &self.changed_raw_contacts
    }

    pub fn stale_search_raw_contacts(&self) -> &BTreeSet<RawContactId> {
        &self.stale_search_raw_contacts
    }

    pub fn stale_search_contacts(&self) -> &BTreeSet<ContactId> {
        &self.stale_search_contacts
    }

    pub fn pending_sync_state_count(&self) -> usize {
        self.pending_sync_state.len()
    }

    /// Runs once per commit, after every handler call of the transaction.
    /// Search staleness is only counted here; it is handed to the indexer
    /// by [`TransactionContext::update_search_index`] once the commit holds.
    pub fn flush(&mut self, store: &ContactsStore, now: DateTime<Utc>) -> Result<FlushReport, ProviderError> {
        let mut report = FlushReport {
            dirty_rows: store.mark_dirty(&self.dirty_raw_contacts)?,
            version_bumps: store.bump_versions(&self.updated_raw_contacts)?,
            contacts_touched: store.touch_contacts_for_raw_contacts(&self.changed_raw_contacts, now)?,
            search_index_contacts: self.stale_search_contacts.len(),
            search_index_raw_contacts: self.stale_search_raw_contacts.len(),
            ..FlushReport::default()
        };

        for (sync_state_id, data) in &self.pending_sync_state {
            if store.update_sync_state(*sync_state_id, data)? == 0 {
                return Err(ProviderError::MissingSyncState(*sync_state_id));
            }
            report.sync_states_written += 1;
        }

        self.clear_except_search_index();
        Ok(report)
    }

    /// Call only after a successful commit. The stale sets are cleared when
    /// the indexer accepts them and kept for the next commit otherwise.
    pub fn update_search_index(
        &mut self,
        store: &ContactsStore,
        indexer: &dyn SearchIndexer,
    ) -> Result<usize, ProviderError> {
        if self.stale_search_contacts.is_empty() && self.stale_search_raw_contacts.is_empty() {
            return Ok(0);
        }
        indexer.update_index_for_raw_contacts(
            store,
            &self.stale_search_contacts,
            &self.stale_search_raw_contacts,
        )?;
        let delivered = self.stale_search_contacts.len() + self.stale_search_raw_contacts.len();
        self.stale_search_contacts.clear();
        self.stale_search_raw_contacts.clear();
        Ok(delivered)
    }

    pub fn clear_except_search_index(&mut self) {
        self.inserted_raw_contacts.clear();
        self.dirty_raw_contacts.clear();
        self.updated_raw_contacts.clear();
        self.changed_raw_contacts.clear();
        self.marked_for_aggregation.clear();
        self.stale_aggregates.clear();
        self.display_name_refresh.clear();
        self.pending_sync_state.clear();
        self.invalidate_fast_index = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contacts_storage::{statements, NewRawContactRow};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingIndexer {
        calls: Mutex<Vec<(Vec<ContactId>, Vec<RawContactId>)>>,
    }

    impl SearchIndexer for RecordingIndexer {
        fn update_index_for_raw_contacts(
            &self,
            _store: &ContactsStore,
            stale_contact_ids: &BTreeSet<ContactId>,
            stale_raw_contact_ids: &BTreeSet<RawContactId>,
        ) -> Result<(), ProviderError> {
            self.calls.lock().expect("indexer lock").push((
                stale_contact_ids.iter().copied().collect(),
                stale_raw_contact_ids.iter().copied().collect(),
            ));
            Ok(())
        }
    }

    struct FailingIndexer;

    impl SearchIndexer for FailingIndexer {
        fn update_index_for_raw_contacts(
            &self,
            _store: &ContactsStore,
            _stale_contact_ids: &BTreeSet<ContactId>,
            _stale_raw_contact_ids: &BTreeSet<RawContactId>,
        ) -> Result<(), ProviderError> {
            Err(ProviderError::SearchIndex("index offline".to_string()))
        }
    }

    fn raw_contacts(store: &ContactsStore, count: usize) -> Vec<RawContactId> {
        (0..count)
            .map(|_| {
                store
                    .insert_raw_contact(&NewRawContactRow::default())
                    .expect("insert raw contact")
            })
            .collect()
    }

    #[test]
    fn repeated_marks_are_idempotent() {
        let mut txn = TransactionContext::new();
        let id = RawContactId(7);
        for _ in 0..3 {
            txn.mark_dirty_and_changed(id, false);
            txn.raw_contact_updated(id);
            txn.invalidate_search_index_for_raw_contact(id);
        }
        assert_eq!(txn.dirty_raw_contacts().len(), 1);
        assert_eq!(txn.updated_raw_contacts().len(), 1);
        assert_eq!(txn.changed_raw_contacts().len(), 1);
        assert_eq!(txn.stale_search_raw_contacts().len(), 1);
    }

    #[test]
    fn sync_adapter_changes_are_not_dirty() {
        let mut txn = TransactionContext::new();
        txn.mark_dirty_and_changed(RawContactId(1), true);
        assert!(txn.dirty_raw_contacts().is_empty());
        assert!(txn.changed_raw_contacts().contains(&RawContactId(1)));
    }

    #[test]
    fn new_raw_contacts_are_not_version_bumped() {
        let mut txn = TransactionContext::new();
        txn.raw_contact_inserted(RawContactId(1), Some(AccountId(3)));
        txn.raw_contact_updated(RawContactId(1));
        txn.raw_contact_updated(RawContactId(2));
        assert_eq!(
            txn.updated_raw_contacts().iter().copied().collect::<Vec<_>>(),
            vec![RawContactId(2)]
        );
        assert_eq!(txn.inserted_account(RawContactId(1)), Some(AccountId(3)));
    }

    #[test]
    fn begin_keeps_search_staleness_only() {
        let mut txn = TransactionContext::new();
        txn.mark_dirty_and_changed(RawContactId(1), false);
        txn.invalidate_search_index_for_raw_contact(RawContactId(1));
        txn.invalidate_search_index_for_contact(ContactId(4));
        txn.set_sync_state(SyncStateId(1), b"x".to_vec());
        txn.request_fast_index_invalidation();

        txn.begin();
        assert!(txn.dirty_raw_contacts().is_empty());
        assert!(txn.changed_raw_contacts().is_empty());
        assert_eq!(txn.pending_sync_state_count(), 0);
        assert!(!txn.take_fast_index_invalidation());
        assert_eq!(txn.stale_search_raw_contacts().len(), 1);
        assert_eq!(txn.stale_search_contacts().len(), 1);
    }

    #[test]
    fn default_mode_does_not_override_earlier_mark() {
        let mut txn = TransactionContext::new();
        let id = RawContactId(9);
        txn.mark_for_aggregation(id, AggregationMode::Suspended, false);
        txn.mark_for_aggregation(id, AggregationMode::Default, false);
        assert_eq!(
            txn.marked_for_aggregation().get(&id),
            Some(&AggregationMode::Suspended)
        );

        txn.mark_for_aggregation(id, AggregationMode::Default, true);
        assert_eq!(
            txn.marked_for_aggregation().get(&id),
            Some(&AggregationMode::Default)
        );

        txn.mark_for_aggregation(id, AggregationMode::Disabled, false);
        assert_eq!(
            txn.take_marked_for_aggregation().get(&id),
            Some(&AggregationMode::Disabled)
        );
        assert!(txn.marked_for_aggregation().is_empty());
    }

    #[test]
    fn flush_batches_dirty_and_version_updates() {
        let store = ContactsStore::open_in_memory().expect("open store");
        let ids = raw_contacts(&store, 5);
        store.reset_statement_counts();

        let mut txn = TransactionContext::new();
        for id in &ids[..3] {
            txn.raw_contact_inserted(*id, None);
            txn.mark_dirty_and_changed(*id, false);
        }
        for id in &ids[3..] {
            txn.mark_dirty_and_changed(*id, false);
            txn.raw_contact_updated(*id);
        }

        let report = txn.flush(&store, Utc::now()).expect("flush");
        assert_eq!(report.dirty_rows, 5);
        assert_eq!(report.version_bumps, 2);
        assert_eq!(store.statement_count(statements::MARK_DIRTY), 1);
        assert_eq!(store.statement_count(statements::BUMP_VERSION), 1);
        assert!(txn.dirty_raw_contacts().is_empty());
    }

    #[test]
    fn flush_fails_on_missing_sync_state() {
        let store = ContactsStore::open_in_memory().expect("open store");
        let mut txn = TransactionContext::new();
        txn.set_sync_state(SyncStateId(404), b"cursor".to_vec());

        let err = txn.flush(&store, Utc::now()).expect_err("missing sync state");
        assert!(matches!(err, ProviderError::MissingSyncState(SyncStateId(404))));
    }

    #[test]
    fn flush_leaves_search_staleness_for_after_commit() {
        let store = ContactsStore::open_in_memory().expect("open store");
        let indexer = RecordingIndexer::default();
        let mut txn = TransactionContext::new();
        txn.invalidate_search_index_for_raw_contact(RawContactId(3));
        txn.invalidate_search_index_for_contact(ContactId(8));

        let report = txn.flush(&store, Utc::now()).expect("flush");
        assert_eq!(report.search_index_raw_contacts, 1);
        assert_eq!(report.search_index_contacts, 1);
        assert!(indexer.calls.lock().expect("indexer lock").is_empty());
        assert_eq!(txn.stale_search_raw_contacts().len(), 1);

        assert_eq!(txn.update_search_index(&store, &indexer).expect("index"), 2);
        assert_eq!(txn.update_search_index(&store, &indexer).expect("nothing left"), 0);

        let calls = indexer.calls.lock().expect("indexer lock");
        assert_eq!(
            *calls,
            vec![(vec![ContactId(8)], vec![RawContactId(3)])]
        );
    }

    #[test]
    fn indexer_failure_keeps_staleness_for_retry() {
        let store = ContactsStore::open_in_memory().expect("open store");
        let mut txn = TransactionContext::new();
        txn.invalidate_search_index_for_raw_contact(RawContactId(3));

        txn.flush(&store, Utc::now()).expect("flush");
        txn.update_search_index(&store, &FailingIndexer)
            .expect_err("indexer failure");
        txn.begin();
        assert_eq!(txn.stale_search_raw_contacts().len(), 1);

        let indexer = RecordingIndexer::default();
        txn.update_search_index(&store, &indexer).expect("retry");
        assert!(txn.stale_search_raw_contacts().is_empty());
    }

    #[test]
    fn effects_merge_and_apply() {
        let mut effects = MutationEffects::touched(RawContactId(1));
        let mut other = MutationEffects::touched(RawContactId(2));
        other.stale_search(RawContactId(2)).invalidate_fast_index();
        effects.merge(other);

        let mut txn = TransactionContext::new();
        txn.apply(effects, false);
        assert_eq!(txn.dirty_raw_contacts().len(), 2);
        assert_eq!(txn.stale_search_raw_contacts().len(), 1);
        assert!(txn.take_fast_index_invalidation());
    }
}
