use crate::ProviderError;
use contacts_core::{ContactId, RawContactId};
use contacts_storage::ContactsStore;
use std::collections::BTreeSet;
use tracing::info;

/// Receives the ids whose search index content went stale during a commit.
pub trait SearchIndexer: Send + Sync {
    fn update_index_for_raw_contacts(
        &self,
        store: &ContactsStore,
        stale_contact_ids: &BTreeSet<ContactId>,
        stale_raw_contact_ids: &BTreeSet<RawContactId>,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSearchIndexer;

impl SearchIndexer for LoggingSearchIndexer {
    fn update_index_for_raw_contacts(
        &self,
        _store: &ContactsStore,
        stale_contact_ids: &BTreeSet<ContactId>,
        stale_raw_contact_ids: &BTreeSet<RawContactId>,
    ) -> Result<(), ProviderError> {
        info!(
            event = "search_index_update",
            contacts = stale_contact_ids.len(),
            raw_contacts = stale_raw_contact_ids.len()
        );
        Ok(())
    }
}
