pub mod aggregation;
pub mod config;
pub mod display_name;
pub mod fast_index;
pub mod handlers;
pub mod init_gate;
pub mod lookup;
pub mod provider;
pub mod search;
pub mod session;
pub mod transaction;

use contacts_core::{ContextKind, ContractError, DataId, RawContactId, SyncStateId};
use contacts_storage::StorageError;
use thiserror::Error;

pub use config::ProviderConfig;
pub use fast_index::{IndexBuckets, QuerySignature};
pub use lookup::LookupOutcome;
pub use provider::{Collaborators, ContactsProvider, ContextBindings};
pub use session::{ApplyResult, CommitSummary, ContactUpdate, NewRawContact, RawContactUpdate, Session};
pub use transaction::{FlushReport, MutationEffects, TransactionContext};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("sync state {0} no longer exists")]
    MissingSyncState(SyncStateId),
    #[error("unknown raw contact {0}")]
    UnknownRawContact(RawContactId),
    #[error("unknown data row {0}")]
    UnknownDataRow(DataId),
    #[error("invalid attribute {key}: {reason}")]
    InvalidAttribute { key: String, reason: String },
    #[error("{context} store failed to initialize: {reason}")]
    InitFailed { context: ContextKind, reason: String },
    #[error("aggregation failed: {0}")]
    Aggregation(String),
    #[error("search index update failed: {0}")]
    SearchIndex(String),
    #[error("config error: {0}")]
    Config(String),
}

impl ProviderError {
    pub(crate) fn invalid_attribute(key: &str, reason: impl Into<String>) -> Self {
        ProviderError::InvalidAttribute {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
