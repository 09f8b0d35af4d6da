use crate::aggregation::{Aggregator, ExactNameAggregator, ProfileAggregator};
use crate::config::ProviderConfig;
use crate::fast_index::{address_book_index, FastScrollingIndexCache, IndexBuckets, QuerySignature};
use crate::handlers::{DataRowHandler, HandlerRegistry};
use crate::init_gate::InitGate;
use crate::lookup::{LookupOutcome, LookupResolver};
use crate::search::{LoggingSearchIndexer, SearchIndexer};
use crate::session::{CommitSummary, Session};
use crate::transaction::TransactionContext;
use crate::ProviderError;
use chrono::Utc;
use contacts_core::lookup_key::LookupKey;
use contacts_core::name::{NameSplitter, SimpleNameSplitter};
use contacts_core::{AttributeKind, ContextKind};
use contacts_storage::ContactsStore;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{debug, error, info, warn};

/// Pluggable services shared by both contexts.
#[derive(Clone)]
pub struct Collaborators {
    pub search_indexer: Arc<dyn SearchIndexer>,
    pub splitter: Arc<dyn NameSplitter>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            search_indexer: Arc::new(LoggingSearchIndexer),
            splitter: Arc::new(SimpleNameSplitter::default()),
        }
    }
}

struct ContextState {
    store: ContactsStore,
    txn: TransactionContext,
}

/// Everything bound to one context: its store, its transaction context,
/// its handlers, its aggregator and its index cache.
pub struct ContextBindings {
    kind: ContextKind,
    gate: InitGate,
    state: Mutex<ContextState>,
    handlers: HandlerRegistry,
    cache: FastScrollingIndexCache,
    aggregator: Box<dyn Aggregator>,
    search_indexer: Arc<dyn SearchIndexer>,
    splitter: Arc<dyn NameSplitter>,
}

impl ContextBindings {
    fn new(
        kind: ContextKind,
        store: ContactsStore,
        config: &ProviderConfig,
        collaborators: &Collaborators,
    ) -> Self {
        let aggregator: Box<dyn Aggregator> = match kind {
            ContextKind::Main => Box::new(ExactNameAggregator),
            ContextKind::Profile => Box::new(ProfileAggregator),
        };
        Self {
            kind,
            gate: InitGate::new(),
            state: Mutex::new(ContextState {
                store,
                txn: TransactionContext::new(),
            }),
            handlers: HandlerRegistry::new(config),
            cache: FastScrollingIndexCache::new(config.fast_index_cache),
            aggregator,
            search_indexer: Arc::clone(&collaborators.search_indexer),
            splitter: Arc::clone(&collaborators.splitter),
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn wait_until_ready(&self) -> Result<(), ProviderError> {
        self.gate.wait(self.kind)
    }

    pub fn handler(&self, kind: &AttributeKind) -> Arc<dyn DataRowHandler> {
        self.handlers.get(kind)
    }

    pub fn fast_index_cache(&self) -> &FastScrollingIndexCache {
        &self.cache
    }

    /// Runs `body` inside one store transaction. Deferred work is flushed
    /// before commit; any error or panic rolls everything back. Stale search
    /// ids reach the indexer only after the commit succeeded.
    ///
    /// `body` must not call [`ContextBindings::read`], [`ContextBindings::fast_index`]
    /// or [`ContextBindings::resolve_lookup_key`] on the same bindings: they take the
    /// store lock this call holds. Read through [`Session::store`] and the
    /// session's lookup methods instead.
    pub fn transaction<T, F>(&self, body: F) -> Result<T, ProviderError>
    where
        F: FnOnce(&mut Session<'_>) -> Result<T, ProviderError>,
    {
        self.gate.wait(self.kind)?;
        let (value, invalidate_fast_index) = {
            let mut guard = self.lock_state();
            let ContextState { store, txn } = &mut *guard;
            txn.begin();
            store.begin()?;
            let mut open = OpenTransaction {
                kind: self.kind,
                store,
                txn,
                committed: false,
            };

            let outcome = self.run_session(open.store, &mut *open.txn, body);
            match outcome.and_then(|(value, summary)| {
                open.commit()?;
                Ok((value, summary))
            }) {
                Ok((value, summary)) => {
                    info!(
                        event = "txn_commit",
                        context = %self.kind,
                        dirty = summary.flush.dirty_rows,
                        version_bumps = summary.flush.version_bumps,
                        contacts_touched = summary.flush.contacts_touched,
                        aggregates_recomputed = summary.aggregation.recomputed
                    );
                    match open.txn.update_search_index(open.store, self.search_indexer.as_ref()) {
                        Ok(0) => {}
                        Ok(delivered) => {
                            debug!(event = "search_index_delivered", context = %self.kind, ids = delivered);
                        }
                        Err(err) => {
                            warn!(event = "search_index_deferred", context = %self.kind, error = %err);
                        }
                    }
                    (value, summary.invalidate_fast_index)
                }
                Err(err) => {
                    warn!(event = "txn_rollback", context = %self.kind, error = %err);
                    return Err(err);
                }
            }
        };

        // The store lock is released; cache then store is the only lock order.
        if invalidate_fast_index {
            self.cache.invalidate_all();
        }
        Ok(value)
    }

    fn run_session<T, F>(
        &self,
        store: &ContactsStore,
        txn: &mut TransactionContext,
        body: F,
    ) -> Result<(T, CommitSummary), ProviderError>
    where
        F: FnOnce(&mut Session<'_>) -> Result<T, ProviderError>,
    {
        let mut session = Session::new(
            self.kind,
            store,
            txn,
            &self.handlers,
            self.aggregator.as_ref(),
            self.splitter.as_ref(),
        );
        let value = body(&mut session)?;
        let summary = session.finish(Utc::now())?;
        Ok((value, summary))
    }

    /// Read-only access to the store once init has finished. Not reentrant
    /// from inside a [`ContextBindings::transaction`] body.
    pub fn read<T, F>(&self, body: F) -> Result<T, ProviderError>
    where
        F: FnOnce(&ContactsStore) -> Result<T, ProviderError>,
    {
        self.gate.wait(self.kind)?;
        let guard = self.lock_state();
        body(&guard.store)
    }

    /// Same lock as [`ContextBindings::read`]; inside a transaction body use
    /// [`Session::resolve_lookup_key`].
    pub fn resolve_lookup_key(&self, key: &str) -> Result<LookupOutcome, ProviderError> {
        self.read(|store| LookupResolver::new(store, self.kind).resolve(&LookupKey::parse(key)))
    }

    /// A cache miss computes under the store lock, so this must not run from
    /// inside a transaction body on the same bindings.
    pub fn fast_index(&self, signature: &QuerySignature) -> Result<IndexBuckets, ProviderError> {
        self.gate.wait(self.kind)?;
        self.cache.get_or_compute(signature, || {
            let guard = self.lock_state();
            address_book_index(&guard.store, signature)
        })
    }

    pub fn invalidate_fast_index_cache(&self) {
        self.cache.invalidate_all();
    }

    fn initialize(&self) -> Result<(), ProviderError> {
        let guard = self.lock_state();
        guard.store.migrate()?;
        let relabeled = guard.store.rebuild_phonebook_labels()?;
        info!(event = "context_ready", context = %self.kind, relabeled);
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A store transaction that has begun but not committed. Dropping it
/// uncommitted, on an error return or while unwinding out of the body,
/// rolls the store back and discards the deferred work.
struct OpenTransaction<'a> {
    kind: ContextKind,
    store: &'a ContactsStore,
    txn: &'a mut TransactionContext,
    committed: bool,
}

impl OpenTransaction<'_> {
    fn commit(&mut self) -> Result<(), ProviderError> {
        self.store.commit()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for OpenTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.store.rollback() {
            error!(event = "txn_rollback_failed", context = %self.kind, error = %err);
        }
        self.txn.clear_except_search_index();
        if thread::panicking() {
            warn!(event = "txn_rollback", context = %self.kind, error = "transaction body panicked");
        }
    }
}

/// The main and profile contexts, each initialized on its own thread.
pub struct ContactsProvider {
    main: Arc<ContextBindings>,
    profile: Arc<ContextBindings>,
    config: ProviderConfig,
}

impl ContactsProvider {
    pub fn open(config: ProviderConfig) -> Result<Self, ProviderError> {
        Self::open_with(config, Collaborators::default())
    }

    pub fn open_with(config: ProviderConfig, collaborators: Collaborators) -> Result<Self, ProviderError> {
        fs::create_dir_all(&config.data_dir).map_err(|err| {
            ProviderError::Config(format!("create {}: {err}", config.data_dir.display()))
        })?;
        let main = ContactsStore::connect(config.db_path(ContextKind::Main))?;
        let profile = ContactsStore::connect(config.db_path(ContextKind::Profile))?;
        Ok(Self::assemble(config, main, profile, &collaborators))
    }

    pub fn open_in_memory(config: ProviderConfig) -> Result<Self, ProviderError> {
        Self::open_in_memory_with(config, Collaborators::default())
    }

    pub fn open_in_memory_with(
        config: ProviderConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ProviderError> {
        let main = ContactsStore::connect_in_memory()?;
        let profile = ContactsStore::connect_in_memory()?;
        Ok(Self::assemble(config, main, profile, &collaborators))
    }

    fn assemble(
        config: ProviderConfig,
        main: ContactsStore,
        profile: ContactsStore,
        collaborators: &Collaborators,
    ) -> Self {
        let main = Arc::new(ContextBindings::new(ContextKind::Main, main, &config, collaborators));
        let profile = Arc::new(ContextBindings::new(
            ContextKind::Profile,
            profile,
            &config,
            collaborators,
        ));
        spawn_init(Arc::clone(&main));
        spawn_init(Arc::clone(&profile));
        Self {
            main,
            profile,
            config,
        }
    }

    /// Selects the bindings every operation on `kind` must go through.
    pub fn context(&self, kind: ContextKind) -> &ContextBindings {
        match kind {
            ContextKind::Main => &self.main,
            ContextKind::Profile => &self.profile,
        }
    }

    pub fn main(&self) -> &ContextBindings {
        &self.main
    }

    pub fn profile(&self) -> &ContextBindings {
        &self.profile
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn wait_until_ready(&self) -> Result<(), ProviderError> {
        self.main.wait_until_ready()?;
        self.profile.wait_until_ready()
    }
}

fn spawn_init(bindings: Arc<ContextBindings>) {
    let worker = Arc::clone(&bindings);
    let spawned = thread::Builder::new()
        .name(format!("contacts-init-{}", bindings.kind))
        .spawn(move || {
            let outcome = worker.initialize().map_err(|err| {
                error!(event = "context_init_failed", context = %worker.kind, error = %err);
                err.to_string()
            });
            worker.gate.open(outcome);
        });
    if let Err(err) = spawned {
        bindings.gate.open(Err(format!("spawn init thread: {err}")));
    }
}
