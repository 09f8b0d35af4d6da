use crate::ProviderError;
use contacts_storage::{ContactsStore, PhonebookQuery};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// The shape of a contacts query, as far as its index buckets are concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QuerySignature {
    pub uri: String,
    pub selection: Option<String>,
    pub selection_args: Vec<String>,
    pub sort_order: Option<String>,
    pub count_expression: Option<String>,
}

impl QuerySignature {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn with_selection(mut self, selection: impl Into<String>, args: Vec<String>) -> Self {
        self.selection = Some(selection.into());
        self.selection_args = args;
        self
    }

    pub fn with_sort_order(mut self, sort_order: impl Into<String>) -> Self {
        self.sort_order = Some(sort_order.into());
        self
    }

    pub fn with_count_expression(mut self, count_expression: impl Into<String>) -> Self {
        self.count_expression = Some(count_expression.into());
        self
    }

    fn sorts_by_alternative_name(&self) -> bool {
        self.sort_order.as_deref().is_some_and(|order| {
            let order = order.to_lowercase();
            order.contains("display_name_alt") || order.contains("sort_key_alt")
        })
    }

    fn counts_raw_contacts(&self) -> bool {
        self.count_expression
            .as_deref()
            .is_some_and(|expression| expression.to_lowercase().contains("raw_contacts"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBuckets {
    entries: Vec<(String, i64)>,
}

impl IndexBuckets {
    pub fn from_counts(entries: Vec<(String, i64)>) -> Self {
        Self { entries }
    }

    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|(label, _)| label.as_str()).collect()
    }

    pub fn counts(&self) -> Vec<i64> {
        self.entries.iter().map(|(_, count)| *count).collect()
    }

    pub fn entries(&self) -> &[(String, i64)] {
        &self.entries
    }

    pub fn total(&self) -> i64 {
        self.entries.iter().map(|(_, count)| count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Groups the contacts matched by `signature` into phonebook buckets.
pub fn address_book_index(
    store: &ContactsStore,
    signature: &QuerySignature,
) -> Result<IndexBuckets, ProviderError> {
    let counts = store.phonebook_counts(&PhonebookQuery {
        selection: signature.selection.as_deref(),
        selection_args: &signature.selection_args,
        alternative: signature.sorts_by_alternative_name(),
        count_raw_contacts: signature.counts_raw_contacts(),
    })?;
    Ok(IndexBuckets::from_counts(counts))
}

#[derive(Debug)]
pub struct FastScrollingIndexCache {
    enabled: bool,
    entries: Mutex<HashMap<QuerySignature, IndexBuckets>>,
}

impl FastScrollingIndexCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, signature: &QuerySignature) -> Option<IndexBuckets> {
        if !self.enabled {
            return None;
        }
        self.lock().get(signature).cloned()
    }

    pub fn put(&self, signature: QuerySignature, buckets: IndexBuckets) {
        if self.enabled {
            self.lock().insert(signature, buckets);
        }
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.lock();
        if !entries.is_empty() {
            debug!(event = "fast_index_invalidated", entries = entries.len());
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Holds the cache lock across lookup, computation and insertion, so one
    /// signature is computed at most once per invalidation.
    pub fn get_or_compute<F>(
        &self,
        signature: &QuerySignature,
        compute: F,
    ) -> Result<IndexBuckets, ProviderError>
    where
        F: FnOnce() -> Result<IndexBuckets, ProviderError>,
    {
        if !self.enabled {
            return compute();
        }

        let mut entries = self.lock();
        if let Some(hit) = entries.get(signature) {
            return Ok(hit.clone());
        }
        let computed = compute()?;
        debug!(
            event = "fast_index_recomputed",
            uri = %signature.uri,
            buckets = computed.entries.len()
        );
        entries.insert(signature.clone(), computed.clone());
        Ok(computed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<QuerySignature, IndexBuckets>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
