mod contact_methods;
mod name;
mod simple;

pub use contact_methods::{EmailHandler, PhoneHandler};
pub use name::StructuredNameHandler;
pub use simple::{GenericHandler, GroupMembershipHandler, NicknameHandler, OrganizationHandler};

use crate::config::ProviderConfig;
use crate::transaction::MutationEffects;
use crate::ProviderError;
use contacts_core::name::NameSplitter;
use contacts_core::operation::{attr_bool, attr_string, AttributeMap};
use contacts_core::{AttributeKind, DataId, RawContactId};
use contacts_storage::{ContactsStore, DataColumns, DataRow};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::error;

const UNRANKED: i64 = 1_000;

/// Everything a handler may touch while running inside a session.
pub struct HandlerContext<'a> {
    pub store: &'a ContactsStore,
    pub splitter: &'a dyn NameSplitter,
}

/// Requested changes to a data row. Unset columns and flags stay as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataPatch {
    columns: BTreeMap<usize, Option<String>>,
    pub is_primary: Option<bool>,
    pub is_super_primary: Option<bool>,
}

impl DataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, column: usize, value: impl Into<String>) -> Self {
        self.columns.insert(column, Some(value.into()));
        self
    }

    pub fn clear_column(mut self, column: usize) -> Self {
        self.columns.insert(column, None);
        self
    }

    pub fn primary(mut self, is_primary: bool) -> Self {
        self.is_primary = Some(is_primary);
        self
    }

    pub fn super_primary(mut self, is_super_primary: bool) -> Self {
        self.is_super_primary = Some(is_super_primary);
        self
    }

    pub fn touches(&self, column: usize) -> bool {
        self.columns.contains_key(&column)
    }

    pub fn touches_any(&self, columns: impl IntoIterator<Item = usize>) -> bool {
        columns.into_iter().any(|column| self.touches(column))
    }

    pub fn apply_to(&self, columns: &mut DataColumns) {
        for (column, value) in &self.columns {
            columns.set(*column, value.clone());
        }
    }

    /// Reads `data1`..`data10`, `is_primary` and `is_super_primary`; the
    /// routing keys in `skip` are left to the caller.
    pub fn from_attributes(attributes: &AttributeMap, skip: &[&str]) -> Result<Self, ProviderError> {
        let mut patch = DataPatch::new();
        for key in attributes.keys() {
            if skip.contains(&key.as_str()) {
                continue;
            }
            match key.as_str() {
                "is_primary" => patch.is_primary = attr_bool(attributes, key)?,
                "is_super_primary" => patch.is_super_primary = attr_bool(attributes, key)?,
                other => {
                    let column = DataColumns::column_index(other).ok_or_else(|| {
                        ProviderError::invalid_attribute(other, "unknown data column")
                    })?;
                    patch.columns.insert(column, attr_string(attributes, key)?);
                }
            }
        }
        Ok(patch)
    }
}

/// Sub-type ordering used to re-derive a primary row after a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeRank {
    order: Vec<i64>,
}

impl TypeRank {
    pub fn new(order: Vec<i64>) -> Self {
        Self { order }
    }

    pub fn from_config(config: &ProviderConfig, kind: &AttributeKind, default: &[i64]) -> Self {
        let order = config
            .type_rank_for(kind.as_str())
            .unwrap_or(default)
            .to_vec();
        Self { order }
    }

    pub fn rank(&self, type_code: Option<i64>) -> i64 {
        type_code
            .and_then(|code| self.order.iter().position(|candidate| *candidate == code))
            .map(|position| position as i64)
            .unwrap_or(UNRANKED)
    }
}

/// Sub-type code stored in `data2` by the typed kinds.
pub fn type_code(row: &DataRow) -> Option<i64> {
    row.columns
        .get(2)
        .and_then(|value| value.trim().parse::<i64>().ok())
}

/// Per-kind row mutation logic. The provided `insert`/`update`/`delete`
/// enforce the primary flags; kinds customise them through the hooks.
pub trait DataRowHandler: Send + Sync {
    fn kind(&self) -> &AttributeKind;

    fn type_rank(&self, _row: &DataRow) -> i64 {
        UNRANKED
    }

    fn is_searchable(&self) -> bool {
        false
    }

    fn fix_up(
        &self,
        _ctx: &HandlerContext<'_>,
        _columns: &mut DataColumns,
        _previous: Option<&DataRow>,
        _patch: &DataPatch,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    fn after_write(
        &self,
        _ctx: &HandlerContext<'_>,
        _row: &DataRow,
        _effects: &mut MutationEffects,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    fn after_delete(
        &self,
        _ctx: &HandlerContext<'_>,
        _row: &DataRow,
        _effects: &mut MutationEffects,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    fn insert(
        &self,
        ctx: &HandlerContext<'_>,
        raw_contact_id: RawContactId,
        patch: &DataPatch,
    ) -> Result<(DataId, MutationEffects), ProviderError> {
        insert_row(self, ctx, raw_contact_id, patch)
    }

    fn update(
        &self,
        ctx: &HandlerContext<'_>,
        previous: &DataRow,
        patch: &DataPatch,
    ) -> Result<MutationEffects, ProviderError> {
        update_row(self, ctx, previous, patch)
    }

    fn delete(
        &self,
        ctx: &HandlerContext<'_>,
        row: &DataRow,
    ) -> Result<MutationEffects, ProviderError> {
        delete_row(self, ctx, row)
    }
}

pub fn insert_row<H: DataRowHandler + ?Sized>(
    handler: &H,
    ctx: &HandlerContext<'_>,
    raw_contact_id: RawContactId,
    patch: &DataPatch,
) -> Result<(DataId, MutationEffects), ProviderError> {
    if ctx.store.raw_contact(raw_contact_id)?.is_none() {
        return Err(ProviderError::UnknownRawContact(raw_contact_id));
    }

    let mut columns = DataColumns::new();
    patch.apply_to(&mut columns);
    handler.fix_up(ctx, &mut columns, None, patch)?;
    let data_id = ctx.store.insert_data(raw_contact_id, handler.kind(), &columns)?;

    apply_primary_flags(
        ctx.store,
        raw_contact_id,
        data_id,
        handler.kind(),
        (false, false),
        patch,
    )?;

    let row = ctx
        .store
        .data_row(data_id)?
        .ok_or(ProviderError::UnknownDataRow(data_id))?;
    let mut effects = MutationEffects::touched(raw_contact_id);
    if handler.is_searchable() {
        effects.stale_search(raw_contact_id);
    }
    handler.after_write(ctx, &row, &mut effects)?;
    Ok((data_id, effects))
}

pub fn update_row<H: DataRowHandler + ?Sized>(
    handler: &H,
    ctx: &HandlerContext<'_>,
    previous: &DataRow,
    patch: &DataPatch,
) -> Result<MutationEffects, ProviderError> {
    let mut columns = previous.columns.clone();
    patch.apply_to(&mut columns);
    handler.fix_up(ctx, &mut columns, Some(previous), patch)?;
    let content_changed = columns != previous.columns;
    if content_changed {
        ctx.store.update_data_columns(previous.id, &columns)?;
    }

    apply_primary_flags(
        ctx.store,
        previous.raw_contact_id,
        previous.id,
        handler.kind(),
        (previous.is_primary, previous.is_super_primary),
        patch,
    )?;

    let row = ctx
        .store
        .data_row(previous.id)?
        .ok_or(ProviderError::UnknownDataRow(previous.id))?;
    let mut effects = MutationEffects::touched(previous.raw_contact_id);
    if handler.is_searchable() && content_changed {
        effects.stale_search(previous.raw_contact_id);
    }
    handler.after_write(ctx, &row, &mut effects)?;
    Ok(effects)
}

pub fn delete_row<H: DataRowHandler + ?Sized>(
    handler: &H,
    ctx: &HandlerContext<'_>,
    row: &DataRow,
) -> Result<MutationEffects, ProviderError> {
    ctx.store.delete_data_row(row.id)?;
    if row.is_primary {
        repick_primary(handler, ctx.store, row.raw_contact_id)?;
    }

    let mut effects = MutationEffects::touched(row.raw_contact_id);
    if handler.is_searchable() {
        effects.stale_search(row.raw_contact_id);
    }
    handler.after_delete(ctx, row, &mut effects)?;
    Ok(effects)
}

/// Flag transitions are driven off the row's flags before the write:
/// clears only happen when the flag is actually set.
fn apply_primary_flags(
    store: &ContactsStore,
    raw_contact_id: RawContactId,
    data_id: DataId,
    kind: &AttributeKind,
    (was_primary, was_super_primary): (bool, bool),
    patch: &DataPatch,
) -> Result<(), ProviderError> {
    let set_super_primary = patch.is_super_primary == Some(true);
    let set_primary = patch.is_primary == Some(true) || set_super_primary;
    let clear_primary = patch.is_primary == Some(false) && was_primary;
    let clear_super_primary = was_super_primary
        && (patch.is_super_primary == Some(false) || patch.is_primary == Some(false));

    if set_super_primary {
        store.set_is_primary(raw_contact_id, data_id, kind)?;
        store.set_is_super_primary(raw_contact_id, data_id, kind)?;
    } else {
        if clear_super_primary {
            store.clear_super_primary(raw_contact_id, kind)?;
        }
        if set_primary {
            // A primary row in an aggregate that already has a preferred
            // value of this kind takes over that preference.
            if patch.is_super_primary.is_none()
                && !was_super_primary
                && store.aggregate_has_super_primary(raw_contact_id, kind)?
            {
                store.set_is_super_primary(raw_contact_id, data_id, kind)?;
            }
            store.set_is_primary(raw_contact_id, data_id, kind)?;
        } else if clear_primary {
            store.clear_primary(raw_contact_id, kind)?;
        }
    }

    let super_primaries = store.super_primary_count(raw_contact_id, kind)?;
    if super_primaries > 1 {
        error!(
            event = "super_primary_invariant_violated",
            raw_contact_id = raw_contact_id.0,
            kind = %kind,
            count = super_primaries
        );
        return Err(ProviderError::InvariantViolation(format!(
            "{super_primaries} super-primary {kind} rows in the aggregate of raw contact {raw_contact_id}"
        )));
    }
    Ok(())
}

/// Lowest type rank wins, then the oldest row.
fn repick_primary<H: DataRowHandler + ?Sized>(
    handler: &H,
    store: &ContactsStore,
    raw_contact_id: RawContactId,
) -> Result<Option<DataId>, ProviderError> {
    let siblings = store.data_rows_for_raw_contact(raw_contact_id, Some(handler.kind()))?;
    let Some(chosen) = siblings
        .iter()
        .min_by_key(|row| (handler.type_rank(row), row.id))
    else {
        return Ok(None);
    };
    store.set_is_primary(raw_contact_id, chosen.id, handler.kind())?;
    Ok(Some(chosen.id))
}

pub struct HandlerRegistry {
    handlers: BTreeMap<AttributeKind, Arc<dyn DataRowHandler>>,
    fallbacks: Mutex<HashMap<String, Arc<dyn DataRowHandler>>>,
}

impl HandlerRegistry {
    pub fn new(config: &ProviderConfig) -> Self {
        let mut registry = Self {
            handlers: BTreeMap::new(),
            fallbacks: Mutex::new(HashMap::new()),
        };
        registry.register(Arc::new(StructuredNameHandler));
        registry.register(Arc::new(PhoneHandler::new(config)));
        registry.register(Arc::new(EmailHandler::new(config)));
        registry.register(Arc::new(NicknameHandler));
        registry.register(Arc::new(OrganizationHandler));
        registry.register(Arc::new(GroupMembershipHandler));
        for kind in [
            AttributeKind::StructuredPostal,
            AttributeKind::Im,
            AttributeKind::Note,
            AttributeKind::Website,
        ] {
            registry.register(Arc::new(GenericHandler::searchable(kind, config)));
        }
        for kind in [AttributeKind::Photo, AttributeKind::Event] {
            registry.register(Arc::new(GenericHandler::new(kind, config)));
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn DataRowHandler>) {
        self.handlers.insert(handler.kind().clone(), handler);
    }

    /// Kinds without a registered handler get a plain one, built on first use.
    pub fn get(&self, kind: &AttributeKind) -> Arc<dyn DataRowHandler> {
        if let Some(handler) = self.handlers.get(kind) {
            return Arc::clone(handler);
        }
        let mut fallbacks = self
            .fallbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let handler = fallbacks
            .entry(kind.as_str().to_string())
            .or_insert_with(|| Arc::new(GenericHandler::fallback(kind.clone())));
        Arc::clone(handler)
    }

    pub fn fallback_count(&self) -> usize {
        self.fallbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contacts_core::name::SimpleNameSplitter;
    use contacts_core::{Account, ContactId};
    use contacts_storage::NewRawContactRow;
    use serde_json::json;

    struct Fixture {
        store: ContactsStore,
        splitter: SimpleNameSplitter,
        registry: HandlerRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: ContactsStore::open_in_memory().expect("open store"),
                splitter: SimpleNameSplitter::default(),
                registry: HandlerRegistry::new(&ProviderConfig::default()),
            }
        }

        fn ctx(&self) -> HandlerContext<'_> {
            HandlerContext {
                store: &self.store,
                splitter: &self.splitter,
            }
        }

        fn raw_contact(&self, contact: Option<ContactId>) -> RawContactId {
            let account_id = self
                .store
                .ensure_account(&Account::new("com.example", "x"))
                .expect("account");
            let id = self
                .store
                .insert_raw_contact(&NewRawContactRow {
                    account_id: Some(account_id),
                    ..NewRawContactRow::default()
                })
                .expect("raw contact");
            if contact.is_some() {
                self.store
                    .set_raw_contact_aggregate(id, contact)
                    .expect("join");
            }
            id
        }

        fn phone(&self, raw_contact_id: RawContactId, number: &str, phone_type: i64, patch: DataPatch) -> DataId {
            let handler = self.registry.get(&AttributeKind::Phone);
            let patch = patch.column(1, number).column(2, phone_type.to_string());
            handler
                .insert(&self.ctx(), raw_contact_id, &patch)
                .expect("insert phone")
                .0
        }

        fn row(&self, data_id: DataId) -> DataRow {
            self.store.data_row(data_id).expect("read").expect("row")
        }

        fn primaries(&self, raw_contact_id: RawContactId) -> Vec<DataId> {
            self.store
                .data_rows_for_raw_contact(raw_contact_id, Some(&AttributeKind::Phone))
                .expect("rows")
                .into_iter()
                .filter(|row| row.is_primary)
                .map(|row| row.id)
                .collect()
        }
    }

    #[test]
    fn inserting_primary_clears_previous_primary() {
        let fixture = Fixture::new();
        let raw = fixture.raw_contact(None);
        let first = fixture.phone(raw, "111", 2, DataPatch::new().primary(true));
        let second = fixture.phone(raw, "222", 1, DataPatch::new().primary(true));

        assert_eq!(fixture.primaries(raw), vec![second]);
        assert!(!fixture.row(first).is_primary);
    }

    #[test]
    fn super_primary_implies_primary_and_is_aggregate_wide() {
        let fixture = Fixture::new();
        let contact = fixture.store.insert_contact().expect("contact");
        let left = fixture.raw_contact(Some(contact));
        let right = fixture.raw_contact(Some(contact));
        let left_phone = fixture.phone(left, "111", 2, DataPatch::new().super_primary(true));
        let right_phone = fixture.phone(right, "222", 2, DataPatch::new().super_primary(true));

        let left_row = fixture.row(left_phone);
        let right_row = fixture.row(right_phone);
        assert!(left_row.is_primary);
        assert!(!left_row.is_super_primary);
        assert!(right_row.is_primary && right_row.is_super_primary);
    }

    #[test]
    fn primary_in_aggregate_with_super_primary_takes_it_over() {
        let fixture = Fixture::new();
        let contact = fixture.store.insert_contact().expect("contact");
        let left = fixture.raw_contact(Some(contact));
        let right = fixture.raw_contact(Some(contact));
        let left_phone = fixture.phone(left, "111", 2, DataPatch::new().super_primary(true));
        let right_phone = fixture.phone(right, "222", 2, DataPatch::new().primary(true));

        assert!(fixture.row(right_phone).is_super_primary);
        assert!(!fixture.row(left_phone).is_super_primary);
        assert!(fixture.row(left_phone).is_primary);
    }

    #[test]
    fn update_clears_only_flags_that_are_set() {
        let fixture = Fixture::new();
        let raw = fixture.raw_contact(None);
        let phone = fixture.phone(raw, "111", 2, DataPatch::new().super_primary(true));
        let handler = fixture.registry.get(&AttributeKind::Phone);

        fixture.store.reset_statement_counts();
        handler
            .update(&fixture.ctx(), &fixture.row(phone), &DataPatch::new().primary(false))
            .expect("clear primary");
        let row = fixture.row(phone);
        assert!(!row.is_primary && !row.is_super_primary);
        assert_eq!(fixture.store.statement_count(contacts_storage::statements::CLEAR_SUPER_PRIMARY), 1);

        fixture.store.reset_statement_counts();
        handler
            .update(&fixture.ctx(), &row, &DataPatch::new().primary(false))
            .expect("clear again");
        assert_eq!(fixture.store.statement_count(contacts_storage::statements::CLEAR_SUPER_PRIMARY), 0);
        assert_eq!(fixture.store.statement_count(contacts_storage::statements::SET_PRIMARY), 0);
    }

    #[test]
    fn deleting_primary_repicks_by_type_rank_then_id() {
        let fixture = Fixture::new();
        let raw = fixture.raw_contact(None);
        let work = fixture.phone(raw, "333", 3, DataPatch::new());
        let home = fixture.phone(raw, "111", 1, DataPatch::new());
        let other_home = fixture.phone(raw, "112", 1, DataPatch::new());
        let mobile = fixture.phone(raw, "222", 2, DataPatch::new().primary(true));
        let handler = fixture.registry.get(&AttributeKind::Phone);

        handler
            .delete(&fixture.ctx(), &fixture.row(mobile))
            .expect("delete mobile");
        assert_eq!(fixture.primaries(raw), vec![home]);

        handler
            .delete(&fixture.ctx(), &fixture.row(home))
            .expect("delete home");
        assert_eq!(fixture.primaries(raw), vec![other_home]);

        handler
            .delete(&fixture.ctx(), &fixture.row(other_home))
            .expect("delete other home");
        assert_eq!(fixture.primaries(raw), vec![work]);

        handler
            .delete(&fixture.ctx(), &fixture.row(work))
            .expect("delete work");
        assert!(fixture.primaries(raw).is_empty());
    }

    #[test]
    fn deleting_non_primary_leaves_primary_alone() {
        let fixture = Fixture::new();
        let raw = fixture.raw_contact(None);
        let keep = fixture.phone(raw, "111", 7, DataPatch::new().primary(true));
        let drop = fixture.phone(raw, "222", 2, DataPatch::new());
        let handler = fixture.registry.get(&AttributeKind::Phone);

        handler
            .delete(&fixture.ctx(), &fixture.row(drop))
            .expect("delete");
        assert_eq!(fixture.primaries(raw), vec![keep]);
    }

    #[test]
    fn configured_type_rank_overrides_default_order() {
        let mut config = ProviderConfig::default();
        config.type_rank.insert("phone".to_string(), vec![3, 2]);
        let handler = PhoneHandler::new(&config);
        let fixture = Fixture::new();
        let raw = fixture.raw_contact(None);
        let mobile = fixture.phone(raw, "222", 2, DataPatch::new());
        let work = fixture.phone(raw, "333", 3, DataPatch::new());
        assert!(handler.type_rank(&fixture.row(work)) < handler.type_rank(&fixture.row(mobile)));
    }

    #[test]
    fn effects_record_touched_and_searchable_rows() {
        let fixture = Fixture::new();
        let raw = fixture.raw_contact(None);
        let handler = fixture.registry.get(&AttributeKind::Phone);
        let (_, effects) = handler
            .insert(&fixture.ctx(), raw, &DataPatch::new().column(1, "555"))
            .expect("insert");
        assert!(effects.dirty_and_changed.contains(&raw));
        assert!(effects.updated.contains(&raw));
        assert!(effects.stale_search.contains(&raw));

        let photo = fixture.registry.get(&AttributeKind::Photo);
        let (_, effects) = photo
            .insert(&fixture.ctx(), raw, &DataPatch::new().column(1, "blob"))
            .expect("insert photo");
        assert!(effects.stale_search.is_empty());
    }

    #[test]
    fn unknown_raw_contact_is_rejected() {
        let fixture = Fixture::new();
        let handler = fixture.registry.get(&AttributeKind::Email);
        let err = handler
            .insert(&fixture.ctx(), RawContactId(42), &DataPatch::new().column(1, "a@b.c"))
            .expect_err("missing raw contact");
        assert!(matches!(err, ProviderError::UnknownRawContact(RawContactId(42))));
    }

    #[test]
    fn registry_builds_fallbacks_lazily_once() {
        let registry = HandlerRegistry::new(&ProviderConfig::default());
        assert_eq!(registry.fallback_count(), 0);
        let custom = AttributeKind::Custom("vnd.example/badge".to_string());
        let first = registry.get(&custom);
        let second = registry.get(&custom);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), &custom);
        assert_eq!(registry.fallback_count(), 1);

        registry.get(&AttributeKind::Phone);
        assert_eq!(registry.fallback_count(), 1);
    }

    #[test]
    fn patch_from_attributes_reads_columns_and_flags() {
        let attributes = [
            ("data1", json!("+1 555 0100")),
            ("data2", json!(2)),
            ("is_primary", json!(true)),
            ("raw_contact_id", json!(4)),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect::<AttributeMap>();

        let patch = DataPatch::from_attributes(&attributes, &["raw_contact_id"]).expect("patch");
        let mut columns = DataColumns::new();
        patch.apply_to(&mut columns);
        assert_eq!(columns.get(1), Some("+1 555 0100"));
        assert_eq!(columns.get(2), Some("2"));
        assert_eq!(patch.is_primary, Some(true));
        assert_eq!(patch.is_super_primary, None);

        let err = DataPatch::from_attributes(&attributes, &[]).expect_err("unknown key");
        assert!(matches!(err, ProviderError::InvalidAttribute { .. }));
    }

    #[test]
    fn type_rank_puts_unknown_codes_last() {
        let rank = TypeRank::new(vec![2, 1]);
        assert_eq!(rank.rank(Some(2)), 0);
        assert_eq!(rank.rank(Some(1)), 1);
        assert_eq!(rank.rank(Some(9)), UNRANKED);
        assert_eq!(rank.rank(None), UNRANKED);
    }
}
