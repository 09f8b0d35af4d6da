use super::{non_empty, DataPatch, DataRowHandler, HandlerContext};
use crate::transaction::MutationEffects;
use crate::ProviderError;
use contacts_core::name::{normalize, Name};
use contacts_core::{AttributeKind, NameLookupType};
use contacts_storage::{DataColumns, DataRow};

static STRUCTURED_NAME: AttributeKind = AttributeKind::StructuredName;

const DISPLAY_NAME: usize = 1;
const GIVEN_NAME: usize = 2;
const FAMILY_NAME: usize = 3;
const PREFIX: usize = 4;
const MIDDLE_NAME: usize = 5;
const SUFFIX: usize = 6;
const PHONETIC_GIVEN_NAME: usize = 7;
const PHONETIC_MIDDLE_NAME: usize = 8;
const PHONETIC_FAMILY_NAME: usize = 9;

const STRUCTURED_COLUMNS: [usize; 5] = [GIVEN_NAME, FAMILY_NAME, PREFIX, MIDDLE_NAME, SUFFIX];

/// Name rows keep the free-form display name and the structured parts in
/// step, and own the name lookup entries of their row.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredNameHandler;

impl StructuredNameHandler {
    pub fn name_from_columns(columns: &DataColumns) -> Name {
        let part = |column: usize| non_empty(columns.get(column)).map(str::to_string);
        Name {
            prefix: part(PREFIX),
            given_names: part(GIVEN_NAME),
            middle_name: part(MIDDLE_NAME),
            family_name: part(FAMILY_NAME),
            suffix: part(SUFFIX),
            phonetic_given_name: part(PHONETIC_GIVEN_NAME),
            phonetic_middle_name: part(PHONETIC_MIDDLE_NAME),
            phonetic_family_name: part(PHONETIC_FAMILY_NAME),
        }
    }

    fn write_structured(columns: &mut DataColumns, name: &Name) {
        columns.set(PREFIX, name.prefix.clone());
        columns.set(GIVEN_NAME, name.given_names.clone());
        columns.set(MIDDLE_NAME, name.middle_name.clone());
        columns.set(FAMILY_NAME, name.family_name.clone());
        columns.set(SUFFIX, name.suffix.clone());
    }

    fn split_display_name(ctx: &HandlerContext<'_>, columns: &mut DataColumns) {
        let name = non_empty(columns.get(DISPLAY_NAME))
            .map(|display_name| ctx.splitter.split(display_name))
            .unwrap_or_default();
        Self::write_structured(columns, &name);
    }

    fn join_structured(ctx: &HandlerContext<'_>, columns: &mut DataColumns) {
        let name = Self::name_from_columns(columns);
        columns.set(DISPLAY_NAME, ctx.splitter.join(&name, true, true));
    }

    /// Rewriting a part with its current value leaves the display text as typed.
    fn structured_parts_changed(before: &DataColumns, after: &DataColumns) -> bool {
        STRUCTURED_COLUMNS
            .iter()
            .any(|column| non_empty(before.get(*column)) != non_empty(after.get(*column)))
    }

    fn lookup_entries(ctx: &HandlerContext<'_>, columns: &DataColumns) -> Vec<(NameLookupType, String)> {
        let name = Self::name_from_columns(columns);
        let display_name = non_empty(columns.get(DISPLAY_NAME))
            .map(str::to_string)
            .or_else(|| ctx.splitter.join(&name, true, true));
        let Some(display_name) = display_name else {
            return Vec::new();
        };

        let mut entries = vec![
            (NameLookupType::NameExact, normalize(&display_name)),
            (NameLookupType::NameCollationKey, normalize(&display_name)),
        ];
        let given = name.given_names.as_deref();
        let family = name.family_name.as_deref();
        if let (Some(given), Some(family)) = (given, family) {
            entries.push((NameLookupType::NameCollationKey, normalize(&format!("{given}{family}"))));
            entries.push((NameLookupType::NameCollationKey, normalize(&format!("{family}{given}"))));
        }
        if let Some(given) = given {
            entries.push((NameLookupType::NameVariant, normalize(given)));
        }
        entries.retain(|(_, normalized)| !normalized.is_empty());
        entries
    }
}

impl DataRowHandler for StructuredNameHandler {
    fn kind(&self) -> &AttributeKind {
        &STRUCTURED_NAME
    }

    fn is_searchable(&self) -> bool {
        true
    }

    fn fix_up(
        &self,
        ctx: &HandlerContext<'_>,
        columns: &mut DataColumns,
        previous: Option<&DataRow>,
        patch: &DataPatch,
    ) -> Result<(), ProviderError> {
        let has_display_name = non_empty(columns.get(DISPLAY_NAME)).is_some();
        match previous {
            None => {
                let name = Self::name_from_columns(columns);
                if has_display_name && !name.has_structured_parts() {
                    Self::split_display_name(ctx, columns);
                } else if !has_display_name && name.has_structured_parts() {
                    Self::join_structured(ctx, columns);
                }
            }
            Some(previous) => {
                let display_touched = patch.touches(DISPLAY_NAME);
                let structured_touched = patch.touches_any(STRUCTURED_COLUMNS);
                if display_touched && !structured_touched {
                    Self::split_display_name(ctx, columns);
                } else if structured_touched
                    && !display_touched
                    && Self::structured_parts_changed(&previous.columns, columns)
                {
                    Self::join_structured(ctx, columns);
                }
            }
        }
        Ok(())
    }

    fn after_write(
        &self,
        ctx: &HandlerContext<'_>,
        row: &DataRow,
        effects: &mut MutationEffects,
    ) -> Result<(), ProviderError> {
        ctx.store.delete_name_lookup_for_data(row.id)?;
        for (name_type, normalized) in Self::lookup_entries(ctx, &row.columns) {
            ctx.store
                .insert_name_lookup(row.raw_contact_id, row.id, name_type, &normalized)?;
        }
        effects
            .refresh_display_name(row.raw_contact_id)
            .aggregate(row.raw_contact_id);
        Ok(())
    }

    fn after_delete(
        &self,
        _ctx: &HandlerContext<'_>,
        row: &DataRow,
        effects: &mut MutationEffects,
    ) -> Result<(), ProviderError> {
        effects
            .refresh_display_name(row.raw_contact_id)
            .aggregate(row.raw_contact_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contacts_core::name::SimpleNameSplitter;
    use contacts_core::RawContactId;
    use contacts_storage::{ContactsStore, NewRawContactRow};

    fn setup() -> (ContactsStore, SimpleNameSplitter, RawContactId) {
        let store = ContactsStore::open_in_memory().expect("open store");
        let raw_contact_id = store
            .insert_raw_contact(&NewRawContactRow::default())
            .expect("raw contact");
        (store, SimpleNameSplitter::default(), raw_contact_id)
    }

    #[test]
    fn insert_splits_display_name_into_parts() {
        let (store, splitter, raw) = setup();
        let ctx = HandlerContext { store: &store, splitter: &splitter };
        let (data_id, effects) = StructuredNameHandler
            .insert(&ctx, raw, &DataPatch::new().column(DISPLAY_NAME, "Dr. Ada King Lovelace"))
            .expect("insert");

        let row = store.data_row(data_id).expect("read").expect("row");
        assert_eq!(row.columns.get(PREFIX), Some("Dr."));
        assert_eq!(row.columns.get(GIVEN_NAME), Some("Ada"));
        assert_eq!(row.columns.get(MIDDLE_NAME), Some("King"));
        assert_eq!(row.columns.get(FAMILY_NAME), Some("Lovelace"));
        assert!(effects.display_name_refresh.contains(&raw));
        assert!(effects.aggregation.contains_key(&raw));
        assert!(effects.stale_search.contains(&raw));
    }

    #[test]
    fn insert_joins_parts_into_display_name() {
        let (store, splitter, raw) = setup();
        let ctx = HandlerContext { store: &store, splitter: &splitter };
        let patch = DataPatch::new()
            .column(GIVEN_NAME, "Grace")
            .column(FAMILY_NAME, "Hopper");
        let (data_id, _) = StructuredNameHandler.insert(&ctx, raw, &patch).expect("insert");

        let row = store.data_row(data_id).expect("read").expect("row");
        assert_eq!(row.columns.get(DISPLAY_NAME), Some("Grace Hopper"));
    }

    #[test]
    fn split_then_join_is_byte_identical() {
        let (store, splitter, raw) = setup();
        let ctx = HandlerContext { store: &store, splitter: &splitter };
        let display_name = "Mr. John Ronald Reuel Tolkien Jr.";
        let (data_id, _) = StructuredNameHandler
            .insert(&ctx, raw, &DataPatch::new().column(DISPLAY_NAME, display_name))
            .expect("insert");
        let row = store.data_row(data_id).expect("read").expect("row");

        let mut rejoined = row.columns.clone();
        StructuredNameHandler::join_structured(&ctx, &mut rejoined);
        assert_eq!(rejoined.get(DISPLAY_NAME), Some(display_name));
    }

    #[test]
    fn update_follows_whichever_side_was_edited() {
        let (store, splitter, raw) = setup();
        let ctx = HandlerContext { store: &store, splitter: &splitter };
        let (data_id, _) = StructuredNameHandler
            .insert(&ctx, raw, &DataPatch::new().column(DISPLAY_NAME, "Ada Lovelace"))
            .expect("insert");

        let row = store.data_row(data_id).expect("read").expect("row");
        StructuredNameHandler
            .update(&ctx, &row, &DataPatch::new().column(FAMILY_NAME, "Byron"))
            .expect("update family");
        let row = store.data_row(data_id).expect("read").expect("row");
        assert_eq!(row.columns.get(DISPLAY_NAME), Some("Ada Byron"));

        StructuredNameHandler
            .update(&ctx, &row, &DataPatch::new().column(DISPLAY_NAME, "Augusta King"))
            .expect("update display");
        let row = store.data_row(data_id).expect("read").expect("row");
        assert_eq!(row.columns.get(GIVEN_NAME), Some("Augusta"));
        assert_eq!(row.columns.get(FAMILY_NAME), Some("King"));
    }

    #[test]
    fn unchanged_parts_keep_display_text_as_typed() {
        let (store, splitter, raw) = setup();
        let ctx = HandlerContext { store: &store, splitter: &splitter };
        let (data_id, _) = StructuredNameHandler
            .insert(&ctx, raw, &DataPatch::new().column(DISPLAY_NAME, "Lovelace,  Ada"))
            .expect("insert");
        let row = store.data_row(data_id).expect("read").expect("row");
        assert_eq!(row.columns.get(GIVEN_NAME), Some("Ada"));
        assert_eq!(row.columns.get(FAMILY_NAME), Some("Lovelace"));

        StructuredNameHandler
            .update(&ctx, &row, &DataPatch::new().column(GIVEN_NAME, "Ada"))
            .expect("same given name");
        let row = store.data_row(data_id).expect("read").expect("row");
        assert_eq!(row.columns.get(DISPLAY_NAME), Some("Lovelace,  Ada"));

        StructuredNameHandler
            .update(&ctx, &row, &DataPatch::new().column(GIVEN_NAME, "Augusta"))
            .expect("new given name");
        let row = store.data_row(data_id).expect("read").expect("row");
        assert_eq!(row.columns.get(DISPLAY_NAME), Some("Augusta Lovelace"));
    }

    #[test]
    fn name_lookup_entries_are_replaced_on_update() {
        let (store, splitter, raw) = setup();
        let ctx = HandlerContext { store: &store, splitter: &splitter };
        let (data_id, _) = StructuredNameHandler
            .insert(&ctx, raw, &DataPatch::new().column(DISPLAY_NAME, "Ada Lovelace"))
            .expect("insert");

        let entries = store.name_lookup_entries(raw).expect("entries");
        assert!(entries.contains(&(NameLookupType::NameExact, "adalovelace".to_string())));
        assert!(entries.contains(&(NameLookupType::NameCollationKey, "lovelaceada".to_string())));
        assert!(entries.contains(&(NameLookupType::NameVariant, "ada".to_string())));

        let row = store.data_row(data_id).expect("read").expect("row");
        StructuredNameHandler
            .update(&ctx, &row, &DataPatch::new().column(DISPLAY_NAME, "Grace Hopper"))
            .expect("update");
        let entries = store.name_lookup_entries(raw).expect("entries");
        assert!(entries.iter().all(|(_, name)| !name.contains("ada")));
        assert!(entries.contains(&(NameLookupType::NameCollationKey, "gracehopper".to_string())));
    }
}
