use crate::handlers::StructuredNameHandler;
use crate::ProviderError;
use contacts_core::name::NameSplitter;
use contacts_core::{AttributeKind, DisplayNameSource, RawContactId};
use contacts_storage::{ContactsStore, DataRow, RawContactDisplayName};
use std::cmp::Reverse;

/// Recomputes the raw contact's display name from its best name-bearing row.
///
/// Rows rank by source first, then primary rows, then the oldest row.
pub fn refresh_raw_contact_display_name(
    store: &ContactsStore,
    splitter: &dyn NameSplitter,
    raw_contact_id: RawContactId,
) -> Result<RawContactDisplayName, ProviderError> {
    let rows = store.data_rows_for_raw_contact(raw_contact_id, None)?;
    let name = rows
        .iter()
        .filter_map(|row| derive(splitter, row).map(|name| (row, name)))
        .max_by_key(|(row, name)| (name.source, row.is_primary, Reverse(row.id)))
        .map(|(_, name)| name)
        .unwrap_or_else(|| RawContactDisplayName {
            source: Some(DisplayNameSource::Undefined),
            ..RawContactDisplayName::default()
        });

    store.set_raw_contact_display_name(raw_contact_id, &name)?;
    Ok(name)
}

fn derive(splitter: &dyn NameSplitter, row: &DataRow) -> Option<RawContactDisplayName> {
    let source = row.kind.display_name_source();
    if source == DisplayNameSource::Undefined {
        return None;
    }

    if row.kind == AttributeKind::StructuredName {
        let structured = StructuredNameHandler::name_from_columns(&row.columns);
        let display_name = text(row.columns.get(1))
            .or_else(|| splitter.join(&structured, true, true))?;
        let display_name_alt = splitter
            .join(&structured, false, true)
            .unwrap_or_else(|| display_name.clone());
        return Some(RawContactDisplayName {
            source: Some(source),
            sort_key: Some(display_name.clone()),
            sort_key_alt: Some(display_name_alt.clone()),
            phonetic_name: splitter.join_phonetic(&structured),
            display_name: Some(display_name),
            display_name_alt: Some(display_name_alt),
        });
    }

    let display_name = match row.kind {
        AttributeKind::Organization => text(row.columns.get(1)).or_else(|| text(row.columns.get(4))),
        _ => text(row.columns.get(1)),
    }?;
    Some(RawContactDisplayName {
        source: Some(source),
        display_name: Some(display_name.clone()),
        display_name_alt: Some(display_name.clone()),
        phonetic_name: None,
        sort_key: Some(display_name.clone()),
        sort_key_alt: Some(display_name),
    })
}

fn text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contacts_core::name::SimpleNameSplitter;
    use contacts_storage::{DataColumns, NewRawContactRow};

    fn setup() -> (ContactsStore, RawContactId) {
        let store = ContactsStore::open_in_memory().expect("open store");
        let raw = store
            .insert_raw_contact(&NewRawContactRow::default())
            .expect("raw contact");
        (store, raw)
    }

    #[test]
    fn structured_name_beats_other_sources() {
        let (store, raw) = setup();
        let splitter = SimpleNameSplitter::default();
        store
            .insert_data(raw, &AttributeKind::Email, &DataColumns::new().with(1, "ada@example.com"))
            .expect("email");
        store
            .insert_data(
                raw,
                &AttributeKind::StructuredName,
                &DataColumns::new().with(2, "Ada").with(3, "Lovelace"),
            )
            .expect("name");

        let name = refresh_raw_contact_display_name(&store, &splitter, raw).expect("refresh");
        assert_eq!(name.source, Some(DisplayNameSource::StructuredName));
        assert_eq!(name.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(name.display_name_alt.as_deref(), Some("Lovelace, Ada"));

        let stored = store.require_raw_contact(raw).expect("raw contact");
        assert_eq!(stored.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(stored.sort_key.as_deref(), Some("Ada Lovelace"));
        assert_eq!(stored.display_name_source, DisplayNameSource::StructuredName);
    }

    #[test]
    fn primary_row_wins_within_a_source() {
        let (store, raw) = setup();
        let splitter = SimpleNameSplitter::default();
        store
            .insert_data(raw, &AttributeKind::Phone, &DataColumns::new().with(1, "111"))
            .expect("first phone");
        let second = store
            .insert_data(raw, &AttributeKind::Phone, &DataColumns::new().with(1, "222"))
            .expect("second phone");

        let name = refresh_raw_contact_display_name(&store, &splitter, raw).expect("refresh");
        assert_eq!(name.display_name.as_deref(), Some("111"));

        store
            .set_is_primary(raw, second, &AttributeKind::Phone)
            .expect("primary");
        let name = refresh_raw_contact_display_name(&store, &splitter, raw).expect("refresh");
        assert_eq!(name.display_name.as_deref(), Some("222"));
    }

    #[test]
    fn no_name_bearing_rows_clears_the_name() {
        let (store, raw) = setup();
        let splitter = SimpleNameSplitter::default();
        store
            .insert_data(raw, &AttributeKind::Note, &DataColumns::new().with(1, "met at the conference"))
            .expect("note");

        let name = refresh_raw_contact_display_name(&store, &splitter, raw).expect("refresh");
        assert_eq!(name.display_name, None);
        assert_eq!(name.source, Some(DisplayNameSource::Undefined));
    }
}
