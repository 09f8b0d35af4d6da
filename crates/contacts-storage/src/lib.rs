use chrono::{DateTime, Utc};
use contacts_core::phonebook::bucket_for;
use contacts_core::{
    Account, AccountId, AggregationMode, AttributeKind, ContactId, DataId, DisplayNameSource,
    NameLookupType, RawContactId, SyncStateId,
};
use rusqlite::types::{Type, Value};
use rusqlite::vtab::array::{self, Array};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

pub const CONTACTS_SCHEMA_VERSION: i64 = 2;
pub const DATA_COLUMN_COUNT: usize = 10;

const DATA_COLUMN_NAMES: [&str; DATA_COLUMN_COUNT] = [
    "data1", "data2", "data3", "data4", "data5", "data6", "data7", "data8", "data9", "data10",
];

const RAW_CONTACT_COLUMNS: &str = "
    rc._id, rc.account_id, rc.source_id, rc.version, rc.dirty, rc.deleted, rc.contact_id,
    rc.aggregation_mode, rc.aggregation_needed, rc.starred, rc.pinned, rc.display_name,
    rc.display_name_alt, rc.display_name_source, rc.sort_key, rc.sort_key_alt, rc.name_verified,
    a.account_type, a.account_name, a.data_set
";

const DATA_COLUMNS: &str = "
    _id, raw_contact_id, mimetype, is_primary, is_super_primary, data_version,
    data1, data2, data3, data4, data5, data6, data7, data8, data9, data10
";

const CONTACT_COLUMNS: &str = "
    _id, name_raw_contact_id, display_name, display_name_alt, sort_key, phonebook_label,
    phonebook_bucket, phonebook_label_alt, phonebook_bucket_alt, starred, pinned,
    has_phone_number, lookup, contact_last_updated_timestamp
";

// ?1 is the raw contact id; the scope covers its whole aggregate, or just the
// raw contact itself while it is not aggregated.
const AGGREGATE_SCOPE: &str = "
    raw_contact_id IN (
        SELECT _id FROM raw_contacts
        WHERE _id = ?1
           OR (contact_id IS NOT NULL
               AND contact_id = (SELECT contact_id FROM raw_contacts WHERE _id = ?1))
    )
";

/// Labels used by the per-statement counters.
pub mod statements {
    pub const MARK_DIRTY: &str = "raw_contacts.mark_dirty";
    pub const BUMP_VERSION: &str = "raw_contacts.bump_version";
    pub const TOUCH_CONTACTS: &str = "contacts.touch_last_updated";
    pub const UPDATE_SYNC_STATE: &str = "sync_state.update";
    pub const INSERT_RAW_CONTACT: &str = "raw_contacts.insert";
    pub const UPDATE_RAW_CONTACT: &str = "raw_contacts.update";
    pub const DELETE_RAW_CONTACT: &str = "raw_contacts.delete";
    pub const INSERT_DATA: &str = "data.insert";
    pub const UPDATE_DATA: &str = "data.update";
    pub const DELETE_DATA: &str = "data.delete";
    pub const SET_PRIMARY: &str = "data.set_primary";
    pub const SET_SUPER_PRIMARY: &str = "data.set_super_primary";
    pub const CLEAR_SUPER_PRIMARY: &str = "data.clear_super_primary";
    pub const NAME_LOOKUP: &str = "name_lookup.write";
    pub const CONTACT_WRITE: &str = "contacts.write";
    pub const PHONEBOOK_INDEX: &str = "contacts.phonebook_index";
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("missing {table} row {id}")]
    MissingRow { table: &'static str, id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRawContact {
    pub id: RawContactId,
    pub account_id: Option<AccountId>,
    pub account: Option<Account>,
    pub source_id: Option<String>,
    pub version: i64,
    pub dirty: bool,
    pub deleted: bool,
    pub contact_id: Option<ContactId>,
    pub aggregation_mode: AggregationMode,
    pub aggregation_needed: bool,
    pub starred: bool,
    pub pinned: i64,
    pub display_name: Option<String>,
    pub display_name_alt: Option<String>,
    pub display_name_source: DisplayNameSource,
    pub sort_key: Option<String>,
    pub sort_key_alt: Option<String>,
    pub name_verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewRawContactRow {
    pub account_id: Option<AccountId>,
    pub source_id: Option<String>,
    pub aggregation_mode: AggregationMode,
    pub starred: bool,
    pub pinned: i64,
}

/// Column changes for a raw contact; `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawContactChanges {
    pub source_id: Option<Option<String>>,
    pub aggregation_mode: Option<AggregationMode>,
    pub starred: Option<bool>,
    pub pinned: Option<i64>,
    pub name_verified: Option<bool>,
}

impl RawContactChanges {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawContactDisplayName {
    pub source: Option<DisplayNameSource>,
    pub display_name: Option<String>,
    pub display_name_alt: Option<String>,
    pub phonetic_name: Option<String>,
    pub sort_key: Option<String>,
    pub sort_key_alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContact {
    pub id: ContactId,
    pub name_raw_contact_id: Option<RawContactId>,
    pub display_name: Option<String>,
    pub display_name_alt: Option<String>,
    pub sort_key: Option<String>,
    pub phonebook_label: Option<String>,
    pub phonebook_bucket: i64,
    pub phonebook_label_alt: Option<String>,
    pub phonebook_bucket_alt: i64,
    pub starred: bool,
    pub pinned: i64,
    pub has_phone_number: bool,
    pub lookup: Option<String>,
    pub last_updated_ms: Option<i64>,
}

impl StoredContact {
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactSummary {
    pub name_raw_contact_id: Option<RawContactId>,
    pub display_name: Option<String>,
    pub display_name_alt: Option<String>,
    pub sort_key: Option<String>,
    pub sort_key_alt: Option<String>,
    pub starred: bool,
    pub pinned: i64,
    pub has_phone_number: bool,
    pub lookup: Option<String>,
}

/// The ten generic payload columns of a data row, addressed 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataColumns {
    values: [Option<String>; DATA_COLUMN_COUNT],
}

impl DataColumns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: usize) -> Option<&str> {
        column
            .checked_sub(1)
            .and_then(|index| self.values.get(index))
            .and_then(|value| value.as_deref())
    }

    pub fn set(&mut self, column: usize, value: Option<String>) {
        if let Some(slot) = column
            .checked_sub(1)
            .and_then(|index| self.values.get_mut(index))
        {
            *slot = value;
        }
    }

    pub fn with(mut self, column: usize, value: impl Into<String>) -> Self {
        self.set(column, Some(value.into()));
        self
    }

    pub fn column_index(name: &str) -> Option<usize> {
        DATA_COLUMN_NAMES
            .iter()
            .position(|candidate| *candidate == name)
            .map(|index| index + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub id: DataId,
    pub raw_contact_id: RawContactId,
    pub kind: AttributeKind,
    pub is_primary: bool,
    pub is_super_primary: bool,
    pub data_version: i64,
    pub columns: DataColumns,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameLookupMatch {
    pub normalized_name: String,
    pub raw_contact: StoredRawContact,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PhonebookQuery<'a> {
    pub selection: Option<&'a str>,
    pub selection_args: &'a [String],
    pub alternative: bool,
    pub count_raw_contacts: bool,
}

pub struct ContactsStore {
    conn: Connection,
    statement_counts: RefCell<BTreeMap<&'static str, u64>>,
}

impl ContactsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let store = Self::connect(path)?;
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self::connect_in_memory()?;
        store.migrate()?;
        Ok(store)
    }

    /// Opens the database without running migrations.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn connect_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    // Id sets are bound as one `rarray` value, so no statement depends on
    // SQLite's bound-parameter limit.
    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        array::load_module(&conn)?;
        Ok(Self {
            conn,
            statement_counts: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > CONTACTS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CONTACTS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_contacts_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_groups_sync_state_social.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    pub fn begin(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<(), StorageError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    pub fn statement_count(&self, label: &str) -> u64 {
        self.statement_counts
            .borrow()
            .get(label)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_statement_counts(&self) {
        self.statement_counts.borrow_mut().clear();
    }

    fn record(&self, label: &'static str) {
        *self.statement_counts.borrow_mut().entry(label).or_insert(0) += 1;
    }

    fn execute<P: rusqlite::Params>(
        &self,
        label: &'static str,
        sql: &str,
        params: P,
    ) -> Result<usize, StorageError> {
        let changed = self.conn.execute(sql, params)?;
        self.record(label);
        Ok(changed)
    }

    pub fn ensure_account(&self, account: &Account) -> Result<AccountId, StorageError> {
        let existing = self
            .conn
            .query_row(
                "
                SELECT _id FROM accounts
                WHERE account_type = ?1 AND account_name = ?2
                  AND IFNULL(data_set, '') = IFNULL(?3, '')
                ",
                params![account.account_type, account.account_name, account.data_set],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(AccountId(id));
        }

        self.conn.execute(
            "INSERT INTO accounts (account_type, account_name, data_set) VALUES (?1, ?2, ?3)",
            params![account.account_type, account.account_name, account.data_set],
        )?;
        Ok(AccountId(self.conn.last_insert_rowid()))
    }

    pub fn account(&self, account_id: AccountId) -> Result<Option<Account>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT account_type, account_name, data_set FROM accounts WHERE _id = ?1",
                [account_id.0],
                |row| {
                    Ok(Account {
                        account_type: row.get(0)?,
                        account_name: row.get(1)?,
                        data_set: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn insert_raw_contact(&self, row: &NewRawContactRow) -> Result<RawContactId, StorageError> {
        self.execute(
            statements::INSERT_RAW_CONTACT,
            "
            INSERT INTO raw_contacts (
                account_id, source_id, aggregation_mode, starred, pinned, aggregation_needed
            ) VALUES (?1, ?2, ?3, ?4, ?5, 1)
            ",
            params![
                row.account_id.map(|id| id.0),
                row.source_id,
                row.aggregation_mode.code(),
                row.starred,
                row.pinned,
            ],
        )?;
        Ok(RawContactId(self.conn.last_insert_rowid()))
    }

    pub fn raw_contact(
        &self,
        raw_contact_id: RawContactId,
    ) -> Result<Option<StoredRawContact>, StorageError> {
        let sql = format!(
            "SELECT {RAW_CONTACT_COLUMNS}
             FROM raw_contacts rc LEFT JOIN accounts a ON a._id = rc.account_id
             WHERE rc._id = ?1"
        );
        Ok(self
            .conn
            .query_row(&sql, [raw_contact_id.0], map_raw_contact)
            .optional()?)
    }

    pub fn require_raw_contact(
        &self,
        raw_contact_id: RawContactId,
    ) -> Result<StoredRawContact, StorageError> {
        self.raw_contact(raw_contact_id)?
            .ok_or(StorageError::MissingRow {
                table: "raw_contacts",
                id: raw_contact_id.0,
            })
    }

    pub fn update_raw_contact(
        &self,
        raw_contact_id: RawContactId,
        changes: &RawContactChanges,
    ) -> Result<usize, StorageError> {
        let mut assignments = Vec::new();
        let mut values = Vec::new();
        if let Some(source_id) = &changes.source_id {
            assignments.push("source_id = ?");
            values.push(source_id.clone().map(Value::Text).unwrap_or(Value::Null));
        }
        if let Some(mode) = changes.aggregation_mode {
            assignments.push("aggregation_mode = ?");
            values.push(Value::Integer(mode.code()));
        }
        if let Some(starred) = changes.starred {
            assignments.push("starred = ?");
            values.push(Value::Integer(i64::from(starred)));
        }
        if let Some(pinned) = changes.pinned {
            assignments.push("pinned = ?");
            values.push(Value::Integer(pinned));
        }
        if let Some(name_verified) = changes.name_verified {
            assignments.push("name_verified = ?");
            values.push(Value::Integer(i64::from(name_verified)));
        }
        if assignments.is_empty() {
            return Ok(0);
        }

        values.push(Value::Integer(raw_contact_id.0));
        let sql = format!(
            "UPDATE raw_contacts SET {} WHERE _id = ?",
            assignments.join(", ")
        );
        self.execute(
            statements::UPDATE_RAW_CONTACT,
            &sql,
            params_from_iter(values),
        )
    }

    pub fn mark_raw_contact_deleted(&self, raw_contact_id: RawContactId) -> Result<usize, StorageError> {
        self.execute(
            statements::UPDATE_RAW_CONTACT,
            "UPDATE raw_contacts SET deleted = 1, aggregation_mode = ?2 WHERE _id = ?1",
            params![raw_contact_id.0, AggregationMode::Disabled.code()],
        )
    }

    /// Hard delete of the raw contact and everything hanging off it.
    pub fn purge_raw_contact(&self, raw_contact_id: RawContactId) -> Result<usize, StorageError> {
        self.conn.execute(
            "DELETE FROM name_lookup WHERE raw_contact_id = ?1",
            [raw_contact_id.0],
        )?;
        self.conn.execute(
            "DELETE FROM presence WHERE presence_raw_contact_id = ?1",
            [raw_contact_id.0],
        )?;
        self.conn.execute(
            "DELETE FROM stream_items WHERE raw_contact_id = ?1",
            [raw_contact_id.0],
        )?;
        self.conn.execute(
            "DELETE FROM data WHERE raw_contact_id = ?1",
            [raw_contact_id.0],
        )?;
        self.execute(
            statements::DELETE_RAW_CONTACT,
            "DELETE FROM raw_contacts WHERE _id = ?1",
            [raw_contact_id.0],
        )
    }

    pub fn set_raw_contact_display_name(
        &self,
        raw_contact_id: RawContactId,
        name: &RawContactDisplayName,
    ) -> Result<usize, StorageError> {
        let primary = bucket_for(name.sort_key.as_deref());
        let alternative = bucket_for(name.sort_key_alt.as_deref());
        self.execute(
            statements::UPDATE_RAW_CONTACT,
            "
            UPDATE raw_contacts SET
                display_name = ?2,
                display_name_alt = ?3,
                display_name_source = ?4,
                phonetic_name = ?5,
                sort_key = ?6,
                sort_key_alt = ?7,
                phonebook_label = ?8,
                phonebook_bucket = ?9,
                phonebook_label_alt = ?10,
                phonebook_bucket_alt = ?11
            WHERE _id = ?1
            ",
            params![
                raw_contact_id.0,
                name.display_name,
                name.display_name_alt,
                name.source.unwrap_or(DisplayNameSource::Undefined).code(),
                name.phonetic_name,
                name.sort_key,
                name.sort_key_alt,
                primary.label,
                primary.index,
                alternative.label,
                alternative.index,
            ],
        )
    }

    pub fn set_raw_contact_aggregate(
        &self,
        raw_contact_id: RawContactId,
        contact_id: Option<ContactId>,
    ) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "UPDATE raw_contacts SET contact_id = ?2, aggregation_needed = 0 WHERE _id = ?1",
            params![raw_contact_id.0, contact_id.map(|id| id.0)],
        )?)
    }

    pub fn mark_aggregation_needed(&self, raw_contact_id: RawContactId) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "UPDATE raw_contacts SET aggregation_needed = 1 WHERE _id = ?1",
            [raw_contact_id.0],
        )?)
    }

    pub fn reset_name_verified_for_siblings(
        &self,
        raw_contact_id: RawContactId,
    ) -> Result<usize, StorageError> {
        self.execute(
            statements::UPDATE_RAW_CONTACT,
            "
            UPDATE raw_contacts SET name_verified = 0
            WHERE _id <> ?1
              AND contact_id IS NOT NULL
              AND contact_id = (SELECT contact_id FROM raw_contacts WHERE _id = ?1)
            ",
            [raw_contact_id.0],
        )
    }

    pub fn raw_contacts_for_contact(
        &self,
        contact_id: ContactId,
    ) -> Result<Vec<StoredRawContact>, StorageError> {
        let sql = format!(
            "SELECT {RAW_CONTACT_COLUMNS}
             FROM raw_contacts rc LEFT JOIN accounts a ON a._id = rc.account_id
             WHERE rc.contact_id = ?1 AND rc.deleted = 0
             ORDER BY rc._id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([contact_id.0], map_raw_contact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_raw_contact_ids(&self) -> Result<Vec<RawContactId>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT _id FROM raw_contacts ORDER BY _id")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0).map(RawContactId))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Live, aggregated raw contacts carrying any of the given source ids.
    pub fn lookup_candidates_by_source_id(
        &self,
        source_ids: &[&str],
    ) -> Result<Vec<StoredRawContact>, StorageError> {
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {RAW_CONTACT_COLUMNS}
             FROM raw_contacts rc LEFT JOIN accounts a ON a._id = rc.account_id
             WHERE rc.source_id IN rarray(?1)
               AND rc.deleted = 0 AND rc.contact_id IS NOT NULL
             ORDER BY rc._id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([text_array(source_ids)], map_raw_contact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn lookup_candidates_by_id(
        &self,
        raw_contact_ids: &[RawContactId],
    ) -> Result<Vec<StoredRawContact>, StorageError> {
        if raw_contact_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {RAW_CONTACT_COLUMNS}
             FROM raw_contacts rc LEFT JOIN accounts a ON a._id = rc.account_id
             WHERE rc._id IN rarray(?1)
               AND rc.deleted = 0 AND rc.contact_id IS NOT NULL
             ORDER BY rc._id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([id_array(raw_contact_ids.iter().map(|id| id.0))], map_raw_contact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Matches against the collation-key entries of the name lookup index.
    pub fn lookup_candidates_by_name(
        &self,
        normalized_names: &[&str],
    ) -> Result<Vec<NameLookupMatch>, StorageError> {
        if normalized_names.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT {RAW_CONTACT_COLUMNS}, nl.normalized_name
             FROM name_lookup nl
             JOIN raw_contacts rc ON rc._id = nl.raw_contact_id
             LEFT JOIN accounts a ON a._id = rc.account_id
             WHERE nl.name_type = {}
               AND nl.normalized_name IN rarray(?1)
               AND rc.deleted = 0 AND rc.contact_id IS NOT NULL
             ORDER BY rc._id",
            NameLookupType::NameCollationKey.code()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([text_array(normalized_names)], |row| {
                Ok(NameLookupMatch {
                    raw_contact: map_raw_contact(row)?,
                    normalized_name: row.get(20)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// One statement for the whole set, regardless of its size.
    pub fn mark_dirty(&self, raw_contact_ids: &BTreeSet<RawContactId>) -> Result<usize, StorageError> {
        if raw_contact_ids.is_empty() {
            return Ok(0);
        }
        self.execute(
            statements::MARK_DIRTY,
            "UPDATE raw_contacts SET dirty = 1 WHERE _id IN rarray(?1)",
            [id_array(raw_contact_ids.iter().map(|id| id.0))],
        )
    }

    pub fn bump_versions(&self, raw_contact_ids: &BTreeSet<RawContactId>) -> Result<usize, StorageError> {
        if raw_contact_ids.is_empty() {
            return Ok(0);
        }
        self.execute(
            statements::BUMP_VERSION,
            "UPDATE raw_contacts SET version = version + 1 WHERE _id IN rarray(?1)",
            [id_array(raw_contact_ids.iter().map(|id| id.0))],
        )
    }

    pub fn touch_contacts_for_raw_contacts(
        &self,
        raw_contact_ids: &BTreeSet<RawContactId>,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        if raw_contact_ids.is_empty() {
            return Ok(0);
        }
        self.execute(
            statements::TOUCH_CONTACTS,
            "UPDATE contacts SET contact_last_updated_timestamp = ?1
             WHERE _id IN (
                SELECT contact_id FROM raw_contacts
                WHERE contact_id IS NOT NULL AND _id IN rarray(?2)
             )",
            params![
                now.timestamp_millis(),
                id_array(raw_contact_ids.iter().map(|id| id.0))
            ],
        )
    }

    pub fn insert_contact(&self) -> Result<ContactId, StorageError> {
        self.execute(
            statements::CONTACT_WRITE,
            "INSERT INTO contacts DEFAULT VALUES",
            [],
        )?;
        Ok(ContactId(self.conn.last_insert_rowid()))
    }

    pub fn contact(&self, contact_id: ContactId) -> Result<Option<StoredContact>, StorageError> {
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE _id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [contact_id.0], map_contact)
            .optional()?)
    }

    pub fn contact_ids(&self) -> Result<Vec<ContactId>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT _id FROM contacts ORDER BY _id")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0).map(ContactId))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn contact_display_names(&self) -> Result<Vec<(ContactId, Option<String>)>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT _id, display_name FROM contacts ORDER BY _id")?;
        let rows = stmt
            .query_map([], |row| Ok((ContactId(row.get(0)?), row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn contact_by_lookup(&self, lookup: &str) -> Result<Option<ContactId>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT _id FROM contacts WHERE lookup = ?1 ORDER BY _id LIMIT 1",
                [lookup],
                |row| row.get::<_, i64>(0).map(ContactId),
            )
            .optional()?)
    }

    pub fn update_contact_summary(
        &self,
        contact_id: ContactId,
        summary: &ContactSummary,
    ) -> Result<usize, StorageError> {
        let primary = bucket_for(summary.sort_key.as_deref());
        let alternative = bucket_for(summary.sort_key_alt.as_deref());
        self.execute(
            statements::CONTACT_WRITE,
            "
            UPDATE contacts SET
                name_raw_contact_id = ?2,
                display_name = ?3,
                display_name_alt = ?4,
                sort_key = ?5,
                sort_key_alt = ?6,
                phonebook_label = ?7,
                phonebook_bucket = ?8,
                phonebook_label_alt = ?9,
                phonebook_bucket_alt = ?10,
                starred = ?11,
                pinned = ?12,
                has_phone_number = ?13,
                lookup = ?14
            WHERE _id = ?1
            ",
            params![
                contact_id.0,
                summary.name_raw_contact_id.map(|id| id.0),
                summary.display_name,
                summary.display_name_alt,
                summary.sort_key,
                summary.sort_key_alt,
                primary.label,
                primary.index,
                alternative.label,
                alternative.index,
                summary.starred,
                summary.pinned,
                summary.has_phone_number,
                summary.lookup,
            ],
        )
    }

    pub fn set_contact_flags(
        &self,
        contact_id: ContactId,
        starred: Option<bool>,
        pinned: Option<i64>,
    ) -> Result<usize, StorageError> {
        if starred.is_none() && pinned.is_none() {
            return Ok(0);
        }
        self.execute(
            statements::CONTACT_WRITE,
            "
            UPDATE contacts SET
                starred = COALESCE(?2, starred),
                pinned = COALESCE(?3, pinned)
            WHERE _id = ?1
            ",
            params![contact_id.0, starred, pinned],
        )
    }

    pub fn delete_contact(&self, contact_id: ContactId) -> Result<usize, StorageError> {
        self.execute(
            statements::CONTACT_WRITE,
            "DELETE FROM contacts WHERE _id = ?1",
            [contact_id.0],
        )
    }

    pub fn insert_data(
        &self,
        raw_contact_id: RawContactId,
        kind: &AttributeKind,
        columns: &DataColumns,
    ) -> Result<DataId, StorageError> {
        let mut values = vec![
            Value::Integer(raw_contact_id.0),
            Value::Text(kind.as_str().to_string()),
        ];
        values.extend(column_values(columns));
        self.execute(
            statements::INSERT_DATA,
            "
            INSERT INTO data (
                raw_contact_id, mimetype,
                data1, data2, data3, data4, data5, data6, data7, data8, data9, data10
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
            params_from_iter(values),
        )?;
        Ok(DataId(self.conn.last_insert_rowid()))
    }

    pub fn data_row(&self, data_id: DataId) -> Result<Option<DataRow>, StorageError> {
        let sql = format!("SELECT {DATA_COLUMNS} FROM data WHERE _id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [data_id.0], map_data_row)
            .optional()?)
    }

    pub fn data_rows_for_raw_contact(
        &self,
        raw_contact_id: RawContactId,
        kind: Option<&AttributeKind>,
    ) -> Result<Vec<DataRow>, StorageError> {
        let mut stmt;
        let rows = match kind {
            Some(kind) => {
                let sql = format!(
                    "SELECT {DATA_COLUMNS} FROM data
                     WHERE raw_contact_id = ?1 AND mimetype = ?2
                     ORDER BY _id"
                );
                stmt = self.conn.prepare(&sql)?;
                stmt.query_map(params![raw_contact_id.0, kind.as_str()], map_data_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {DATA_COLUMNS} FROM data WHERE raw_contact_id = ?1 ORDER BY _id"
                );
                stmt = self.conn.prepare(&sql)?;
                stmt.query_map([raw_contact_id.0], map_data_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    pub fn contact_has_data_of_kind(
        &self,
        contact_id: ContactId,
        kind: &AttributeKind,
    ) -> Result<bool, StorageError> {
        let exists = self.conn.query_row(
            "
            SELECT EXISTS (
                SELECT 1 FROM data
                WHERE mimetype = ?2
                  AND raw_contact_id IN (
                    SELECT _id FROM raw_contacts WHERE contact_id = ?1 AND deleted = 0
                  )
            )
            ",
            params![contact_id.0, kind.as_str()],
            |row| row.get::<_, bool>(0),
        )?;
        Ok(exists)
    }

    /// Rewrites all payload columns and bumps the row's data version.
    pub fn update_data_columns(
        &self,
        data_id: DataId,
        columns: &DataColumns,
    ) -> Result<usize, StorageError> {
        let mut values = column_values(columns);
        values.push(Value::Integer(data_id.0));
        self.execute(
            statements::UPDATE_DATA,
            "
            UPDATE data SET
                data1 = ?1, data2 = ?2, data3 = ?3, data4 = ?4, data5 = ?5,
                data6 = ?6, data7 = ?7, data8 = ?8, data9 = ?9, data10 = ?10,
                data_version = data_version + 1
            WHERE _id = ?11
            ",
            params_from_iter(values),
        )
    }

    pub fn delete_data_row(&self, data_id: DataId) -> Result<usize, StorageError> {
        self.conn
            .execute("DELETE FROM name_lookup WHERE data_id = ?1", [data_id.0])?;
        self.conn
            .execute("DELETE FROM presence WHERE presence_data_id = ?1", [data_id.0])?;
        self.execute(
            statements::DELETE_DATA,
            "DELETE FROM data WHERE _id = ?1",
            [data_id.0],
        )
    }

    /// Makes `data_id` the only primary row of its kind on the raw contact.
    pub fn set_is_primary(
        &self,
        raw_contact_id: RawContactId,
        data_id: DataId,
        kind: &AttributeKind,
    ) -> Result<usize, StorageError> {
        self.execute(
            statements::SET_PRIMARY,
            "
            UPDATE data SET is_primary = (_id = ?3)
            WHERE raw_contact_id = ?1 AND mimetype = ?2
            ",
            params![raw_contact_id.0, kind.as_str(), data_id.0],
        )
    }

    pub fn clear_primary(
        &self,
        raw_contact_id: RawContactId,
        kind: &AttributeKind,
    ) -> Result<usize, StorageError> {
        self.execute(
            statements::SET_PRIMARY,
            "
            UPDATE data SET is_primary = 0
            WHERE raw_contact_id = ?1 AND mimetype = ?2 AND is_primary <> 0
            ",
            params![raw_contact_id.0, kind.as_str()],
        )
    }

    /// Makes `data_id` the only super-primary row of its kind across the
    /// raw contact's aggregate.
    pub fn set_is_super_primary(
        &self,
        raw_contact_id: RawContactId,
        data_id: DataId,
        kind: &AttributeKind,
    ) -> Result<usize, StorageError> {
        let sql = format!(
            "UPDATE data SET is_super_primary = (_id = ?3)
             WHERE mimetype = ?2 AND {AGGREGATE_SCOPE}"
        );
        self.execute(
            statements::SET_SUPER_PRIMARY,
            &sql,
            params![raw_contact_id.0, kind.as_str(), data_id.0],
        )
    }

    pub fn clear_super_primary(
        &self,
        raw_contact_id: RawContactId,
        kind: &AttributeKind,
    ) -> Result<usize, StorageError> {
        self.execute(
            statements::CLEAR_SUPER_PRIMARY,
            "
            UPDATE data SET is_super_primary = 0
            WHERE raw_contact_id = ?1 AND mimetype = ?2 AND is_super_primary <> 0
            ",
            params![raw_contact_id.0, kind.as_str()],
        )
    }

    pub fn aggregate_has_super_primary(
        &self,
        raw_contact_id: RawContactId,
        kind: &AttributeKind,
    ) -> Result<bool, StorageError> {
        Ok(self.super_primary_count(raw_contact_id, kind)? > 0)
    }

    pub fn super_primary_count(
        &self,
        raw_contact_id: RawContactId,
        kind: &AttributeKind,
    ) -> Result<i64, StorageError> {
        let sql = format!(
            "SELECT COUNT(*) FROM data
             WHERE mimetype = ?2 AND is_super_primary <> 0 AND {AGGREGATE_SCOPE}"
        );
        Ok(self.conn.query_row(
            &sql,
            params![raw_contact_id.0, kind.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Kinds holding more than one super-primary row across the aggregate.
    pub fn conflicting_super_primary_kinds(
        &self,
        contact_id: ContactId,
    ) -> Result<Vec<AttributeKind>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT mimetype FROM data
            WHERE is_super_primary <> 0
              AND raw_contact_id IN (SELECT _id FROM raw_contacts WHERE contact_id = ?1)
            GROUP BY mimetype
            HAVING COUNT(*) > 1
            ORDER BY mimetype
            ",
        )?;
        let kinds = stmt
            .query_map([contact_id.0], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .map(|mimetype| AttributeKind::parse(mimetype))
            .collect();
        Ok(kinds)
    }

    pub fn clear_super_primary_for_contact(
        &self,
        contact_id: ContactId,
        kind: &AttributeKind,
    ) -> Result<usize, StorageError> {
        self.execute(
            statements::CLEAR_SUPER_PRIMARY,
            "
            UPDATE data SET is_super_primary = 0
            WHERE mimetype = ?2
              AND raw_contact_id IN (SELECT _id FROM raw_contacts WHERE contact_id = ?1)
            ",
            params![contact_id.0, kind.as_str()],
        )
    }

    pub fn insert_name_lookup(
        &self,
        raw_contact_id: RawContactId,
        data_id: DataId,
        name_type: NameLookupType,
        normalized_name: &str,
    ) -> Result<usize, StorageError> {
        self.execute(
            statements::NAME_LOOKUP,
            "
            INSERT OR IGNORE INTO name_lookup (data_id, raw_contact_id, normalized_name, name_type)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![data_id.0, raw_contact_id.0, normalized_name, name_type.code()],
        )
    }

    pub fn delete_name_lookup_for_data(&self, data_id: DataId) -> Result<usize, StorageError> {
        self.execute(
            statements::NAME_LOOKUP,
            "DELETE FROM name_lookup WHERE data_id = ?1",
            [data_id.0],
        )
    }

    pub fn name_lookup_entries(
        &self,
        raw_contact_id: RawContactId,
    ) -> Result<Vec<(NameLookupType, String)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT name_type, normalized_name FROM name_lookup
            WHERE raw_contact_id = ?1
            ORDER BY name_type, normalized_name
            ",
        )?;
        let rows = stmt
            .query_map([raw_contact_id.0], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(code, name)| NameLookupType::from_code(code).map(|kind| (kind, name)))
            .collect())
    }

    pub fn insert_group(
        &self,
        account_id: Option<AccountId>,
        title: &str,
        source_id: Option<&str>,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO groups (account_id, title, source_id) VALUES (?1, ?2, ?3)",
            params![account_id.map(|id| id.0), title, source_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn group_exists(&self, group_id: i64) -> Result<bool, StorageError> {
        Ok(self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM groups WHERE _id = ?1 AND deleted = 0)",
            [group_id],
            |row| row.get(0),
        )?)
    }

    pub fn insert_sync_state(&self, account_id: AccountId) -> Result<SyncStateId, StorageError> {
        self.conn.execute(
            "
            INSERT INTO sync_state (account_id, data) VALUES (?1, NULL)
            ON CONFLICT(account_id) DO NOTHING
            ",
            [account_id.0],
        )?;
        let id = self.conn.query_row(
            "SELECT _id FROM sync_state WHERE account_id = ?1",
            [account_id.0],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(SyncStateId(id))
    }

    pub fn update_sync_state(&self, id: SyncStateId, data: &[u8]) -> Result<usize, StorageError> {
        self.execute(
            statements::UPDATE_SYNC_STATE,
            "UPDATE sync_state SET data = ?2 WHERE _id = ?1",
            params![id.0, data],
        )
    }

    pub fn sync_state(&self, id: SyncStateId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT data FROM sync_state WHERE _id = ?1",
                [id.0],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?
            .flatten())
    }

    pub fn delete_sync_state(&self, id: SyncStateId) -> Result<usize, StorageError> {
        Ok(self
            .conn
            .execute("DELETE FROM sync_state WHERE _id = ?1", [id.0])?)
    }

    pub fn insert_presence(
        &self,
        data_id: DataId,
        raw_contact_id: RawContactId,
        mode: i64,
        status: Option<&str>,
    ) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "
            INSERT OR REPLACE INTO presence (presence_data_id, presence_raw_contact_id, mode, status)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![data_id.0, raw_contact_id.0, mode, status],
        )?)
    }

    pub fn insert_stream_item(
        &self,
        raw_contact_id: RawContactId,
        text: &str,
        ts: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO stream_items (raw_contact_id, text, timestamp) VALUES (?1, ?2, ?3)",
            params![raw_contact_id.0, text, ts.timestamp_millis()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn social_row_count(&self, raw_contact_id: RawContactId) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "
            SELECT
                (SELECT COUNT(*) FROM presence WHERE presence_raw_contact_id = ?1)
              + (SELECT COUNT(*) FROM stream_items WHERE raw_contact_id = ?1)
            ",
            [raw_contact_id.0],
            |row| row.get(0),
        )?)
    }

    /// Grouped `(label, count)` pairs ordered by phonebook bucket.
    pub fn phonebook_counts(
        &self,
        query: &PhonebookQuery<'_>,
    ) -> Result<Vec<(String, i64)>, StorageError> {
        let (label, bucket) = if query.alternative {
            ("phonebook_label_alt", "phonebook_bucket_alt")
        } else {
            ("phonebook_label", "phonebook_bucket")
        };
        let predicate = query
            .selection
            .map(str::trim)
            .filter(|selection| !selection.is_empty())
            .unwrap_or("1");

        let sql = if query.count_raw_contacts {
            format!(
                "SELECT IFNULL(c.{label}, ''), c.{bucket}, COUNT(rc._id)
                 FROM (SELECT * FROM contacts WHERE {predicate}) c
                 JOIN raw_contacts rc ON rc.contact_id = c._id AND rc.deleted = 0
                 GROUP BY c.{bucket}, c.{label}
                 ORDER BY c.{bucket}, c.{label}"
            )
        } else {
            format!(
                "SELECT IFNULL({label}, ''), {bucket}, COUNT(*)
                 FROM contacts
                 WHERE {predicate}
                 GROUP BY {bucket}, {label}
                 ORDER BY {bucket}, {label}"
            )
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(query.selection_args.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        self.record(statements::PHONEBOOK_INDEX);
        Ok(rows)
    }

    /// Recomputes phonebook labels from stored sort keys, for every raw
    /// contact and contact.
    pub fn rebuild_phonebook_labels(&self) -> Result<usize, StorageError> {
        let mut updated = 0;
        for table in ["raw_contacts", "contacts"] {
            let rows = {
                let mut stmt = self
                    .conn
                    .prepare(&format!("SELECT _id, sort_key, sort_key_alt FROM {table}"))?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            let sql = format!(
                "UPDATE {table} SET
                    phonebook_label = ?2, phonebook_bucket = ?3,
                    phonebook_label_alt = ?4, phonebook_bucket_alt = ?5
                 WHERE _id = ?1"
            );
            for (id, sort_key, sort_key_alt) in rows {
                let primary = bucket_for(sort_key.as_deref());
                let alternative = bucket_for(sort_key_alt.as_deref());
                updated += self.conn.execute(
                    &sql,
                    params![id, primary.label, primary.index, alternative.label, alternative.index],
                )?;
            }
        }
        debug!(event = "phonebook_labels_rebuilt", rows = updated);
        Ok(updated)
    }
}

fn id_array(ids: impl IntoIterator<Item = i64>) -> Array {
    Rc::new(ids.into_iter().map(Value::Integer).collect())
}

fn text_array(values: &[&str]) -> Array {
    Rc::new(values.iter().map(|value| Value::Text(value.to_string())).collect())
}

fn column_values(columns: &DataColumns) -> Vec<Value> {
    columns
        .values
        .iter()
        .map(|value| value.clone().map(Value::Text).unwrap_or(Value::Null))
        .collect()
}

fn aggregation_mode_column(row: &Row<'_>, index: usize) -> rusqlite::Result<AggregationMode> {
    let code: i64 = row.get(index)?;
    AggregationMode::from_code(code).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Integer, Box::new(err))
    })
}

fn map_raw_contact(row: &Row<'_>) -> rusqlite::Result<StoredRawContact> {
    let account_type: Option<String> = row.get(17)?;
    let account = match account_type {
        Some(account_type) => Some(Account {
            account_type,
            account_name: row.get::<_, Option<String>>(18)?.unwrap_or_default(),
            data_set: row.get(19)?,
        }),
        None => None,
    };
    Ok(StoredRawContact {
        id: RawContactId(row.get(0)?),
        account_id: row.get::<_, Option<i64>>(1)?.map(AccountId),
        account,
        source_id: row.get(2)?,
        version: row.get(3)?,
        dirty: row.get(4)?,
        deleted: row.get(5)?,
        contact_id: row.get::<_, Option<i64>>(6)?.map(ContactId),
        aggregation_mode: aggregation_mode_column(row, 7)?,
        aggregation_needed: row.get(8)?,
        starred: row.get(9)?,
        pinned: row.get(10)?,
        display_name: row.get(11)?,
        display_name_alt: row.get(12)?,
        display_name_source: DisplayNameSource::from_code(row.get(13)?),
        sort_key: row.get(14)?,
        sort_key_alt: row.get(15)?,
        name_verified: row.get(16)?,
    })
}

fn map_data_row(row: &Row<'_>) -> rusqlite::Result<DataRow> {
    let mut columns = DataColumns::new();
    for column in 1..=DATA_COLUMN_COUNT {
        columns.set(column, row.get(5 + column)?);
    }
    Ok(DataRow {
        id: DataId(row.get(0)?),
        raw_contact_id: RawContactId(row.get(1)?),
        kind: AttributeKind::parse(&row.get::<_, String>(2)?),
        is_primary: row.get(3)?,
        is_super_primary: row.get(4)?,
        data_version: row.get(5)?,
        columns,
    })
}

fn map_contact(row: &Row<'_>) -> rusqlite::Result<StoredContact> {
    Ok(StoredContact {
        id: ContactId(row.get(0)?),
        name_raw_contact_id: row.get::<_, Option<i64>>(1)?.map(RawContactId),
        display_name: row.get(2)?,
        display_name_alt: row.get(3)?,
        sort_key: row.get(4)?,
        phonebook_label: row.get(5)?,
        phonebook_bucket: row.get(6)?,
        phonebook_label_alt: row.get(7)?,
        phonebook_bucket_alt: row.get(8)?,
        starred: row.get(9)?,
        pinned: row.get(10)?,
        has_phone_number: row.get(11)?,
        lookup: row.get(12)?,
        last_updated_ms: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn raw_contact(store: &ContactsStore, source_id: Option<&str>) -> RawContactId {
        let account_id = store
            .ensure_account(&Account::new("com.example", "x@example.com"))
            .expect("account");
        store
            .insert_raw_contact(&NewRawContactRow {
                account_id: Some(account_id),
                source_id: source_id.map(str::to_string),
                ..NewRawContactRow::default()
            })
            .expect("insert raw contact")
    }

    fn phone(store: &ContactsStore, raw_contact_id: RawContactId, number: &str) -> DataId {
        store
            .insert_data(
                raw_contact_id,
                &AttributeKind::Phone,
                &DataColumns::new().with(1, number).with(2, "2"),
            )
            .expect("insert phone")
    }

    #[test]
    fn migration_creates_contacts_tables() {
        let db = ContactsStore::open_in_memory().expect("open db");

        for table in [
            "accounts",
            "contacts",
            "raw_contacts",
            "data",
            "name_lookup",
            "groups",
            "sync_state",
            "presence",
            "stream_items",
        ] {
            assert!(db.table_exists(table).expect("table exists"), "{table}");
        }
        assert_eq!(db.schema_version().expect("version"), CONTACTS_SCHEMA_VERSION);
    }

    #[test]
    fn rejects_newer_schema_versions() {
        let db = ContactsStore::connect_in_memory().expect("connect");
        db.conn
            .execute_batch("PRAGMA user_version = 99")
            .expect("set version");
        let err = db.migrate().expect_err("newer schema");
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion { found: 99, .. }
        ));
    }

    #[test]
    fn file_backed_store_reopens_at_current_version() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let db = ContactsStore::open(file.path()).expect("open");
            raw_contact(&db, Some("abc"));
        }
        let db = ContactsStore::open(file.path()).expect("reopen");
        assert_eq!(db.schema_version().expect("version"), CONTACTS_SCHEMA_VERSION);
        assert_eq!(db.all_raw_contact_ids().expect("ids").len(), 1);
    }

    #[test]
    fn ensure_account_is_idempotent_per_data_set() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let plain = Account::new("com.example", "x");
        let first = db.ensure_account(&plain).expect("first");
        let second = db.ensure_account(&plain).expect("second");
        let with_set = db
            .ensure_account(&plain.clone().with_data_set("plus"))
            .expect("data set");
        assert_eq!(first, second);
        assert_ne!(first, with_set);
        assert_eq!(db.account(with_set).expect("read"), Some(plain.with_data_set("plus")));
    }

    #[test]
    fn bulk_updates_use_one_statement_per_set() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let ids = (0..4)
            .map(|_| raw_contact(&db, None))
            .collect::<BTreeSet<_>>();

        assert_eq!(db.mark_dirty(&ids).expect("dirty"), 4);
        assert_eq!(db.bump_versions(&ids).expect("version"), 4);
        assert_eq!(db.statement_count(statements::MARK_DIRTY), 1);
        assert_eq!(db.statement_count(statements::BUMP_VERSION), 1);
        assert_eq!(db.mark_dirty(&BTreeSet::new()).expect("empty"), 0);
        assert_eq!(db.statement_count(statements::MARK_DIRTY), 1);

        for id in ids {
            let row = db.require_raw_contact(id).expect("row");
            assert!(row.dirty);
            assert_eq!(row.version, 2);
        }
    }

    #[test]
    fn id_sets_past_the_bind_limit_stay_one_statement() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let contact = db.insert_contact().expect("contact");
        let live = raw_contact(&db, Some("abc"));
        db.set_raw_contact_aggregate(live, Some(contact)).expect("join");
        db.reset_statement_counts();

        // Well past SQLite's default limit of 32766 bound parameters.
        let mut ids = (1_000..41_000).map(RawContactId).collect::<BTreeSet<_>>();
        ids.insert(live);
        assert_eq!(db.mark_dirty(&ids).expect("dirty"), 1);
        assert_eq!(db.bump_versions(&ids).expect("version"), 1);
        assert_eq!(db.touch_contacts_for_raw_contacts(&ids, ts()).expect("touch"), 1);
        assert_eq!(db.statement_count(statements::MARK_DIRTY), 1);
        assert_eq!(db.statement_count(statements::BUMP_VERSION), 1);

        let id_list = ids.iter().copied().collect::<Vec<_>>();
        let by_id = db.lookup_candidates_by_id(&id_list).expect("by id");
        assert_eq!(by_id.iter().map(|row| row.id).collect::<Vec<_>>(), vec![live]);

        let source_ids = (0..40_000).map(|n| format!("s{n}")).collect::<Vec<_>>();
        let mut source_refs = source_ids.iter().map(String::as_str).collect::<Vec<_>>();
        source_refs.push("abc");
        let by_source = db
            .lookup_candidates_by_source_id(&source_refs)
            .expect("by source id");
        assert_eq!(by_source.len(), 1);
        assert!(db
            .lookup_candidates_by_name(&source_refs)
            .expect("by name")
            .is_empty());
    }

    #[test]
    fn primary_statements_keep_single_flag() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let raw = raw_contact(&db, None);
        let first = phone(&db, raw, "111");
        let second = phone(&db, raw, "222");

        db.set_is_primary(raw, first, &AttributeKind::Phone)
            .expect("primary first");
        db.set_is_primary(raw, second, &AttributeKind::Phone)
            .expect("primary second");

        let rows = db
            .data_rows_for_raw_contact(raw, Some(&AttributeKind::Phone))
            .expect("rows");
        assert_eq!(
            rows.iter().filter(|row| row.is_primary).map(|row| row.id).collect::<Vec<_>>(),
            vec![second]
        );
    }

    #[test]
    fn super_primary_scope_spans_the_aggregate() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let contact = db.insert_contact().expect("contact");
        let left = raw_contact(&db, None);
        let right = raw_contact(&db, None);
        db.set_raw_contact_aggregate(left, Some(contact)).expect("join left");
        db.set_raw_contact_aggregate(right, Some(contact)).expect("join right");
        let left_phone = phone(&db, left, "111");
        let right_phone = phone(&db, right, "222");

        db.set_is_super_primary(left, left_phone, &AttributeKind::Phone)
            .expect("super left");
        assert!(db
            .aggregate_has_super_primary(right, &AttributeKind::Phone)
            .expect("has super"));

        db.set_is_super_primary(right, right_phone, &AttributeKind::Phone)
            .expect("super right");
        assert_eq!(
            db.super_primary_count(left, &AttributeKind::Phone).expect("count"),
            1
        );
        let left_row = db.data_row(left_phone).expect("read").expect("row");
        assert!(!left_row.is_super_primary);
    }

    #[test]
    fn unaggregated_raw_contact_is_its_own_scope() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let lone = raw_contact(&db, None);
        let other = raw_contact(&db, None);
        let lone_phone = phone(&db, lone, "111");
        let other_phone = phone(&db, other, "222");

        db.set_is_super_primary(lone, lone_phone, &AttributeKind::Phone)
            .expect("super lone");
        db.set_is_super_primary(other, other_phone, &AttributeKind::Phone)
            .expect("super other");

        assert!(db.data_row(lone_phone).expect("read").expect("row").is_super_primary);
        assert!(db.data_row(other_phone).expect("read").expect("row").is_super_primary);
    }

    #[test]
    fn conflicting_super_primary_kinds_reported_per_contact() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let left = raw_contact(&db, None);
        let right = raw_contact(&db, None);
        let left_phone = phone(&db, left, "111");
        let right_phone = phone(&db, right, "222");
        db.set_is_super_primary(left, left_phone, &AttributeKind::Phone)
            .expect("super left");
        db.set_is_super_primary(right, right_phone, &AttributeKind::Phone)
            .expect("super right");

        let contact = db.insert_contact().expect("contact");
        db.set_raw_contact_aggregate(left, Some(contact)).expect("join left");
        db.set_raw_contact_aggregate(right, Some(contact)).expect("join right");

        assert_eq!(
            db.conflicting_super_primary_kinds(contact).expect("conflicts"),
            vec![AttributeKind::Phone]
        );
        db.clear_super_primary_for_contact(contact, &AttributeKind::Phone)
            .expect("clear");
        assert!(db
            .conflicting_super_primary_kinds(contact)
            .expect("conflicts")
            .is_empty());
    }

    #[test]
    fn lookup_candidates_skip_deleted_and_unaggregated_rows() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let contact = db.insert_contact().expect("contact");
        let live = raw_contact(&db, Some("abc"));
        let pending = raw_contact(&db, Some("abc"));
        let deleted = raw_contact(&db, Some("abc"));
        db.set_raw_contact_aggregate(live, Some(contact)).expect("join");
        db.set_raw_contact_aggregate(deleted, Some(contact)).expect("join");
        db.mark_raw_contact_deleted(deleted).expect("tombstone");

        let candidates = db
            .lookup_candidates_by_source_id(&["abc"])
            .expect("candidates");
        assert_eq!(
            candidates.iter().map(|row| row.id).collect::<Vec<_>>(),
            vec![live]
        );
        assert_eq!(
            candidates[0].account,
            Some(Account::new("com.example", "x@example.com"))
        );
        assert!(db
            .lookup_candidates_by_id(&[pending])
            .expect("by id")
            .is_empty());
    }

    #[test]
    fn name_lookup_candidates_use_collation_keys_only() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let contact = db.insert_contact().expect("contact");
        let raw = raw_contact(&db, None);
        db.set_raw_contact_aggregate(raw, Some(contact)).expect("join");
        let data = db
            .insert_data(raw, &AttributeKind::StructuredName, &DataColumns::new().with(1, "Ada"))
            .expect("name");
        db.insert_name_lookup(raw, data, NameLookupType::NameCollationKey, "ada")
            .expect("collation");
        db.insert_name_lookup(raw, data, NameLookupType::Nickname, "countess")
            .expect("nickname");

        let matches = db.lookup_candidates_by_name(&["ada", "countess"]).expect("matches");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].normalized_name, "ada");
        assert_eq!(matches[0].raw_contact.contact_id, Some(contact));

        db.delete_data_row(data).expect("delete data");
        assert!(db.name_lookup_entries(raw).expect("entries").is_empty());
    }

    #[test]
    fn purge_removes_dependent_rows() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let raw = raw_contact(&db, None);
        let data = phone(&db, raw, "111");
        db.insert_presence(data, raw, 5, Some("available"))
            .expect("presence");
        db.insert_stream_item(raw, "hello", ts()).expect("stream item");
        assert_eq!(db.social_row_count(raw).expect("count"), 2);

        assert_eq!(db.purge_raw_contact(raw).expect("purge"), 1);
        assert_eq!(db.social_row_count(raw).expect("count"), 0);
        assert!(db.data_row(data).expect("read").is_none());
        assert!(db.raw_contact(raw).expect("read").is_none());
    }

    #[test]
    fn update_data_columns_bumps_data_version() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let raw = raw_contact(&db, None);
        let data = phone(&db, raw, "111");
        let mut columns = db.data_row(data).expect("read").expect("row").columns;
        columns.set(1, Some("999".to_string()));
        db.update_data_columns(data, &columns).expect("update");

        let row = db.data_row(data).expect("read").expect("row");
        assert_eq!(row.columns.get(1), Some("999"));
        assert_eq!(row.columns.get(2), Some("2"));
        assert_eq!(row.data_version, 1);
    }

    #[test]
    fn sync_state_update_reports_missing_rows() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let account_id = db
            .ensure_account(&Account::new("com.example", "x"))
            .expect("account");
        let id = db.insert_sync_state(account_id).expect("insert");
        assert_eq!(db.insert_sync_state(account_id).expect("again"), id);

        assert_eq!(db.update_sync_state(id, b"cursor-1").expect("update"), 1);
        assert_eq!(db.sync_state(id).expect("read"), Some(b"cursor-1".to_vec()));

        db.delete_sync_state(id).expect("delete");
        assert_eq!(db.update_sync_state(id, b"cursor-2").expect("update"), 0);
    }

    #[test]
    fn phonebook_counts_group_by_bucket() {
        let db = ContactsStore::open_in_memory().expect("open db");
        for (name, starred) in [("Ada", true), ("alan", false), ("Bob", true), ("42", false)] {
            let contact = db.insert_contact().expect("contact");
            let raw = raw_contact(&db, None);
            db.set_raw_contact_aggregate(raw, Some(contact)).expect("join");
            db.update_contact_summary(
                contact,
                &ContactSummary {
                    display_name: Some(name.to_string()),
                    sort_key: Some(name.to_string()),
                    starred,
                    ..ContactSummary::default()
                },
            )
            .expect("summary");
        }

        let all = db
            .phonebook_counts(&PhonebookQuery::default())
            .expect("counts");
        assert_eq!(
            all,
            vec![
                ("A".to_string(), 2),
                ("B".to_string(), 1),
                ("#".to_string(), 1)
            ]
        );

        let args = vec!["1".to_string()];
        let starred = db
            .phonebook_counts(&PhonebookQuery {
                selection: Some("starred = ?"),
                selection_args: &args,
                count_raw_contacts: true,
                ..PhonebookQuery::default()
            })
            .expect("starred counts");
        assert_eq!(starred, vec![("A".to_string(), 1), ("B".to_string(), 1)]);
        assert_eq!(db.statement_count(statements::PHONEBOOK_INDEX), 2);
    }

    #[test]
    fn touch_contacts_records_timestamp() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let contact = db.insert_contact().expect("contact");
        let raw = raw_contact(&db, None);
        db.set_raw_contact_aggregate(raw, Some(contact)).expect("join");

        let touched = db
            .touch_contacts_for_raw_contacts(&BTreeSet::from([raw]), ts())
            .expect("touch");
        assert_eq!(touched, 1);
        let stored = db.contact(contact).expect("read").expect("contact");
        assert_eq!(stored.last_updated(), Some(ts()));
    }

    #[test]
    fn rebuild_phonebook_labels_rederives_buckets() {
        let db = ContactsStore::open_in_memory().expect("open db");
        let contact = db.insert_contact().expect("contact");
        db.conn
            .execute(
                "UPDATE contacts SET sort_key = 'zed', phonebook_label = 'stale' WHERE _id = ?1",
                [contact.0],
            )
            .expect("seed");

        assert!(db.rebuild_phonebook_labels().expect("rebuild") >= 1);
        let stored = db.contact(contact).expect("read").expect("contact");
        assert_eq!(stored.phonebook_label.as_deref(), Some("Z"));
        assert_eq!(stored.phonebook_bucket, 26);
    }

    #[test]
    fn rollback_discards_uncommitted_writes() {
        let db = ContactsStore::open_in_memory().expect("open db");
        db.begin().expect("begin");
        assert!(db.in_transaction());
        raw_contact(&db, None);
        db.rollback().expect("rollback");
        assert!(!db.in_transaction());
        assert!(db.all_raw_contact_ids().expect("ids").is_empty());
    }
}
