use super::{non_empty, type_code, DataPatch, DataRowHandler, HandlerContext, TypeRank};
use crate::config::ProviderConfig;
use crate::transaction::MutationEffects;
use crate::ProviderError;
use contacts_core::name::{email_handle, normalize};
use contacts_core::{AttributeKind, NameLookupType};
use contacts_storage::{DataColumns, DataRow};

static PHONE: AttributeKind = AttributeKind::Phone;
static EMAIL: AttributeKind = AttributeKind::Email;

/// Mobile, home, work, main, other.
const DEFAULT_PHONE_RANK: [i64; 5] = [2, 1, 3, 12, 7];
/// Home, work, other, mobile.
const DEFAULT_EMAIL_RANK: [i64; 4] = [1, 2, 3, 4];

const NUMBER: usize = 1;
const NORMALIZED_NUMBER: usize = 4;
const ADDRESS: usize = 1;

pub struct PhoneHandler {
    rank: TypeRank,
}

impl PhoneHandler {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            rank: TypeRank::from_config(config, &PHONE, &DEFAULT_PHONE_RANK),
        }
    }
}

/// Digits only, keeping a leading `+`.
pub fn normalize_number(number: &str) -> Option<String> {
    let trimmed = number.trim();
    let digits = trimmed
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    if digits.is_empty() {
        return None;
    }
    if trimmed.starts_with('+') {
        Some(format!("+{digits}"))
    } else {
        Some(digits)
    }
}

impl DataRowHandler for PhoneHandler {
    fn kind(&self) -> &AttributeKind {
        &PHONE
    }

    fn type_rank(&self, row: &DataRow) -> i64 {
        self.rank.rank(type_code(row))
    }

    fn is_searchable(&self) -> bool {
        true
    }

    fn fix_up(
        &self,
        _ctx: &HandlerContext<'_>,
        columns: &mut DataColumns,
        previous: Option<&DataRow>,
        patch: &DataPatch,
    ) -> Result<(), ProviderError> {
        if previous.is_none() || patch.touches(NUMBER) {
            let normalized = columns.get(NUMBER).and_then(normalize_number);
            columns.set(NORMALIZED_NUMBER, normalized);
        }
        Ok(())
    }

    fn after_write(
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

pub struct EmailHandler {
    rank: TypeRank,
}

impl EmailHandler {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            rank: TypeRank::from_config(config, &EMAIL, &DEFAULT_EMAIL_RANK),
        }
    }
}

impl DataRowHandler for EmailHandler {
    fn kind(&self) -> &AttributeKind {
        &EMAIL
    }

    fn type_rank(&self, row: &DataRow) -> i64 {
        self.rank.rank(type_code(row))
    }

    fn is_searchable(&self) -> bool {
        true
    }

    fn after_write(
        &self,
        ctx: &HandlerContext<'_>,
        row: &DataRow,
        effects: &mut MutationEffects,
    ) -> Result<(), ProviderError> {
        ctx.store.delete_name_lookup_for_data(row.id)?;
        let handle = non_empty(row.columns.get(ADDRESS))
            .and_then(email_handle)
            .map(|handle| normalize(&handle))
            .filter(|handle| !handle.is_empty());
        if let Some(handle) = handle {
            ctx.store.insert_name_lookup(
                row.raw_contact_id,
                row.id,
                NameLookupType::EmailBasedNickname,
                &handle,
            )?;
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
