use super::{non_empty, type_code, DataPatch, DataRowHandler, HandlerContext, TypeRank};
use crate::config::ProviderConfig;
use crate::transaction::MutationEffects;
use crate::ProviderError;
use contacts_core::name::normalize;
use contacts_core::{AttributeKind, NameLookupType};
use contacts_storage::{DataColumns, DataRow};

static NICKNAME: AttributeKind = AttributeKind::Nickname;
static ORGANIZATION: AttributeKind = AttributeKind::Organization;
static GROUP_MEMBERSHIP: AttributeKind = AttributeKind::GroupMembership;

const GROUP_ROW_ID: usize = 1;

#[derive(Debug, Default, Clone, Copy)]
pub struct NicknameHandler;

impl DataRowHandler for NicknameHandler {
    fn kind(&self) -> &AttributeKind {
        &NICKNAME
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
        let nickname = non_empty(row.columns.get(1))
            .map(normalize)
            .filter(|nickname| !nickname.is_empty());
        if let Some(nickname) = nickname {
            ctx.store.insert_name_lookup(
                row.raw_contact_id,
                row.id,
                NameLookupType::Nickname,
                &nickname,
            )?;
        }
        effects.refresh_display_name(row.raw_contact_id);
        Ok(())
    }

    fn after_delete(
        &self,
        _ctx: &HandlerContext<'_>,
        row: &DataRow,
        effects: &mut MutationEffects,
    ) -> Result<(), ProviderError> {
        effects.refresh_display_name(row.raw_contact_id);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OrganizationHandler;

impl DataRowHandler for OrganizationHandler {
    fn kind(&self) -> &AttributeKind {
        &ORGANIZATION
    }

    fn is_searchable(&self) -> bool {
        true
    }

    fn after_write(
        &self,
        _ctx: &HandlerContext<'_>,
        row: &DataRow,
        effects: &mut MutationEffects,
    ) -> Result<(), ProviderError> {
        effects.refresh_display_name(row.raw_contact_id);
        Ok(())
    }

    fn after_delete(
        &self,
        _ctx: &HandlerContext<'_>,
        row: &DataRow,
        effects: &mut MutationEffects,
    ) -> Result<(), ProviderError> {
        effects.refresh_display_name(row.raw_contact_id);
        Ok(())
    }
}

/// Membership rows must point at a live group. Membership changes move
/// contacts in and out of group-filtered lists, so the fast index goes too.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupMembershipHandler;

impl DataRowHandler for GroupMembershipHandler {
    fn kind(&self) -> &AttributeKind {
        &GROUP_MEMBERSHIP
    }

    fn fix_up(
        &self,
        ctx: &HandlerContext<'_>,
        columns: &mut DataColumns,
        _previous: Option<&DataRow>,
        _patch: &DataPatch,
    ) -> Result<(), ProviderError> {
        let group_id = non_empty(columns.get(GROUP_ROW_ID))
            .ok_or_else(|| ProviderError::invalid_attribute("data1", "group id is required"))?
            .parse::<i64>()
            .map_err(|_| ProviderError::invalid_attribute("data1", "group id must be an integer"))?;
        if !ctx.store.group_exists(group_id)? {
            return Err(ProviderError::invalid_attribute(
                "data1",
                format!("group {group_id} does not exist"),
            ));
        }
        Ok(())
    }

    fn after_write(
        &self,
        _ctx: &HandlerContext<'_>,
        _row: &DataRow,
        effects: &mut MutationEffects,
    ) -> Result<(), ProviderError> {
        effects.invalidate_fast_index();
        Ok(())
    }

    fn after_delete(
        &self,
        _ctx: &HandlerContext<'_>,
        _row: &DataRow,
        effects: &mut MutationEffects,
    ) -> Result<(), ProviderError> {
        effects.invalidate_fast_index();
        Ok(())
    }
}

/// Kinds with no behaviour beyond the shared primary-flag handling.
pub struct GenericHandler {
    kind: AttributeKind,
    rank: TypeRank,
    searchable: bool,
}

impl GenericHandler {
    pub fn new(kind: AttributeKind, config: &ProviderConfig) -> Self {
        let rank = TypeRank::from_config(config, &kind, &[]);
        Self {
            kind,
            rank,
            searchable: false,
        }
    }

    pub fn searchable(kind: AttributeKind, config: &ProviderConfig) -> Self {
        Self {
            searchable: true,
            ..Self::new(kind, config)
        }
    }

    pub fn fallback(kind: AttributeKind) -> Self {
        Self {
            kind,
            rank: TypeRank::default(),
            searchable: false,
        }
    }
}

impl DataRowHandler for GenericHandler {
    fn kind(&self) -> &AttributeKind {
        &self.kind
    }

    fn type_rank(&self, row: &DataRow) -> i64 {
        self.rank.rank(type_code(row))
    }

    fn is_searchable(&self) -> bool {
        self.searchable
    }
}
