//! Device group and group element operations. Elements live under the group
//! prefix in counter order and carry a packed combined identifier column so
//! membership checks compare raw bytes without touching the payload.

use tracing::warn;

use crate::entity::{
    CascadeOutcome, Context, Pager, SearchCriteria, SearchResults, DELETED_COLUMN, PAYLOAD_COLUMN,
};
use crate::error::Result;
use crate::keys::{EntityClass, KeyBuilder, ELEMENT};
use crate::kv::{Row, Table};
use crate::marshal::PayloadMarshaler;
use crate::model::{DeviceGroup, DeviceGroupElement, ElementTargetKind, EntityMetadata};
use crate::site::required_primary_key;

pub const ELEMENT_COUNTER: &str = "elementctr";
/// Packed combined identifier: discriminator byte + target token bytes.
pub const ELEMENT_IDENTIFIER_COLUMN: &str = "i";
pub const ELEMENT_ID_WIDTH: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct GroupCreateRequest {
    pub token: Option<String>,
    pub name: String,
    pub description: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GroupElementCreateRequest {
    pub target: ElementTargetKind,
    pub element_token: String,
    pub roles: Vec<String>,
}

pub(crate) fn combined_identifier(target: ElementTargetKind, token: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(token.len() + 1);
    bytes.push(target.discriminator());
    bytes.extend_from_slice(token.as_bytes());
    bytes
}

pub fn create_group<M: PayloadMarshaler>(
    ctx: &Context<M>,
    request: GroupCreateRequest,
    created_by: &str,
) -> Result<DeviceGroup> {
    let (token, value) = match request.token {
        Some(token) => {
            let value = ctx.registry.use_existing_id(EntityClass::Group, &token)?;
            (token, value)
        }
        None => ctx.registry.create_unique_id(EntityClass::Group)?,
    };
    let group = DeviceGroup {
        token,
        name: request.name,
        description: request.description,
        roles: request.roles,
        meta: EntityMetadata::new(created_by),
    };
    let key = KeyBuilder::for_class(EntityClass::Group).primary_key(&value);
    ctx.write_entity(EntityClass::Group, &key, &group, Row::new())?;
    Ok(group)
}

pub fn get_group<M: PayloadMarshaler>(ctx: &Context<M>, token: &str) -> Result<Option<DeviceGroup>> {
    ctx.load_active(EntityClass::Group, token)
}

pub fn update_group<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    request: GroupCreateRequest,
    updated_by: &str,
) -> Result<DeviceGroup> {
    let mut group: DeviceGroup = ctx
        .load_active(EntityClass::Group, token)?
        .ok_or_else(|| EntityClass::Group.not_found())?;
    group.name = request.name;
    group.description = request.description;
    group.roles = request.roles;
    let key = required_primary_key(ctx, EntityClass::Group, token)?;
    ctx.update_entity(EntityClass::Group, &key, &mut group, updated_by, Row::new())?;
    Ok(group)
}

pub fn list_groups<M: PayloadMarshaler>(
    ctx: &Context<M>,
    criteria: SearchCriteria,
    include_deleted: bool,
    role: Option<&str>,
) -> Result<SearchResults<DeviceGroup>> {
    ctx.list_primary(EntityClass::Group, criteria, include_deleted, |group: &DeviceGroup| {
        role.is_none_or(|role| group.roles.iter().any(|r| r == role))
    })
}

pub fn delete_group<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    force: bool,
    deleted_by: &str,
) -> Result<(DeviceGroup, CascadeOutcome)> {
    if !force {
        let group = ctx
            .soft_delete::<DeviceGroup>(EntityClass::Group, token, deleted_by)?
            .ok_or_else(|| EntityClass::Group.not_found())?;
        return Ok((group, CascadeOutcome::default()));
    }
    let group: DeviceGroup = ctx
        .load_entity(EntityClass::Group, token)?
        .ok_or_else(|| EntityClass::Group.not_found())?;
    let value = ctx.registry.require_value(EntityClass::Group, token)?;
    let builder = KeyBuilder::for_class(EntityClass::Group);
    let start = builder.subkey(&value, ELEMENT);
    let stop = builder.subkey(&value, ELEMENT + 1);
    let outcome = ctx.cascade_delete_range(&start, &stop)?;
    ctx.force_delete(EntityClass::Group, token)?;
    Ok((group, outcome))
}

/// Append elements to a group. Targets must exist; element order follows the
/// group's element counter.
pub fn add_group_elements<M: PayloadMarshaler>(
    ctx: &Context<M>,
    group_token: &str,
    requests: Vec<GroupElementCreateRequest>,
) -> Result<Vec<DeviceGroupElement>> {
    let value = ctx.registry.require_value(EntityClass::Group, group_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Group);
    let group_key = builder.primary_key(&value);
    let mut added = Vec::with_capacity(requests.len());
    for request in requests {
        let target_class = match request.target {
            ElementTargetKind::Device => EntityClass::Device,
            ElementTargetKind::Nested => EntityClass::Group,
        };
        ctx.registry
            .require_value(target_class, &request.element_token)?;
        let index =
            ctx.store
                .atomic_increment(Table::Entities, &group_key, ELEMENT_COUNTER, 1)? as u64;
        let element_key = builder.child_key(&value, ELEMENT, index, ELEMENT_ID_WIDTH);
        let element = DeviceGroupElement {
            group_token: group_token.to_string(),
            index,
            target: request.target,
            element_token: request.element_token,
            roles: request.roles,
        };
        let payload = ctx.marshaler.serialize(&element)?;
        let columns = Row::from([
            (PAYLOAD_COLUMN.to_string(), payload),
            (
                ELEMENT_IDENTIFIER_COLUMN.to_string(),
                combined_identifier(element.target, &element.element_token),
            ),
        ]);
        ctx.store.put(Table::Entities, &element_key, columns)?;
        added.push(element);
    }
    Ok(added)
}

/// Remove every element matching one of the given targets. Byte-compares the
/// identifier column; rows that fail to delete are skipped and logged.
pub fn remove_group_elements<M: PayloadMarshaler>(
    ctx: &Context<M>,
    group_token: &str,
    targets: &[(ElementTargetKind, String)],
) -> Result<Vec<DeviceGroupElement>> {
    let value = ctx.registry.require_value(EntityClass::Group, group_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Group);
    let start = builder.subkey(&value, ELEMENT);
    let stop = builder.subkey(&value, ELEMENT + 1);
    let wanted: Vec<Vec<u8>> = targets
        .iter()
        .map(|(target, token)| combined_identifier(*target, token))
        .collect();
    let mut removed = Vec::new();
    for (key, row) in ctx.store.scan(Table::Entities, &start, &stop)? {
        let matches = row
            .get(ELEMENT_IDENTIFIER_COLUMN)
            .is_some_and(|id| wanted.iter().any(|w| w == id));
        if !matches {
            continue;
        }
        match ctx.store.delete(Table::Entities, &key) {
            Ok(()) => {
                if let Some(element) = ctx.read_row::<DeviceGroupElement>(&row)? {
                    removed.push(element);
                }
            }
            Err(err) => warn!(error = %err, "failed to remove group element, continuing"),
        }
    }
    Ok(removed)
}

pub fn list_group_elements<M: PayloadMarshaler>(
    ctx: &Context<M>,
    group_token: &str,
    criteria: SearchCriteria,
) -> Result<SearchResults<DeviceGroupElement>> {
    let value = ctx.registry.require_value(EntityClass::Group, group_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Group);
    let start = builder.subkey(&value, ELEMENT);
    let stop = builder.subkey(&value, ELEMENT + 1);
    let mut pager = Pager::new(criteria);
    for (_, row) in ctx.store.scan(Table::Entities, &start, &stop)? {
        if row.contains_key(DELETED_COLUMN) {
            continue;
        }
        let Some(element) = ctx.read_row::<DeviceGroupElement>(&row)? else {
            continue;
        };
        pager.process(element);
    }
    Ok(pager.into_results())
}
