//! Device specification and command operations. The command counter is
//! seeded at `i64::MAX` when the specification is created and decremented per
//! command, so newer commands sort first in the command range.

use crate::entity::{CascadeOutcome, Context, Pager, SearchCriteria, SearchResults, DELETED_COLUMN};
use crate::error::Result;
use crate::keys::{EntityClass, KeyBuilder, ELEMENT};
use crate::kv::{encode_counter, Row, Table};
use crate::marshal::PayloadMarshaler;
use crate::model::{CommandParameter, DeviceCommand, DeviceSpecification, EntityMetadata};
use crate::site::required_primary_key;

pub const COMMAND_COUNTER: &str = "commandctr";
pub const COMMAND_ID_WIDTH: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct SpecificationCreateRequest {
    pub token: Option<String>,
    pub name: String,
    pub asset_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CommandCreateRequest {
    pub token: Option<String>,
    pub name: String,
    pub namespace: Option<String>,
    pub parameters: Vec<CommandParameter>,
}

pub fn create_specification<M: PayloadMarshaler>(
    ctx: &Context<M>,
    request: SpecificationCreateRequest,
    created_by: &str,
) -> Result<DeviceSpecification> {
    let (token, value) = match request.token {
        Some(token) => {
            let value = ctx
                .registry
                .use_existing_id(EntityClass::Specification, &token)?;
            (token, value)
        }
        None => ctx.registry.create_unique_id(EntityClass::Specification)?,
    };
    let specification = DeviceSpecification {
        token,
        name: request.name,
        asset_id: request.asset_id,
        meta: EntityMetadata::new(created_by),
    };
    let key = KeyBuilder::for_class(EntityClass::Specification).primary_key(&value);
    let seed = Row::from([(COMMAND_COUNTER.to_string(), encode_counter(i64::MAX))]);
    ctx.write_entity(EntityClass::Specification, &key, &specification, seed)?;
    Ok(specification)
}

pub fn get_specification<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
) -> Result<Option<DeviceSpecification>> {
    ctx.load_active(EntityClass::Specification, token)
}

pub fn update_specification<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    request: SpecificationCreateRequest,
    updated_by: &str,
) -> Result<DeviceSpecification> {
    let mut specification: DeviceSpecification = ctx
        .load_active(EntityClass::Specification, token)?
        .ok_or_else(|| EntityClass::Specification.not_found())?;
    specification.name = request.name;
    specification.asset_id = request.asset_id;
    let key = required_primary_key(ctx, EntityClass::Specification, token)?;
    ctx.update_entity(EntityClass::Specification, &key, &mut specification, updated_by, Row::new())?;
    Ok(specification)
}

pub fn list_specifications<M: PayloadMarshaler>(
    ctx: &Context<M>,
    criteria: SearchCriteria,
    include_deleted: bool,
) -> Result<SearchResults<DeviceSpecification>> {
    ctx.list_primary(EntityClass::Specification, criteria, include_deleted, |_| true)
}

pub fn delete_specification<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    force: bool,
    deleted_by: &str,
) -> Result<(DeviceSpecification, CascadeOutcome)> {
    if !force {
        let specification = ctx
            .soft_delete::<DeviceSpecification>(EntityClass::Specification, token, deleted_by)?
            .ok_or_else(|| EntityClass::Specification.not_found())?;
        return Ok((specification, CascadeOutcome::default()));
    }
    let specification: DeviceSpecification = ctx
        .load_entity(EntityClass::Specification, token)?
        .ok_or_else(|| EntityClass::Specification.not_found())?;
    let value = ctx
        .registry
        .require_value(EntityClass::Specification, token)?;
    let builder = KeyBuilder::for_class(EntityClass::Specification);
    let start = builder.subkey(&value, ELEMENT);
    let stop = builder.subkey(&value, ELEMENT + 1);
    let outcome = ctx.cascade_delete_range(&start, &stop)?;
    ctx.force_delete(EntityClass::Specification, token)?;
    Ok((specification, outcome))
}

pub fn create_command<M: PayloadMarshaler>(
    ctx: &Context<M>,
    specification_token: &str,
    request: CommandCreateRequest,
    created_by: &str,
) -> Result<DeviceCommand> {
    let value = ctx
        .registry
        .require_value(EntityClass::Specification, specification_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Specification);
    let spec_key = builder.primary_key(&value);
    // Descending allocation: later commands get smaller ids and sort first.
    let command_id =
        ctx.store
            .atomic_increment(Table::Entities, &spec_key, COMMAND_COUNTER, -1)? as u64;
    let command_key = builder.child_key(&value, ELEMENT, command_id, COMMAND_ID_WIDTH);
    let token = ctx.registry.register_key(
        EntityClass::Command,
        request.token.as_deref(),
        command_key.clone(),
    )?;
    let command = DeviceCommand {
        token,
        specification_token: specification_token.to_string(),
        name: request.name,
        namespace: request.namespace,
        parameters: request.parameters,
        meta: EntityMetadata::new(created_by),
    };
    ctx.write_entity(EntityClass::Command, &command_key, &command, Row::new())?;
    Ok(command)
}

pub fn get_command<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
) -> Result<Option<DeviceCommand>> {
    ctx.load_active(EntityClass::Command, token)
}

pub fn update_command<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    request: CommandCreateRequest,
    updated_by: &str,
) -> Result<DeviceCommand> {
    let mut command: DeviceCommand = ctx
        .load_active(EntityClass::Command, token)?
        .ok_or_else(|| EntityClass::Command.not_found())?;
    command.name = request.name;
    command.namespace = request.namespace;
    command.parameters = request.parameters;
    let key = required_primary_key(ctx, EntityClass::Command, token)?;
    ctx.update_entity(EntityClass::Command, &key, &mut command, updated_by, Row::new())?;
    Ok(command)
}

/// Commands of a specification, newest first (the counter inversion makes
/// that the natural key order).
pub fn list_commands<M: PayloadMarshaler>(
    ctx: &Context<M>,
    specification_token: &str,
    criteria: SearchCriteria,
) -> Result<SearchResults<DeviceCommand>> {
    let value = ctx
        .registry
        .require_value(EntityClass::Specification, specification_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Specification);
    let start = builder.subkey(&value, ELEMENT);
    let stop = builder.subkey(&value, ELEMENT + 1);
    let mut pager = Pager::new(criteria);
    for (_, row) in ctx.store.scan(Table::Entities, &start, &stop)? {
        if row.contains_key(DELETED_COLUMN) {
            continue;
        }
        let Some(command) = ctx.read_row::<DeviceCommand>(&row)? else {
            continue;
        };
        pager.process(command);
    }
    Ok(pager.into_results())
}

pub fn delete_command<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    force: bool,
    deleted_by: &str,
) -> Result<DeviceCommand> {
    if !force {
        return ctx
            .soft_delete(EntityClass::Command, token, deleted_by)?
            .ok_or_else(|| EntityClass::Command.not_found());
    }
    let command: DeviceCommand = ctx
        .load_entity(EntityClass::Command, token)?
        .ok_or_else(|| EntityClass::Command.not_found())?;
    ctx.force_delete(EntityClass::Command, token)?;
    Ok(command)
}
