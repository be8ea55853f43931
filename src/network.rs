//! Device network and network element operations. Same element packing as
//! device groups: counter-ordered child rows with a raw combined-identifier
//! column, where the nested discriminator points at another network.

use tracing::warn;

use crate::entity::{
    CascadeOutcome, Context, Pager, SearchCriteria, SearchResults, DELETED_COLUMN, PAYLOAD_COLUMN,
};
use crate::error::Result;
use crate::group::{combined_identifier, ELEMENT_COUNTER, ELEMENT_IDENTIFIER_COLUMN, ELEMENT_ID_WIDTH};
use crate::keys::{EntityClass, KeyBuilder, ELEMENT};
use crate::kv::{Row, Table};
use crate::marshal::PayloadMarshaler;
use crate::model::{DeviceNetwork, DeviceNetworkElement, ElementTargetKind, EntityMetadata};
use crate::site::required_primary_key;

#[derive(Debug, Clone, Default)]
pub struct NetworkCreateRequest {
    pub token: Option<String>,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct NetworkElementCreateRequest {
    pub target: ElementTargetKind,
    pub element_token: String,
}

pub fn create_network<M: PayloadMarshaler>(
    ctx: &Context<M>,
    request: NetworkCreateRequest,
    created_by: &str,
) -> Result<DeviceNetwork> {
    let (token, value) = match request.token {
        Some(token) => {
            let value = ctx.registry.use_existing_id(EntityClass::Network, &token)?;
            (token, value)
        }
        None => ctx.registry.create_unique_id(EntityClass::Network)?,
    };
    let network = DeviceNetwork {
        token,
        name: request.name,
        description: request.description,
        meta: EntityMetadata::new(created_by),
    };
    let key = KeyBuilder::for_class(EntityClass::Network).primary_key(&value);
    ctx.write_entity(EntityClass::Network, &key, &network, Row::new())?;
    Ok(network)
}

pub fn get_network<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
) -> Result<Option<DeviceNetwork>> {
    ctx.load_active(EntityClass::Network, token)
}

pub fn update_network<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    request: NetworkCreateRequest,
    updated_by: &str,
) -> Result<DeviceNetwork> {
    let mut network: DeviceNetwork = ctx
        .load_active(EntityClass::Network, token)?
        .ok_or_else(|| EntityClass::Network.not_found())?;
    network.name = request.name;
    network.description = request.description;
    let key = required_primary_key(ctx, EntityClass::Network, token)?;
    ctx.update_entity(EntityClass::Network, &key, &mut network, updated_by, Row::new())?;
    Ok(network)
}

pub fn list_networks<M: PayloadMarshaler>(
    ctx: &Context<M>,
    criteria: SearchCriteria,
    include_deleted: bool,
) -> Result<SearchResults<DeviceNetwork>> {
    ctx.list_primary(EntityClass::Network, criteria, include_deleted, |_| true)
}

pub fn delete_network<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    force: bool,
    deleted_by: &str,
) -> Result<(DeviceNetwork, CascadeOutcome)> {
    if !force {
        let network = ctx
            .soft_delete::<DeviceNetwork>(EntityClass::Network, token, deleted_by)?
            .ok_or_else(|| EntityClass::Network.not_found())?;
        return Ok((network, CascadeOutcome::default()));
    }
    let network: DeviceNetwork = ctx
        .load_entity(EntityClass::Network, token)?
        .ok_or_else(|| EntityClass::Network.not_found())?;
    let value = ctx.registry.require_value(EntityClass::Network, token)?;
    let builder = KeyBuilder::for_class(EntityClass::Network);
    let start = builder.subkey(&value, ELEMENT);
    let stop = builder.subkey(&value, ELEMENT + 1);
    let outcome = ctx.cascade_delete_range(&start, &stop)?;
    ctx.force_delete(EntityClass::Network, token)?;
    Ok((network, outcome))
}

pub fn add_network_elements<M: PayloadMarshaler>(
    ctx: &Context<M>,
    network_token: &str,
    requests: Vec<NetworkElementCreateRequest>,
) -> Result<Vec<DeviceNetworkElement>> {
    let value = ctx.registry.require_value(EntityClass::Network, network_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Network);
    let network_key = builder.primary_key(&value);
    let mut added = Vec::with_capacity(requests.len());
    for request in requests {
        let target_class = match request.target {
            ElementTargetKind::Device => EntityClass::Device,
            ElementTargetKind::Nested => EntityClass::Network,
        };
        ctx.registry
            .require_value(target_class, &request.element_token)?;
        let index =
            ctx.store
                .atomic_increment(Table::Entities, &network_key, ELEMENT_COUNTER, 1)? as u64;
        let element_key = builder.child_key(&value, ELEMENT, index, ELEMENT_ID_WIDTH);
        let element = DeviceNetworkElement {
            network_token: network_token.to_string(),
            index,
            target: request.target,
            element_token: request.element_token,
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

pub fn remove_network_elements<M: PayloadMarshaler>(
    ctx: &Context<M>,
    network_token: &str,
    targets: &[(ElementTargetKind, String)],
) -> Result<Vec<DeviceNetworkElement>> {
    let value = ctx.registry.require_value(EntityClass::Network, network_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Network);
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
                if let Some(element) = ctx.read_row::<DeviceNetworkElement>(&row)? {
                    removed.push(element);
                }
            }
            Err(err) => warn!(error = %err, "failed to remove network element, continuing"),
        }
    }
    Ok(removed)
}

pub fn list_network_elements<M: PayloadMarshaler>(
    ctx: &Context<M>,
    network_token: &str,
    criteria: SearchCriteria,
) -> Result<SearchResults<DeviceNetworkElement>> {
    let value = ctx.registry.require_value(EntityClass::Network, network_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Network);
    let start = builder.subkey(&value, ELEMENT);
    let stop = builder.subkey(&value, ELEMENT + 1);
    let mut pager = Pager::new(criteria);
    for (_, row) in ctx.store.scan(Table::Entities, &start, &stop)? {
        if row.contains_key(DELETED_COLUMN) {
            continue;
        }
        let Some(element) = ctx.read_row::<DeviceNetworkElement>(&row)? else {
            continue;
        };
        pager.process(element);
    }
    Ok(pager.into_results())
}
