//! Batch operation persistence: one primary row per operation plus one
//! counter-ordered element row per targeted device, each carrying its own
//! processing status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::entity::{
    CascadeOutcome, Context, Pager, SearchCriteria, SearchResults, DELETED_COLUMN, PAYLOAD_COLUMN,
};
use crate::error::Result;
use crate::group::ELEMENT_COUNTER;
use crate::keys::{EntityClass, KeyBuilder, ELEMENT};
use crate::kv::{Row, Table};
use crate::marshal::PayloadMarshaler;
use crate::model::{BatchElement, BatchOperation, EntityMetadata, ProcessingStatus};
use crate::site::required_primary_key;

pub const BATCH_ELEMENT_ID_WIDTH: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct BatchOperationCreateRequest {
    pub token: Option<String>,
    pub operation_type: String,
    pub parameters: BTreeMap<String, String>,
    /// Devices targeted by the operation, one element row each.
    pub device_tokens: Vec<String>,
}

pub fn create_batch_operation<M: PayloadMarshaler>(
    ctx: &Context<M>,
    request: BatchOperationCreateRequest,
    created_by: &str,
) -> Result<BatchOperation> {
    let (token, value) = match request.token {
        Some(token) => {
            let value = ctx
                .registry
                .use_existing_id(EntityClass::BatchOperation, &token)?;
            (token, value)
        }
        None => ctx.registry.create_unique_id(EntityClass::BatchOperation)?,
    };
    let operation = BatchOperation {
        token: token.clone(),
        operation_type: request.operation_type,
        parameters: request.parameters,
        processing_status: ProcessingStatus::Unprocessed,
        meta: EntityMetadata::new(created_by),
    };
    let builder = KeyBuilder::for_class(EntityClass::BatchOperation);
    let key = builder.primary_key(&value);
    ctx.write_entity(EntityClass::BatchOperation, &key, &operation, Row::new())?;

    for device_token in request.device_tokens {
        ctx.registry
            .require_value(EntityClass::Device, &device_token)?;
        let index =
            ctx.store
                .atomic_increment(Table::Entities, &key, ELEMENT_COUNTER, 1)? as u64;
        let element = BatchElement {
            batch_token: token.clone(),
            index,
            device_token,
            processing_status: ProcessingStatus::Unprocessed,
            processed_date: None,
        };
        let element_key = builder.child_key(&value, ELEMENT, index, BATCH_ELEMENT_ID_WIDTH);
        let payload = ctx.marshaler.serialize(&element)?;
        ctx.store.put(
            Table::Entities,
            &element_key,
            Row::from([(PAYLOAD_COLUMN.to_string(), payload)]),
        )?;
    }
    Ok(operation)
}

pub fn get_batch_operation<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
) -> Result<Option<BatchOperation>> {
    ctx.load_active(EntityClass::BatchOperation, token)
}

pub fn update_batch_operation_status<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    status: ProcessingStatus,
    updated_by: &str,
) -> Result<BatchOperation> {
    let mut operation: BatchOperation = ctx
        .load_active(EntityClass::BatchOperation, token)?
        .ok_or_else(|| EntityClass::BatchOperation.not_found())?;
    operation.processing_status = status;
    let key = required_primary_key(ctx, EntityClass::BatchOperation, token)?;
    ctx.update_entity(EntityClass::BatchOperation, &key, &mut operation, updated_by, Row::new())?;
    Ok(operation)
}

pub fn list_batch_operations<M: PayloadMarshaler>(
    ctx: &Context<M>,
    criteria: SearchCriteria,
    include_deleted: bool,
) -> Result<SearchResults<BatchOperation>> {
    ctx.list_primary(EntityClass::BatchOperation, criteria, include_deleted, |_| true)
}

/// Elements in processing order (ascending index). A token that no longer
/// resolves (the operation was force deleted) yields an empty result rather
/// than an error.
pub fn list_batch_elements<M: PayloadMarshaler>(
    ctx: &Context<M>,
    batch_token: &str,
    criteria: SearchCriteria,
    status: Option<ProcessingStatus>,
) -> Result<SearchResults<BatchElement>> {
    let Some(value) = ctx
        .registry
        .get_value(EntityClass::BatchOperation, batch_token)?
    else {
        return Ok(SearchResults {
            results: Vec::new(),
            total: 0,
        });
    };
    let builder = KeyBuilder::for_class(EntityClass::BatchOperation);
    let start = builder.subkey(&value, ELEMENT);
    let stop = builder.subkey(&value, ELEMENT + 1);
    let mut pager = Pager::new(criteria);
    for (_, row) in ctx.store.scan(Table::Entities, &start, &stop)? {
        if row.contains_key(DELETED_COLUMN) {
            continue;
        }
        let Some(element) = ctx.read_row::<BatchElement>(&row)? else {
            continue;
        };
        if status.is_some_and(|wanted| element.processing_status != wanted) {
            continue;
        }
        pager.process(element);
    }
    Ok(pager.into_results())
}

/// Rewrite one element's processing state.
pub fn update_batch_element<M: PayloadMarshaler>(
    ctx: &Context<M>,
    batch_token: &str,
    index: u64,
    status: ProcessingStatus,
    processed_date: Option<DateTime<Utc>>,
) -> Result<BatchElement> {
    let value = ctx
        .registry
        .require_value(EntityClass::BatchOperation, batch_token)?;
    let builder = KeyBuilder::for_class(EntityClass::BatchOperation);
    let element_key = builder.child_key(&value, ELEMENT, index, BATCH_ELEMENT_ID_WIDTH);
    let row = ctx
        .store
        .get(Table::Entities, &element_key)?
        .ok_or_else(|| EntityClass::BatchOperation.not_found())?;
    let mut element: BatchElement = ctx
        .read_row(&row)?
        .ok_or_else(|| EntityClass::BatchOperation.not_found())?;
    element.processing_status = status;
    element.processed_date = processed_date;
    let payload = ctx.marshaler.serialize(&element)?;
    ctx.store.put(
        Table::Entities,
        &element_key,
        Row::from([(PAYLOAD_COLUMN.to_string(), payload)]),
    )?;
    Ok(element)
}

pub fn delete_batch_operation<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    force: bool,
    deleted_by: &str,
) -> Result<(BatchOperation, CascadeOutcome)> {
    if !force {
        let operation = ctx
            .soft_delete::<BatchOperation>(EntityClass::BatchOperation, token, deleted_by)?
            .ok_or_else(|| EntityClass::BatchOperation.not_found())?;
        return Ok((operation, CascadeOutcome::default()));
    }
    let operation: BatchOperation = ctx
        .load_entity(EntityClass::BatchOperation, token)?
        .ok_or_else(|| EntityClass::BatchOperation.not_found())?;
    let value = ctx
        .registry
        .require_value(EntityClass::BatchOperation, token)?;
    let builder = KeyBuilder::for_class(EntityClass::BatchOperation);
    let start = builder.subkey(&value, ELEMENT);
    let stop = builder.subkey(&value, ELEMENT + 1);
    let outcome = ctx.cascade_delete_range(&start, &stop)?;
    ctx.force_delete(EntityClass::BatchOperation, token)?;
    Ok((operation, outcome))
}
