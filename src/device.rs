//! Device and device-assignment operations.
//!
//! The device row carries the token of its current assignment so "is this
//! device assigned" never requires a scan. Assignment create and release keep
//! that back-reference in sync with two separate single-row writes; a crash
//! between them leaves the reference behind, and the next create against the
//! stale device fails until it is released.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::entity::{Context, Pager, SearchCriteria, SearchResults, DELETED_COLUMN};
use crate::error::{Result, StoreError};
use crate::keys::{site_subtype, EntityClass, KeyBuilder};
use crate::kv::{Row, Table};
use crate::marshal::PayloadMarshaler;
use crate::model::{AssignmentStatus, Device, DeviceAssignment, EntityMetadata};
use crate::site::{required_primary_key, ASSIGNMENT_COUNTER, SITE_CHILD_ID_WIDTH};

/// Raw status column on assignment rows, readable without payload parsing.
pub const STATUS_COLUMN: &str = "status";

#[derive(Debug, Clone, Default)]
pub struct DeviceCreateRequest {
    /// Hardware id; required, becomes the device token.
    pub token: String,
    pub site_token: String,
    pub specification_token: String,
    pub comments: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentCreateRequest {
    pub token: Option<String>,
    pub device_token: String,
    pub asset_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

pub fn create_device<M: PayloadMarshaler>(
    ctx: &Context<M>,
    request: DeviceCreateRequest,
    created_by: &str,
) -> Result<Device> {
    // Both parents must resolve before any identifier is allocated.
    ctx.registry
        .require_value(EntityClass::Site, &request.site_token)?;
    ctx.registry
        .require_value(EntityClass::Specification, &request.specification_token)?;
    let value = ctx
        .registry
        .use_existing_id(EntityClass::Device, &request.token)?;
    let device = Device {
        token: request.token,
        site_token: request.site_token,
        specification_token: request.specification_token,
        comments: request.comments,
        assignment_token: None,
        metadata: request.metadata,
        meta: EntityMetadata::new(created_by),
    };
    let key = KeyBuilder::for_class(EntityClass::Device).primary_key(&value);
    ctx.write_entity(EntityClass::Device, &key, &device, Row::new())?;
    Ok(device)
}

pub fn get_device<M: PayloadMarshaler>(ctx: &Context<M>, token: &str) -> Result<Option<Device>> {
    ctx.load_active(EntityClass::Device, token)
}

pub fn update_device<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    comments: Option<String>,
    metadata: BTreeMap<String, String>,
    updated_by: &str,
) -> Result<Device> {
    let mut device: Device = ctx
        .load_active(EntityClass::Device, token)?
        .ok_or_else(|| EntityClass::Device.not_found())?;
    device.comments = comments;
    device.metadata = metadata;
    let key = required_primary_key(ctx, EntityClass::Device, token)?;
    ctx.update_entity(EntityClass::Device, &key, &mut device, updated_by, Row::new())?;
    Ok(device)
}

pub fn list_devices<M: PayloadMarshaler>(
    ctx: &Context<M>,
    criteria: SearchCriteria,
    include_deleted: bool,
    site_token: Option<&str>,
    specification_token: Option<&str>,
) -> Result<SearchResults<Device>> {
    ctx.list_primary(EntityClass::Device, criteria, include_deleted, |device: &Device| {
        site_token.is_none_or(|site| device.site_token == site)
            && specification_token.is_none_or(|spec| device.specification_token == spec)
    })
}

/// Devices of a site with no current assignment.
pub fn list_unassigned_devices<M: PayloadMarshaler>(
    ctx: &Context<M>,
    criteria: SearchCriteria,
    site_token: Option<&str>,
) -> Result<SearchResults<Device>> {
    ctx.list_primary(EntityClass::Device, criteria, false, |device: &Device| {
        device.assignment_token.is_none()
            && site_token.is_none_or(|site| device.site_token == site)
    })
}

pub fn delete_device<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    force: bool,
    deleted_by: &str,
) -> Result<Device> {
    if !force {
        return ctx
            .soft_delete(EntityClass::Device, token, deleted_by)?
            .ok_or_else(|| EntityClass::Device.not_found());
    }
    let device: Device = ctx
        .load_entity(EntityClass::Device, token)?
        .ok_or_else(|| EntityClass::Device.not_found())?;
    ctx.force_delete(EntityClass::Device, token)?;
    Ok(device)
}

/// Create an assignment for a device. The assignment row lands under the
/// device's site prefix; the device is then pointed at the new assignment.
pub fn create_assignment<M: PayloadMarshaler>(
    ctx: &Context<M>,
    request: AssignmentCreateRequest,
    created_by: &str,
) -> Result<DeviceAssignment> {
    let mut device: Device = ctx
        .load_active(EntityClass::Device, &request.device_token)?
        .ok_or_else(|| EntityClass::Device.not_found())?;
    if device.assignment_token.is_some() {
        return Err(StoreError::DeviceAlreadyAssigned);
    }
    let site_value = ctx
        .registry
        .require_value(EntityClass::Site, &device.site_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Site);
    let site_key = builder.primary_key(&site_value);
    let assignment_id =
        ctx.store
            .atomic_increment(Table::Entities, &site_key, ASSIGNMENT_COUNTER, 1)? as u64;
    let assignment_key = builder.child_key(
        &site_value,
        site_subtype::ASSIGNMENT,
        assignment_id,
        SITE_CHILD_ID_WIDTH,
    );
    let token = ctx.registry.register_key(
        EntityClass::Assignment,
        request.token.as_deref(),
        assignment_key.clone(),
    )?;
    let assignment = DeviceAssignment {
        token: token.clone(),
        device_token: device.token.clone(),
        site_token: device.site_token.clone(),
        asset_id: request.asset_id,
        status: AssignmentStatus::Active,
        active_date: Utc::now(),
        released_date: None,
        metadata: request.metadata,
        meta: EntityMetadata::new(created_by),
    };
    let status = Row::from([(
        STATUS_COLUMN.to_string(),
        assignment.status.code().as_bytes().to_vec(),
    )]);
    ctx.write_entity(EntityClass::Assignment, &assignment_key, &assignment, status)?;

    device.assignment_token = Some(token);
    let device_key = required_primary_key(ctx, EntityClass::Device, &device.token)?;
    ctx.update_entity(EntityClass::Device, &device_key, &mut device, created_by, Row::new())?;
    Ok(assignment)
}

pub fn get_assignment<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
) -> Result<Option<DeviceAssignment>> {
    ctx.load_active(EntityClass::Assignment, token)
}

/// Current assignment of a device, if any.
pub fn get_current_assignment<M: PayloadMarshaler>(
    ctx: &Context<M>,
    device_token: &str,
) -> Result<Option<DeviceAssignment>> {
    let Some(device) = get_device(ctx, device_token)? else {
        return Err(EntityClass::Device.not_found());
    };
    match device.assignment_token {
        Some(token) => get_assignment(ctx, &token),
        None => Ok(None),
    }
}

pub fn update_assignment_metadata<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    metadata: BTreeMap<String, String>,
    updated_by: &str,
) -> Result<DeviceAssignment> {
    let mut assignment: DeviceAssignment = ctx
        .load_active(EntityClass::Assignment, token)?
        .ok_or_else(|| EntityClass::Assignment.not_found())?;
    assignment.metadata = metadata;
    let key = required_primary_key(ctx, EntityClass::Assignment, token)?;
    ctx.update_entity(EntityClass::Assignment, &key, &mut assignment, updated_by, Row::new())?;
    Ok(assignment)
}

/// Move an assignment to a new status, keeping the raw status column in sync
/// with the payload.
pub fn update_assignment_status<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    status: AssignmentStatus,
    updated_by: &str,
) -> Result<DeviceAssignment> {
    let mut assignment: DeviceAssignment = ctx
        .load_active(EntityClass::Assignment, token)?
        .ok_or_else(|| EntityClass::Assignment.not_found())?;
    assignment.status = status;
    if status == AssignmentStatus::Released {
        assignment.released_date = Some(Utc::now());
    }
    let key = required_primary_key(ctx, EntityClass::Assignment, token)?;
    let status_column = Row::from([(
        STATUS_COLUMN.to_string(),
        status.code().as_bytes().to_vec(),
    )]);
    ctx.update_entity(EntityClass::Assignment, &key, &mut assignment, updated_by, status_column)?;

    if status == AssignmentStatus::Released {
        clear_back_reference(ctx, &assignment, updated_by)?;
    }
    Ok(assignment)
}

/// Release an assignment: mark it released and detach the device.
pub fn release_assignment<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    updated_by: &str,
) -> Result<DeviceAssignment> {
    update_assignment_status(ctx, token, AssignmentStatus::Released, updated_by)
}

/// Assignments of a site in creation order, optionally narrowed by status
/// using the raw column.
pub fn list_assignments_for_site<M: PayloadMarshaler>(
    ctx: &Context<M>,
    site_token: &str,
    criteria: SearchCriteria,
    status: Option<AssignmentStatus>,
) -> Result<SearchResults<DeviceAssignment>> {
    let site_value = ctx.registry.require_value(EntityClass::Site, site_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Site);
    let start = builder.subkey(&site_value, site_subtype::ASSIGNMENT);
    let stop = builder.subkey(&site_value, site_subtype::END);
    let mut pager = Pager::new(criteria);
    for (_, row) in ctx.store.scan(Table::Entities, &start, &stop)? {
        if row.contains_key(DELETED_COLUMN) {
            continue;
        }
        if let Some(wanted) = status {
            let matches = row
                .get(STATUS_COLUMN)
                .and_then(|code| AssignmentStatus::from_code(code))
                == Some(wanted);
            if !matches {
                continue;
            }
        }
        let Some(assignment) = ctx.read_row::<DeviceAssignment>(&row)? else {
            continue;
        };
        pager.process(assignment);
    }
    Ok(pager.into_results())
}

pub fn delete_assignment<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    force: bool,
    deleted_by: &str,
) -> Result<DeviceAssignment> {
    let assignment: DeviceAssignment = ctx
        .load_entity(EntityClass::Assignment, token)?
        .ok_or_else(|| EntityClass::Assignment.not_found())?;
    if !force {
        let assignment = ctx
            .soft_delete::<DeviceAssignment>(EntityClass::Assignment, token, deleted_by)?
            .ok_or_else(|| EntityClass::Assignment.not_found())?;
        clear_back_reference(ctx, &assignment, deleted_by)?;
        return Ok(assignment);
    }
    ctx.force_delete(EntityClass::Assignment, token)?;
    clear_back_reference(ctx, &assignment, deleted_by)?;
    Ok(assignment)
}

/// Detach the device if it still points at this assignment.
fn clear_back_reference<M: PayloadMarshaler>(
    ctx: &Context<M>,
    assignment: &DeviceAssignment,
    updated_by: &str,
) -> Result<()> {
    let Some(mut device) = ctx.load_entity::<Device>(EntityClass::Device, &assignment.device_token)?
    else {
        return Ok(());
    };
    if device.assignment_token.as_deref() != Some(&assignment.token) {
        return Ok(());
    }
    device.assignment_token = None;
    let key = required_primary_key(ctx, EntityClass::Device, &device.token)?;
    ctx.update_entity(EntityClass::Device, &key, &mut device, updated_by, Row::new())
}
