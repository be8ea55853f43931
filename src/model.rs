//! Entity payload structs. These are what the marshaler serializes into the
//! `payload` column; row keys and status columns are derived from them but
//! never stored inside them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Audit fields shared by every stored entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityMetadata {
    pub created_date: DateTime<Utc>,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub updated_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl EntityMetadata {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_date: Utc::now(),
            created_by: created_by.into(),
            updated_date: None,
            updated_by: None,
            deleted: false,
        }
    }

    pub fn touch(&mut self, updated_by: impl Into<String>) {
        self.updated_date = Some(Utc::now());
        self.updated_by = Some(updated_by.into());
    }
}

/// Implemented by every payload type the generic entity store handles.
pub trait StoredEntity: Serialize + DeserializeOwned + Clone {
    fn token(&self) -> &str;
    fn meta(&self) -> &EntityMetadata;
    fn meta_mut(&mut self) -> &mut EntityMetadata;
}

macro_rules! stored_entity {
    ($type:ty) => {
        impl StoredEntity for $type {
            fn token(&self) -> &str {
                &self.token
            }
            fn meta(&self) -> &EntityMetadata {
                &self.meta
            }
            fn meta_mut(&mut self) -> &mut EntityMetadata {
                &mut self.meta
            }
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub meta: EntityMetadata,
}
stored_entity!(Site);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub elevation: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Zone {
    pub token: String,
    pub site_token: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coordinates: Vec<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub border_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fill_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub opacity: Option<f64>,
    pub meta: EntityMetadata,
}
stored_entity!(Zone);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    /// Hardware id; doubles as the device's registry token.
    pub token: String,
    pub site_token: String,
    pub specification_token: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub comments: Option<String>,
    /// Token of the current assignment, if the device is assigned.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub assignment_token: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub meta: EntityMetadata,
}
stored_entity!(Device);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Missing,
    Released,
}

impl AssignmentStatus {
    /// Short code kept in the assignment's `status` column so list filters
    /// avoid payload parsing.
    pub fn code(self) -> &'static str {
        match self {
            AssignmentStatus::Active => "A",
            AssignmentStatus::Missing => "M",
            AssignmentStatus::Released => "R",
        }
    }

    pub fn from_code(code: &[u8]) -> Option<Self> {
        match code {
            b"A" => Some(AssignmentStatus::Active),
            b"M" => Some(AssignmentStatus::Missing),
            b"R" => Some(AssignmentStatus::Released),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceAssignment {
    pub token: String,
    pub device_token: String,
    pub site_token: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub asset_id: Option<String>,
    pub status: AssignmentStatus,
    pub active_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub released_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub meta: EntityMetadata,
}
stored_entity!(DeviceAssignment);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSpecification {
    pub token: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub asset_id: Option<String>,
    pub meta: EntityMetadata,
}
stored_entity!(DeviceSpecification);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandParameter {
    pub name: String,
    pub parameter_type: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceCommand {
    pub token: String,
    pub specification_token: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<CommandParameter>,
    pub meta: EntityMetadata,
}
stored_entity!(DeviceCommand);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceGroup {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    pub meta: EntityMetadata,
}
stored_entity!(DeviceGroup);

/// What a group or network element points at. Nested means another container
/// of the same kind (a subgroup, or a subnetwork).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ElementTargetKind {
    Device,
    Nested,
}

impl ElementTargetKind {
    pub fn discriminator(self) -> u8 {
        match self {
            ElementTargetKind::Device => 0x00,
            ElementTargetKind::Nested => 0x01,
        }
    }

    pub fn from_discriminator(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ElementTargetKind::Device),
            0x01 => Some(ElementTargetKind::Nested),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceGroupElement {
    pub group_token: String,
    pub index: u64,
    pub target: ElementTargetKind,
    pub element_token: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceNetwork {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub meta: EntityMetadata,
}
stored_entity!(DeviceNetwork);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceNetworkElement {
    pub network_token: String,
    pub index: u64,
    pub target: ElementTargetKind,
    pub element_token: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Unprocessed,
    Processing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchOperation {
    pub token: String,
    pub operation_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    pub processing_status: ProcessingStatus,
    pub meta: EntityMetadata,
}
stored_entity!(BatchOperation);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchElement {
    pub batch_token: String,
    pub index: u64,
    pub device_token: String,
    pub processing_status: ProcessingStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub processed_date: Option<DateTime<Utc>>,
}

/// Device event kinds and their index discriminator bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Measurements,
    Location,
    Alert,
    CommandInvocation,
    CommandResponse,
    StateChange,
}

impl EventKind {
    pub fn code(self) -> u8 {
        match self {
            EventKind::Measurements => 0x01,
            EventKind::Location => 0x02,
            EventKind::Alert => 0x03,
            EventKind::CommandInvocation => 0x04,
            EventKind::CommandResponse => 0x05,
            EventKind::StateChange => 0x06,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(EventKind::Measurements),
            0x02 => Some(EventKind::Location),
            0x03 => Some(EventKind::Alert),
            0x04 => Some(EventKind::CommandInvocation),
            0x05 => Some(EventKind::CommandResponse),
            0x06 => Some(EventKind::StateChange),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Measurements {
        values: BTreeMap<String, f64>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        elevation: Option<f64>,
    },
    Alert {
        source: String,
        level: String,
        message: String,
    },
    CommandInvocation {
        command_token: String,
        initiator: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        parameter_values: BTreeMap<String, String>,
    },
    CommandResponse {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        originating_event_id: Option<String>,
        response: String,
    },
    StateChange {
        category: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        previous_state: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        new_state: Option<String>,
    },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Measurements { .. } => EventKind::Measurements,
            EventBody::Location { .. } => EventKind::Location,
            EventBody::Alert { .. } => EventKind::Alert,
            EventBody::CommandInvocation { .. } => EventKind::CommandInvocation,
            EventBody::CommandResponse { .. } => EventKind::CommandResponse,
            EventBody::StateChange { .. } => EventKind::StateChange,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEvent {
    /// Self-describing external id, assigned once the event is indexed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    pub assignment_token: String,
    pub site_token: String,
    /// When the event happened at the device, Unix seconds.
    pub event_date: i64,
    /// When the platform received it, Unix seconds.
    pub received_date: i64,
    pub body: EventBody,
}

impl DeviceEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}
