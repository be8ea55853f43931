//! fleetstore — sorted key-value persistence core for multi-tenant IoT
//! device management.
//!
//! Maps a hierarchical entity model (sites, zones, devices, assignments,
//! specifications, commands, groups, networks, batch operations) and a
//! time-bucketed device event index onto a flat lexicographically sorted
//! row space, behind a small [`kv::KeyValueStore`] contract with in-memory
//! and RocksDB implementations.

pub mod batch;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod device;
pub mod entity;
pub mod error;
pub mod events;
pub mod group;
pub mod keys;
pub mod kv;
pub mod logging;
pub mod management;
pub mod marshal;
pub mod model;
pub mod network;
pub mod registry;
pub mod site;
pub mod specification;

pub use buffer::{EventBuffer, EventBufferConfig};
pub use config::StoreConfig;
pub use entity::{CascadeOutcome, SearchCriteria, SearchResults};
pub use error::{Result, StoreError};
pub use events::DateRange;
pub use kv::{KeyValueStore, MemoryStore, RocksStore, Table};
pub use management::DeviceManagement;
pub use model::{
    AssignmentStatus, BatchElement, BatchOperation, Device, DeviceAssignment, DeviceCommand,
    DeviceEvent, DeviceGroup, DeviceGroupElement, DeviceNetwork, DeviceNetworkElement,
    DeviceSpecification, ElementTargetKind, EventBody, EventKind, ProcessingStatus, Site, Zone,
};
