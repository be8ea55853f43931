//! Device management facade. One instance per storage handle (one tenant's
//! keyspace); everything it touches flows through the shared [`Context`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::batch::{self, BatchOperationCreateRequest};
use crate::buffer::{EventBuffer, EventBufferConfig};
use crate::cache::LruTokenCache;
use crate::config::StoreConfig;
use crate::device::{self, AssignmentCreateRequest, DeviceCreateRequest};
use crate::entity::{CascadeOutcome, Context, SearchCriteria, SearchResults};
use crate::error::{Result, StoreError};
use crate::events::{self, DateRange};
use crate::group::{self, GroupCreateRequest, GroupElementCreateRequest};
use crate::kv::{KeyValueStore, RocksStore};
use crate::marshal::JsonMarshaler;
use crate::model::{
    AssignmentStatus, BatchElement, BatchOperation, Device, DeviceAssignment, DeviceCommand,
    DeviceEvent, DeviceGroup, DeviceGroupElement, DeviceNetwork, DeviceNetworkElement,
    DeviceSpecification, ElementTargetKind, EventBody, EventKind, ProcessingStatus, Site, Zone,
};
use crate::network::{self, NetworkCreateRequest, NetworkElementCreateRequest};
use crate::registry::TokenRegistry;
use crate::site::{self, SiteCreateRequest, ZoneCreateRequest};
use crate::specification::{self, CommandCreateRequest, SpecificationCreateRequest};

pub struct DeviceManagement {
    ctx: Context<JsonMarshaler>,
    buffer: Option<EventBuffer>,
}

impl DeviceManagement {
    /// Wrap an existing store handle with no cache and no write buffer.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            ctx: Context {
                store: store.clone(),
                registry: TokenRegistry::new(store),
                marshaler: JsonMarshaler,
                cache: None,
            },
            buffer: None,
        }
    }

    /// Open the configured RocksDB store, with the payload cache sized from
    /// the config. The event buffer still needs `start_event_buffer`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(RocksStore::open(&config.data_dir)?);
        let mut management = Self::new(store);
        if config.cache_capacity > 0 {
            management.ctx.cache = Some(Arc::new(LruTokenCache::new(config.cache_capacity)));
        }
        Ok(management)
    }

    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.ctx.cache = Some(Arc::new(LruTokenCache::new(capacity)));
        self
    }

    // --- Sites and zones ---

    pub fn create_site(&self, request: SiteCreateRequest, actor: &str) -> Result<Site> {
        site::create_site(&self.ctx, request, actor)
    }

    pub fn get_site(&self, token: &str) -> Result<Option<Site>> {
        site::get_site(&self.ctx, token)
    }

    pub fn update_site(&self, token: &str, request: SiteCreateRequest, actor: &str) -> Result<Site> {
        site::update_site(&self.ctx, token, request, actor)
    }

    pub fn list_sites(
        &self,
        criteria: SearchCriteria,
        include_deleted: bool,
    ) -> Result<SearchResults<Site>> {
        site::list_sites(&self.ctx, criteria, include_deleted)
    }

    pub fn delete_site(
        &self,
        token: &str,
        force: bool,
        actor: &str,
    ) -> Result<(Site, CascadeOutcome)> {
        site::delete_site(&self.ctx, token, force, actor)
    }

    pub fn create_zone(
        &self,
        site_token: &str,
        request: ZoneCreateRequest,
        actor: &str,
    ) -> Result<Zone> {
        site::create_zone(&self.ctx, site_token, request, actor)
    }

    pub fn get_zone(&self, token: &str) -> Result<Option<Zone>> {
        site::get_zone(&self.ctx, token)
    }

    pub fn update_zone(&self, token: &str, request: ZoneCreateRequest, actor: &str) -> Result<Zone> {
        site::update_zone(&self.ctx, token, request, actor)
    }

    pub fn list_zones(&self, site_token: &str, criteria: SearchCriteria) -> Result<SearchResults<Zone>> {
        site::list_zones(&self.ctx, site_token, criteria)
    }

    pub fn delete_zone(&self, token: &str, force: bool, actor: &str) -> Result<Zone> {
        site::delete_zone(&self.ctx, token, force, actor)
    }

    // --- Specifications and commands ---

    pub fn create_specification(
        &self,
        request: SpecificationCreateRequest,
        actor: &str,
    ) -> Result<DeviceSpecification> {
        specification::create_specification(&self.ctx, request, actor)
    }

    pub fn get_specification(&self, token: &str) -> Result<Option<DeviceSpecification>> {
        specification::get_specification(&self.ctx, token)
    }

    pub fn update_specification(
        &self,
        token: &str,
        request: SpecificationCreateRequest,
        actor: &str,
    ) -> Result<DeviceSpecification> {
        specification::update_specification(&self.ctx, token, request, actor)
    }

    pub fn list_specifications(
        &self,
        criteria: SearchCriteria,
        include_deleted: bool,
    ) -> Result<SearchResults<DeviceSpecification>> {
        specification::list_specifications(&self.ctx, criteria, include_deleted)
    }

    pub fn delete_specification(
        &self,
        token: &str,
        force: bool,
        actor: &str,
    ) -> Result<(DeviceSpecification, CascadeOutcome)> {
        specification::delete_specification(&self.ctx, token, force, actor)
    }

    pub fn create_command(
        &self,
        specification_token: &str,
        request: CommandCreateRequest,
        actor: &str,
    ) -> Result<DeviceCommand> {
        specification::create_command(&self.ctx, specification_token, request, actor)
    }

    pub fn get_command(&self, token: &str) -> Result<Option<DeviceCommand>> {
        specification::get_command(&self.ctx, token)
    }

    pub fn update_command(
        &self,
        token: &str,
        request: CommandCreateRequest,
        actor: &str,
    ) -> Result<DeviceCommand> {
        specification::update_command(&self.ctx, token, request, actor)
    }

    pub fn list_commands(
        &self,
        specification_token: &str,
        criteria: SearchCriteria,
    ) -> Result<SearchResults<DeviceCommand>> {
        specification::list_commands(&self.ctx, specification_token, criteria)
    }

    pub fn delete_command(&self, token: &str, force: bool, actor: &str) -> Result<DeviceCommand> {
        specification::delete_command(&self.ctx, token, force, actor)
    }

    // --- Devices and assignments ---

    pub fn create_device(&self, request: DeviceCreateRequest, actor: &str) -> Result<Device> {
        device::create_device(&self.ctx, request, actor)
    }

    pub fn get_device(&self, token: &str) -> Result<Option<Device>> {
        device::get_device(&self.ctx, token)
    }

    pub fn update_device(
        &self,
        token: &str,
        comments: Option<String>,
        metadata: BTreeMap<String, String>,
        actor: &str,
    ) -> Result<Device> {
        device::update_device(&self.ctx, token, comments, metadata, actor)
    }

    pub fn list_devices(
        &self,
        criteria: SearchCriteria,
        include_deleted: bool,
        site_token: Option<&str>,
        specification_token: Option<&str>,
    ) -> Result<SearchResults<Device>> {
        device::list_devices(&self.ctx, criteria, include_deleted, site_token, specification_token)
    }

    pub fn list_unassigned_devices(
        &self,
        criteria: SearchCriteria,
        site_token: Option<&str>,
    ) -> Result<SearchResults<Device>> {
        device::list_unassigned_devices(&self.ctx, criteria, site_token)
    }

    pub fn delete_device(&self, token: &str, force: bool, actor: &str) -> Result<Device> {
        device::delete_device(&self.ctx, token, force, actor)
    }

    pub fn create_assignment(
        &self,
        request: AssignmentCreateRequest,
        actor: &str,
    ) -> Result<DeviceAssignment> {
        device::create_assignment(&self.ctx, request, actor)
    }

    pub fn get_assignment(&self, token: &str) -> Result<Option<DeviceAssignment>> {
        device::get_assignment(&self.ctx, token)
    }

    pub fn get_current_assignment(&self, device_token: &str) -> Result<Option<DeviceAssignment>> {
        device::get_current_assignment(&self.ctx, device_token)
    }

    pub fn update_assignment_metadata(
        &self,
        token: &str,
        metadata: BTreeMap<String, String>,
        actor: &str,
    ) -> Result<DeviceAssignment> {
        device::update_assignment_metadata(&self.ctx, token, metadata, actor)
    }

    pub fn update_assignment_status(
        &self,
        token: &str,
        status: AssignmentStatus,
        actor: &str,
    ) -> Result<DeviceAssignment> {
        device::update_assignment_status(&self.ctx, token, status, actor)
    }

    pub fn release_assignment(&self, token: &str, actor: &str) -> Result<DeviceAssignment> {
        device::release_assignment(&self.ctx, token, actor)
    }

    pub fn list_assignments_for_site(
        &self,
        site_token: &str,
        criteria: SearchCriteria,
        status: Option<AssignmentStatus>,
    ) -> Result<SearchResults<DeviceAssignment>> {
        device::list_assignments_for_site(&self.ctx, site_token, criteria, status)
    }

    pub fn delete_assignment(
        &self,
        token: &str,
        force: bool,
        actor: &str,
    ) -> Result<DeviceAssignment> {
        device::delete_assignment(&self.ctx, token, force, actor)
    }

    // --- Groups ---

    pub fn create_group(&self, request: GroupCreateRequest, actor: &str) -> Result<DeviceGroup> {
        group::create_group(&self.ctx, request, actor)
    }

    pub fn get_group(&self, token: &str) -> Result<Option<DeviceGroup>> {
        group::get_group(&self.ctx, token)
    }

    pub fn update_group(
        &self,
        token: &str,
        request: GroupCreateRequest,
        actor: &str,
    ) -> Result<DeviceGroup> {
        group::update_group(&self.ctx, token, request, actor)
    }

    pub fn list_groups(
        &self,
        criteria: SearchCriteria,
        include_deleted: bool,
        role: Option<&str>,
    ) -> Result<SearchResults<DeviceGroup>> {
        group::list_groups(&self.ctx, criteria, include_deleted, role)
    }

    pub fn delete_group(
        &self,
        token: &str,
        force: bool,
        actor: &str,
    ) -> Result<(DeviceGroup, CascadeOutcome)> {
        group::delete_group(&self.ctx, token, force, actor)
    }

    pub fn add_group_elements(
        &self,
        group_token: &str,
        requests: Vec<GroupElementCreateRequest>,
    ) -> Result<Vec<DeviceGroupElement>> {
        group::add_group_elements(&self.ctx, group_token, requests)
    }

    pub fn remove_group_elements(
        &self,
        group_token: &str,
        targets: &[(ElementTargetKind, String)],
    ) -> Result<Vec<DeviceGroupElement>> {
        group::remove_group_elements(&self.ctx, group_token, targets)
    }

    pub fn list_group_elements(
        &self,
        group_token: &str,
        criteria: SearchCriteria,
    ) -> Result<SearchResults<DeviceGroupElement>> {
        group::list_group_elements(&self.ctx, group_token, criteria)
    }

    // --- Networks ---

    pub fn create_network(&self, request: NetworkCreateRequest, actor: &str) -> Result<DeviceNetwork> {
        network::create_network(&self.ctx, request, actor)
    }

    pub fn get_network(&self, token: &str) -> Result<Option<DeviceNetwork>> {
        network::get_network(&self.ctx, token)
    }

    pub fn update_network(
        &self,
        token: &str,
        request: NetworkCreateRequest,
        actor: &str,
    ) -> Result<DeviceNetwork> {
        network::update_network(&self.ctx, token, request, actor)
    }

    pub fn list_networks(
        &self,
        criteria: SearchCriteria,
        include_deleted: bool,
    ) -> Result<SearchResults<DeviceNetwork>> {
        network::list_networks(&self.ctx, criteria, include_deleted)
    }

    pub fn delete_network(
        &self,
        token: &str,
        force: bool,
        actor: &str,
    ) -> Result<(DeviceNetwork, CascadeOutcome)> {
        network::delete_network(&self.ctx, token, force, actor)
    }

    pub fn add_network_elements(
        &self,
        network_token: &str,
        requests: Vec<NetworkElementCreateRequest>,
    ) -> Result<Vec<DeviceNetworkElement>> {
        network::add_network_elements(&self.ctx, network_token, requests)
    }

    pub fn remove_network_elements(
        &self,
        network_token: &str,
        targets: &[(ElementTargetKind, String)],
    ) -> Result<Vec<DeviceNetworkElement>> {
        network::remove_network_elements(&self.ctx, network_token, targets)
    }

    pub fn list_network_elements(
        &self,
        network_token: &str,
        criteria: SearchCriteria,
    ) -> Result<SearchResults<DeviceNetworkElement>> {
        network::list_network_elements(&self.ctx, network_token, criteria)
    }

    // --- Batch operations ---

    pub fn create_batch_operation(
        &self,
        request: BatchOperationCreateRequest,
        actor: &str,
    ) -> Result<BatchOperation> {
        batch::create_batch_operation(&self.ctx, request, actor)
    }

    pub fn get_batch_operation(&self, token: &str) -> Result<Option<BatchOperation>> {
        batch::get_batch_operation(&self.ctx, token)
    }

    pub fn update_batch_operation_status(
        &self,
        token: &str,
        status: ProcessingStatus,
        actor: &str,
    ) -> Result<BatchOperation> {
        batch::update_batch_operation_status(&self.ctx, token, status, actor)
    }

    pub fn list_batch_operations(
        &self,
        criteria: SearchCriteria,
        include_deleted: bool,
    ) -> Result<SearchResults<BatchOperation>> {
        batch::list_batch_operations(&self.ctx, criteria, include_deleted)
    }

    pub fn list_batch_elements(
        &self,
        batch_token: &str,
        criteria: SearchCriteria,
        status: Option<ProcessingStatus>,
    ) -> Result<SearchResults<BatchElement>> {
        batch::list_batch_elements(&self.ctx, batch_token, criteria, status)
    }

    pub fn update_batch_element(
        &self,
        batch_token: &str,
        index: u64,
        status: ProcessingStatus,
        processed_date: Option<DateTime<Utc>>,
    ) -> Result<BatchElement> {
        batch::update_batch_element(&self.ctx, batch_token, index, status, processed_date)
    }

    pub fn delete_batch_operation(
        &self,
        token: &str,
        force: bool,
        actor: &str,
    ) -> Result<(BatchOperation, CascadeOutcome)> {
        batch::delete_batch_operation(&self.ctx, token, force, actor)
    }

    // --- Events ---

    pub fn add_event(
        &self,
        assignment_token: &str,
        event_date: i64,
        received_date: i64,
        body: EventBody,
    ) -> Result<DeviceEvent> {
        events::add_event(&self.ctx, assignment_token, event_date, received_date, body)
    }

    pub fn get_event_by_id(&self, id: &str) -> Result<Option<DeviceEvent>> {
        events::get_event_by_id(&self.ctx, id)
    }

    pub fn list_events_for_assignment(
        &self,
        assignment_token: &str,
        range: DateRange,
        kind: Option<EventKind>,
        criteria: SearchCriteria,
    ) -> Result<SearchResults<DeviceEvent>> {
        events::list_events_for_assignment(&self.ctx, assignment_token, range, kind, criteria)
    }

    pub fn list_events_for_site(
        &self,
        site_token: &str,
        range: DateRange,
        kind: Option<EventKind>,
        criteria: SearchCriteria,
    ) -> Result<SearchResults<DeviceEvent>> {
        events::list_events_for_site(&self.ctx, site_token, range, kind, criteria)
    }

    pub fn list_command_responses_for_invocation(
        &self,
        invocation_id: &str,
    ) -> Result<Vec<DeviceEvent>> {
        events::list_command_responses_for_invocation(&self.ctx, invocation_id)
    }

    // --- Event write buffer ---

    /// Start the write-behind buffer. Must run inside a tokio runtime.
    pub fn start_event_buffer(&mut self, config: EventBufferConfig) {
        if self.buffer.is_none() {
            self.buffer = Some(EventBuffer::start(self.ctx.store.clone(), config));
        }
    }

    /// Queue an event through the buffer. The returned event carries its
    /// final id even though the index write has not landed yet.
    pub async fn add_event_buffered(
        &self,
        assignment_token: &str,
        event_date: i64,
        received_date: i64,
        body: EventBody,
    ) -> Result<DeviceEvent> {
        let buffer = self.buffer.as_ref().ok_or(StoreError::BufferClosed)?;
        let (row_key, columns, event) =
            events::prepare_event(&self.ctx, assignment_token, event_date, received_date, body)?;
        buffer.enqueue(row_key, columns).await?;
        Ok(event)
    }

    /// Force out everything queued in the buffer.
    pub async fn flush_events(&self) -> Result<()> {
        match &self.buffer {
            Some(buffer) => buffer.flush().await,
            None => Ok(()),
        }
    }

    /// Stop the buffer, dropping unflushed writes.
    pub fn shutdown_event_buffer(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            buffer.shutdown();
        }
    }
}
