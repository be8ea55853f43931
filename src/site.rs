//! Site and zone operations. A site's primary row anchors two counter
//! columns (`zonectr`, `assnctr`) that hand out sub-identifiers for the zone
//! and assignment ranges nested under the site's key prefix.

use std::collections::BTreeMap;

use crate::entity::{CascadeOutcome, Context, Pager, SearchCriteria, SearchResults, DELETED_COLUMN};
use crate::error::Result;
use crate::keys::{site_subtype, EntityClass, KeyBuilder};
use crate::kv::{Row, Table};
use crate::marshal::PayloadMarshaler;
use crate::model::{EntityMetadata, GeoPoint, Site, Zone};

pub const ZONE_COUNTER: &str = "zonectr";
pub const ASSIGNMENT_COUNTER: &str = "assnctr";

/// Width of zone and assignment sub-identifiers under a site prefix.
pub const SITE_CHILD_ID_WIDTH: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct SiteCreateRequest {
    /// External token; minted when absent.
    pub token: Option<String>,
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ZoneCreateRequest {
    pub token: Option<String>,
    pub name: String,
    pub coordinates: Vec<GeoPoint>,
    pub border_color: Option<String>,
    pub fill_color: Option<String>,
    pub opacity: Option<f64>,
}

pub fn create_site<M: PayloadMarshaler>(
    ctx: &Context<M>,
    request: SiteCreateRequest,
    created_by: &str,
) -> Result<Site> {
    let (token, value) = match request.token {
        Some(token) => {
            let value = ctx.registry.use_existing_id(EntityClass::Site, &token)?;
            (token, value)
        }
        None => ctx.registry.create_unique_id(EntityClass::Site)?,
    };
    let site = Site {
        token,
        name: request.name,
        description: request.description,
        image_url: request.image_url,
        metadata: request.metadata,
        meta: EntityMetadata::new(created_by),
    };
    let key = KeyBuilder::for_class(EntityClass::Site).primary_key(&value);
    ctx.write_entity(EntityClass::Site, &key, &site, Row::new())?;
    Ok(site)
}

pub fn get_site<M: PayloadMarshaler>(ctx: &Context<M>, token: &str) -> Result<Option<Site>> {
    ctx.load_active(EntityClass::Site, token)
}

pub fn update_site<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    request: SiteCreateRequest,
    updated_by: &str,
) -> Result<Site> {
    let mut site: Site = ctx
        .load_active(EntityClass::Site, token)?
        .ok_or_else(|| EntityClass::Site.not_found())?;
    site.name = request.name;
    site.description = request.description;
    site.image_url = request.image_url;
    site.metadata = request.metadata;
    let key = required_primary_key(ctx, EntityClass::Site, token)?;
    ctx.update_entity(EntityClass::Site, &key, &mut site, updated_by, Row::new())?;
    Ok(site)
}

pub fn list_sites<M: PayloadMarshaler>(
    ctx: &Context<M>,
    criteria: SearchCriteria,
    include_deleted: bool,
) -> Result<SearchResults<Site>> {
    ctx.list_primary(EntityClass::Site, criteria, include_deleted, |_| true)
}

/// Delete a site. Soft delete marks the primary row; force delete sweeps the
/// zone and assignment ranges under the site prefix and releases the token.
/// Child tokens cascaded this way are left in the registry.
pub fn delete_site<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    force: bool,
    deleted_by: &str,
) -> Result<(Site, CascadeOutcome)> {
    if !force {
        let site = ctx
            .soft_delete::<Site>(EntityClass::Site, token, deleted_by)?
            .ok_or_else(|| EntityClass::Site.not_found())?;
        return Ok((site, CascadeOutcome::default()));
    }
    let site: Site = ctx
        .load_entity(EntityClass::Site, token)?
        .ok_or_else(|| EntityClass::Site.not_found())?;
    let value = ctx.registry.require_value(EntityClass::Site, token)?;
    let builder = KeyBuilder::for_class(EntityClass::Site);
    let start = builder.subkey(&value, site_subtype::ZONE);
    let stop = builder.subkey(&value, site_subtype::END);
    let outcome = ctx.cascade_delete_range(&start, &stop)?;
    ctx.force_delete(EntityClass::Site, token)?;
    Ok((site, outcome))
}

pub fn create_zone<M: PayloadMarshaler>(
    ctx: &Context<M>,
    site_token: &str,
    request: ZoneCreateRequest,
    created_by: &str,
) -> Result<Zone> {
    let site_value = ctx.registry.require_value(EntityClass::Site, site_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Site);
    let site_key = builder.primary_key(&site_value);
    let zone_id =
        ctx.store
            .atomic_increment(Table::Entities, &site_key, ZONE_COUNTER, 1)? as u64;
    let zone_key = builder.child_key(
        &site_value,
        site_subtype::ZONE,
        zone_id,
        SITE_CHILD_ID_WIDTH,
    );
    let token = ctx
        .registry
        .register_key(EntityClass::Zone, request.token.as_deref(), zone_key.clone())?;
    let zone = Zone {
        token,
        site_token: site_token.to_string(),
        name: request.name,
        coordinates: request.coordinates,
        border_color: request.border_color,
        fill_color: request.fill_color,
        opacity: request.opacity,
        meta: EntityMetadata::new(created_by),
    };
    ctx.write_entity(EntityClass::Zone, &zone_key, &zone, Row::new())?;
    Ok(zone)
}

pub fn get_zone<M: PayloadMarshaler>(ctx: &Context<M>, token: &str) -> Result<Option<Zone>> {
    ctx.load_active(EntityClass::Zone, token)
}

pub fn update_zone<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    request: ZoneCreateRequest,
    updated_by: &str,
) -> Result<Zone> {
    let mut zone: Zone = ctx
        .load_active(EntityClass::Zone, token)?
        .ok_or_else(|| EntityClass::Zone.not_found())?;
    zone.name = request.name;
    zone.coordinates = request.coordinates;
    zone.border_color = request.border_color;
    zone.fill_color = request.fill_color;
    zone.opacity = request.opacity;
    let key = required_primary_key(ctx, EntityClass::Zone, token)?;
    ctx.update_entity(EntityClass::Zone, &key, &mut zone, updated_by, Row::new())?;
    Ok(zone)
}

/// Zones in creation order (ascending sub-identifier).
pub fn list_zones<M: PayloadMarshaler>(
    ctx: &Context<M>,
    site_token: &str,
    criteria: SearchCriteria,
) -> Result<SearchResults<Zone>> {
    let site_value = ctx.registry.require_value(EntityClass::Site, site_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Site);
    let start = builder.subkey(&site_value, site_subtype::ZONE);
    let stop = builder.subkey(&site_value, site_subtype::ZONE + 1);
    let mut pager = Pager::new(criteria);
    for (_, row) in ctx.store.scan(Table::Entities, &start, &stop)? {
        if row.contains_key(DELETED_COLUMN) {
            continue;
        }
        let Some(zone) = ctx.read_row::<Zone>(&row)? else {
            continue;
        };
        pager.process(zone);
    }
    Ok(pager.into_results())
}

pub fn delete_zone<M: PayloadMarshaler>(
    ctx: &Context<M>,
    token: &str,
    force: bool,
    deleted_by: &str,
) -> Result<Zone> {
    if !force {
        return ctx
            .soft_delete(EntityClass::Zone, token, deleted_by)?
            .ok_or_else(|| EntityClass::Zone.not_found());
    }
    let zone: Zone = ctx
        .load_entity(EntityClass::Zone, token)?
        .ok_or_else(|| EntityClass::Zone.not_found())?;
    ctx.force_delete(EntityClass::Zone, token)?;
    Ok(zone)
}

pub(crate) fn required_primary_key<M: PayloadMarshaler>(
    ctx: &Context<M>,
    class: EntityClass,
    token: &str,
) -> Result<Vec<u8>> {
    ctx.primary_key(class, token)?
        .ok_or_else(|| class.not_found())
}
