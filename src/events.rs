//! Time-bucketed device event index.
//!
//! Events for an assignment live in the events table under row keys of the
//! form `assignment key (8 bytes) ++ !bucket`, where the bucket is the event
//! date rounded down to the hour and the bitwise NOT makes newer buckets sort
//! first. Within a row, each event is one column whose qualifier is
//! `!offset-in-bucket (3 bytes) ++ event-type byte`, again inverted so newer
//! events come first. The row key plus qualifier is self-describing; the
//! external event id is just their base64 concatenation.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::entity::{Context, Pager, SearchCriteria, SearchResults};
use crate::error::{Result, StoreError};
use crate::keys::{site_subtype, EntityClass, KeyBuilder};
use crate::kv::{decode_counter, Row, Table};
use crate::marshal::PayloadMarshaler;
use crate::model::{DeviceAssignment, DeviceEvent, EventBody, EventKind};

/// Bucket granularity in seconds.
pub const BUCKET_INTERVAL_SECS: i64 = 3600;
/// Assignment key (8) plus inverted bucket suffix (4).
pub const EVENT_ROW_KEY_LEN: usize = 12;
/// Inverted offset (3) plus event-type byte.
pub const EVENT_QUALIFIER_LEN: usize = 4;

/// Suffixes distinguishing invocation-response link columns from event
/// qualifier columns on the same row.
const RESPONSE_COUNTER_SUFFIX: &str = ".n";
const RESPONSE_ENTRY_SUFFIX: &str = ".r";

/// Inclusive date filter in Unix seconds; `None` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl DateRange {
    pub fn contains(&self, ts: i64) -> bool {
        self.start.is_none_or(|start| ts >= start) && self.end.is_none_or(|end| ts <= end)
    }
}

/// Event date rounded down to its bucket boundary. `rem_euclid` keeps
/// pre-epoch dates on the correct side of the boundary.
pub fn bucket_of(ts: i64) -> i64 {
    ts - ts.rem_euclid(BUCKET_INTERVAL_SECS)
}

fn inverted_bucket_suffix(bucket: i64) -> [u8; 4] {
    let be = bucket.to_be_bytes();
    [!be[4], !be[5], !be[6], !be[7]]
}

/// Row key for an event: assignment key plus inverted bucket suffix.
pub fn event_row_key(assignment_key: &[u8], ts: i64) -> Vec<u8> {
    let mut key = assignment_key.to_vec();
    key.extend_from_slice(&inverted_bucket_suffix(bucket_of(ts)));
    key
}

/// Column qualifier for an event: inverted offset within the bucket plus the
/// event-type byte.
pub fn event_qualifier(ts: i64, kind: EventKind) -> Vec<u8> {
    let offset = ts.rem_euclid(BUCKET_INTERVAL_SECS);
    let be = offset.to_be_bytes();
    vec![!be[5], !be[6], !be[7], kind.code()]
}

/// Recover the event timestamp and kind from a row key and qualifier.
pub fn decode_event_time(row_key: &[u8], qualifier: &[u8]) -> Result<(i64, EventKind)> {
    if row_key.len() != EVENT_ROW_KEY_LEN || qualifier.len() != EVENT_QUALIFIER_LEN {
        return Err(StoreError::InvalidEventId);
    }
    let bucket = u32::from_be_bytes([
        !row_key[8],
        !row_key[9],
        !row_key[10],
        !row_key[11],
    ]) as i64;
    let offset = u32::from_be_bytes([0, !qualifier[0], !qualifier[1], !qualifier[2]]) as i64;
    let kind = EventKind::from_code(qualifier[3]).ok_or(StoreError::InvalidEventId)?;
    Ok((bucket + offset, kind))
}

/// Self-describing external event id.
pub fn event_id(row_key: &[u8], qualifier: &[u8]) -> String {
    let mut bytes = row_key.to_vec();
    bytes.extend_from_slice(qualifier);
    BASE64.encode(bytes)
}

/// Split an external event id back into row key and qualifier.
pub fn parse_event_id(id: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let bytes = BASE64.decode(id).map_err(|_| StoreError::InvalidEventId)?;
    if bytes.len() != EVENT_ROW_KEY_LEN + EVENT_QUALIFIER_LEN {
        return Err(StoreError::InvalidEventId);
    }
    let qualifier = bytes[EVENT_ROW_KEY_LEN..].to_vec();
    let mut row_key = bytes;
    row_key.truncate(EVENT_ROW_KEY_LEN);
    Ok((row_key, qualifier))
}

/// Scan bounds over one assignment's event rows. Newer buckets sort first,
/// so the start bound derives from the requested end date and the stop bound
/// from the requested start date.
pub fn scan_bounds(assignment_key: &[u8], range: &DateRange) -> (Vec<u8>, Vec<u8>) {
    let mut start = assignment_key.to_vec();
    match range.end {
        Some(end) => start.extend_from_slice(&inverted_bucket_suffix(bucket_of(end))),
        None => start.extend_from_slice(&[0x00; 4]),
    }
    let mut stop = assignment_key.to_vec();
    match range.start {
        Some(first) => {
            stop.extend_from_slice(&inverted_bucket_suffix(bucket_of(first)));
            // One past the 12-byte row so the oldest included bucket survives
            // the exclusive bound.
            stop.push(0x00);
        }
        // Exclusive bound, so bucket 0 (suffix FF FF FF FF, the first hour of
        // 1970) falls outside unbounded listings.
        None => stop.extend_from_slice(&[0xFF; 4]),
    }
    (start, stop)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

fn qualifier_column(qualifier: &[u8]) -> String {
    hex_encode(qualifier)
}

/// Parse a column name back into an event qualifier; link columns and other
/// markers come back as `None`.
fn column_qualifier(column: &str) -> Option<Vec<u8>> {
    if column.len() != EVENT_QUALIFIER_LEN * 2 {
        return None;
    }
    hex_decode(column).filter(|bytes| bytes.len() == EVENT_QUALIFIER_LEN)
}

/// Build the indexed row write for an event without touching the store.
/// Shared by the synchronous path and the write buffer.
pub fn prepare_event<M: PayloadMarshaler>(
    ctx: &Context<M>,
    assignment_token: &str,
    event_date: i64,
    received_date: i64,
    body: EventBody,
) -> Result<(Vec<u8>, Row, DeviceEvent)> {
    let assignment_key = ctx
        .registry
        .require_value(EntityClass::Assignment, assignment_token)?;
    let assignment: DeviceAssignment = ctx
        .load_entity(EntityClass::Assignment, assignment_token)?
        .ok_or_else(|| EntityClass::Assignment.not_found())?;
    let kind = body.kind();
    let row_key = event_row_key(&assignment_key, event_date);
    let qualifier = event_qualifier(event_date, kind);
    let mut event = DeviceEvent {
        id: None,
        assignment_token: assignment_token.to_string(),
        site_token: assignment.site_token,
        event_date,
        received_date,
        body,
    };
    // The id is recoverable from the key material, so the stored payload
    // omits it.
    let payload = ctx.marshaler.serialize(&event)?;
    event.id = Some(event_id(&row_key, &qualifier));
    let columns = Row::from([(qualifier_column(&qualifier), payload)]);
    Ok((row_key, columns, event))
}

/// Index one event synchronously. Command responses that name their
/// originating invocation are linked back to it.
pub fn add_event<M: PayloadMarshaler>(
    ctx: &Context<M>,
    assignment_token: &str,
    event_date: i64,
    received_date: i64,
    body: EventBody,
) -> Result<DeviceEvent> {
    let (row_key, columns, event) =
        prepare_event(ctx, assignment_token, event_date, received_date, body)?;
    ctx.store.put(Table::Events, &row_key, columns)?;
    if let (Some(id), EventBody::CommandResponse { originating_event_id: Some(invocation), .. }) =
        (&event.id, &event.body)
    {
        link_command_response(ctx, invocation, id)?;
    }
    Ok(event)
}

/// Record a response under its invocation's row: bump the per-invocation
/// response counter and add an entry column holding the response's event id.
pub fn link_command_response<M: PayloadMarshaler>(
    ctx: &Context<M>,
    invocation_id: &str,
    response_id: &str,
) -> Result<()> {
    let (row_key, qualifier) = parse_event_id(invocation_id)?;
    let base = qualifier_column(&qualifier);
    let counter_column = format!("{base}{RESPONSE_COUNTER_SUFFIX}");
    let sequence = ctx
        .store
        .atomic_increment(Table::Events, &row_key, &counter_column, 1)?;
    let entry_column = format!("{base}{RESPONSE_ENTRY_SUFFIX}{sequence}");
    ctx.store.put(
        Table::Events,
        &row_key,
        Row::from([(entry_column, response_id.as_bytes().to_vec())]),
    )?;
    Ok(())
}

/// Responses linked to an invocation, in link order. Entries whose target
/// event has disappeared are skipped.
pub fn list_command_responses_for_invocation<M: PayloadMarshaler>(
    ctx: &Context<M>,
    invocation_id: &str,
) -> Result<Vec<DeviceEvent>> {
    let (row_key, qualifier) = parse_event_id(invocation_id)?;
    let base = qualifier_column(&qualifier);
    let counter_column = format!("{base}{RESPONSE_COUNTER_SUFFIX}");
    let Some(row) = ctx.store.get(Table::Events, &row_key)? else {
        return Ok(Vec::new());
    };
    let count = match row.get(&counter_column) {
        Some(bytes) => decode_counter(bytes)?,
        None => 0,
    };
    let mut responses = Vec::new();
    for sequence in 1..=count {
        let entry_column = format!("{base}{RESPONSE_ENTRY_SUFFIX}{sequence}");
        let Some(bytes) = row.get(&entry_column) else {
            continue;
        };
        let response_id = std::str::from_utf8(bytes).map_err(|_| StoreError::InvalidEventId)?;
        if let Some(event) = get_event_by_id(ctx, response_id)? {
            responses.push(event);
        }
    }
    Ok(responses)
}

/// Resolve any event from its self-describing id.
pub fn get_event_by_id<M: PayloadMarshaler>(
    ctx: &Context<M>,
    id: &str,
) -> Result<Option<DeviceEvent>> {
    let (row_key, qualifier) = parse_event_id(id)?;
    let Some(row) = ctx.store.get(Table::Events, &row_key)? else {
        return Ok(None);
    };
    let Some(payload) = row.get(&qualifier_column(&qualifier)) else {
        return Ok(None);
    };
    let mut event: DeviceEvent = ctx.marshaler.deserialize(payload)?;
    event.id = Some(id.to_string());
    Ok(Some(event))
}

/// Events of one assignment, newest first, filtered to the date range and
/// optionally one event kind.
pub fn list_events_for_assignment<M: PayloadMarshaler>(
    ctx: &Context<M>,
    assignment_token: &str,
    range: DateRange,
    kind: Option<EventKind>,
    criteria: SearchCriteria,
) -> Result<SearchResults<DeviceEvent>> {
    let assignment_key = ctx
        .registry
        .require_value(EntityClass::Assignment, assignment_token)?;
    let (start, stop) = scan_bounds(&assignment_key, &range);
    let mut pager = Pager::new(criteria);
    for (row_key, row) in ctx.store.scan(Table::Events, &start, &stop)? {
        for (column, payload) in &row {
            let Some(event) = read_indexed_event(ctx, &row_key, column, payload, &range, kind)?
            else {
                continue;
            };
            pager.process(event);
        }
    }
    Ok(pager.into_results())
}

/// Events across every assignment of a site. Scans the site's whole
/// assignment range and filters in memory; there is no secondary index for
/// this path, so cost grows with the site's total event volume.
pub fn list_events_for_site<M: PayloadMarshaler>(
    ctx: &Context<M>,
    site_token: &str,
    range: DateRange,
    kind: Option<EventKind>,
    criteria: SearchCriteria,
) -> Result<SearchResults<DeviceEvent>> {
    let site_value = ctx.registry.require_value(EntityClass::Site, site_token)?;
    let builder = KeyBuilder::for_class(EntityClass::Site);
    let start = builder.subkey(&site_value, site_subtype::ASSIGNMENT);
    let stop = builder.subkey(&site_value, site_subtype::END);
    let mut matches = Vec::new();
    for (row_key, row) in ctx.store.scan(Table::Events, &start, &stop)? {
        for (column, payload) in &row {
            if let Some(event) =
                read_indexed_event(ctx, &row_key, column, payload, &range, kind)?
            {
                matches.push(event);
            }
        }
    }
    matches.sort_by(|a, b| b.event_date.cmp(&a.event_date));
    let mut pager = Pager::new(criteria);
    for event in matches {
        pager.process(event);
    }
    Ok(pager.into_results())
}

fn read_indexed_event<M: PayloadMarshaler>(
    ctx: &Context<M>,
    row_key: &[u8],
    column: &str,
    payload: &[u8],
    range: &DateRange,
    kind: Option<EventKind>,
) -> Result<Option<DeviceEvent>> {
    let Some(qualifier) = column_qualifier(column) else {
        return Ok(None);
    };
    let Ok((event_date, event_kind)) = decode_event_time(row_key, &qualifier) else {
        return Ok(None);
    };
    if !range.contains(event_date) {
        return Ok(None);
    }
    if kind.is_some_and(|wanted| wanted != event_kind) {
        return Ok(None);
    }
    let mut event: DeviceEvent = ctx.marshaler.deserialize(payload)?;
    event.id = Some(event_id(row_key, &qualifier));
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSIGNMENT_KEY: [u8; 8] = [0x01, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x01];

    #[test]
    fn bucket_rounds_down_to_the_hour() {
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(3599), 0);
        assert_eq!(bucket_of(3600), 3600);
        assert_eq!(bucket_of(7201), 7200);
    }

    #[test]
    fn row_keys_sort_newer_buckets_first() {
        let older = event_row_key(&ASSIGNMENT_KEY, 3600);
        let newer = event_row_key(&ASSIGNMENT_KEY, 7200);
        assert_eq!(older.len(), EVENT_ROW_KEY_LEN);
        assert!(newer < older);
    }

    #[test]
    fn qualifiers_sort_newer_events_first_within_a_bucket() {
        let older = event_qualifier(7200 + 10, EventKind::Location);
        let newer = event_qualifier(7200 + 20, EventKind::Location);
        assert_eq!(older.len(), EVENT_QUALIFIER_LEN);
        assert!(newer < older);
    }

    #[test]
    fn same_second_events_of_different_kinds_do_not_collide() {
        let a = event_qualifier(500, EventKind::Measurements);
        let b = event_qualifier(500, EventKind::Alert);
        assert_ne!(a, b);
        assert_eq!(a[..3], b[..3]);
    }

    #[test]
    fn timestamps_round_trip_across_decades() {
        // Hour boundaries, mid-bucket, bucket ends, from 1970 through 2100.
        let samples = [
            0_i64,
            1,
            3599,
            3600,
            86_400,
            1_000_000_000,
            1_500_000_000 + 1234,
            2_000_000_000,
            2_500_000_000,
            4_000_000_000,
        ];
        for ts in samples {
            for kind in [
                EventKind::Measurements,
                EventKind::CommandResponse,
                EventKind::StateChange,
            ] {
                let row = event_row_key(&ASSIGNMENT_KEY, ts);
                let qualifier = event_qualifier(ts, kind);
                let (decoded, decoded_kind) = decode_event_time(&row, &qualifier).unwrap();
                assert_eq!(decoded, ts);
                assert_eq!(decoded_kind, kind);
            }
        }
    }

    #[test]
    fn event_ids_round_trip() {
        let row = event_row_key(&ASSIGNMENT_KEY, 1_700_000_123);
        let qualifier = event_qualifier(1_700_000_123, EventKind::Alert);
        let id = event_id(&row, &qualifier);
        let (parsed_row, parsed_qualifier) = parse_event_id(&id).unwrap();
        assert_eq!(parsed_row, row);
        assert_eq!(parsed_qualifier, qualifier);
    }

    #[test]
    fn malformed_event_ids_are_rejected() {
        assert!(matches!(
            parse_event_id("not base64!!!"),
            Err(StoreError::InvalidEventId)
        ));
        // Valid base64 of the wrong length.
        assert!(matches!(
            parse_event_id(&BASE64.encode([0u8; 10])),
            Err(StoreError::InvalidEventId)
        ));
    }

    #[test]
    fn scan_bounds_invert_the_date_range() {
        let range = DateRange {
            start: Some(3600),
            end: Some(7200),
        };
        let (start, stop) = scan_bounds(&ASSIGNMENT_KEY, &range);
        assert_eq!(start, event_row_key(&ASSIGNMENT_KEY, 7200));
        let oldest_row = event_row_key(&ASSIGNMENT_KEY, 3600);
        assert!(start <= oldest_row);
        assert!(oldest_row < stop);
    }

    #[test]
    fn unbounded_scan_covers_the_full_suffix_space() {
        let (start, stop) = scan_bounds(&ASSIGNMENT_KEY, &DateRange::default());
        let mut expected_start = ASSIGNMENT_KEY.to_vec();
        expected_start.extend_from_slice(&[0x00; 4]);
        let mut expected_stop = ASSIGNMENT_KEY.to_vec();
        expected_stop.extend_from_slice(&[0xFF; 4]);
        assert_eq!(start, expected_start);
        assert_eq!(stop, expected_stop);
    }

    #[test]
    fn qualifier_columns_reject_link_columns() {
        let qualifier = event_qualifier(100, EventKind::CommandInvocation);
        let base = qualifier_column(&qualifier);
        assert!(column_qualifier(&base).is_some());
        assert!(column_qualifier(&format!("{base}.n")).is_none());
        assert!(column_qualifier(&format!("{base}.r1")).is_none());
    }
}
