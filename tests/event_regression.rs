use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleetstore::device::{AssignmentCreateRequest, DeviceCreateRequest};
use fleetstore::site::SiteCreateRequest;
use fleetstore::specification::SpecificationCreateRequest;
use fleetstore::{
    DateRange, DeviceManagement, EventBody, EventBufferConfig, EventKind, MemoryStore,
    SearchCriteria, StoreError,
};

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const ACTOR: &str = "tests";

/// A fixed hour boundary well into the 2020s.
const BASE: i64 = 1_700_000_400;

fn setup_assignment(management: &DeviceManagement, device_token: &str) -> TestResult<String> {
    if management.get_site("site-1")?.is_none() {
        management.create_site(
            SiteCreateRequest {
                token: Some("site-1".to_string()),
                name: "Plant A".to_string(),
                ..SiteCreateRequest::default()
            },
            ACTOR,
        )?;
        management.create_specification(
            SpecificationCreateRequest {
                token: Some("spec-1".to_string()),
                name: "MeterKit".to_string(),
                asset_id: None,
            },
            ACTOR,
        )?;
    }
    management.create_device(
        DeviceCreateRequest {
            token: device_token.to_string(),
            site_token: "site-1".to_string(),
            specification_token: "spec-1".to_string(),
            ..DeviceCreateRequest::default()
        },
        ACTOR,
    )?;
    let assignment = management.create_assignment(
        AssignmentCreateRequest {
            device_token: device_token.to_string(),
            ..AssignmentCreateRequest::default()
        },
        ACTOR,
    )?;
    Ok(assignment.token)
}

fn measurement(name: &str, value: f64) -> EventBody {
    EventBody::Measurements {
        values: BTreeMap::from([(name.to_string(), value)]),
    }
}

#[test]
fn events_list_newest_first_within_and_across_buckets() -> TestResult<()> {
    let management = DeviceManagement::new(Arc::new(MemoryStore::new()));
    let assignment = setup_assignment(&management, "dev-1")?;

    // Straddle a bucket boundary on purpose.
    let dates = [BASE - 1, BASE, BASE + 1, BASE + 3599, BASE + 3600];
    for (index, date) in dates.iter().enumerate() {
        management.add_event(&assignment, *date, *date, measurement("temp", index as f64))?;
    }

    let events = management.list_events_for_assignment(
        &assignment,
        DateRange::default(),
        None,
        SearchCriteria::all(),
    )?;
    let listed: Vec<i64> = events.results.iter().map(|event| event.event_date).collect();
    assert_eq!(
        listed,
        vec![BASE + 3600, BASE + 3599, BASE + 1, BASE, BASE - 1]
    );
    assert_eq!(events.total, 5);
    Ok(())
}

#[test]
fn date_range_filter_is_inclusive_on_both_ends() -> TestResult<()> {
    let management = DeviceManagement::new(Arc::new(MemoryStore::new()));
    let assignment = setup_assignment(&management, "dev-1")?;
    for offset in [0, 100, 200, 300, 400] {
        management.add_event(
            &assignment,
            BASE + offset,
            BASE + offset,
            measurement("temp", offset as f64),
        )?;
    }
    let events = management.list_events_for_assignment(
        &assignment,
        DateRange {
            start: Some(BASE + 100),
            end: Some(BASE + 300),
        },
        None,
        SearchCriteria::all(),
    )?;
    let listed: Vec<i64> = events.results.iter().map(|event| event.event_date).collect();
    assert_eq!(listed, vec![BASE + 300, BASE + 200, BASE + 100]);
    Ok(())
}

#[test]
fn ranges_spanning_a_decade_round_trip() -> TestResult<()> {
    let management = DeviceManagement::new(Arc::new(MemoryStore::new()));
    let assignment = setup_assignment(&management, "dev-1")?;

    let year = 31_536_000;
    let dates: Vec<i64> = (0..12).map(|i| BASE - 6 * year + i * year).collect();
    for date in &dates {
        management.add_event(&assignment, *date, *date, measurement("temp", 1.0))?;
    }

    let all = management.list_events_for_assignment(
        &assignment,
        DateRange::default(),
        None,
        SearchCriteria::all(),
    )?;
    assert_eq!(all.total, 12);
    let listed: Vec<i64> = all.results.iter().map(|event| event.event_date).collect();
    let mut expected = dates.clone();
    expected.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(listed, expected);

    let middle = management.list_events_for_assignment(
        &assignment,
        DateRange {
            start: Some(dates[3]),
            end: Some(dates[8]),
        },
        None,
        SearchCriteria::all(),
    )?;
    assert_eq!(middle.total, 6);
    Ok(())
}

#[test]
fn event_ids_resolve_back_to_their_events() -> TestResult<()> {
    let management = DeviceManagement::new(Arc::new(MemoryStore::new()));
    let assignment = setup_assignment(&management, "dev-1")?;
    let event = management.add_event(
        &assignment,
        BASE + 42,
        BASE + 45,
        EventBody::Alert {
            source: "sensor".to_string(),
            level: "warning".to_string(),
            message: "over temperature".to_string(),
        },
    )?;
    let id = event.id.clone().expect("indexed event should carry an id");

    let loaded = management.get_event_by_id(&id)?.expect("event should resolve");
    assert_eq!(loaded.event_date, BASE + 42);
    assert_eq!(loaded.received_date, BASE + 45);
    assert_eq!(loaded.kind(), EventKind::Alert);
    assert_eq!(loaded.assignment_token, assignment);
    assert_eq!(loaded.id, Some(id));

    assert!(matches!(
        management.get_event_by_id("@@not-an-id@@"),
        Err(StoreError::InvalidEventId)
    ));
    Ok(())
}

#[test]
fn kind_filter_uses_the_qualifier_type_byte() -> TestResult<()> {
    let management = DeviceManagement::new(Arc::new(MemoryStore::new()));
    let assignment = setup_assignment(&management, "dev-1")?;
    management.add_event(&assignment, BASE, BASE, measurement("temp", 1.0))?;
    management.add_event(
        &assignment,
        BASE,
        BASE,
        EventBody::Location {
            latitude: 33.75,
            longitude: -84.39,
            elevation: None,
        },
    )?;

    let locations = management.list_events_for_assignment(
        &assignment,
        DateRange::default(),
        Some(EventKind::Location),
        SearchCriteria::all(),
    )?;
    assert_eq!(locations.total, 1);
    assert_eq!(locations.results[0].kind(), EventKind::Location);
    Ok(())
}

#[test]
fn site_wide_listing_merges_assignments() -> TestResult<()> {
    let management = DeviceManagement::new(Arc::new(MemoryStore::new()));
    let first = setup_assignment(&management, "dev-1")?;
    let second = setup_assignment(&management, "dev-2")?;

    management.add_event(&first, BASE + 10, BASE + 10, measurement("temp", 1.0))?;
    management.add_event(&second, BASE + 20, BASE + 20, measurement("temp", 2.0))?;
    management.add_event(&first, BASE + 30, BASE + 30, measurement("temp", 3.0))?;

    let events = management.list_events_for_site(
        "site-1",
        DateRange::default(),
        None,
        SearchCriteria::all(),
    )?;
    let listed: Vec<i64> = events.results.iter().map(|event| event.event_date).collect();
    assert_eq!(listed, vec![BASE + 30, BASE + 20, BASE + 10]);
    let tokens: Vec<&str> = events
        .results
        .iter()
        .map(|event| event.assignment_token.as_str())
        .collect();
    assert_eq!(tokens, vec![first.as_str(), second.as_str(), first.as_str()]);
    Ok(())
}

#[test]
fn command_responses_link_back_to_their_invocation() -> TestResult<()> {
    let management = DeviceManagement::new(Arc::new(MemoryStore::new()));
    let assignment = setup_assignment(&management, "dev-1")?;

    let invocation = management.add_event(
        &assignment,
        BASE,
        BASE,
        EventBody::CommandInvocation {
            command_token: "cmd-reboot".to_string(),
            initiator: ACTOR.to_string(),
            parameter_values: BTreeMap::new(),
        },
    )?;
    let invocation_id = invocation.id.clone().unwrap();

    for (offset, response) in [(5, "ack"), (9, "done")] {
        management.add_event(
            &assignment,
            BASE + offset,
            BASE + offset,
            EventBody::CommandResponse {
                originating_event_id: Some(invocation_id.clone()),
                response: response.to_string(),
            },
        )?;
    }

    let responses = management.list_command_responses_for_invocation(&invocation_id)?;
    assert_eq!(responses.len(), 2);
    let texts: Vec<&str> = responses
        .iter()
        .map(|event| match &event.body {
            EventBody::CommandResponse { response, .. } => response.as_str(),
            other => panic!("unexpected body: {other:?}"),
        })
        .collect();
    assert_eq!(texts, vec!["ack", "done"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn buffered_events_land_after_flush() -> TestResult<()> {
    let store = Arc::new(MemoryStore::new());
    let mut management = DeviceManagement::new(store);
    let assignment = setup_assignment(&management, "dev-1")?;
    management.start_event_buffer(EventBufferConfig {
        capacity: 16,
        batch_size: 100,
        flush_interval: Duration::from_secs(3600),
    });

    let queued = management
        .add_event_buffered(&assignment, BASE, BASE, measurement("temp", 1.0))
        .await?;
    assert!(queued.id.is_some());

    management.flush_events().await?;
    let events = management.list_events_for_assignment(
        &assignment,
        DateRange::default(),
        None,
        SearchCriteria::all(),
    )?;
    assert_eq!(events.total, 1);
    assert_eq!(events.results[0].id, queued.id);

    management.shutdown_event_buffer();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn buffered_writes_fail_once_the_buffer_is_gone() -> TestResult<()> {
    let mut management = DeviceManagement::new(Arc::new(MemoryStore::new()));
    let assignment = setup_assignment(&management, "dev-1")?;
    management.start_event_buffer(EventBufferConfig::default());
    management.shutdown_event_buffer();

    let err = management
        .add_event_buffered(&assignment, BASE, BASE, measurement("temp", 1.0))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::BufferClosed));
    Ok(())
}
