use std::collections::BTreeMap;
use std::sync::Arc;

use fleetstore::batch::BatchOperationCreateRequest;
use fleetstore::device::{AssignmentCreateRequest, DeviceCreateRequest};
use fleetstore::group::{GroupCreateRequest, GroupElementCreateRequest};
use fleetstore::site::{SiteCreateRequest, ZoneCreateRequest};
use fleetstore::specification::{CommandCreateRequest, SpecificationCreateRequest};
use fleetstore::{
    AssignmentStatus, DeviceManagement, ElementTargetKind, MemoryStore, ProcessingStatus,
    SearchCriteria, StoreError,
};

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const ACTOR: &str = "tests";

fn management() -> DeviceManagement {
    DeviceManagement::new(Arc::new(MemoryStore::new()))
}

fn site_request(token: &str, name: &str) -> SiteCreateRequest {
    SiteCreateRequest {
        token: Some(token.to_string()),
        name: name.to_string(),
        description: format!("{name} description"),
        image_url: None,
        metadata: BTreeMap::new(),
    }
}

fn seed_device(management: &DeviceManagement, device_token: &str) -> TestResult<()> {
    management.create_site(site_request("site-1", "Plant A"), ACTOR)?;
    management.create_specification(
        SpecificationCreateRequest {
            token: Some("spec-1".to_string()),
            name: "MeterKit".to_string(),
            asset_id: None,
        },
        ACTOR,
    )?;
    management.create_device(
        DeviceCreateRequest {
            token: device_token.to_string(),
            site_token: "site-1".to_string(),
            specification_token: "spec-1".to_string(),
            comments: None,
            metadata: BTreeMap::new(),
        },
        ACTOR,
    )?;
    Ok(())
}

#[test]
fn minted_tokens_resolve_both_directions() -> TestResult<()> {
    let management = management();
    let site = management.create_site(
        SiteCreateRequest {
            token: None,
            name: "Plant A".to_string(),
            ..SiteCreateRequest::default()
        },
        ACTOR,
    )?;
    assert!(!site.token.is_empty());
    let loaded = management.get_site(&site.token)?.expect("site should exist");
    assert_eq!(loaded.name, "Plant A");
    Ok(())
}

#[test]
fn duplicate_site_token_is_a_conflict() -> TestResult<()> {
    let management = management();
    management.create_site(site_request("site-1", "Plant A"), ACTOR)?;
    let err = management
        .create_site(site_request("site-1", "Plant B"), ACTOR)
        .unwrap_err();
    assert!(matches!(err, StoreError::TokenInUse(_)));
    Ok(())
}

#[test]
fn device_creation_requires_existing_parents() -> TestResult<()> {
    let management = management();
    let err = management
        .create_device(
            DeviceCreateRequest {
                token: "dev-1".to_string(),
                site_token: "no-such-site".to_string(),
                specification_token: "no-such-spec".to_string(),
                ..DeviceCreateRequest::default()
            },
            ACTOR,
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidSiteToken));
    Ok(())
}

#[test]
fn zones_list_in_creation_order() -> TestResult<()> {
    let management = management();
    management.create_site(site_request("site-1", "Plant A"), ACTOR)?;
    for name in ["north", "south", "east"] {
        management.create_zone(
            "site-1",
            ZoneCreateRequest {
                name: name.to_string(),
                ..ZoneCreateRequest::default()
            },
            ACTOR,
        )?;
    }
    let zones = management.list_zones("site-1", SearchCriteria::all())?;
    let names: Vec<_> = zones.results.iter().map(|zone| zone.name.as_str()).collect();
    assert_eq!(names, vec!["north", "south", "east"]);
    assert_eq!(zones.total, 3);
    Ok(())
}

#[test]
fn soft_delete_hides_without_releasing_the_token() -> TestResult<()> {
    let management = management();
    management.create_site(site_request("site-1", "Plant A"), ACTOR)?;
    let (first, _) = management.delete_site("site-1", false, ACTOR)?;
    assert!(first.meta.deleted);
    // Repeating the delete refreshes the audit metadata.
    std::thread::sleep(std::time::Duration::from_millis(2));
    let (site, _) = management.delete_site("site-1", false, ACTOR)?;
    assert!(site.meta.deleted);
    assert!(site.meta.updated_date > first.meta.updated_date);

    assert!(management.get_site("site-1")?.is_none());
    assert_eq!(management.list_sites(SearchCriteria::all(), false)?.total, 0);
    assert_eq!(management.list_sites(SearchCriteria::all(), true)?.total, 1);

    // Token is still bound, so re-creating it conflicts.
    let err = management
        .create_site(site_request("site-1", "Plant A again"), ACTOR)
        .unwrap_err();
    assert!(matches!(err, StoreError::TokenInUse(_)));
    Ok(())
}

#[test]
fn force_delete_cascades_children_and_frees_the_token() -> TestResult<()> {
    let management = management();
    seed_device(&management, "dev-1")?;
    management.create_zone(
        "site-1",
        ZoneCreateRequest {
            name: "north".to_string(),
            ..ZoneCreateRequest::default()
        },
        ACTOR,
    )?;
    let assignment = management.create_assignment(
        AssignmentCreateRequest {
            device_token: "dev-1".to_string(),
            ..AssignmentCreateRequest::default()
        },
        ACTOR,
    )?;

    let (_, outcome) = management.delete_site("site-1", true, ACTOR)?;
    assert!(outcome.is_clean());
    assert_eq!(outcome.deleted, 2);

    assert!(management.get_site("site-1")?.is_none());
    assert!(management.get_assignment(&assignment.token)?.is_none());

    // Re-creating the same external token allocates a fresh identity.
    let recreated = management.create_site(site_request("site-1", "Plant A v2"), ACTOR)?;
    assert_eq!(recreated.name, "Plant A v2");
    assert_eq!(
        management.list_zones("site-1", SearchCriteria::all())?.total,
        0
    );
    Ok(())
}

#[test]
fn assignment_back_reference_blocks_double_assignment() -> TestResult<()> {
    let management = management();
    seed_device(&management, "dev-1")?;
    let first = management.create_assignment(
        AssignmentCreateRequest {
            device_token: "dev-1".to_string(),
            ..AssignmentCreateRequest::default()
        },
        ACTOR,
    )?;
    assert_eq!(first.status, AssignmentStatus::Active);
    assert_eq!(
        management.get_device("dev-1")?.unwrap().assignment_token,
        Some(first.token.clone())
    );

    let err = management
        .create_assignment(
            AssignmentCreateRequest {
                device_token: "dev-1".to_string(),
                ..AssignmentCreateRequest::default()
            },
            ACTOR,
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::DeviceAlreadyAssigned));

    let released = management.release_assignment(&first.token, ACTOR)?;
    assert_eq!(released.status, AssignmentStatus::Released);
    assert!(released.released_date.is_some());
    assert!(management.get_device("dev-1")?.unwrap().assignment_token.is_none());

    // Device is assignable again.
    management.create_assignment(
        AssignmentCreateRequest {
            device_token: "dev-1".to_string(),
            ..AssignmentCreateRequest::default()
        },
        ACTOR,
    )?;
    Ok(())
}

#[test]
fn assignment_status_filter_uses_the_raw_column() -> TestResult<()> {
    let management = management();
    seed_device(&management, "dev-1")?;
    management.create_device(
        DeviceCreateRequest {
            token: "dev-2".to_string(),
            site_token: "site-1".to_string(),
            specification_token: "spec-1".to_string(),
            ..DeviceCreateRequest::default()
        },
        ACTOR,
    )?;
    let a = management.create_assignment(
        AssignmentCreateRequest {
            device_token: "dev-1".to_string(),
            ..AssignmentCreateRequest::default()
        },
        ACTOR,
    )?;
    management.create_assignment(
        AssignmentCreateRequest {
            device_token: "dev-2".to_string(),
            ..AssignmentCreateRequest::default()
        },
        ACTOR,
    )?;
    management.release_assignment(&a.token, ACTOR)?;

    let active = management.list_assignments_for_site(
        "site-1",
        SearchCriteria::all(),
        Some(AssignmentStatus::Active),
    )?;
    assert_eq!(active.total, 1);
    assert_eq!(active.results[0].device_token, "dev-2");

    let released = management.list_assignments_for_site(
        "site-1",
        SearchCriteria::all(),
        Some(AssignmentStatus::Released),
    )?;
    assert_eq!(released.total, 1);
    Ok(())
}

#[test]
fn commands_list_newest_first() -> TestResult<()> {
    let management = management();
    management.create_specification(
        SpecificationCreateRequest {
            token: Some("spec-1".to_string()),
            name: "MeterKit".to_string(),
            asset_id: None,
        },
        ACTOR,
    )?;
    for name in ["reboot", "ping", "report"] {
        management.create_command(
            "spec-1",
            CommandCreateRequest {
                name: name.to_string(),
                ..CommandCreateRequest::default()
            },
            ACTOR,
        )?;
    }
    let commands = management.list_commands("spec-1", SearchCriteria::all())?;
    let names: Vec<_> = commands.results.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["report", "ping", "reboot"]);
    Ok(())
}

#[test]
fn group_membership_is_matched_on_packed_identifiers() -> TestResult<()> {
    let management = management();
    seed_device(&management, "dev-1")?;
    management.create_group(
        GroupCreateRequest {
            token: Some("grp-1".to_string()),
            name: "meters".to_string(),
            ..GroupCreateRequest::default()
        },
        ACTOR,
    )?;
    management.create_group(
        GroupCreateRequest {
            token: Some("grp-2".to_string()),
            name: "nested".to_string(),
            ..GroupCreateRequest::default()
        },
        ACTOR,
    )?;
    management.add_group_elements(
        "grp-1",
        vec![
            GroupElementCreateRequest {
                target: ElementTargetKind::Device,
                element_token: "dev-1".to_string(),
                roles: vec!["primary".to_string()],
            },
            GroupElementCreateRequest {
                target: ElementTargetKind::Nested,
                element_token: "grp-2".to_string(),
                roles: Vec::new(),
            },
        ],
    )?;
    assert_eq!(
        management.list_group_elements("grp-1", SearchCriteria::all())?.total,
        2
    );

    let removed = management.remove_group_elements(
        "grp-1",
        &[(ElementTargetKind::Device, "dev-1".to_string())],
    )?;
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].element_token, "dev-1");

    let remaining = management.list_group_elements("grp-1", SearchCriteria::all())?;
    assert_eq!(remaining.total, 1);
    assert_eq!(remaining.results[0].target, ElementTargetKind::Nested);
    Ok(())
}

#[test]
fn batch_elements_track_per_device_status() -> TestResult<()> {
    let management = management();
    seed_device(&management, "dev-1")?;
    management.create_device(
        DeviceCreateRequest {
            token: "dev-2".to_string(),
            site_token: "site-1".to_string(),
            specification_token: "spec-1".to_string(),
            ..DeviceCreateRequest::default()
        },
        ACTOR,
    )?;
    let operation = management.create_batch_operation(
        BatchOperationCreateRequest {
            token: Some("batch-1".to_string()),
            operation_type: "invoke_command".to_string(),
            parameters: BTreeMap::new(),
            device_tokens: vec!["dev-1".to_string(), "dev-2".to_string()],
        },
        ACTOR,
    )?;
    assert_eq!(operation.processing_status, ProcessingStatus::Unprocessed);

    let elements = management.list_batch_elements("batch-1", SearchCriteria::all(), None)?;
    assert_eq!(elements.total, 2);
    assert_eq!(elements.results[0].index, 1);

    management.update_batch_element(
        "batch-1",
        1,
        ProcessingStatus::Succeeded,
        Some(chrono::Utc::now()),
    )?;
    let succeeded = management.list_batch_elements(
        "batch-1",
        SearchCriteria::all(),
        Some(ProcessingStatus::Succeeded),
    )?;
    assert_eq!(succeeded.total, 1);
    assert_eq!(succeeded.results[0].device_token, "dev-1");
    assert!(succeeded.results[0].processed_date.is_some());

    management.update_batch_operation_status("batch-1", ProcessingStatus::Processing, ACTOR)?;
    assert_eq!(
        management.get_batch_operation("batch-1")?.unwrap().processing_status,
        ProcessingStatus::Processing
    );
    Ok(())
}

#[test]
fn force_deleted_batch_operation_lists_no_elements() -> TestResult<()> {
    let management = management();
    seed_device(&management, "dev-1")?;
    for token in ["dev-2", "dev-3"] {
        management.create_device(
            DeviceCreateRequest {
                token: token.to_string(),
                site_token: "site-1".to_string(),
                specification_token: "spec-1".to_string(),
                ..DeviceCreateRequest::default()
            },
            ACTOR,
        )?;
    }
    management.create_batch_operation(
        BatchOperationCreateRequest {
            token: Some("batch-1".to_string()),
            operation_type: "invoke_command".to_string(),
            parameters: BTreeMap::new(),
            device_tokens: vec![
                "dev-1".to_string(),
                "dev-2".to_string(),
                "dev-3".to_string(),
            ],
        },
        ACTOR,
    )?;
    assert_eq!(
        management.list_batch_elements("batch-1", SearchCriteria::all(), None)?.total,
        3
    );

    let (_, outcome) = management.delete_batch_operation("batch-1", true, ACTOR)?;
    assert!(outcome.is_clean());
    assert_eq!(outcome.deleted, 3);

    assert!(management.get_batch_operation("batch-1")?.is_none());
    let elements = management.list_batch_elements("batch-1", SearchCriteria::all(), None)?;
    assert_eq!(elements.total, 0);
    assert!(elements.results.is_empty());
    Ok(())
}

#[test]
fn listing_pages_report_full_totals() -> TestResult<()> {
    let management = management();
    for index in 0..5 {
        management.create_site(
            site_request(&format!("site-{index}"), &format!("Plant {index}")),
            ACTOR,
        )?;
    }
    let page = management.list_sites(SearchCriteria::new(2, 2), false)?;
    assert_eq!(page.total, 5);
    assert_eq!(page.results.len(), 2);
    Ok(())
}

#[test]
fn unassigned_device_listing_tracks_back_references() -> TestResult<()> {
    let management = management();
    seed_device(&management, "dev-1")?;
    management.create_device(
        DeviceCreateRequest {
            token: "dev-2".to_string(),
            site_token: "site-1".to_string(),
            specification_token: "spec-1".to_string(),
            ..DeviceCreateRequest::default()
        },
        ACTOR,
    )?;
    management.create_assignment(
        AssignmentCreateRequest {
            device_token: "dev-1".to_string(),
            ..AssignmentCreateRequest::default()
        },
        ACTOR,
    )?;
    let unassigned = management.list_unassigned_devices(SearchCriteria::all(), Some("site-1"))?;
    assert_eq!(unassigned.total, 1);
    assert_eq!(unassigned.results[0].token, "dev-2");
    Ok(())
}
