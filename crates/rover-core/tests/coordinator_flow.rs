use std::time::Duration;

use httpmock::prelude::*;
use rover_core::coordinator::{HttpDocumentStore, WriteMethod};
use rover_core::transport::Endpoint;
use rover_core::{ConfigCoordinator, CoordinatorError, CoordinatorPolicy, DeviceClient};
use serde_json::json;

fn coordinator(server: &MockServer) -> ConfigCoordinator {
    let endpoint = Endpoint::parse(&server.base_url()).expect("endpoint");
    let client = DeviceClient::new(endpoint, Duration::from_secs(5)).expect("client");
    let policy = CoordinatorPolicy {
        fetch_retry_delay: Duration::from_millis(5),
        ..CoordinatorPolicy::default()
    };
    ConfigCoordinator::new(HttpDocumentStore::new(&client, WriteMethod::Post), policy)
}

#[tokio::test]
async fn positioning_settings_update_keeps_unrelated_fields() {
    let server = MockServer::start_async().await;
    let current = json!({
        "gnss_settings": {
            "update_rate": 5,
            "elevation_mask_angle": 15,
            "positioning_systems": {"gps": true, "glonass": true, "galileo": true}
        },
        "positioning_mode": "kinematic"
    });
    server
        .mock_async(|when, then| {
            when.method(GET).path("/configuration/positioning_settings");
            then.status(200).json_body(current.clone());
        })
        .await;
    let write = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/configuration/positioning_settings")
                .json_body(json!({
                    "gnss_settings": {
                        "update_rate": 10,
                        "elevation_mask_angle": 15,
                        "positioning_systems": {"gps": true, "glonass": false, "galileo": true}
                    },
                    "positioning_mode": "kinematic"
                }));
            then.status(200);
        })
        .await;

    let merged = coordinator(&server)
        .apply(
            "/configuration/positioning_settings",
            json!({"gnss_settings": {"update_rate": 10, "positioning_systems": {"glonass": false}}}),
        )
        .await
        .expect("apply");
    write.assert_async().await;
    assert_eq!(merged["positioning_mode"], json!("kinematic"));
    assert_eq!(merged["gnss_settings"]["elevation_mask_angle"], json!(15));
}

#[tokio::test]
async fn repeated_412_is_reported_as_conflict_exhaustion() {
    let server = MockServer::start_async().await;
    let fetch = server
        .mock_async(|when, then| {
            when.method(GET).path("/configuration/device");
            then.status(200)
                .header("ETag", "\"abc\"")
                .json_body(json!({"night_mode": false}));
        })
        .await;
    let write = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/configuration/device")
                .header("If-Match", "\"abc\"");
            then.status(412);
        })
        .await;

    let err = coordinator(&server)
        .apply("/configuration/device", json!({"night_mode": true}))
        .await
        .expect_err("conflicts");
    assert_eq!(
        err,
        CoordinatorError::ConflictExhausted {
            resource: "/configuration/device".into(),
            attempts: 4
        }
    );
    // Each conflict restarts from a fresh fetch.
    fetch.assert_hits_async(4).await;
    write.assert_hits_async(4).await;
}

#[tokio::test]
async fn unreachable_resource_is_a_fetch_error() {
    let server = MockServer::start_async().await;
    let fetch = server
        .mock_async(|when, then| {
            when.method(GET).path("/logging/settings");
            then.status(503);
        })
        .await;
    let err = coordinator(&server)
        .apply("/logging/settings", json!({"raw": {"enabled": true}}))
        .await
        .expect_err("fetch fails");
    assert!(matches!(err, CoordinatorError::Fetch { attempts: 3, .. }));
    fetch.assert_hits_async(3).await;
}
