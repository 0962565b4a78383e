//! HTTP client tests against a mock episode and population health service.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use partnerlink::backfill::BackfillStatus;
use partnerlink::clients::episode::EpisodeClient;
use partnerlink::clients::pophealth::PopHealthClient;
use partnerlink::clients::{
    BackfillStatusReport, BackfillStatusReporter, CareRequestSource, CareRequestWindow, PatientQuery,
    PatientSearch,
};
use partnerlink::errors::PartnerError;

const TIMEOUT: Duration = Duration::from_secs(5);

fn window() -> CareRequestWindow {
    CareRequestWindow {
        created_from: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        created_before: Utc.with_ymd_and_hms(2023, 2, 1, 0, 0, 0).unwrap(),
        max_results: 3,
        include_patient: true,
    }
}

fn backfill_query() -> PatientQuery {
    PatientQuery {
        first_name: "Pat".to_string(),
        last_name: "Alpha".to_string(),
        date_of_birth: NaiveDate::from_ymd_opt(1980, 5, 17).unwrap(),
        ssn: None,
        patient_id: None,
        channel_item_ids: vec![100],
        max_results: Some(100),
        is_backfill: true,
    }
}

#[tokio::test]
async fn test_list_care_requests_sends_window_and_parses_response() {
    let mock_server = MockServer::start().await;

    let response = serde_json::json!({
        "care_requests": [
            {
                "id": 7,
                "created_at": "2023-01-10T01:00:00Z",
                "patient": {
                    "name": { "given_name": "Pat", "family_name": "Alpha" },
                    "date_of_birth": "1980-05-17"
                }
            },
            { "id": 8, "created_at": "2023-01-11T01:00:00Z" }
        ]
    });

    Mock::given(method("POST"))
        .and(path("/v1/care-requests:list"))
        .and(body_partial_json(serde_json::json!({
            "max_visits": 3,
            "include_patient": true,
            "sort_order": "created_at"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(&response))
        .expect(1)
        .mount(&mock_server)
        .await;

    // trailing slash on the base URL is tolerated
    let client = EpisodeClient::new(&format!("{}/", mock_server.uri()), TIMEOUT).expect("client");
    let care_requests = client.list_care_requests(&window()).await.expect("listing should succeed");

    assert_eq!(care_requests.len(), 2);
    assert_eq!(care_requests[0].id, 7);
    assert_eq!(
        care_requests[0].created_at,
        Some(Utc.with_ymd_and_hms(2023, 1, 10, 1, 0, 0).unwrap())
    );
    let patient = care_requests[0].patient.as_ref().expect("patient payload");
    assert_eq!(patient.name.as_ref().unwrap().family_name, "Alpha");
    assert_eq!(patient.date_of_birth, NaiveDate::from_ymd_opt(1980, 5, 17));
    assert!(care_requests[1].patient.is_none());

    let requests = mock_server.received_requests().await.expect("recorded requests");
    let body: serde_json::Value = requests[0].body_json().expect("json body");
    let time_window = &body["created_at_time_window"];
    let start: DateTime<Utc> = serde_json::from_value(time_window["start_datetime"].clone()).unwrap();
    let end: DateTime<Utc> = serde_json::from_value(time_window["end_datetime"].clone()).unwrap();
    assert_eq!(start, window().created_from);
    assert_eq!(end, window().created_before);
}

#[tokio::test]
async fn test_list_care_requests_maps_error_status_to_internal() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/care-requests:list"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&mock_server)
        .await;

    let client = EpisodeClient::new(&mock_server.uri(), TIMEOUT).unwrap();
    match client.list_care_requests(&window()).await {
        Err(PartnerError::Internal(message)) => {
            assert!(message.contains("status 503"), "{}", message);
            assert!(message.contains("unavailable"), "{}", message);
        }
        other => panic!("expected internal error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_list_care_requests_rejects_malformed_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&mock_server)
        .await;

    let client = EpisodeClient::new(&mock_server.uri(), TIMEOUT).unwrap();
    assert!(matches!(
        client.list_care_requests(&window()).await,
        Err(PartnerError::Internal(message)) if message.contains("Failed to parse ListVisits response")
    ));
}

#[tokio::test]
async fn test_empty_response_is_no_care_requests() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&mock_server)
        .await;

    let client = EpisodeClient::new(&mock_server.uri(), TIMEOUT).unwrap();
    assert!(client.list_care_requests(&window()).await.unwrap().is_empty());
}

#[test]
fn test_blank_base_url_is_config_error() {
    assert!(matches!(EpisodeClient::new("  ", TIMEOUT), Err(PartnerError::Config(_))));
    assert!(matches!(PopHealthClient::new("", TIMEOUT), Err(PartnerError::Config(_))));
}

#[tokio::test]
async fn test_search_patients_sends_backfill_scope() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/patients:search"))
        .and(body_partial_json(serde_json::json!({
            "first_name": "Pat",
            "last_name": "Alpha",
            "date_of_birth": "1980-05-17",
            "channel_item_ids": [100],
            "max_results": 100,
            "is_backfill": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "patient": [
                { "channel_item_id": 100 },
                { "id": "pt-9", "channel_item_id": 100 }
            ]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = PopHealthClient::new(&mock_server.uri(), TIMEOUT).unwrap();
    let patients = client.search_patients(&backfill_query()).await.expect("search should succeed");

    assert_eq!(patients.len(), 2);
    assert!(patients.iter().all(|p| p.channel_item_id == 100));
    assert_eq!(patients[1].id.as_deref(), Some("pt-9"));

    // optional fields without a value are left out of the request
    let requests = mock_server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert!(body.get("ssn").is_none());
    assert!(body.get("patient_id").is_none());
}

#[tokio::test]
async fn test_search_patients_error_status() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/patients:search"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&mock_server)
        .await;

    let client = PopHealthClient::new(&mock_server.uri(), TIMEOUT).unwrap();
    assert!(matches!(
        client.search_patients(&backfill_query()).await,
        Err(PartnerError::Internal(message)) if message.contains("status 500")
    ));
}

#[tokio::test]
async fn test_report_posts_status() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/backfills:status"))
        .and(body_partial_json(serde_json::json!({
            "channel_item_id": 100,
            "number_of_matches": 3,
            "status": "PROCESSED"
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = PopHealthClient::new(&mock_server.uri(), TIMEOUT).unwrap();
    let report = BackfillStatusReport {
        channel_item_id: 100,
        number_of_matches: 3,
        status: BackfillStatus::Processed,
    };
    client.report(&report).await.expect("report should succeed");
}

#[tokio::test]
async fn test_report_error_status() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/backfills:status"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&mock_server)
        .await;

    let client = PopHealthClient::new(&mock_server.uri(), TIMEOUT).unwrap();
    let report = BackfillStatusReport {
        channel_item_id: 100,
        number_of_matches: 0,
        status: BackfillStatus::Failed,
    };
    assert!(matches!(
        client.report(&report).await,
        Err(PartnerError::Internal(message)) if message.contains("status 502")
    ));
}
