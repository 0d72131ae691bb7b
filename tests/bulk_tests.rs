//! Integration tests for bulk and paginated fetching.

mod common;

use common::{setup_mock_server, test_client};
use integrations_esi::{ClientPolicy, EsiError, EsiErrorKind, PageSetOutcome};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_page(server: &MockServer, page: Option<&str>, body: Value, marker: &str, pages: u32) {
    let mock = Mock::given(method("GET")).and(path("/v1/widgets/"));
    let mock = match page {
        Some(page) => mock.and(query_param("page", page)),
        None => mock.and(query_param_is_missing("page")),
    };
    mock.respond_with(
        ResponseTemplate::new(200)
            .set_body_json(body)
            .insert_header("expires", marker)
            .insert_header("X-Pages", pages.to_string().as_str()),
    )
    .mount(server)
    .await;
}

#[tokio::test]
async fn test_paginated_fetch_returns_every_page() {
    let mock_server = setup_mock_server().await;
    mount_page(&mock_server, None, json!([{"id": 1}, {"id": 2}]), "M1", 2).await;
    mount_page(&mock_server, Some("1"), json!([{"id": 1}, {"id": 2}]), "M1", 2).await;
    mount_page(&mock_server, Some("2"), json!([{"id": 3}]), "M1", 2).await;

    let client = test_client(&mock_server);
    let items = client.get_multiple_paginated("/v1/widgets/").await.unwrap();

    assert_eq!(items, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
    assert_eq!(client.metrics().pagination_restarts, 0);
}

#[tokio::test]
async fn test_mixed_generations_yield_no_items() {
    let mock_server = setup_mock_server().await;
    mount_page(&mock_server, Some("1"), json!([{"id": 1}]), "M1", 2).await;
    mount_page(&mock_server, Some("2"), json!([{"id": 2}]), "M2", 2).await;

    let client = test_client(&mock_server);
    let outcome = client
        .bulk()
        .get_multiple_flat("/v1/widgets/?page={}", &[1, 2], None)
        .await
        .unwrap();

    assert_eq!(outcome, PageSetOutcome::Inconsistent);
    assert_eq!(outcome.into_items(), None);
}

#[tokio::test]
async fn test_persistent_mismatch_exhausts_restarts() {
    let mock_server = setup_mock_server().await;
    mount_page(&mock_server, None, json!([{"id": 1}]), "M1", 2).await;
    mount_page(&mock_server, Some("1"), json!([{"id": 1}]), "M1", 2).await;
    mount_page(&mock_server, Some("2"), json!([{"id": 2}]), "M2", 2).await;

    let client = test_client(&mock_server);
    let client = client.with_policy(
        ClientPolicy::from_config(client.config())
            .max_pagination_restarts(1)
            .build(),
    );

    let result = client.get_multiple_paginated("/v1/widgets/").await;

    match result {
        Err(EsiError::InconsistentPages { endpoint, restarts }) => {
            assert_eq!(endpoint, "/v1/widgets/");
            assert_eq!(restarts, 1);
        }
        other => panic!("expected inconsistent pages, got {:?}", other),
    }
    assert_eq!(client.metrics().pagination_restarts, 1);
}

#[tokio::test]
async fn test_missing_page_header_means_single_page() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .and(path("/v2/universe/factions/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"faction_id": 500001}])))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = test_client(&mock_server);
    let items = client.get_multiple_paginated("/v2/universe/factions/").await.unwrap();

    assert_eq!(items, vec![json!({"faction_id": 500001})]);
}

#[tokio::test]
async fn test_consistent_flat_fetch_without_markers() {
    let mock_server = setup_mock_server().await;

    for (page, id) in [("1", 1), ("2", 2), ("3", 3)] {
        Mock::given(method("GET"))
            .and(path("/v1/widgets/"))
            .and(query_param("page", page))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": id }])))
            .mount(&mock_server)
            .await;
    }

    let client = test_client(&mock_server);
    let items = client
        .bulk()
        .get_multiple_flat_consistent("/v1/widgets/?page={}", &[1, 2, 3])
        .await
        .unwrap();

    assert_eq!(items, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
}

#[tokio::test]
async fn test_independent_map_keeps_failures_per_param() {
    let mock_server = setup_mock_server().await;

    for id in [1u64, 2] {
        Mock::given(method("GET"))
            .and(path(format!("/v5/characters/{}/", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": format!("Pilot {}", id) })))
            .mount(&mock_server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/v5/characters/3/"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "Character not found"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = test_client(&mock_server);
    let client = client.with_policy(
        ClientPolicy::from_config(client.config())
            .raise_application_errors(false)
            .log_application_errors(false)
            .build(),
    );

    let results = client
        .get_multiple("/v5/characters/{}/", &[1u64, 2, 3])
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[&1u64].payload(), Some(&json!({"name": "Pilot 1"})));
    assert_eq!(results[&2u64].payload(), Some(&json!({"name": "Pilot 2"})));
    assert_eq!(results[&3u64].error_kind(), Some(EsiErrorKind::UpstreamApplicationError));
}

#[tokio::test]
async fn test_independent_map_raises_under_strict_policy() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .and(path("/v5/characters/1/"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "Character not found"})))
        .mount(&mock_server)
        .await;

    let client = test_client(&mock_server);
    let result = client.get_multiple("/v5/characters/{}/", &[1u64]).await;

    assert!(matches!(
        result,
        Err(EsiError::Upstream {
            kind: EsiErrorKind::UpstreamApplicationError,
            ..
        })
    ));
}

#[tokio::test]
async fn test_undecodable_response_fails_batch() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .and(path("/v5/characters/1/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Pilot 1"})))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v5/characters/2/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&mock_server)
        .await;

    let client = test_client(&mock_server);
    let result = client.get_multiple("/v5/characters/{}/", &[1u64, 2]).await;

    assert!(matches!(result, Err(EsiError::Decode { .. })));
}
