/// Management API tests driven through the router
mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

const BPN: &str = "BPNL000000000001";

#[tokio::test]
async fn test_mapping_lifecycle() {
    let server = test_server();
    let member = member_token();

    let created = send(
        &server.management,
        admin_request("POST", "/bpn", Some(json!({ "bpn": BPN, "did": "did:web:a.example" }))),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.json()["version"], 1);
    assert_eq!(created.headers["etag"], "\"1\"");

    let resolved = send(
        &server.directory,
        request("GET", &format!("/bpn/{}", BPN), Some(&member), None),
    )
    .await;
    assert_eq!(resolved.json()["did"], "did:web:a.example");

    let rotated = send(
        &server.management,
        admin_request(
            "PUT",
            &format!("/bpn/{}", BPN),
            Some(json!({ "did": "did:web:b.example", "expectedVersion": 1 })),
        ),
    )
    .await;
    assert_eq!(rotated.status, StatusCode::OK);
    assert_eq!(rotated.json()["version"], 2);

    // The cached value must not survive the write
    let resolved = send(
        &server.directory,
        request("GET", &format!("/bpn/{}", BPN), Some(&member), None),
    )
    .await;
    assert_eq!(resolved.json()["did"], "did:web:b.example");

    let stale = send(
        &server.management,
        admin_request(
            "PUT",
            &format!("/bpn/{}", BPN),
            Some(json!({ "did": "did:web:c.example", "expectedVersion": 1 })),
        ),
    )
    .await;
    assert_eq!(stale.status, StatusCode::CONFLICT);
    assert_eq!(stale.json()["error"], "VERSION_CONFLICT");

    let mut delete = admin_request("DELETE", &format!("/bpn/{}", BPN), None);
    delete
        .headers_mut()
        .insert("if-match", "\"2\"".parse().unwrap());
    let deleted = send(&server.management, delete).await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);

    let gone = send(
        &server.directory,
        request("GET", &format!("/bpn/{}", BPN), Some(&member), None),
    )
    .await;
    assert_eq!(gone.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let server = test_server();
    let body = json!({ "bpn": BPN, "did": "did:web:a.example" });

    let first = send(&server.management, admin_request("POST", "/bpn", Some(body.clone()))).await;
    assert_eq!(first.status, StatusCode::CREATED);

    let second = send(&server.management, admin_request("POST", "/bpn", Some(body))).await;
    assert_eq!(second.status, StatusCode::CONFLICT);
    assert_eq!(second.json()["error"], "ALREADY_EXISTS");
}

#[tokio::test]
async fn test_invalid_did_is_rejected() {
    let server = test_server();

    let response = send(
        &server.management,
        admin_request("POST", "/bpn", Some(json!({ "bpn": BPN, "did": "web:missing-scheme" }))),
    )
    .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_member_is_forbidden_operator_is_allowed() {
    let server = test_server();

    let anonymous = send(&server.management, request("GET", "/bpn", None, None)).await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);

    let member = member_token();
    let forbidden = send(&server.management, request("GET", "/bpn", Some(&member), None)).await;
    assert_eq!(forbidden.status, StatusCode::FORBIDDEN);
    assert_eq!(forbidden.json()["error"], "FORBIDDEN");

    let operator = operator_token();
    let allowed = send(
        &server.management,
        request(
            "POST",
            "/bpn",
            Some(&operator),
            Some(json!({ "bpn": BPN, "did": "did:web:a.example" })),
        ),
    )
    .await;
    assert_eq!(allowed.status, StatusCode::CREATED);

    let mut wrong_key = request("GET", "/bpn", None, None);
    wrong_key
        .headers_mut()
        .insert("x-api-key", "wrong-key-wrong-key".parse().unwrap());
    let rejected = send(&server.management, wrong_key).await;
    assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_delete_requires_expected_version() {
    let server = test_server();
    send(
        &server.management,
        admin_request("POST", "/bpn", Some(json!({ "bpn": BPN, "did": "did:web:a.example" }))),
    )
    .await;

    let missing = send(
        &server.management,
        admin_request("DELETE", &format!("/bpn/{}", BPN), None),
    )
    .await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);

    let stale = send(
        &server.management,
        admin_request("DELETE", &format!("/bpn/{}?expectedVersion=7", BPN), None),
    )
    .await;
    assert_eq!(stale.status, StatusCode::CONFLICT);

    let deleted = send(
        &server.management,
        admin_request("DELETE", &format!("/bpn/{}?expectedVersion=1", BPN), None),
    )
    .await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_batch_register_and_paginated_listing() {
    let server = test_server();
    let entries: Vec<_> = (1..=5)
        .map(|i| json!({ "bpn": format!("BPNL00000000000{}", i), "did": format!("did:web:{}.example", i) }))
        .collect();

    let created = send(
        &server.management,
        admin_request("POST", "/bpn:batchRegister", Some(json!({ "entries": entries }))),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.json()["records"].as_array().unwrap().len(), 5);

    let first = send(&server.management, admin_request("GET", "/bpn?pageSize=2", None)).await;
    assert_eq!(first.status, StatusCode::OK);
    let page = first.json();
    assert_eq!(page["records"].as_array().unwrap().len(), 2);
    assert_eq!(page["records"][0]["bpn"], "BPNL000000000001");

    let mut seen = 2;
    let mut token = page["nextPageToken"].as_str().map(str::to_string);
    while let Some(next) = token {
        let response = send(
            &server.management,
            admin_request("GET", &format!("/bpn?pageSize=2&pageToken={}", next), None),
        )
        .await;
        let page = response.json();
        seen += page["records"].as_array().unwrap().len();
        token = page["nextPageToken"].as_str().map(str::to_string);
    }
    assert_eq!(seen, 5);

    let invalid = send(&server.management, admin_request("GET", "/bpn?pageSize=0", None)).await;
    assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_register_is_all_or_nothing() {
    let server = test_server();
    send(
        &server.management,
        admin_request("POST", "/bpn", Some(json!({ "bpn": BPN, "did": "did:web:a.example" }))),
    )
    .await;

    let response = send(
        &server.management,
        admin_request(
            "POST",
            "/bpn:batchRegister",
            Some(json!({ "entries": [
                { "bpn": "BPNL000000000002", "did": "did:web:b.example" },
                { "bpn": BPN, "did": "did:web:c.example" }
            ] })),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::CONFLICT);

    let untouched = send(
        &server.management,
        admin_request("GET", "/bpn/BPNL000000000002", None),
    )
    .await;
    assert_eq!(untouched.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reverse_lookup_by_did() {
    let server = test_server();
    for bpn in ["BPNL000000000001", "BPNS000000000001"] {
        send(
            &server.management,
            admin_request("POST", "/bpn", Some(json!({ "bpn": bpn, "did": "did:web:shared.example" }))),
        )
        .await;
    }

    let response = send(
        &server.management,
        admin_request("GET", "/did/did:web:shared.example", None),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    let body = response.json();
    assert_eq!(body["did"], "did:web:shared.example");
    assert_eq!(body["records"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_external_write_is_picked_up_by_poll() {
    use bdrs_server::store::MappingStore;

    let server = test_server();
    let member = member_token();
    send(
        &server.management,
        admin_request("POST", "/bpn", Some(json!({ "bpn": BPN, "did": "did:web:a.example" }))),
    )
    .await;

    server.ctx.engine.poll_directory_version().await.unwrap();
    let cached = send(
        &server.directory,
        request("GET", &format!("/bpn/{}", BPN), Some(&member), None),
    )
    .await;
    assert_eq!(cached.json()["did"], "did:web:a.example");

    // Another instance rotates the mapping behind this one's back
    server
        .store
        .put(BPN, "did:web:b.example", Some(1))
        .await
        .unwrap();
    assert!(server.ctx.engine.poll_directory_version().await.unwrap());

    let fresh = send(
        &server.directory,
        request("GET", &format!("/bpn/{}", BPN), Some(&member), None),
    )
    .await;
    assert_eq!(fresh.json()["did"], "did:web:b.example");
}

#[tokio::test]
async fn test_management_errors_keep_json_shape() {
    let server = test_server();

    let patch = send(
        &server.management,
        admin_request("PATCH", &format!("/bpn/{}", BPN), Some(json!({ "did": "did:web:a.example" }))),
    )
    .await;
    assert_eq!(patch.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(patch.json()["error"], "METHOD_NOT_ALLOWED");

    let bad_path = send(&server.management, admin_request("DELETE", "/bpn/%C3%28", None)).await;
    assert_eq!(bad_path.status, StatusCode::BAD_REQUEST);
    assert_eq!(bad_path.json()["error"], "INVALID_INPUT");
}
