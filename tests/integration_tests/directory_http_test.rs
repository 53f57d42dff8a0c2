//! HTTP directory client tests against a mock server

use wiremock::matchers::{body_partial_json, header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use roster_sync::directory::{DirectoryClient, HttpDirectoryClient, RemoveOutcome};
use roster_sync::error::DirectoryError;
use roster_sync::models::{GroupEmail, GroupName, MemberEmail};
use roster_sync::utils::retry::RetryConfig;

use super::fixtures::{membership_json, operation_json};

fn client(server: &MockServer) -> HttpDirectoryClient {
    HttpDirectoryClient::with_base_url(&server.uri(), 100)
        .unwrap()
        .with_retry(RetryConfig::with_delays(2, 10, 50))
}

fn group() -> GroupName {
    GroupName::new("groups/g1")
}

// ============================================================================
// Group Lookup
// ============================================================================

#[tokio::test]
async fn test_resolve_group() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/groups:lookup"))
        .and(query_param("groupKey.id", "eng@example.com"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "name": "groups/g1" })))
        .expect(1)
        .mount(&server)
        .await;

    let name = client(&server)
        .with_token("secret")
        .resolve_group(&GroupEmail::new("eng@example.com"))
        .await
        .unwrap();

    assert_eq!(name, Some(group()));
}

#[tokio::test]
async fn test_resolve_unknown_group_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/groups:lookup"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .expect(1)
        .mount(&server)
        .await;

    let name = client(&server)
        .resolve_group(&GroupEmail::new("ghost@example.com"))
        .await
        .unwrap();

    assert!(name.is_none());
}

#[tokio::test]
async fn test_forbidden_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/groups:lookup"))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .resolve_group(&GroupEmail::new("eng@example.com"))
        .await
        .unwrap_err();

    assert!(matches!(err, DirectoryError::Rejected { status: 403, .. }));
    assert!(!err.is_recoverable());
}

// ============================================================================
// Listing
// ============================================================================

#[tokio::test]
async fn test_list_members_follows_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/groups/g1/memberships"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "memberships": [
                membership_json("groups/g1/memberships/1", "alice@example.com"),
                { "name": "groups/g1/memberships/svc" }
            ],
            "nextPageToken": "p2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/groups/g1/memberships"))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "memberships": [membership_json("groups/g1/memberships/2", "bob@example.com")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let members = client(&server).list_members(&group()).await.unwrap();

    let emails: Vec<&str> = members.iter().map(|m| m.email.as_str()).collect();
    assert_eq!(emails, vec!["alice@example.com", "bob@example.com"]);
    assert_eq!(members[1].name.as_str(), "groups/g1/memberships/2");
}

#[tokio::test]
async fn test_rate_limited_request_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/groups/g1/memberships"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/groups/g1/memberships"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "memberships": [membership_json("groups/g1/memberships/1", "alice@example.com")]
        })))
        .mount(&server)
        .await;

    let members = client(&server).list_members(&group()).await.unwrap();
    assert_eq!(members.len(), 1);
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/groups/g1/memberships"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server).list_members(&group()).await.unwrap_err();
    assert!(matches!(err, DirectoryError::ServerError(503)));
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn test_add_member_returns_membership_name() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/groups/g1/memberships"))
        .and(body_partial_json(serde_json::json!({
            "preferredMemberKey": { "id": "alice@example.com" },
            "roles": [{ "name": "MEMBER" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation_json("groups/g1/memberships/9")))
        .expect(1)
        .mount(&server)
        .await;

    let info = client(&server)
        .add_member(&group(), &MemberEmail::new("alice@example.com"))
        .await
        .unwrap();

    assert_eq!(info.name.as_str(), "groups/g1/memberships/9");
    assert_eq!(info.email.as_str(), "alice@example.com");
}

#[tokio::test]
async fn test_add_without_membership_name_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/groups/g1/memberships"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "done": false })))
        .mount(&server)
        .await;

    let err = client(&server)
        .add_member(&group(), &MemberEmail::new("alice@example.com"))
        .await
        .unwrap_err();

    assert!(matches!(err, DirectoryError::MalformedResponse(_)));
}

#[tokio::test]
async fn test_remove_member_looks_up_then_deletes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/groups/g1/memberships:lookup"))
        .and(query_param("memberKey.id", "alice@example.com"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "name": "groups/g1/memberships/1" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/groups/g1/memberships/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "done": true })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client(&server)
        .remove_member(&group(), &MemberEmail::new("alice@example.com"))
        .await
        .unwrap();

    assert_eq!(outcome, RemoveOutcome::Removed);
}

#[tokio::test]
async fn test_remove_absent_member_skips_delete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/groups/g1/memberships:lookup"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let outcome = client(&server)
        .remove_member(&group(), &MemberEmail::new("gone@example.com"))
        .await
        .unwrap();

    assert_eq!(outcome, RemoveOutcome::AlreadyAbsent);
}
