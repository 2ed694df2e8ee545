//! Integration tests for the bearer token lifecycle.
//!
//! These tests verify that authentication:
//! - Checks credentials before touching the network
//! - Requests tokens with HTTP Basic auth
//! - Renews an expired token exactly once before the next registry call
//! - Surfaces token endpoint failures as errors

use chrono::Utc;
use oima_core::{
    AuthError, AuthState, DockerRegistry, MemoryStore, RegistryConfig, RegistryError, RetryPolicy,
    SecretStore, store,
};
use serde_json::json;
use std::sync::Arc;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{basic_auth, header, method, path},
};

const TOKEN_PATH: &str = "/api/docker/docker/v2/token";

fn config(server: &MockServer) -> RegistryConfig {
    RegistryConfig::new(server.uri())
        .with_auth("robot")
        .with_retry(RetryPolicy::none())
}

async fn store_with_password(password: &str) -> Arc<MemoryStore> {
    let secrets = Arc::new(MemoryStore::new());
    secrets
        .add(store::PASSWORD, &mut password.as_bytes().to_vec())
        .await
        .unwrap();
    secrets
}

async fn mount_version_check(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(401))
        .mount(server)
        .await;
}

fn token_body(token: &str, expires_in: i64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "token": token, "expires_in": expires_in }))
}

#[tokio::test]
async fn test_init_obtains_token_with_basic_auth() {
    let server = MockServer::start().await;
    mount_version_check(&server).await;
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .and(basic_auth("robot", "hunter2"))
        .respond_with(token_body("first", 300))
        .expect(1)
        .mount(&server)
        .await;

    let mut registry =
        DockerRegistry::new(&config(&server), store_with_password("hunter2").await).unwrap();

    let before = Utc::now().timestamp();
    registry.init().await.unwrap();
    let after = Utc::now().timestamp();

    assert_eq!(registry.auth().state(), AuthState::Authenticated);
    let expiry = registry.auth().token_expiry().await.unwrap();
    assert!(expiry >= before + 300 && expiry <= after + 300);
}

#[tokio::test]
async fn test_expired_token_is_renewed_exactly_once() {
    let server = MockServer::start().await;
    mount_version_check(&server).await;

    // The first token is already expired when it arrives.
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(token_body("stale", 0))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(token_body("fresh", 600))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/_catalog"))
        .and(header("Authorization", "Bearer fresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "repositories": ["nginx", "team/app"] })),
        )
        .expect(1)
        .mount(&server)
        .await;
    for image in ["nginx", "team/app"] {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/tags/list", image)))
            .and(header("Authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "tags": ["a", "b"] })))
            .mount(&server)
            .await;
        for tag in ["a", "b"] {
            Mock::given(method("HEAD"))
                .and(path(format!("/v2/{}/manifests/{}", image, tag)))
                .and(header("Authorization", "Bearer fresh"))
                .respond_with(
                    ResponseTemplate::new(200).insert_header("Docker-Content-Digest", "sha256:00"),
                )
                .mount(&server)
                .await;
        }
    }

    let mut registry =
        DockerRegistry::new(&config(&server), store_with_password("hunter2").await).unwrap();
    registry.init().await.unwrap();

    let before = Utc::now().timestamp();
    registry.fetch_all().await.unwrap();
    let after = Utc::now().timestamp();

    assert_eq!(registry.stats().tags, 4);
    let expiry = registry.auth().token_expiry().await.unwrap();
    assert!(expiry >= before + 600 && expiry <= after + 600);
}

#[tokio::test]
async fn test_missing_password_fails_before_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut registry =
        DockerRegistry::new(&config(&server), Arc::new(MemoryStore::new())).unwrap();
    let err = registry.init().await.unwrap_err();

    assert!(matches!(
        err,
        RegistryError::Auth(AuthError::MissingCredential { .. })
    ));
    assert!(err.is_configuration_fault());
}

#[tokio::test]
async fn test_non_utf8_password_is_never_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(token_body("anonymous", 300))
        .expect(0)
        .mount(&server)
        .await;

    let secrets = Arc::new(MemoryStore::new());
    secrets
        .add(store::PASSWORD, &mut vec![0xff, 0xfe, 0x41])
        .await
        .unwrap();

    let mut registry = DockerRegistry::new(&config(&server), secrets).unwrap();
    let err = registry.init().await.unwrap_err();

    assert!(matches!(
        err,
        RegistryError::Auth(AuthError::InvalidCredential { .. })
    ));
    assert!(err.is_configuration_fault());
    assert_ne!(registry.auth().state(), AuthState::Authenticated);
}

#[tokio::test]
async fn test_huge_token_lifetime_is_accepted() {
    let server = MockServer::start().await;
    mount_version_check(&server).await;
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(token_body("forever", i64::MAX))
        .expect(1)
        .mount(&server)
        .await;

    let mut registry =
        DockerRegistry::new(&config(&server), store_with_password("hunter2").await).unwrap();
    registry.init().await.unwrap();

    assert_eq!(registry.auth().state(), AuthState::Authenticated);
    assert_eq!(registry.auth().token_expiry().await, Some(i64::MAX));
}

#[tokio::test]
async fn test_rejected_credentials() {
    let server = MockServer::start().await;
    mount_version_check(&server).await;
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let mut registry =
        DockerRegistry::new(&config(&server), store_with_password("wrong").await).unwrap();
    let err = registry.init().await.unwrap_err();

    assert!(matches!(err, RegistryError::Auth(AuthError::Http(_))));
    assert!(!err.is_transient());
    assert_eq!(registry.version(), None);
}

#[tokio::test]
async fn test_malformed_token_response() {
    let server = MockServer::start().await;
    mount_version_check(&server).await;
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "x" })))
        .mount(&server)
        .await;

    let mut registry =
        DockerRegistry::new(&config(&server), store_with_password("hunter2").await).unwrap();
    let err = registry.init().await.unwrap_err();

    assert!(matches!(
        err,
        RegistryError::Auth(AuthError::MalformedResponse { .. })
    ));
}

#[tokio::test]
async fn test_check_registry_requests_new_token() {
    let server = MockServer::start().await;
    mount_version_check(&server).await;
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(token_body("t", 300))
        .expect(2)
        .mount(&server)
        .await;

    let mut registry =
        DockerRegistry::new(&config(&server), store_with_password("hunter2").await).unwrap();
    registry.init().await.unwrap();

    assert!(registry.check_registry().await.unwrap());
}
