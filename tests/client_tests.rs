//! Authenticated client tests: refresh, single-flight, 401 handling

use cli_auth::auth::{CredentialStore, TokenSet, unix_now};
use cli_auth::{AuthConfig, AuthError, ManualBrowser, RetryPolicy, Session};
use futures::future::join_all;
use serde_json::{Value, json};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    server: MockServer,
    dir: TempDir,
    config: AuthConfig,
}

impl Harness {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let config = Self::config_for(&server, &dir, "1234");
        Self {
            server,
            dir,
            config,
        }
    }

    fn config_for(server: &MockServer, dir: &TempDir, client_id: &str) -> AuthConfig {
        AuthConfig::builder()
            .client_id(client_id)
            .redirect_uri("http://127.0.0.1:53682/callback")
            .token_url(format!("{}/oauth2/token", server.uri()))
            .api_root(format!("{}/api/", server.uri()))
            .retry(RetryPolicy::default().with_initial_delay(Duration::from_millis(10)))
            .credentials_path(dir.path().join("credentials.json"))
            .build()
    }

    fn session(&self) -> Session {
        Session::builder()
            .config(self.config.clone())
            .browser(ManualBrowser)
            .build()
            .unwrap()
    }

    fn store(&self) -> CredentialStore {
        CredentialStore::with_path(self.dir.path().join("credentials.json"), &self.config)
    }

    fn seed(&self, access: &str, refresh: Option<&str>, expires_in: i64) -> TokenSet {
        let mut tokens = TokenSet::new(
            access.to_string(),
            refresh.map(str::to_string),
            None,
            unix_now(),
            0,
            Some("identify guilds".to_string()),
        );
        tokens.expires_at = unix_now().saturating_add_signed(expires_in);
        self.store().save(&tokens).unwrap();
        tokens
    }

    async fn mock_me(&self, access: &str) {
        Mock::given(method("GET"))
            .and(path("/api/users/@me"))
            .and(header("authorization", format!("Bearer {access}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "1",
                "username": "nelly"
            })))
            .mount(&self.server)
            .await;
    }
}

fn refresh_response(access: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 604800
    }))
}

#[tokio::test]
async fn test_valid_token_is_used_as_is() {
    let harness = Harness::new().await;
    harness.seed("current", Some("r"), 3600);
    harness.mock_me("current").await;

    let client = harness.session().client().unwrap();
    let me: Value = client.get_json("users/@me").await.unwrap();
    assert_eq!(me["username"], "nelly");
}

#[tokio::test]
async fn test_concurrent_calls_share_one_refresh() {
    let harness = Harness::new().await;
    harness.seed("stale", Some("refresh-1"), -10);

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(refresh_response("renewed").set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&harness.server)
        .await;
    harness.mock_me("renewed").await;

    let client = harness.session().client().unwrap();
    let calls = (0..10).map(|_| {
        let client = client.clone();
        tokio::spawn(async move { client.get_json::<Value>("users/@me").await })
    });
    for result in join_all(calls).await {
        assert_eq!(result.unwrap().unwrap()["id"], "1");
    }

    harness.server.verify().await;
    assert_eq!(harness.store().load().unwrap().access_token, "renewed");
}

#[tokio::test]
async fn test_refresh_without_new_refresh_token_keeps_old_one() {
    let harness = Harness::new().await;
    harness.seed("stale", Some("keep-me"), -10);
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(refresh_response("renewed"))
        .mount(&harness.server)
        .await;

    let client = harness.session().client().unwrap();
    let tokens = client.access_token().await.unwrap();

    assert_eq!(tokens.access_token, "renewed");
    assert_eq!(tokens.refresh_token.as_deref(), Some("keep-me"));
    assert_eq!(tokens.scope.as_deref(), Some("identify guilds"));

    let stored = harness.store().load().unwrap();
    assert_eq!(stored.refresh_token.as_deref(), Some("keep-me"));
}

#[tokio::test]
async fn test_token_within_margin_is_refreshed() {
    let harness = Harness::new().await;
    // Still valid, but inside the 60 s margin
    harness.seed("almost", Some("r"), 30);
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(refresh_response("renewed"))
        .expect(1)
        .mount(&harness.server)
        .await;

    let client = harness.session().client().unwrap();
    assert_eq!(client.access_token().await.unwrap().access_token, "renewed");
}

#[tokio::test]
async fn test_rejected_refresh_poisons_client() {
    let harness = Harness::new().await;
    harness.seed("stale", Some("revoked"), -10);
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant"
        })))
        .expect(1)
        .mount(&harness.server)
        .await;

    let client = harness.session().client().unwrap();
    let first = client.get_json::<Value>("users/@me").await.unwrap_err();
    assert!(matches!(first, AuthError::Unauthenticated(_)), "{first:?}");
    assert!(client.is_poisoned().await);

    // No second provider call
    let second = client.get_json::<Value>("users/@me").await.unwrap_err();
    assert!(matches!(second, AuthError::Unauthenticated(_)));
    harness.server.verify().await;
}

#[tokio::test]
async fn test_expired_without_refresh_token_is_unauthenticated() {
    let harness = Harness::new().await;
    harness.seed("stale", None, -10);

    let client = harness.session().client().unwrap();
    let err = client.access_token().await.unwrap_err();
    assert!(matches!(err, AuthError::Unauthenticated(_)));
    assert!(harness.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_refresh_network_failure_is_retryable() {
    let harness = Harness::new().await;
    harness.seed("stale", Some("r"), -10);
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&harness.server)
        .await;

    let client = harness.session().client().unwrap();
    let err = client.access_token().await.unwrap_err();
    assert!(matches!(err, AuthError::Network(_)), "{err:?}");
    assert!(err.is_retryable());
    assert!(!client.is_poisoned().await);
}

#[tokio::test]
async fn test_401_forces_one_refresh_and_retry() {
    let harness = Harness::new().await;
    harness.seed("revoked-access", Some("r"), 3600);

    Mock::given(method("GET"))
        .and(path("/api/users/@me"))
        .and(header("authorization", "Bearer revoked-access"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(refresh_response("renewed"))
        .expect(1)
        .mount(&harness.server)
        .await;
    harness.mock_me("renewed").await;

    let client = harness.session().client().unwrap();
    let me: Value = client.get_json("users/@me").await.unwrap();
    assert_eq!(me["username"], "nelly");
    harness.server.verify().await;
}

#[tokio::test]
async fn test_second_401_is_unauthenticated() {
    let harness = Harness::new().await;
    harness.seed("a", Some("r"), 3600);

    Mock::given(method("GET"))
        .and(path("/api/users/@me"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(refresh_response("b"))
        .expect(1)
        .mount(&harness.server)
        .await;

    let client = harness.session().client().unwrap();
    let err = client.get_json::<Value>("users/@me").await.unwrap_err();
    assert!(matches!(err, AuthError::Unauthenticated(_)), "{err:?}");
    harness.server.verify().await;
}

#[tokio::test]
async fn test_api_5xx_is_retried() {
    let harness = Harness::new().await;
    harness.seed("current", Some("r"), 3600);

    Mock::given(method("GET"))
        .and(path("/api/users/@me"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&harness.server)
        .await;
    harness.mock_me("current").await;

    let client = harness.session().client().unwrap();
    let me: Value = client.get_json("users/@me").await.unwrap();
    assert_eq!(me["id"], "1");
}

#[tokio::test]
async fn test_api_4xx_is_returned_as_api_error() {
    let harness = Harness::new().await;
    harness.seed("current", Some("r"), 3600);

    Mock::given(method("GET"))
        .and(path("/api/guilds/42"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "message": "Unknown Guild",
            "code": 10004
        })))
        .expect(1)
        .mount(&harness.server)
        .await;

    let client = harness.session().client().unwrap();
    let err = client.get_json::<Value>("guilds/42").await.unwrap_err();
    match err {
        AuthError::Api { status, ref body } => {
            assert_eq!(status, 404);
            assert!(body.contains("Unknown Guild"));
        }
        ref other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_credentials_of_other_client_are_ignored() {
    let harness = Harness::new().await;
    harness.seed("for-1234", Some("r"), 3600);

    let other = Harness::config_for(&harness.server, &harness.dir, "5678");
    let session = Session::builder()
        .config(other)
        .browser(ManualBrowser)
        .build()
        .unwrap();

    assert!(matches!(session.client(), Err(AuthError::Unauthenticated(_))));
    assert_eq!(session.status(), cli_auth::AuthStatus::LoggedOut);
}

#[tokio::test]
async fn test_newer_tokens_in_store_are_adopted() {
    let harness = Harness::new().await;
    harness.seed("stale", Some("r"), -10);
    let client = harness.session().client().unwrap();

    // Another process refreshed in the meantime
    harness.seed("from-other-process", Some("r2"), 3600);
    harness.mock_me("from-other-process").await;

    let me: Value = client.get_json("users/@me").await.unwrap();
    assert_eq!(me["username"], "nelly");
    let requests = harness.server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() != "/oauth2/token"));
}

#[tokio::test]
async fn test_refresh_that_cannot_be_saved_fails() {
    let harness = Harness::new().await;
    harness.seed("stale", Some("r"), -10);
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "renewed",
            "refresh_token": "rotated-r",
            "token_type": "Bearer",
            "expires_in": 604800
        })))
        .expect(2)
        .mount(&harness.server)
        .await;

    let client = harness.session().client().unwrap();

    // A non-empty directory where the file should be makes the rename fail
    let file = harness.dir.path().join("credentials.json");
    std::fs::remove_file(&file).unwrap();
    std::fs::create_dir(&file).unwrap();
    std::fs::write(file.join("occupied"), b"x").unwrap();

    let err = client.access_token().await.unwrap_err();
    assert!(matches!(err, AuthError::Storage(_)), "{err:?}");
    assert!(!client.is_poisoned().await);

    // The unsaved tokens were not adopted, so the next call refreshes again
    let err = client.access_token().await.unwrap_err();
    assert!(matches!(err, AuthError::Storage(_)), "{err:?}");
    harness.server.verify().await;
}
