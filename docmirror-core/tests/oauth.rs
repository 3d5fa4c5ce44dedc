use docmirror_core::{OAuthClient, OAuthError};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn refresh_token_posts_form_data() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/authentication/v2/token"))
        .and(header_exists("authorization"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token-2",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-2"
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
    let token = client.refresh_token("refresh-1", None).await.unwrap();

    assert_eq!(token.access_token, "token-2");
    assert_eq!(token.expires_in, Some(3600));
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-2"));
}

#[tokio::test]
async fn client_credentials_requests_scope() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/authentication/v2/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("scope=data%3Aread"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "two-legged",
            "token_type": "Bearer",
            "expires_in": 3599
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
    let token = client.client_credentials("data:read").await.unwrap();

    assert_eq!(token.access_token, "two-legged");
    assert!(token.refresh_token.is_none());
}

#[tokio::test]
async fn token_error_keeps_status_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/authentication/v2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
    let err = client.refresh_token("bad", None).await.unwrap_err();

    match err {
        OAuthError::Api { status, body } => {
            assert_eq!(status.as_u16(), 400);
            assert_eq!(body, "invalid_grant");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
