//! OAuth refresh-token exchange

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{truncate_chars, Result, SyncError};
use crate::models::TokenGrant;

/// Lifetime assumed when the token endpoint omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Upper bound on a reported token lifetime (90 days)
pub const MAX_EXPIRES_IN_SECS: i64 = 86_400 * 90;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// POST a `refresh_token` grant to `token_url`
///
/// `scope` is left out of the form when empty, the legacy live.com endpoint
/// rejects an explicit one. `proxied` only affects how transport failures are
/// classified.
pub async fn exchange_refresh_token(
    client: &reqwest::Client,
    token_url: &str,
    scope: &str,
    client_id: &str,
    refresh_token: &str,
    proxied: bool,
) -> Result<TokenGrant> {
    let mut params = vec![
        ("client_id", client_id),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    if !scope.is_empty() {
        params.push(("scope", scope));
    }

    debug!("Refreshing access token at {}", token_url);

    let response = client
        .post(token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| SyncError::from_transport(e, proxied))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| SyncError::from_transport(e, proxied))?;

    if !status.is_success() {
        let detail = describe_error_body(&body);
        warn!("Token refresh failed with HTTP {}: {}", status.as_u16(), detail);
        return Err(SyncError::TokenRefresh(format!(
            "HTTP {}: {}",
            status.as_u16(),
            detail
        )));
    }

    let payload: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| SyncError::TokenRefresh(format!("malformed token response: {}", e)))?;

    Ok(TokenGrant {
        access_token: payload.access_token,
        // Providers only sometimes rotate the refresh token
        refresh_token: payload
            .refresh_token
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| refresh_token.to_string()),
        expires_in: payload
            .expires_in
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
            .clamp(0, MAX_EXPIRES_IN_SECS),
    })
}

fn describe_error_body(body: &str) -> String {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(TokenErrorResponse {
            error_description: Some(description),
            ..
        }) => truncate_chars(&description, 300),
        Ok(TokenErrorResponse {
            error: Some(error), ..
        }) => error,
        _ => truncate_chars(body.trim(), 300),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_successful_exchange_with_rotation() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("client_id=client-1"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token_type": "Bearer",
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 4200
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let grant = exchange_refresh_token(
            &client,
            &format!("{}/oauth2/v2.0/token", mock_server.uri()),
            "https://graph.microsoft.com/.default offline_access",
            "client-1",
            "old-refresh",
            false,
        )
        .await
        .unwrap();

        assert_eq!(grant.access_token, "new-access");
        assert_eq!(grant.refresh_token, "new-refresh");
        assert_eq!(grant.expires_in, 4200);
    }

    #[tokio::test]
    async fn test_missing_fields_keep_old_refresh_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access"
            })))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let grant = exchange_refresh_token(
            &client,
            &format!("{}/token", mock_server.uri()),
            "",
            "client-1",
            "keep-me",
            false,
        )
        .await
        .unwrap();

        assert_eq!(grant.refresh_token, "keep-me");
        assert_eq!(grant.expires_in, DEFAULT_EXPIRES_IN_SECS);
    }

    #[tokio::test]
    async fn test_out_of_range_lifetime_is_clamped() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "expires_in": 10_000_000_000_000_i64
            })))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/token", mock_server.uri());
        let grant = exchange_refresh_token(&client, &url, "", "client-1", "rt", false)
            .await
            .unwrap();
        assert_eq!(grant.expires_in, MAX_EXPIRES_IN_SECS);
    }

    #[tokio::test]
    async fn test_empty_scope_is_omitted() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "a"
            })))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        exchange_refresh_token(
            &client,
            &format!("{}/oauth20_token.srf", mock_server.uri()),
            "",
            "client-1",
            "r",
            false,
        )
        .await
        .unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(!body.contains("scope="));
    }

    #[tokio::test]
    async fn test_rejected_grant_carries_description() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70000: The refresh token has expired."
            })))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let error = exchange_refresh_token(
            &client,
            &format!("{}/token", mock_server.uri()),
            "scope",
            "client-1",
            "expired",
            false,
        )
        .await
        .unwrap_err();

        match error {
            SyncError::TokenRefresh(message) => {
                assert!(message.contains("HTTP 400"));
                assert!(message.contains("AADSTS70000"));
            }
            other => panic!("Expected TokenRefresh error, got {:?}", other),
        }
    }

    #[test]
    fn test_describe_error_body_falls_back_to_raw_text() {
        assert_eq!(describe_error_body("{\"error\":\"invalid_client\"}"), "invalid_client");
        assert_eq!(describe_error_body("  Bad Gateway \n"), "Bad Gateway");
    }
}
