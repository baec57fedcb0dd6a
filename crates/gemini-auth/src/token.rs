//! Google OAuth token operations
//!
//! Handles the token endpoint interactions the gateway needs:
//! 1. Authorization code exchange (onboarding flow completion)
//! 2. Token refresh (proactive, from the refresh scheduler)
//! 3. Revocation (explicit credential deletion)
//! 4. Userinfo lookup (resolving an access token to its owner email)
//!
//! All token operations POST form-encoded grants to `TOKEN_ENDPOINT`.

use serde::{Deserialize, Serialize};

use crate::constants::{REVOKE_ENDPOINT, TOKEN_ENDPOINT, USERINFO_ENDPOINT};
use crate::error::{Error, Result};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. Refresh
/// responses routinely omit `refresh_token`; the store retains the prior
/// one when saving with metadata preservation.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

/// Identity of the account that owns an access token.
#[derive(Debug, Deserialize)]
pub struct UserInfo {
    pub email: String,
    #[serde(default)]
    pub verified_email: Option<bool>,
}

/// Exchange an authorization code for tokens (onboarding flow).
pub async fn exchange_code(
    client: &reqwest::Client,
    code: &str,
    redirect_uri: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(TOKEN_ENDPOINT)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))
}

/// Refresh an access token using a refresh token.
///
/// Called by the background refresh scheduler ahead of expiry. A 400/401
/// from the endpoint means the refresh token itself is revoked or invalid.
pub async fn refresh_token(
    client: &reqwest::Client,
    refresh: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(TOKEN_ENDPOINT)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if matches!(status.as_u16(), 400 | 401 | 403) {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}

/// Revoke a token (access or refresh) at Google's revocation endpoint.
pub async fn revoke_token(client: &reqwest::Client, token: &str) -> Result<()> {
    let response = client
        .post(REVOKE_ENDPOINT)
        .form(&[("token", token)])
        .send()
        .await
        .map_err(|e| Error::Http(format!("revoke request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::TokenExchange(format!(
            "revoke endpoint returned {status}"
        )));
    }
    Ok(())
}

/// Resolve an access token to the owning account.
pub async fn fetch_userinfo(client: &reqwest::Client, access_token: &str) -> Result<UserInfo> {
    let response = client
        .get(USERINFO_ENDPOINT)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| Error::Http(format!("userinfo request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::InvalidCredentials(format!(
            "userinfo endpoint returned {status}"
        )));
    }

    response
        .json::<UserInfo>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid userinfo response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_deserializes() {
        let json = r#"{"access_token":"ya29.abc","refresh_token":"1//def","token_type":"Bearer","expires_in":3599,"scope":"openid"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "ya29.abc");
        assert_eq!(token.refresh_token.as_deref(), Some("1//def"));
        assert_eq!(token.expires_in, 3599);
    }

    #[test]
    fn token_response_without_refresh_token() {
        // Google refresh responses usually omit the refresh token.
        let json = r#"{"access_token":"ya29.abc","token_type":"Bearer","expires_in":3599}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert!(token.refresh_token.is_none());
        assert!(token.id_token.is_none());
    }

    #[test]
    fn token_response_with_id_token() {
        let json =
            r#"{"access_token":"ya29.abc","expires_in":3599,"id_token":"eyJhbGciOiJSUzI1NiJ9.x.y"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert!(token.id_token.is_some());
    }

    #[test]
    fn userinfo_deserializes() {
        let json = r#"{"email":"Owner@Example.com","verified_email":true,"picture":"https://x"}"#;
        let info: UserInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.email, "Owner@Example.com");
        assert_eq!(info.verified_email, Some(true));
    }

    #[test]
    fn endpoints_are_google() {
        assert_eq!(TOKEN_ENDPOINT, "https://oauth2.googleapis.com/token");
        assert_eq!(REVOKE_ENDPOINT, "https://oauth2.googleapis.com/revoke");
        assert_eq!(
            USERINFO_ENDPOINT,
            "https://www.googleapis.com/oauth2/v2/userinfo"
        );
    }
}
