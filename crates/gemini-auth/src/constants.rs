//! Google OAuth constants
//!
//! Public OAuth client configuration matching the Gemini CLI installed-app
//! flow. These values are not secrets — they identify the public client
//! application. The actual secrets (access/refresh tokens) live in the
//! token store.

/// Google's public OAuth client ID for the Gemini CLI installed-app flow
pub const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";

/// Installed-app client secret (public by design for this grant type)
pub const OAUTH_CLIENT_SECRET: &str = "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";

/// Token endpoint for code exchange and token refresh
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Userinfo endpoint resolving an access token to the owner email
pub const USERINFO_ENDPOINT: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Revocation endpoint for explicit credential deletion
pub const REVOKE_ENDPOINT: &str = "https://oauth2.googleapis.com/revoke";

/// Scopes required for CloudCode inference and email resolution
pub const OAUTH_SCOPES: &str = "https://www.googleapis.com/auth/cloud-platform \
                                https://www.googleapis.com/auth/userinfo.email \
                                https://www.googleapis.com/auth/userinfo.profile";
