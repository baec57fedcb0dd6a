//! Credential model and hash (de)serialization
//!
//! A credential is one Google account's OAuth bundle plus the cloud projects
//! it owns. Persisted as a KV hash whose fields are all strings (numerics
//! and booleans stringified, the project list JSON-encoded), matching the
//! string-valued hash contract of the backing store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Skew subtracted from the expiry when judging usability: a token about to
/// expire mid-request is treated as already expired.
pub const EXPIRY_SKEW_SECS: u64 = 60;

/// One cloud project owned by a credential.
///
/// Stored inside the credential's `projects` field as JSON. Only
/// API-enabled projects are eligible for selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub project_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_number: Option<String>,
    #[serde(default)]
    pub api_enabled: bool,
}

/// A single account's OAuth credential bundle, keyed by lowercase email.
///
/// Timestamps (`created_at`, `updated_at`, `expiry_timestamp`, `invalid_at`)
/// are unix seconds. `expires_in` is a delta in seconds from `created_at`;
/// `expiry_timestamp` is derived as `created_at + expires_in` when absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scope: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub expires_in: u64,
    pub expiry_timestamp: Option<u64>,
    pub invalid: bool,
    pub invalid_reason: Option<String>,
    pub invalid_at: Option<u64>,
    pub client: Option<String>,
    pub projects: Vec<ProjectInfo>,
}

impl Credential {
    /// A fresh credential from a token grant, expiry derived immediately.
    pub fn new(email: &str, access_token: String, expires_in: u64, now_secs: u64) -> Self {
        Self {
            email: email.to_lowercase(),
            access_token,
            refresh_token: None,
            token_type: "Bearer".to_string(),
            scope: String::new(),
            created_at: now_secs,
            updated_at: now_secs,
            expires_in,
            expiry_timestamp: Some(now_secs + expires_in),
            invalid: false,
            invalid_reason: None,
            invalid_at: None,
            client: None,
            projects: Vec::new(),
        }
    }

    /// Fill in `expiry_timestamp` from `created_at + expires_in` when absent.
    pub fn derive_expiry(&mut self) {
        if self.expiry_timestamp.is_none() {
            self.expiry_timestamp = Some(self.created_at + self.expires_in);
        }
    }

    /// Usable iff not invalidated and the expiry (minus skew) is ahead of
    /// now. An absent expiry is treated as already expired.
    pub fn is_usable(&self, now_secs: u64) -> bool {
        if self.invalid {
            return false;
        }
        match self.expiry_timestamp {
            Some(expiry) => now_secs < expiry.saturating_sub(EXPIRY_SKEW_SECS),
            None => false,
        }
    }

    /// Whether the expiry falls within `buffer_ms` of now. Absent expiry
    /// counts as within (the token is overdue for a refresh).
    pub fn expires_within(&self, now_ms: u64, buffer_ms: u64) -> bool {
        match self.expiry_timestamp {
            Some(expiry) => expiry * 1000 <= now_ms + buffer_ms,
            None => true,
        }
    }

    /// API-enabled projects owned by this credential.
    pub fn enabled_projects(&self) -> impl Iterator<Item = &ProjectInfo> {
        self.projects.iter().filter(|p| p.api_enabled)
    }

    /// Stringify every field for the KV hash.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("email".to_string(), self.email.clone()),
            ("access_token".to_string(), self.access_token.clone()),
            ("token_type".to_string(), self.token_type.clone()),
            ("scope".to_string(), self.scope.clone()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("updated_at".to_string(), self.updated_at.to_string()),
            ("expires_in".to_string(), self.expires_in.to_string()),
            ("invalid".to_string(), self.invalid.to_string()),
            (
                "projects".to_string(),
                serde_json::to_string(&self.projects).unwrap_or_else(|_| "[]".to_string()),
            ),
        ];
        if let Some(refresh) = &self.refresh_token {
            fields.push(("refresh_token".to_string(), refresh.clone()));
        }
        if let Some(expiry) = self.expiry_timestamp {
            fields.push(("expiry_timestamp".to_string(), expiry.to_string()));
        }
        if let Some(reason) = &self.invalid_reason {
            fields.push(("invalid_reason".to_string(), reason.clone()));
        }
        if let Some(at) = self.invalid_at {
            fields.push(("invalid_at".to_string(), at.to_string()));
        }
        if let Some(client) = &self.client {
            fields.push(("client".to_string(), client.clone()));
        }
        fields
    }

    /// Rebuild a credential from its KV hash. Missing optionals degrade to
    /// defaults; a missing access token is a parse error.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let email = fields
            .get("email")
            .cloned()
            .ok_or_else(|| Error::CredentialParse("credential hash missing email".into()))?;
        let access_token = fields
            .get("access_token")
            .cloned()
            .ok_or_else(|| Error::CredentialParse(format!("credential {email} missing access_token")))?;

        let parse_u64 = |name: &str| fields.get(name).and_then(|v| v.parse::<u64>().ok());
        let projects = match fields.get("projects") {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                Error::CredentialParse(format!("credential {email} has bad projects field: {e}"))
            })?,
            None => Vec::new(),
        };

        Ok(Self {
            email: email.to_lowercase(),
            access_token,
            refresh_token: fields.get("refresh_token").cloned(),
            token_type: fields
                .get("token_type")
                .cloned()
                .unwrap_or_else(|| "Bearer".to_string()),
            scope: fields.get("scope").cloned().unwrap_or_default(),
            created_at: parse_u64("created_at").unwrap_or(0),
            updated_at: parse_u64("updated_at").unwrap_or(0),
            expires_in: parse_u64("expires_in").unwrap_or(0),
            expiry_timestamp: parse_u64("expiry_timestamp"),
            invalid: fields
                .get("invalid")
                .map(|v| v == "true")
                .unwrap_or(false),
            invalid_reason: fields.get("invalid_reason").cloned(),
            invalid_at: parse_u64("invalid_at"),
            client: fields.get("client").cloned(),
            projects,
        })
    }
}
