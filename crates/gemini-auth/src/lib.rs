//! Google OAuth credential management for the Gemini gateway
//!
//! Persists per-email credential bundles in the shared KV backend, exposes
//! validity predicates and refresh candidates, and speaks to Google's token
//! endpoints. This crate is a standalone library with no dependency on the
//! gateway binary — it can be tested and used independently.
//!
//! Credential flow:
//! 1. An onboarding collaborator exchanges an authorization code via
//!    `token::exchange_code()` and resolves the email via
//!    `token::fetch_userinfo()`
//! 2. Credential stored via `TokenStore::save()` (all hash fields
//!    string-valued; the `projects` field is JSON-encoded)
//! 3. The refresh scheduler calls `token::refresh_token()` before expiry and
//!    saves with `preserve_metadata = true`
//! 4. A 401 from the generate endpoint marks the credential invalid via
//!    `TokenStore::mark_invalid()`

pub mod constants;
pub mod credential;
pub mod error;
pub mod projects;
pub mod store;
pub mod token;

pub use constants::*;
pub use credential::{Credential, ProjectInfo};
pub use error::{Error, Result};
pub use projects::{DiscoveredProject, discover_projects, is_api_enabled, list_active_projects};
pub use store::TokenStore;
pub use token::{TokenResponse, UserInfo, exchange_code, fetch_userinfo, refresh_token, revoke_token};
