//! Project pool for the Gemini gateway
//!
//! Manages the cross-account pool of cloud projects: per-project health
//! counters with exponential-backoff cooldowns, health-scored selection with
//! short-lived memoization, upstream error classification, and proactive
//! token refresh. State is persisted in the shared KV backend; credentials
//! come from `gemini_auth::TokenStore` (single source of truth).
//!
//! Project lifecycle:
//! 1. An onboarding collaborator stores a credential listing its projects
//! 2. The selector scores every API-enabled project and picks the head
//! 3. The executor reports outcomes: success resets the error streak,
//!    errors grow the cooldown exponentially
//! 4. Cooldowns expire implicitly (wall clock) or via `clear_cooldown`
//! 5. The refresh scheduler keeps owner tokens alive ahead of expiry

pub mod classify;
pub mod error;
pub mod refresh;
pub mod selector;
pub mod state;

pub use classify::ErrorClassifier;
pub use error::{Error, Result};
pub use refresh::{RefreshOutcome, RefreshScheduler};
pub use selector::HealthSelector;
pub use state::{ProjectState, ProjectStatePatch, ProjectStateStore};
