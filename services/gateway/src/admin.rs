//! Admin API for account management
//!
//! Operator endpoints for the credential pool. Onboarding accepts either a
//! pre-obtained authorization code (with its redirect URI) or a raw refresh
//! token; the gateway exchanges it, resolves the owner email via userinfo,
//! discovers the account's projects, and stores the bundle. The browser leg
//! of the OAuth dance happens elsewhere — only its outputs arrive here.
//!
//! Endpoints:
//! - GET    /v1/accounts                       — list accounts with status
//! - POST   /v1/accounts                       — onboard from code or refresh token
//! - DELETE /v1/accounts/{email}               — revoke and remove an account
//! - POST   /v1/accounts/{email}/discover      — re-run project discovery
//! - POST   /v1/projects/{id}/cooldown/clear   — re-open a cooled project

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gemini_auth::Credential;
use serde::Deserialize;
use tracing::{info, warn};

use crate::state::AppState;

/// Body of `POST /v1/accounts`.
#[derive(Debug, Default, Deserialize)]
pub struct AddAccountRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// `GET /v1/accounts` — every stored account, tokens never exposed.
pub async fn list_accounts(State(state): State<AppState>) -> Response {
    let creds = match state.tokens.load_all().await {
        Ok(creds) => creds,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let now = common::unix_secs();
    let mut rows: Vec<serde_json::Value> = creds
        .into_values()
        .map(|cred| {
            serde_json::json!({
                "email": cred.email,
                "usable": cred.is_usable(now),
                "invalid": cred.invalid,
                "invalid_reason": cred.invalid_reason,
                "expiry_timestamp": cred.expiry_timestamp,
                "updated_at": cred.updated_at,
                "projects": cred.projects.len(),
                "projects_enabled": cred.enabled_projects().count(),
            })
        })
        .collect();
    rows.sort_by_key(|row| row["email"].as_str().unwrap_or_default().to_string());
    Json(serde_json::json!({"accounts": rows})).into_response()
}

/// `POST /v1/accounts` — onboard an account from a code or a refresh token.
pub async fn add_account(
    State(state): State<AppState>,
    Json(request): Json<AddAccountRequest>,
) -> Response {
    let token_response = match (&request.code, &request.refresh_token) {
        (Some(code), _) => {
            let Some(redirect_uri) = &request.redirect_uri else {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "redirect_uri is required when onboarding with a code",
                );
            };
            match gemini_auth::exchange_code(
                &state.http_client,
                code,
                redirect_uri,
                &state.oauth_client_id,
                &state.oauth_client_secret,
            )
            .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "code exchange failed during onboarding");
                    return error_response(StatusCode::BAD_GATEWAY, e);
                }
            }
        }
        (None, Some(refresh)) => {
            match gemini_auth::refresh_token(
                &state.http_client,
                refresh,
                &state.oauth_client_id,
                &state.oauth_client_secret,
            )
            .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "refresh token rejected during onboarding");
                    return error_response(StatusCode::BAD_GATEWAY, e);
                }
            }
        }
        (None, None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "provide either code + redirect_uri or refresh_token",
            );
        }
    };

    let userinfo = match gemini_auth::fetch_userinfo(&state.http_client, &token_response.access_token)
        .await
    {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "userinfo lookup failed during onboarding");
            return error_response(StatusCode::BAD_GATEWAY, e);
        }
    };
    let email = userinfo.email.to_lowercase();

    let now = common::unix_secs();
    let mut credential = Credential::new(
        &email,
        token_response.access_token.clone(),
        token_response.expires_in,
        now,
    );
    credential.refresh_token = token_response.refresh_token.or(request.refresh_token);
    credential.scope = token_response.scope.unwrap_or_default();
    if let Some(token_type) = token_response.token_type {
        credential.token_type = token_type;
    }

    // Discovery failures leave the account usable; projects can be
    // re-discovered later.
    match gemini_auth::discover_projects(&state.http_client, &token_response.access_token).await {
        Ok(projects) => credential.projects = projects,
        Err(e) => warn!(email, error = %e, "project discovery failed during onboarding"),
    }

    let projects = credential.projects.len();
    let enabled = credential.enabled_projects().count();
    if let Err(e) = state.tokens.save(&email, credential, true).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }
    state.selector.invalidate_memo();
    info!(email, projects, enabled, "account onboarded");

    Json(serde_json::json!({
        "email": email,
        "projects": projects,
        "projects_enabled": enabled,
    }))
    .into_response()
}

/// `DELETE /v1/accounts/{email}` — revoke (best-effort) and remove.
pub async fn delete_account(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Response {
    let credential = match state.tokens.load(&email).await {
        Ok(Some(credential)) => credential,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, format!("no account for {email}"));
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    if let Some(refresh) = &credential.refresh_token
        && let Err(e) = gemini_auth::revoke_token(&state.http_client, refresh).await
    {
        warn!(email, error = %e, "token revocation failed, removing anyway");
    }

    if let Err(e) = state.tokens.delete(&email).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }
    state.selector.invalidate_memo();
    info!(email, "account removed");
    Json(serde_json::json!({"email": email, "status": "deleted"})).into_response()
}

/// `POST /v1/accounts/{email}/discover` — refresh the project list.
pub async fn discover_account_projects(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Response {
    let mut credential = match state.tokens.load(&email).await {
        Ok(Some(credential)) => credential,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, format!("no account for {email}"));
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    match gemini_auth::discover_projects(&state.http_client, &credential.access_token).await {
        Ok(projects) => credential.projects = projects,
        Err(e) => {
            warn!(email, error = %e, "project discovery failed");
            return error_response(StatusCode::BAD_GATEWAY, e);
        }
    }

    let projects = credential.projects.len();
    let enabled = credential.enabled_projects().count();
    if let Err(e) = state.tokens.save(&email, credential, false).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }
    state.selector.invalidate_memo();

    Json(serde_json::json!({
        "email": email,
        "projects": projects,
        "projects_enabled": enabled,
    }))
    .into_response()
}

/// `POST /v1/projects/{id}/cooldown/clear` — re-open a project now.
pub async fn clear_project_cooldown(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Response {
    match state.selector.clear_cooldown(&project_id).await {
        Ok(()) => {
            info!(project_id, "cooldown cleared by operator");
            Json(serde_json::json!({"project_id": project_id, "status": "cleared"}))
                .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

fn error_response(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({"error": {"message": error.to_string()}})),
    )
        .into_response()
}
