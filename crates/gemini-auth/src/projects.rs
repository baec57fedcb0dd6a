//! Cloud project discovery
//!
//! Resolves which projects an account owns and whether the CloudCode API is
//! enabled on each. Two Google surfaces are involved: the resource manager
//! lists active projects (paginated), and service-usage answers the
//! per-project API-enablement question. Both calls are bounded by a
//! 30-second timeout.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::credential::ProjectInfo;
use crate::error::{Error, Result};

/// Resource manager listing endpoint.
pub const RESOURCE_MANAGER_ENDPOINT: &str = "https://cloudresourcemanager.googleapis.com/v1/projects";

/// Service-usage endpoint prefix.
pub const SERVICE_USAGE_ENDPOINT: &str = "https://serviceusage.googleapis.com/v1";

/// The CloudCode companion service whose enablement gates generate calls.
pub const CLOUDCODE_SERVICE: &str = "cloudaicompanion.googleapis.com";

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectListPage {
    #[serde(default)]
    projects: Vec<DiscoveredProject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// One project row from the resource manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredProject {
    pub project_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_number: Option<String>,
    #[serde(default)]
    pub lifecycle_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceState {
    #[serde(default)]
    state: String,
}

/// List the account's ACTIVE projects, following pagination.
pub async fn list_active_projects(
    client: &reqwest::Client,
    access_token: &str,
) -> Result<Vec<DiscoveredProject>> {
    let mut projects = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let mut request = client
            .get(RESOURCE_MANAGER_ENDPOINT)
            .bearer_auth(access_token)
            .timeout(DISCOVERY_TIMEOUT)
            .query(&[("filter", "lifecycleState:ACTIVE")]);
        if let Some(token) = &page_token {
            request = request.query(&[("pageToken", token.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("project listing failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Http(format!(
                "resource manager returned {status}: {body}"
            )));
        }

        let page: ProjectListPage = response
            .json()
            .await
            .map_err(|e| Error::Http(format!("invalid project listing: {e}")))?;
        projects.extend(page.projects);

        match page.next_page_token {
            Some(token) if !token.is_empty() => page_token = Some(token),
            _ => break,
        }
    }

    debug!(projects = projects.len(), "listed active projects");
    Ok(projects)
}

/// Whether the CloudCode service is enabled on a project.
pub async fn is_api_enabled(
    client: &reqwest::Client,
    access_token: &str,
    project_id: &str,
) -> Result<bool> {
    let url = format!("{SERVICE_USAGE_ENDPOINT}/projects/{project_id}/services/{CLOUDCODE_SERVICE}");
    let response = client
        .get(&url)
        .bearer_auth(access_token)
        .timeout(DISCOVERY_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::Http(format!("service-usage check failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        // A project we cannot inspect is treated as disabled, not fatal.
        warn!(project_id, %status, "service-usage check rejected");
        return Ok(false);
    }

    let state: ServiceState = response
        .json()
        .await
        .map_err(|e| Error::Http(format!("invalid service-usage response: {e}")))?;
    Ok(service_enabled(&state.state))
}

/// Full discovery: list projects, then check enablement on each.
pub async fn discover_projects(
    client: &reqwest::Client,
    access_token: &str,
) -> Result<Vec<ProjectInfo>> {
    let discovered = list_active_projects(client, access_token).await?;
    let mut projects = Vec::with_capacity(discovered.len());
    for project in discovered {
        let api_enabled = is_api_enabled(client, access_token, &project.project_id).await?;
        projects.push(ProjectInfo {
            project_id: project.project_id,
            name: project.name,
            project_number: project.project_number,
            api_enabled,
        });
    }
    Ok(projects)
}

fn service_enabled(state: &str) -> bool {
    state == "ENABLED"
}
