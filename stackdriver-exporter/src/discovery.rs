//! Resolution of the projects to collect.
use std::collections::BTreeSet;

use thiserror::Error as ThisError;
use tracing::{debug, info};

use crate::client::{ApiClient, ApiError};

/// Errors that could occur while resolving projects.
#[derive(Debug, ThisError)]
pub enum DiscoveryError {
    /// No project was given and the credentials do not name one.
    #[error("no project given and no default project could be identified from the credentials")]
    NoDefaultProject,

    /// The project search failed.
    #[error("failed to search projects: {0}")]
    Search(#[from] ApiError),

    /// The given projects and the search together yielded nothing.
    #[error("no project to collect")]
    NoProjects,
}

/// Resolves the projects to collect, once, at startup.
///
/// The active projects matching `filter` are collected along with the `explicit` ones. When
/// neither is given, the project of the credentials is used.  The result is sorted and free of
/// duplicates.
///
/// ## Errors
///
/// If the search fails or no project remains, an error is returned.
pub async fn resolve_projects(
    client: &ApiClient,
    explicit: &[String],
    filter: Option<&str>,
    default_project: Option<&str>,
) -> Result<Vec<String>, DiscoveryError> {
    let mut projects = BTreeSet::new();

    match filter {
        Some(filter) => {
            let found = search_active_projects(client, filter).await?;
            info!(%filter, count = found.len(), "discovered projects");
            projects.extend(found);
        }
        None if explicit.is_empty() => {
            info!("neither project ids nor a projects filter given, using the default project");
            let default_project =
                default_project.filter(|id| !id.is_empty()).ok_or(DiscoveryError::NoDefaultProject)?;
            projects.insert(default_project.to_string());
        }
        None => {}
    }

    projects.extend(explicit.iter().filter(|id| !id.is_empty()).cloned());
    if projects.is_empty() {
        return Err(DiscoveryError::NoProjects);
    }
    Ok(projects.into_iter().collect())
}

async fn search_active_projects(client: &ApiClient, filter: &str) -> Result<Vec<String>, ApiError> {
    let mut found = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = client.search_projects(filter, page_token.as_deref()).await?;
        for project in page.projects {
            if project.is_active() {
                found.push(project.project_id);
            } else {
                debug!(project_id = %project.project_id, state = %project.lifecycle_state, "skipping inactive project");
            }
        }

        match page.next_page_token.filter(|token| !token.is_empty()) {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }
    Ok(found)
}
