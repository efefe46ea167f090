//! Cloud Resource Manager v1 resources.
use serde::Deserialize;

/// A project.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Project identifier.
    pub project_id: String,
    /// Lifecycle state, e.g. `ACTIVE` or `DELETE_REQUESTED`.
    #[serde(default)]
    pub lifecycle_state: String,
}

impl Project {
    /// Returns `true` if the project is active.
    pub fn is_active(&self) -> bool {
        self.lifecycle_state.is_empty() || self.lifecycle_state == "ACTIVE"
    }
}

/// A page of projects.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPage {
    /// Projects on this page.
    #[serde(default)]
    pub projects: Vec<Project>,
    /// Token of the next page, empty or absent on the last page.
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_page_decodes() {
        let page: ProjectPage = serde_json::from_str(
            r#"{"projects": [
                {"projectId": "a", "lifecycleState": "ACTIVE", "name": "A"},
                {"projectId": "b", "lifecycleState": "DELETE_REQUESTED"}
            ]}"#,
        )
        .unwrap();

        let active = page.projects.iter().filter(|p| p.is_active()).map(|p| p.project_id.as_str());
        assert_eq!(active.collect::<Vec<_>>(), vec!["a"]);
        assert!(page.next_page_token.is_none());
    }
}
