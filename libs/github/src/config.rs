//! GitHub URL parsing.
//!
//! The configured URL decides whether the pool is registered against an
//! organization (`https://host/org`) or a repository (`https://host/org/repo`).

use reqwest::Url;

use crate::error::ActionsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitHubScope {
    Organization,
    Repository,
}

/// Parsed target of the configured GitHub URL.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub scope: GitHubScope,
    pub organization: String,
    pub repository: Option<String>,
    pub url: String,
}

impl GitHubConfig {
    /// Parse an organization or repository URL.
    ///
    /// Path depth one maps to an organization, two to a repository; anything
    /// else is rejected.
    pub fn parse(github_url: &str) -> Result<Self, ActionsError> {
        let trimmed = github_url.trim_end_matches('/');
        let parsed = Url::parse(trimmed)
            .map_err(|e| ActionsError::Url(format!("invalid GitHub URL {github_url:?}: {e}")))?;

        let segments: Vec<&str> = parsed
            .path()
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match segments.as_slice() {
            [org] => Ok(Self {
                scope: GitHubScope::Organization,
                organization: (*org).to_string(),
                repository: None,
                url: trimmed.to_string(),
            }),
            [org, repo] => Ok(Self {
                scope: GitHubScope::Repository,
                organization: (*org).to_string(),
                repository: Some((*repo).to_string()),
                url: trimmed.to_string(),
            }),
            _ => Err(ActionsError::Url(format!(
                "invalid GitHub URL {github_url:?}: must point to an organization or repository"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_organization_url() {
        let config = GitHubConfig::parse("https://github.com/acme").unwrap();
        assert_eq!(config.scope, GitHubScope::Organization);
        assert_eq!(config.organization, "acme");
        assert!(config.repository.is_none());
    }

    #[test]
    fn test_repository_url() {
        let config = GitHubConfig::parse("https://github.com/acme/widgets/").unwrap();
        assert_eq!(config.scope, GitHubScope::Repository);
        assert_eq!(config.organization, "acme");
        assert_eq!(config.repository.as_deref(), Some("widgets"));
        assert_eq!(config.url, "https://github.com/acme/widgets");
    }

    #[test]
    fn test_enterprise_host() {
        let config = GitHubConfig::parse("https://ghe.internal.example/acme").unwrap();
        assert_eq!(config.scope, GitHubScope::Organization);
    }

    #[test]
    fn test_rejects_bare_host_and_deep_paths() {
        assert!(GitHubConfig::parse("https://github.com").is_err());
        assert!(GitHubConfig::parse("https://github.com/a/b/c").is_err());
        assert!(GitHubConfig::parse("not a url").is_err());
    }
}
