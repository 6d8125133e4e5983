//! Runner agent version resolution.
//!
//! When `GITHUB_RUNNER_VERSION` is not set, the dispatcher pins the latest
//! upstream release tag at startup. Major versions above 2 are rejected in
//! either case; the bootstrap script and JIT config format are only known to
//! work with the 2.x agent.

use std::time::Duration;

use anyhow::{bail, Context};
use semver::Version;
use serde::Deserialize;

const LATEST_RELEASE_URL: &str =
    "https://api.github.com/repos/actions/runner/releases/latest";
const SUPPORTED_MAJOR: u64 = 2;

#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// Fetch and validate the latest released runner version.
pub async fn latest_runner_version(github_token: Option<&str>) -> anyhow::Result<Version> {
    let client = reqwest::Client::builder()
        .user_agent("orka-actions-bridge")
        .timeout(Duration::from_secs(30))
        .build()?;

    let mut request = client
        .get(LATEST_RELEASE_URL)
        .header(reqwest::header::ACCEPT, "application/vnd.github+json");
    if let Some(token) = github_token {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .context("failed to fetch the latest runner release")?;
    if !response.status().is_success() {
        bail!(
            "failed to fetch latest release version: {}",
            response.status()
        );
    }

    let release: LatestRelease = response.json().await?;
    parse_runner_version(&release.tag_name)
}

/// Parse a release tag (`v2.321.0` or `2.321.0`) and enforce the supported
/// major version.
pub fn parse_runner_version(tag: &str) -> anyhow::Result<Version> {
    let version = Version::parse(tag.trim().trim_start_matches('v'))
        .with_context(|| format!("release tag {tag:?} is not a valid version"))?;

    if version.major > SUPPORTED_MAJOR {
        bail!(
            "runner version {version} is not supported. Please provide \
             GITHUB_RUNNER_VERSION=\"<your version>\" with a {SUPPORTED_MAJOR}.x release to proceed"
        );
    }

    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strips_tag_prefix() {
        assert_eq!(
            parse_runner_version("v2.321.0").unwrap(),
            Version::new(2, 321, 0)
        );
        assert_eq!(
            parse_runner_version("2.300.2").unwrap(),
            Version::new(2, 300, 2)
        );
    }

    #[test]
    fn test_parse_rejects_unsupported_major() {
        let err = parse_runner_version("v3.0.0").unwrap_err().to_string();
        assert!(err.contains("not supported"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_runner_version("latest").is_err());
    }
}
