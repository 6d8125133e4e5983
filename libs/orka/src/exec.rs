//! CLI process execution.
//!
//! The cluster is driven through the `orka3` CLI. Output handling mirrors a
//! combined stdout+stderr capture: a non-zero exit surfaces the merged
//! output so operators see exactly what the CLI printed.

use serde::de::DeserializeOwned;
use tokio::process::Command;

use crate::error::OrkaError;

/// Run a command and return its merged, trimmed output.
pub(crate) async fn exec_string(program: &str, args: &[&str]) -> Result<String, OrkaError> {
    let rendered = format!("{program} {}", args.join(" "));

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| OrkaError::Command {
            command: rendered.clone(),
            output: e.to_string(),
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = combined.trim().to_string();

    if !output.status.success() {
        return Err(OrkaError::Command {
            command: rendered,
            output: combined,
        });
    }

    Ok(combined)
}

/// Run a command and decode its stdout as JSON.
pub(crate) async fn exec_json<T: DeserializeOwned>(
    program: &str,
    args: &[&str],
) -> Result<T, OrkaError> {
    let rendered = format!("{program} {}", args.join(" "));

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| OrkaError::Command {
            command: rendered.clone(),
            output: e.to_string(),
        })?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(OrkaError::Command {
            command: rendered,
            output: combined.trim().to_string(),
        });
    }

    Ok(serde_json::from_slice(&output.stdout)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_string_captures_output() {
        let out = exec_string("echo", &["hello"]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_exec_string_missing_binary() {
        let err = exec_string("definitely-not-a-real-binary-1b2c", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OrkaError::Command { .. }));
    }

    #[tokio::test]
    async fn test_exec_json_decodes_stdout() {
        let value: Vec<i64> = exec_json("echo", &["[1, 2, 3]"]).await.unwrap();
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_exec_json_rejects_non_json() {
        let result: Result<Vec<i64>, _> = exec_json("echo", &["not json"]).await;
        assert!(matches!(result, Err(OrkaError::Decode(_))));
    }
}
