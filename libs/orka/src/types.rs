//! Response models for the cluster CLI and REST surface.

use serde::Deserialize;

/// Lifecycle phase of a deployed VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum VmPhase {
    /// Deployed and running.
    Running,
    /// The backing instance is not running and reports errors.
    Failed,
    /// Still deploying.
    Pending,
}

/// One entry of the JSON array `orka3 vm deploy -o json` prints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDeployResponse {
    pub name: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ssh: Option<u16>,
    #[serde(default)]
    pub vnc: Option<u16>,
    #[serde(default)]
    pub screenshare: Option<u16>,
    pub status: VmPhase,
    #[serde(default)]
    pub port_warnings: Option<String>,
}

/// Subset of `GET /api/v1/cluster-info` used by the reachability probe.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default)]
    pub app_client_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_response_decoding() {
        let json = r#"[{
            "name": "macos-pool-jk4tq",
            "node": "node-2",
            "memory": "12G",
            "ip": "10.221.188.100",
            "ssh": 8822,
            "vnc": 5999,
            "status": "Running",
            "portWarnings": ""
        }]"#;

        let parsed: Vec<VmDeployResponse> = serde_json::from_str(json).unwrap();
        let vm = &parsed[0];
        assert_eq!(vm.name, "macos-pool-jk4tq");
        assert_eq!(vm.ssh, Some(8822));
        assert_eq!(vm.status, VmPhase::Running);
    }

    #[test]
    fn test_deploy_response_without_ports() {
        let json = r#"[{"name": "vm-a", "ip": "10.0.0.1", "status": "Pending"}]"#;
        let parsed: Vec<VmDeployResponse> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed[0].ssh, None);
        assert_eq!(parsed[0].status, VmPhase::Pending);
    }
}
