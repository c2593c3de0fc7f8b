//! Deployment configuration, the durable deployment record, and the saved
//! profile helper that `--profile`/`create-profile` build on.
//!
//! Persisted state (profiles, deployment results, the emergency SSH key)
//! lives in a per-user directory and follows a load/save/default_path
//! shape.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A request to create a new VPC, or a reference to an existing one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetworkSpec {
    Existing {
        vpc_id: String,
        public_subnet_id: String,
        private_subnet_id: String,
    },
    Create {
        vpc_cidr: String,
        public_subnet_cidr: String,
        private_subnet_cidr: String,
    },
}

/// Input to the deployment orchestrator (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub network: NetworkSpec,
    pub region: String,
    /// Desired tunnel count; may be overridden by the probe engine when
    /// `auto_optimize` is set.
    pub tunnel_count: u32,
    pub mtu: u32,
    pub bridge_instance_class: String,
    pub allowed_source_cidr: String,
    pub auto_optimize: bool,
    pub deploy_reachability_target: bool,
    pub target_instance_class: Option<String>,
    pub base_port: u16,
    pub monthly_budget_usd: f64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            network: NetworkSpec::Create {
                vpc_cidr: "10.100.0.0/16".into(),
                public_subnet_cidr: "10.100.0.0/24".into(),
                private_subnet_cidr: "10.100.1.0/24".into(),
            },
            region: "us-east-1".into(),
            tunnel_count: 2,
            mtu: 1420,
            bridge_instance_class: "small".into(),
            allowed_source_cidr: "0.0.0.0/0".into(),
            auto_optimize: true,
            deploy_reachability_target: false,
            target_instance_class: None,
            base_port: 51820,
            monthly_budget_usd: 100.0,
        }
    }
}

/// Hourly/daily/monthly cost estimate for a deployment.
///
/// Hourly is derived from monthly; monthly is the catalogue's own supplied
/// figure rather than something computed (cloud billing months vary in
/// length), and daily is hourly * 24 for a quick mid-range figure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostEstimate {
    pub hourly_usd: f64,
    pub daily_usd: f64,
    pub monthly_usd: f64,
}

impl CostEstimate {
    pub fn from_monthly(monthly_usd: f64) -> Self {
        let hourly_usd = monthly_usd / (30.0 * 24.0);
        Self {
            hourly_usd,
            daily_usd: hourly_usd * 24.0,
            monthly_usd,
        }
    }
}

/// The durable, canonical per-session record produced by `up` and consumed
/// by `down`. If lost, teardown falls back to tag-based discovery (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub deployed_at: DateTime<Utc>,
    pub bridge_instance_id: String,
    pub bridge_public_address: String,
    pub bridge_private_address: String,
    pub security_group_id: String,
    pub keypair_name: String,
    pub listen_ports: Vec<u16>,
    pub cost_estimate: CostEstimate,
    pub client_private_key: String,
    pub client_public_key: String,
    pub server_public_key: String,
    pub target_instance_id: Option<String>,
    pub target_private_address: Option<String>,
    pub emergency_ssh_key_path: Option<PathBuf>,
}

/// A saved connection profile (collaborator of the out-of-scope profile
/// store; this repo only provides the load/save primitives `--profile`
/// and `create-profile` need).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub config: DeploymentConfig,
}

/// Base directory for all persisted state (profiles, deployment results,
/// the emergency SSH key). Only one deployment per user directory is
/// expected at a time; there is no lock file.
pub fn state_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        PathBuf::from(std::env::var("APPDATA").unwrap_or_else(|_| ".".into())).join("cloud-mole")
    }
    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".cloud-mole")
    }
}

fn ensure_state_dir() -> std::io::Result<PathBuf> {
    let dir = state_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

impl DeploymentResult {
    pub fn save(&self, timestamp_tag: &str) -> std::io::Result<PathBuf> {
        let dir = ensure_state_dir()?;
        let path = dir.join(format!("deployment-{timestamp_tag}.json"));
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Find the most recently deployed result in the state directory, if any.
    pub fn load_latest() -> std::io::Result<Option<Self>> {
        let dir = ensure_state_dir()?;
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("deployment-") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();
        match candidates.pop() {
            Some(path) => Ok(Some(Self::load(&path)?)),
            None => Ok(None),
        }
    }
}

impl Profile {
    pub fn path(name: &str) -> std::io::Result<PathBuf> {
        Ok(ensure_state_dir()?.join("profiles").join(format!("{name}.json")))
    }

    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::path(&self.name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn load(name: &str) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(Self::path(name)?)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Write the emergency SSH private key to the state directory with
/// owner-only file permissions.
pub fn write_emergency_key(deployment_tag: &str, pem_contents: &str) -> std::io::Result<PathBuf> {
    let dir = ensure_state_dir()?;
    let path = dir.join(format!("emergency-{deployment_tag}.pem"));
    std::fs::write(&path, pem_contents)?;
    set_owner_only(&path)?;
    Ok(path)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_estimate_derives_hourly_and_daily_from_monthly() {
        let est = CostEstimate::from_monthly(27.0);
        assert!((est.hourly_usd - 27.0 / 720.0).abs() < 1e-9);
        assert!((est.daily_usd - est.hourly_usd * 24.0).abs() < 1e-9);
        assert_eq!(est.monthly_usd, 27.0);
    }
}
