//! Deployment orchestrator (C7)
//!
//! The top-level `up`/`down` state machines. `up` runs the probe, calls the
//! cloud driver in sequence, brings up tunnels, and starts the scaler as a
//! long-lived task (`ScalerHandle`); any failure after a resource is created
//! enters a reverse-order cleanup path that only touches resources created
//! in this session. `down` stops the scaler, then replays cleanup from a
//! `DeploymentResult`, falling back to tag-based discovery when one isn't
//! available.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::cloud::{self, sg::SecurityGroupSpec, CloudDriver, CloudError};
use crate::cluster::{CapacityPlan, ClusterConfig, ClusterController};
use crate::config::{self, CostEstimate, DeploymentConfig, DeploymentResult, NetworkSpec};
use crate::crypto;
use crate::error::CryptoError;
use crate::platform::get_platform;
use crate::probe::{self, ProbeInputs};
use crate::scaler::{Scaler, ScalerConfig};
use crate::tunnel::{TunnelManager, TunnelManagerParams};

/// Handle to the scaler task started as the last step of `up`'s state
/// machine (spec.md §4.7 "C5.Start"). Dropping or sending `true` on `stop`
/// tells the long-lived scaler loop to exit; `scaler` remains queryable
/// (e.g. `snapshot()`) after the loop stops. `cluster` is the same
/// controller the scaler drives on `HandToCluster`; `capacity_task` drains
/// the horizontal-scaling requests the scaler can't act on itself.
pub struct ScalerHandle {
    pub scaler: Arc<Scaler>,
    pub stop: tokio::sync::watch::Sender<bool>,
    pub task: tokio::task::JoinHandle<()>,
    pub cluster: Arc<Mutex<ClusterController>>,
    pub capacity_task: tokio::task::JoinHandle<()>,
}

impl ScalerHandle {
    /// Signal the scaler loop to exit and wait for it and the capacity-plan
    /// consumer to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
        let _ = self.capacity_task.await;
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Tunnel(#[from] crate::tunnel::TunnelError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no deployment record found and tag-based discovery found nothing to tear down")]
    NothingToTearDown,
}

/// Resources created so far in this session, used to drive reverse-order
/// rollback on a mid-deployment failure.
#[derive(Default)]
struct RollbackLedger {
    security_group_id: Option<String>,
    keypair_name: Option<String>,
    bridge_instance_id: Option<String>,
    target_instance_id: Option<String>,
}

impl RollbackLedger {
    /// Undo everything recorded, in reverse order of creation. Best-effort:
    /// logs failures rather than stopping, since a partially-rolled-back
    /// deployment is still strictly better than an un-rolled-back one.
    async fn unwind(&self, cloud: &CloudDriver) {
        if let Some(id) = &self.target_instance_id {
            if let Err(e) = cloud.terminate_instance(id).await {
                warn!("rollback: failed to terminate target {id}: {e}");
            }
        }
        if let Some(id) = &self.bridge_instance_id {
            if let Err(e) = cloud.terminate_instance(id).await {
                warn!("rollback: failed to terminate bridge {id}: {e}");
            }
        }
        // Keypairs and security groups are left in place intentionally:
        // they are named deterministically from stable inputs, so a retried
        // `up` reuses them via the idempotency cache rather than orphaning
        // and recreating. Only instances are torn down on rollback.
        let _ = (&self.security_group_id, &self.keypair_name);
    }
}

/// Run the `up` state machine end-to-end.
pub async fn up(
    config: &DeploymentConfig,
) -> Result<(Arc<TunnelManager>, ScalerHandle, DeploymentResult), OrchestratorError> {
    validate(config)?;

    let cloud = CloudDriver::new(&config.region).await;
    let mut ledger = RollbackLedger::default();

    let result = run_up(config, &cloud, &mut ledger).await;
    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            ledger.unwind(&cloud).await;
            Err(e)
        }
    }
}

async fn run_up(
    config: &DeploymentConfig,
    cloud: &CloudDriver,
    ledger: &mut RollbackLedger,
) -> Result<(Arc<TunnelManager>, ScalerHandle, DeploymentResult), OrchestratorError> {
    let deployed_at = chrono::Utc::now();

    let network = cloud.ensure_network(&config.network).await?;
    info!(vpc_id = %network.vpc_id, "network ready");

    let mut tunnel_count = config.tunnel_count;
    let mut mtu = config.mtu;
    if config.auto_optimize {
        let probe_result = probe::run(ProbeInputs {
            max_tunnels: tunnel_count.max(8),
            ..ProbeInputs::default()
        });
        tunnel_count = probe::recommended_tunnel_count(&probe_result, tunnel_count.max(8));
        mtu = probe_result.optimal_mtu;
        info!(tunnel_count, mtu, "auto-optimize overrode deployment defaults");
    }

    let overlay_cidr = "10.200.0.0/16".to_string();
    let sg_spec = SecurityGroupSpec {
        base_port: config.base_port,
        tunnel_count,
        allowed_source_cidr: config.allowed_source_cidr.clone(),
        vpc_cidr: network_cidr(&config.network),
        overlay_cidr: overlay_cidr.clone(),
        deploy_reachability_target: config.deploy_reachability_target,
    };
    let security_group_id = cloud.ensure_security_group(&network.vpc_id, &sg_spec).await?;
    ledger.security_group_id = Some(security_group_id.clone());

    let role_name = cloud.ensure_instance_role().await?;

    // Emergency SSH access (spec.md §6) is a distinct identity from the
    // per-tunnel X25519 keys below — EC2's ImportKeyPair expects a real SSH
    // public key, not a WireGuard key.
    let ssh_keys = crypto::generate_ssh_keypair()?;
    let keypair_name = cloud.ensure_keypair(Some(ssh_keys.public_key_openssh.as_bytes())).await?;
    ledger.keypair_name = Some(keypair_name.clone());

    let deployment_tag = deployed_at.format("%Y%m%dT%H%M%SZ").to_string();
    let emergency_ssh_key_path = config::write_emergency_key(&deployment_tag, &ssh_keys.private_key_pem)?;

    // One fresh X25519 keypair per tunnel id (spec.md §4.1), generated up
    // front so the same N public keys are baked into the bridge's bootstrap
    // script and threaded into the tunnel manager below — otherwise the
    // bridge and the client would never agree on a peer key.
    let tunnel_keys: Vec<crypto::KeyPair> = (0..tunnel_count)
        .map(|_| crypto::generate_keypair())
        .collect::<Result<_, _>>()?;

    let listen_ports: Vec<u16> = (0..tunnel_count).map(|i| config.base_port + i as u16).collect();
    let bootstrap_spec = cloud::bootstrap::BootstrapSpec {
        overlay_cidr: overlay_cidr.clone(),
        listen_ports: listen_ports.clone(),
        client_public_keys: tunnel_keys.iter().map(|k| k.public_key.clone()).collect(),
        private_subnet_cidr: private_subnet_cidr(&config.network),
        instance_id_tag_key: cloud::bootstrap::BootstrapSpec::TAG_KEY,
    };
    let user_data = cloud::bootstrap::render_user_data(&bootstrap_spec);

    let bridge_instance_id = cloud
        .launch_bridge(
            &config.bridge_instance_class,
            &security_group_id,
            &role_name,
            &public_subnet_id(&config.network, &network),
            &user_data,
        )
        .await?;
    ledger.bridge_instance_id = Some(bridge_instance_id.clone());

    cloud.wait_running(&bridge_instance_id).await?;
    let (bridge_public_address, bridge_private_address) = cloud.describe_ips(&bridge_instance_id).await?;
    cloud.disable_src_dst_check(&bridge_instance_id).await?;

    let server_public_key = cloud.poll_server_public_key(&bridge_instance_id).await?;

    let (target_instance_id, target_private_address) = if config.deploy_reachability_target {
        let (id, addr) = cloud
            .launch_target(
                "nano",
                &security_group_id,
                &role_name,
                &private_subnet_id(&config.network, &network),
            )
            .await?;
        ledger.target_instance_id = Some(id.clone());
        cloud
            .add_route_to_bridge(&network.route_table_id, &overlay_cidr, &bridge_instance_id)
            .await?;
        (Some(id), Some(addr))
    } else {
        (None, None)
    };

    let max_tunnels = tunnel_count.max(8);
    let params = TunnelManagerParams {
        overlay_base: overlay_cidr.parse().map_err(|_| OrchestratorError::Input("bad overlay CIDR".into()))?,
        base_port: config.base_port,
        bridge_public_address: bridge_public_address.clone(),
        server_public_key: server_public_key.clone(),
        private_subnet_cidr: private_subnet_cidr(&config.network),
        mtu,
        max_tunnels,
        min_tunnels: 1,
        reserved_cores: 1,
        total_cores: num_cpus_best_effort(),
        config_dir: crate::config::state_dir().join("tunnels"),
    };
    let tunnels = Arc::new(TunnelManager::new(params, get_platform()));
    let client_private_key = tunnel_keys[0].private_key.clone();
    let client_public_key = tunnel_keys[0].public_key.clone();
    tunnels.create_tunnels_with_keys(tunnel_keys)?;
    tunnels.configure_ecmp()?;

    // Cluster controller (C6): registered with this deployment's own bridge
    // so the scaler can drive it live once MaxTunnelsPerInstance is reached
    // (spec.md §8's Vertical→Horizontal boundary behaviour).
    let zones: Vec<String> = ["a", "b", "c"].iter().map(|z| format!("{}{}", config.region, z)).collect();
    let cluster = Arc::new(Mutex::new(ClusterController::new(ClusterConfig {
        max_tunnels_per_instance: max_tunnels,
        vertical_threshold: 0.85,
        max_instances: 4,
        zones,
    })));
    cluster
        .lock()
        .register_bridge(bridge_instance_id.clone(), format!("{}a", config.region), tunnel_count);

    let scaler = Arc::new(Scaler::new(ScalerConfig {
        own_bridge_id: bridge_instance_id.clone(),
        max_tunnels,
        min_tunnels: 1,
        max_tunnels_per_instance: max_tunnels,
        ..ScalerConfig::default()
    }));
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let (capacity_tx, mut capacity_rx) = tokio::sync::mpsc::unbounded_channel::<CapacityPlan>();
    let task = tokio::spawn(Arc::clone(&scaler).run(Arc::clone(&tunnels), stop_rx, Arc::clone(&cluster), capacity_tx));
    let capacity_task = tokio::spawn(async move {
        while let Some(plan) = capacity_rx.recv().await {
            match plan {
                CapacityPlan::LaunchBridgeInZone { zone } => {
                    warn!(
                        zone,
                        "cluster controller requested a new bridge instance; horizontal \
                         provisioning across bridges is surfaced here but not yet automated \
                         end-to-end, needs operator follow-up"
                    );
                }
                CapacityPlan::AddTunnelToBridge { instance_id } => {
                    warn!(instance_id, "cluster controller targeted a bridge this process does not own");
                }
            }
        }
    });
    let scaler_handle = ScalerHandle {
        scaler,
        stop: stop_tx,
        task,
        cluster,
        capacity_task,
    };
    info!("scaler started");

    let cost_estimate = CostEstimate::from_monthly(
        crate::cloud::catalogue::by_id(&config.bridge_instance_class)
            .map(|c| c.monthly_usd)
            .unwrap_or(0.0),
    );

    let result = DeploymentResult {
        deployed_at,
        bridge_instance_id,
        bridge_public_address,
        bridge_private_address,
        security_group_id,
        keypair_name,
        listen_ports,
        cost_estimate,
        client_private_key,
        client_public_key,
        server_public_key,
        target_instance_id,
        target_private_address,
        emergency_ssh_key_path: Some(emergency_ssh_key_path),
    };

    Ok((tunnels, scaler_handle, result))
}

/// Tear down a deployment. Cleans local tunnel interfaces first, then the
/// cloud side, mirroring spec.md §4.7. Falls back to tag-based discovery
/// when `result` is `None`.
pub async fn down(
    region: &str,
    tunnels: Option<&TunnelManager>,
    scaler: Option<ScalerHandle>,
    result: Option<&DeploymentResult>,
) -> Result<(), OrchestratorError> {
    if let Some(scaler) = scaler {
        scaler.stop().await;
    }

    if let Some(tunnels) = tunnels {
        while tunnels.remove_tunnel().is_ok() {}
    }

    let cloud = CloudDriver::new(region).await;

    match result {
        Some(result) => {
            cloud.terminate_instance(&result.bridge_instance_id).await?;
            if let Some(target) = &result.target_instance_id {
                cloud.terminate_instance(target).await?;
            }
            Ok(())
        }
        None => {
            let terminated = cloud.terminate_all().await?;
            if terminated == 0 {
                return Err(OrchestratorError::NothingToTearDown);
            }
            Ok(())
        }
    }
}

fn validate(config: &DeploymentConfig) -> Result<(), OrchestratorError> {
    if config.tunnel_count == 0 {
        return Err(OrchestratorError::Input("tunnel_count must be >= 1".into()));
    }
    if let NetworkSpec::Create { vpc_cidr, .. } = &config.network {
        if vpc_cidr.parse::<ipnetwork::Ipv4Network>().is_err() {
            return Err(OrchestratorError::Input(format!("invalid VPC CIDR: {vpc_cidr}")));
        }
    }
    Ok(())
}

fn network_cidr(spec: &NetworkSpec) -> String {
    match spec {
        NetworkSpec::Create { vpc_cidr, .. } => vpc_cidr.clone(),
        NetworkSpec::Existing { .. } => "0.0.0.0/0".to_string(),
    }
}

fn private_subnet_cidr(spec: &NetworkSpec) -> String {
    match spec {
        NetworkSpec::Create { private_subnet_cidr, .. } => private_subnet_cidr.clone(),
        NetworkSpec::Existing { .. } => "10.0.1.0/24".to_string(),
    }
}

fn public_subnet_id(spec: &NetworkSpec, network: &cloud::NetworkIds) -> String {
    match spec {
        NetworkSpec::Existing { public_subnet_id, .. } => public_subnet_id.clone(),
        NetworkSpec::Create { .. } => network.public_subnet_id.clone(),
    }
}

fn private_subnet_id(spec: &NetworkSpec, network: &cloud::NetworkIds) -> String {
    match spec {
        NetworkSpec::Existing { private_subnet_id, .. } => private_subnet_id.clone(),
        NetworkSpec::Create { .. } => network.private_subnet_id.clone(),
    }
}

fn num_cpus_best_effort() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_tunnels() {
        let mut config = DeploymentConfig::default();
        config.tunnel_count = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_malformed_cidr() {
        let config = DeploymentConfig {
            network: NetworkSpec::Create {
                vpc_cidr: "not-a-cidr".into(),
                public_subnet_cidr: "10.0.0.0/24".into(),
                private_subnet_cidr: "10.0.1.0/24".into(),
            },
            ..DeploymentConfig::default()
        };
        assert!(validate(&config).is_err());
    }

    #[tokio::test]
    async fn up_then_down_round_trip_leaves_nothing_tagged() {
        let config = DeploymentConfig {
            auto_optimize: false,
            ..DeploymentConfig::default()
        };
        let (tunnels, scaler, result) = up(&config).await.expect("stubbed up should succeed");
        assert_eq!(tunnels.get_active_tunnels().len(), config.tunnel_count as usize);

        down(&config.region, Some(&tunnels), Some(scaler), Some(&result))
            .await
            .expect("down should succeed");
        assert!(tunnels.get_active_tunnels().is_empty());
    }
}
