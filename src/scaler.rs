//! Dynamic scaler (C5)
//!
//! Single-threaded cooperative control loop. Every `scale_interval` it
//! samples C4's metrics and applies the hysteretic scale-up/scale-down
//! rules from spec.md §4.5; every 5s a lighter tick updates `ScalerState`.
//! `ScalerState` is owned exclusively by this component and written behind
//! a `parking_lot::RwLock`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cluster::{CapacityPlan, ClusterController};
use crate::tunnel::TunnelManager;

#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("scaler handed decision to the cluster controller: requested count {requested} exceeds MaxTunnelsPerInstance {max_per_instance}")]
    ExceedsPerInstanceCeiling { requested: u32, max_per_instance: u32 },
}

/// Tunable thresholds, supplied by configuration rather than measured.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub scale_interval: Duration,
    pub metric_tick: Duration,
    pub elephant_flow_threshold_bps: f64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    pub burst_detection_window: Duration,
    pub nominal_tunnel_ceiling_bps: f64,
    pub max_tunnels: u32,
    pub min_tunnels: u32,
    pub max_tunnels_per_instance: u32,
    /// This process's own bridge instance id, used to keep the cluster
    /// controller's per-bridge tunnel count in sync as this scaler adds or
    /// removes tunnels.
    pub own_bridge_id: String,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            scale_interval: Duration::from_secs(30),
            metric_tick: Duration::from_secs(5),
            elephant_flow_threshold_bps: 800_000_000.0,
            scale_up_threshold: 0.80,
            scale_down_threshold: 0.30,
            scale_up_cooldown: Duration::from_secs(2 * 60),
            scale_down_cooldown: Duration::from_secs(10 * 60),
            burst_detection_window: Duration::from_secs(5 * 60),
            nominal_tunnel_ceiling_bps: 1_000_000_000.0,
            max_tunnels: 8,
            min_tunnels: 1,
            max_tunnels_per_instance: 8,
            own_bridge_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BurstEvent {
    pub at: DateTime<Utc>,
    pub peak_bps: f64,
    pub tunnel_count: u32,
}

/// Per-window scaling state, owned by the scaler.
#[derive(Debug, Clone, Default)]
pub struct ScalerStateSnapshot {
    pub total_throughput_bps: f64,
    pub per_tunnel_bps: Vec<f64>,
    pub utilisation: f64,
    pub elephant_flow_count: u32,
    pub recent_bursts: Vec<BurstEvent>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub low_utilisation_since: Option<DateTime<Utc>>,
}

struct ScalerState {
    total_throughput_bps: f64,
    per_tunnel_bps: Vec<f64>,
    utilisation: f64,
    elephant_flow_count: u32,
    recent_bursts: VecDeque<BurstEvent>,
    last_action_at: Option<DateTime<Utc>>,
    low_utilisation_since: Option<DateTime<Utc>>,
}

impl Default for ScalerState {
    fn default() -> Self {
        Self {
            total_throughput_bps: 0.0,
            per_tunnel_bps: Vec::new(),
            utilisation: 0.0,
            elephant_flow_count: 0,
            recent_bursts: VecDeque::new(),
            last_action_at: None,
            low_utilisation_since: None,
        }
    }
}

/// A scaling decision the orchestrator/cluster controller must apply.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleAction {
    ScaleUp { to: u32, reason: String },
    ScaleDown { to: u32, reason: String },
    HandToCluster { requested: u32, reason: String },
    None,
}

/// Owns `ScalerState` and evaluates the decision rules. Does not itself
/// touch the tunnel manager; callers apply the returned `ScaleAction`.
pub struct Scaler {
    config: ScalerConfig,
    state: RwLock<ScalerState>,
}

impl Scaler {
    pub fn new(config: ScalerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ScalerState::default()),
        }
    }

    /// 5-second metric-collection tick: update throughput/utilisation and
    /// burst-event bookkeeping from a fresh set of per-tunnel samples.
    /// `Δbytes / Δtime` is computed by the caller (the tunnel manager's
    /// `PerformanceMonitor`); this tick only consumes already-derived rates
    /// per the Open Question decision in DESIGN NOTES §9.
    pub fn record_tick(&self, per_tunnel_bps: Vec<f64>, now: DateTime<Utc>) {
        let mut state = self.state.write();
        let total: f64 = per_tunnel_bps.iter().sum();
        let tunnel_count = per_tunnel_bps.len().max(1) as f64;
        let mean_per_tunnel = total / tunnel_count;

        state.total_throughput_bps = total;
        state.utilisation = (mean_per_tunnel / self.config.nominal_tunnel_ceiling_bps).clamp(0.0, 1.0);
        state.elephant_flow_count = per_tunnel_bps
            .iter()
            .filter(|&&bps| bps > self.config.elephant_flow_threshold_bps)
            .count() as u32;
        state.per_tunnel_bps = per_tunnel_bps;

        if mean_per_tunnel > 0.7 * self.config.nominal_tunnel_ceiling_bps {
            state.recent_bursts.push_back(BurstEvent {
                at: now,
                peak_bps: mean_per_tunnel,
                tunnel_count: state.per_tunnel_bps.len() as u32,
            });
        }
        let window = self.config.burst_detection_window;
        while let Some(front) = state.recent_bursts.front() {
            if now.signed_duration_since(front.at).to_std().unwrap_or(Duration::ZERO) > window {
                state.recent_bursts.pop_front();
            } else {
                break;
            }
        }

        if state.utilisation < self.config.scale_down_threshold {
            state.low_utilisation_since.get_or_insert(now);
        } else {
            state.low_utilisation_since = None;
        }
    }

    /// Evaluate the decision rules in order; first match wins. `current_count`
    /// is the tunnel manager's current active tunnel count.
    pub fn evaluate(&self, current_count: u32, now: DateTime<Utc>) -> ScaleAction {
        let state = self.state.read();
        let cfg = &self.config;

        let since_last_up = state
            .last_action_at
            .map(|t| now.signed_duration_since(t).to_std().unwrap_or(Duration::MAX))
            .unwrap_or(Duration::MAX);

        // Rule 1: elephant-flow (immediate, still respects scale-up cooldown).
        if state.elephant_flow_count > 0 && current_count < cfg.max_tunnels && since_last_up >= cfg.scale_up_cooldown {
            let target = (current_count + state.elephant_flow_count).min(cfg.max_tunnels);
            return self.scale_up_or_hand_off(target, format!("elephant flow on {} tunnel(s)", state.elephant_flow_count));
        }

        // Rule 2: utilisation scale-up.
        if state.utilisation > cfg.scale_up_threshold && current_count < cfg.max_tunnels && since_last_up >= cfg.scale_up_cooldown {
            return self.scale_up_or_hand_off(
                current_count + 1,
                format!("High utilisation: {:.0}%", state.utilisation * 100.0),
            );
        }

        // Rule 3: utilisation scale-down.
        if state.utilisation < cfg.scale_down_threshold && current_count > cfg.min_tunnels {
            if let Some(since) = state.low_utilisation_since {
                let held = now.signed_duration_since(since).to_std().unwrap_or(Duration::ZERO);
                let since_last_down = state
                    .last_action_at
                    .map(|t| now.signed_duration_since(t).to_std().unwrap_or(Duration::MAX))
                    .unwrap_or(Duration::MAX);
                if held >= cfg.scale_down_cooldown && since_last_down >= cfg.scale_down_cooldown {
                    return ScaleAction::ScaleDown {
                        to: current_count - 1,
                        reason: format!("Low utilisation: {:.0}% for {}s", state.utilisation * 100.0, held.as_secs()),
                    };
                }
            }
        }

        // Rule 4: burst rule.
        if state.recent_bursts.len() >= 3 && since_last_up >= cfg.scale_up_cooldown {
            let target = (current_count + 2).min(cfg.max_tunnels);
            return self.scale_up_or_hand_off(
                target,
                format!("{} burst events within window", state.recent_bursts.len()),
            );
        }

        ScaleAction::None
    }

    fn scale_up_or_hand_off(&self, target: u32, reason: String) -> ScaleAction {
        if target > self.config.max_tunnels_per_instance {
            ScaleAction::HandToCluster { requested: target, reason }
        } else {
            ScaleAction::ScaleUp { to: target, reason }
        }
    }

    /// Record that a scaling action was applied, resetting cooldown clocks.
    pub fn record_action_applied(&self, at: DateTime<Utc>) {
        let mut state = self.state.write();
        state.last_action_at = Some(at);
        state.low_utilisation_since = None;
    }

    pub fn snapshot(&self) -> ScalerStateSnapshot {
        let state = self.state.read();
        ScalerStateSnapshot {
            total_throughput_bps: state.total_throughput_bps,
            per_tunnel_bps: state.per_tunnel_bps.clone(),
            utilisation: state.utilisation,
            elephant_flow_count: state.elephant_flow_count,
            recent_bursts: state.recent_bursts.iter().copied().collect(),
            last_action_at: state.last_action_at,
            low_utilisation_since: state.low_utilisation_since,
        }
    }

    /// The long-lived scaler task (spec.md §4.7 "C5.Start", §5's "one
    /// long-lived task" concurrency point). Ticks `PerformanceMonitor`,
    /// folds samples into `ScalerState`, and applies the resulting decision.
    /// `HandToCluster` decisions drive `cluster` directly: a vertical plan
    /// (headroom on this bridge) is applied to `tunnels` in-process; a
    /// horizontal plan (launch a new bridge) is handed to `capacity_tx` for
    /// the orchestrator to act on, since provisioning a new bridge needs the
    /// cloud driver this loop doesn't own. Exits when `stop` observes
    /// `true`, honouring the cooperative stop signal required by §5.
    pub async fn run(
        self: Arc<Self>,
        tunnels: Arc<TunnelManager>,
        mut stop: tokio::sync::watch::Receiver<bool>,
        cluster: Arc<Mutex<ClusterController>>,
        capacity_tx: mpsc::UnboundedSender<CapacityPlan>,
    ) {
        let monitor = tunnels.monitor_performance();
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("scaler: stop signal received, exiting");
                        return;
                    }
                }
                samples = monitor.sample() => {
                    let now = Utc::now();
                    let per_tunnel_bps: Vec<f64> = samples.iter().map(|s| s.throughput_bps).collect();
                    self.record_tick(per_tunnel_bps, now);

                    let current_count = tunnels.get_active_tunnels().len() as u32;
                    let action = self.evaluate(current_count, now);
                    self.apply(&tunnels, &cluster, &capacity_tx, action, now).await;
                }
            }
        }
    }

    async fn apply(
        &self,
        tunnels: &TunnelManager,
        cluster: &Mutex<ClusterController>,
        capacity_tx: &mpsc::UnboundedSender<CapacityPlan>,
        action: ScaleAction,
        now: DateTime<Utc>,
    ) {
        match action {
            ScaleAction::ScaleUp { to, reason } => {
                info!(to, reason = %reason, "scaler: scaling up");
                match tunnels.add_tunnel() {
                    Ok(_) => {
                        cluster.lock().note_tunnel_added(&self.config.own_bridge_id);
                        self.record_action_applied(now);
                    }
                    Err(e) => warn!("scaler: scale-up rejected by tunnel manager: {e}"),
                }
            }
            ScaleAction::ScaleDown { to, reason } => {
                info!(to, reason = %reason, "scaler: scaling down");
                match tunnels.remove_tunnel() {
                    Ok(_) => {
                        cluster.lock().note_tunnel_removed(&self.config.own_bridge_id);
                        self.record_action_applied(now);
                    }
                    Err(e) => warn!("scaler: scale-down rejected by tunnel manager: {e}"),
                }
            }
            ScaleAction::HandToCluster { requested, reason } => {
                warn!(requested, reason = %reason, "scaler: handing decision to the cluster controller");
                let utilisation = self.snapshot().utilisation;
                match cluster.lock().plan_capacity_increase(utilisation) {
                    Ok(CapacityPlan::AddTunnelToBridge { instance_id }) => match tunnels.add_tunnel() {
                        Ok(_) => {
                            cluster.lock().note_tunnel_added(&instance_id);
                            self.record_action_applied(now);
                        }
                        Err(e) => warn!("scaler: cluster-directed add_tunnel rejected: {e}"),
                    },
                    Ok(plan @ CapacityPlan::LaunchBridgeInZone { .. }) => {
                        if capacity_tx.send(plan).is_err() {
                            warn!("scaler: no consumer for the horizontal capacity plan");
                        }
                    }
                    Err(e) => warn!("scaler: cluster controller declined to plan capacity: {e}"),
                }
            }
            ScaleAction::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterConfig, ScalingPhase};
    use crate::tunnel::TunnelManagerParams;
    use chrono::Duration as ChronoDuration;
    use ipnetwork::Ipv4Network;
    use std::str::FromStr;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_tunnel_manager(max: u32) -> TunnelManager {
        TunnelManager::new(
            TunnelManagerParams {
                overlay_base: Ipv4Network::from_str("10.200.0.0/16").unwrap(),
                base_port: 51820,
                bridge_public_address: "203.0.113.10".into(),
                server_public_key: "SERVERPUBKEYSERVERPUBKEYSERVERPUBKEY=".into(),
                private_subnet_cidr: "10.0.1.0/24".into(),
                mtu: 1420,
                max_tunnels: max,
                min_tunnels: 1,
                reserved_cores: 1,
                total_cores: 5,
                config_dir: std::env::temp_dir().join("cloud-mole-test-scaler-tunnels"),
            },
            crate::platform::get_platform(),
        )
    }

    #[test]
    fn scenario_six_high_utilisation_scales_up_by_one() {
        let scaler = Scaler::new(ScalerConfig::default());
        let t0 = now();
        scaler.record_action_applied(t0 - ChronoDuration::minutes(3));
        scaler.record_tick(vec![880_000_000.0; 4], t0);
        let action = scaler.evaluate(4, t0);
        assert_eq!(
            action,
            ScaleAction::ScaleUp {
                to: 5,
                reason: "High utilisation: 88%".to_string()
            }
        );
    }

    #[test]
    fn scale_up_never_within_cooldown() {
        let scaler = Scaler::new(ScalerConfig::default());
        let t0 = now();
        scaler.record_action_applied(t0 - ChronoDuration::seconds(30));
        scaler.record_tick(vec![950_000_000.0; 4], t0);
        assert_eq!(scaler.evaluate(4, t0), ScaleAction::None);
    }

    #[test]
    fn scale_down_requires_full_cooldown_of_low_utilisation() {
        let cfg = ScalerConfig {
            scale_down_cooldown: Duration::from_secs(60),
            ..ScalerConfig::default()
        };
        let scaler = Scaler::new(cfg);
        let t0 = now();
        scaler.record_tick(vec![10_000_000.0; 2], t0);
        // Transient dip: not yet held for the cooldown.
        assert_eq!(scaler.evaluate(2, t0), ScaleAction::None);

        let t1 = t0 + ChronoDuration::seconds(61);
        scaler.record_tick(vec![10_000_000.0; 2], t1);
        assert_eq!(
            scaler.evaluate(2, t1),
            ScaleAction::ScaleDown {
                to: 1,
                reason: "Low utilisation: 1% for 61s".to_string()
            }
        );
    }

    #[test]
    fn elephant_flow_hands_off_past_per_instance_ceiling() {
        let cfg = ScalerConfig {
            max_tunnels_per_instance: 4,
            max_tunnels: 16,
            ..ScalerConfig::default()
        };
        let scaler = Scaler::new(cfg);
        let t0 = now();
        scaler.record_tick(vec![900_000_000.0, 900_000_000.0, 900_000_000.0, 900_000_000.0], t0);
        let action = scaler.evaluate(4, t0);
        assert!(matches!(action, ScaleAction::HandToCluster { .. }));
    }

    #[tokio::test]
    async fn hand_to_cluster_adds_locally_when_the_bridge_has_headroom() {
        let scaler = Scaler::new(ScalerConfig {
            own_bridge_id: "i-1".into(),
            max_tunnels_per_instance: 4,
            max_tunnels: 16,
            ..ScalerConfig::default()
        });
        let tunnels = test_tunnel_manager(16);
        tunnels.create_tunnels(2).unwrap();
        let cluster = Mutex::new(ClusterController::new(ClusterConfig {
            max_tunnels_per_instance: 4,
            vertical_threshold: 0.8,
            max_instances: 2,
            zones: vec!["a".into()],
        }));
        cluster.lock().register_bridge("i-1".into(), "a".into(), 2);
        let (tx, _rx) = mpsc::unbounded_channel();

        scaler
            .apply(
                &tunnels,
                &cluster,
                &tx,
                ScaleAction::HandToCluster { requested: 5, reason: "test".into() },
                now(),
            )
            .await;

        assert_eq!(tunnels.get_active_tunnels().len(), 3);
    }

    #[tokio::test]
    async fn hand_to_cluster_requests_a_new_bridge_when_saturated() {
        let scaler = Scaler::new(ScalerConfig {
            own_bridge_id: "i-1".into(),
            max_tunnels_per_instance: 2,
            max_tunnels: 16,
            ..ScalerConfig::default()
        });
        let tunnels = test_tunnel_manager(16);
        tunnels.create_tunnels(2).unwrap();
        let cluster = Mutex::new(ClusterController::new(ClusterConfig {
            max_tunnels_per_instance: 2,
            vertical_threshold: 0.5,
            max_instances: 4,
            zones: vec!["a".into(), "b".into()],
        }));
        cluster.lock().register_bridge("i-1".into(), "a".into(), 2);
        scaler.record_tick(vec![900_000_000.0; 2], now());
        let (tx, mut rx) = mpsc::unbounded_channel();

        scaler
            .apply(
                &tunnels,
                &cluster,
                &tx,
                ScaleAction::HandToCluster { requested: 5, reason: "test".into() },
                now(),
            )
            .await;

        let plan = rx.try_recv().expect("expected a capacity plan on the channel");
        assert!(matches!(plan, CapacityPlan::LaunchBridgeInZone { zone } if zone == "b"));
        assert_eq!(cluster.lock().phase(), ScalingPhase::Horizontal);
    }

    #[test]
    fn burst_rule_fires_after_three_events_in_window() {
        let scaler = Scaler::new(ScalerConfig::default());
        let t0 = now();
        for i in 0..3 {
            scaler.record_tick(vec![750_000_000.0], t0 + ChronoDuration::seconds(i * 5));
        }
        let action = scaler.evaluate(2, t0 + ChronoDuration::seconds(10));
        assert!(matches!(action, ScaleAction::ScaleUp { to: 4, .. }));
    }
}
