//! Cluster controller (C6)
//!
//! Two-phase state machine: Vertical (more tunnels on the current bridge)
//! then Horizontal (more bridge instances) once the per-instance ceiling is
//! reached and utilisation stays high. Orchestrates C2 (new bridges) and C4
//! (new tunnels on them) together; never manages tunnel keys or cloud
//! resources itself.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster at MaxInstances ({max}); cannot add another bridge")]
    AtMaxInstances { max: u32 },
    #[error("zone list is empty; cannot place a new bridge")]
    NoZonesAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingPhase {
    Vertical,
    Horizontal,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub max_tunnels_per_instance: u32,
    pub vertical_threshold: f64,
    pub max_instances: u32,
    pub zones: Vec<String>,
}

/// One managed bridge instance's placement and current tunnel load.
#[derive(Debug, Clone)]
pub struct BridgeRecord {
    pub instance_id: String,
    pub zone: String,
    pub tunnel_count: u32,
}

/// Tracks the fleet of bridges and the current scaling phase. Placement and
/// phase transitions are computed here; the orchestrator/scaler perform the
/// actual C2/C4 calls this component decides on.
pub struct ClusterController {
    config: ClusterConfig,
    bridges: Vec<BridgeRecord>,
    phase: ScalingPhase,
    next_zone_round_robin: usize,
}

/// What the caller should do next, returned by `plan_capacity_increase`.
#[derive(Debug, Clone, PartialEq)]
pub enum CapacityPlan {
    /// Add one tunnel to the named bridge (vertical growth).
    AddTunnelToBridge { instance_id: String },
    /// Launch a new bridge in the given zone, with one initial tunnel.
    LaunchBridgeInZone { zone: String },
}

impl ClusterController {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            bridges: Vec::new(),
            phase: ScalingPhase::Vertical,
            next_zone_round_robin: 0,
        }
    }

    pub fn phase(&self) -> ScalingPhase {
        self.phase
    }

    pub fn register_bridge(&mut self, instance_id: String, zone: String, initial_tunnels: u32) {
        self.bridges.push(BridgeRecord {
            instance_id,
            zone,
            tunnel_count: initial_tunnels,
        });
    }

    /// Decide whether the next unit of capacity is another tunnel on an
    /// existing bridge or a brand-new bridge, given current utilisation.
    pub fn plan_capacity_increase(&mut self, utilisation: f64) -> Result<CapacityPlan, ClusterError> {
        if let Some(bridge) = self.bridge_with_headroom() {
            return Ok(CapacityPlan::AddTunnelToBridge {
                instance_id: bridge.instance_id.clone(),
            });
        }

        // Every known bridge is at MaxTunnelsPerInstance.
        if self.phase == ScalingPhase::Vertical && utilisation > self.config.vertical_threshold {
            self.phase = ScalingPhase::Horizontal;
        }

        if self.phase != ScalingPhase::Horizontal {
            // Still vertical but no headroom and utilisation hasn't crossed
            // the threshold yet: nothing productive to plan.
            return Err(ClusterError::NoZonesAvailable);
        }

        if self.bridges.len() as u32 >= self.config.max_instances {
            return Err(ClusterError::AtMaxInstances {
                max: self.config.max_instances,
            });
        }

        let zone = self.select_zone()?;
        Ok(CapacityPlan::LaunchBridgeInZone { zone })
    }

    fn bridge_with_headroom(&self) -> Option<&BridgeRecord> {
        self.bridges
            .iter()
            .find(|b| b.tunnel_count < self.config.max_tunnels_per_instance)
    }

    /// Minimise existing bridges per zone; round-robin breaks ties.
    fn select_zone(&mut self) -> Result<String, ClusterError> {
        if self.config.zones.is_empty() {
            return Err(ClusterError::NoZonesAvailable);
        }

        let mut counts: BTreeMap<&str, u32> = self.config.zones.iter().map(|z| (z.as_str(), 0)).collect();
        for bridge in &self.bridges {
            if let Some(count) = counts.get_mut(bridge.zone.as_str()) {
                *count += 1;
            }
        }

        let min_count = *counts.values().min().unwrap();
        let candidates: Vec<&str> = self
            .config
            .zones
            .iter()
            .map(String::as_str)
            .filter(|z| counts[z] == min_count)
            .collect();

        let chosen = candidates[self.next_zone_round_robin % candidates.len()];
        self.next_zone_round_robin += 1;
        Ok(chosen.to_string())
    }

    pub fn note_tunnel_added(&mut self, instance_id: &str) {
        if let Some(bridge) = self.bridges.iter_mut().find(|b| b.instance_id == instance_id) {
            bridge.tunnel_count += 1;
        }
    }

    pub fn note_tunnel_removed(&mut self, instance_id: &str) {
        if let Some(bridge) = self.bridges.iter_mut().find(|b| b.instance_id == instance_id) {
            bridge.tunnel_count = bridge.tunnel_count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig {
            max_tunnels_per_instance: 2,
            vertical_threshold: 0.8,
            max_instances: 4,
            zones: vec!["a".into(), "b".into()],
        }
    }

    #[test]
    fn stays_vertical_while_headroom_exists() {
        let mut c = ClusterController::new(config());
        c.register_bridge("i-1".into(), "a".into(), 1);
        let plan = c.plan_capacity_increase(0.5).unwrap();
        assert_eq!(plan, CapacityPlan::AddTunnelToBridge { instance_id: "i-1".into() });
        assert_eq!(c.phase(), ScalingPhase::Vertical);
    }

    #[test]
    fn transitions_to_horizontal_at_ceiling_with_high_utilisation() {
        let mut c = ClusterController::new(config());
        c.register_bridge("i-1".into(), "a".into(), 2);
        let plan = c.plan_capacity_increase(0.95).unwrap();
        assert_eq!(c.phase(), ScalingPhase::Horizontal);
        assert_eq!(plan, CapacityPlan::LaunchBridgeInZone { zone: "b".into() });
    }

    #[test]
    fn placement_minimises_bridges_per_zone_with_round_robin_tiebreak() {
        let mut c = ClusterController::new(config());
        c.register_bridge("i-1".into(), "a".into(), 2);
        c.register_bridge("i-2".into(), "b".into(), 2);
        c.plan_capacity_increase(0.95).unwrap(); // forces horizontal
        let plan1 = c.plan_capacity_increase(0.95).unwrap();
        c.register_bridge(
            match &plan1 {
                CapacityPlan::LaunchBridgeInZone { zone } => format!("i-{zone}"),
                _ => panic!("expected a new bridge"),
            },
            match &plan1 {
                CapacityPlan::LaunchBridgeInZone { zone } => zone.clone(),
                _ => unreachable!(),
            },
            1,
        );
        // both zones now have 2 bridges (1 full, 1 with headroom on the new one)
        let plan2 = c.plan_capacity_increase(0.95).unwrap();
        assert!(matches!(plan2, CapacityPlan::AddTunnelToBridge { .. }));
    }

    #[test]
    fn note_tunnel_removed_frees_headroom_again() {
        let mut c = ClusterController::new(config());
        c.register_bridge("i-1".into(), "a".into(), 2);
        c.note_tunnel_removed("i-1");
        let plan = c.plan_capacity_increase(0.5).unwrap();
        assert_eq!(plan, CapacityPlan::AddTunnelToBridge { instance_id: "i-1".into() });
    }

    #[test]
    fn refuses_past_max_instances() {
        let cfg = ClusterConfig {
            max_instances: 1,
            ..config()
        };
        let mut c = ClusterController::new(cfg);
        c.register_bridge("i-1".into(), "a".into(), 2);
        let err = c.plan_capacity_increase(0.95).unwrap_err();
        assert!(matches!(err, ClusterError::AtMaxInstances { max: 1 }));
    }
}
