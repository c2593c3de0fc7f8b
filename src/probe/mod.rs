//! Probe engine (C3)
//!
//! Runs the six phases from spec.md §4.3 in order. Each phase either
//! completes or records a per-phase error; a partial `ProbeResult` is still
//! returned so the orchestrator can fall back to configured defaults rather
//! than failing the whole deployment because one measurement step broke.

pub mod bandwidth;
pub mod classify;
pub mod mtu;

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

pub use classify::Bottleneck;

const DEFAULT_PHASE_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("phase '{phase}' exceeded its time budget")]
    PhaseTimeout { phase: &'static str },
    #[error("phase '{phase}' failed: {detail}")]
    PhaseFailed { phase: &'static str, detail: String },
}

/// The local egress interface's static properties (phase 1).
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub link_speed_bps: f64,
    pub current_mtu: u32,
    pub driver: String,
    pub multi_queue: bool,
    pub offload_flags: Vec<String>,
}

/// The immutable record produced by the probe engine (phase 6's output),
/// per the Data Model in spec.md §3.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub optimal_mtu: u32,
    pub baseline_bps: f64,
    pub burst_bps: f64,
    pub optimal_stream_count: u32,
    pub bottleneck: Bottleneck,
    pub region_rtt_ms: BTreeMap<String, RttSample>,
    pub recommendations: Vec<String>,
    pub phase_errors: Vec<ProbeError>,
}

#[derive(Debug, Clone, Copy)]
pub struct RttSample {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub loss_fraction: f64,
}

/// Injected collaborators so the orchestration logic is testable without
/// real interfaces, ICMP sockets, or network I/O. The no-tooling fallback
/// (returning `None`/empty) exercises the exact same code path as a live
/// environment missing the underlying measurement helper.
pub struct ProbeInputs<'a> {
    pub interface: Box<dyn Fn() -> Option<InterfaceInfo> + 'a>,
    pub mtu_probe: Box<dyn FnMut(u32) -> bool + 'a>,
    pub region_rtt: Box<dyn Fn(&str) -> Option<RttSample> + 'a>,
    pub bandwidth_measure: Box<dyn FnMut(u32) -> Option<f64> + 'a>,
    pub regions: Vec<String>,
    pub include_jumbo: bool,
    pub max_tunnels: u32,
    pub phase_budget: Duration,
}

impl<'a> Default for ProbeInputs<'a> {
    fn default() -> Self {
        Self {
            interface: Box::new(|| None),
            mtu_probe: Box::new(|_| true),
            region_rtt: Box::new(|_| None),
            bandwidth_measure: Box::new(|_| None),
            regions: Vec::new(),
            include_jumbo: false,
            max_tunnels: 8,
            phase_budget: DEFAULT_PHASE_BUDGET,
        }
    }
}

/// Run all six phases in order, recording per-phase errors and still
/// returning a usable (possibly partial) result.
pub fn run(mut inputs: ProbeInputs<'_>) -> ProbeResult {
    let mut phase_errors = Vec::new();

    // Phase 1: local interface discovery.
    let interface = (inputs.interface)();
    let link_speed_bps = interface.as_ref().map(|i| i.link_speed_bps).unwrap_or(1_000_000_000.0);
    if interface.is_none() {
        phase_errors.push(ProbeError::PhaseFailed {
            phase: "local-interface-discovery",
            detail: "no interface info available; using 1 Gbps reference".into(),
        });
    }

    // Phase 2: MTU sweep.
    let mtu_probes = mtu::sweep(inputs.include_jumbo, link_speed_bps, &mut inputs.mtu_probe);
    let best_mtu = mtu::best(&mtu_probes);
    if best_mtu.is_none() {
        phase_errors.push(ProbeError::PhaseFailed {
            phase: "mtu-sweep",
            detail: "every candidate fragmented".into(),
        });
    }
    let optimal_mtu = best_mtu.map(|p| p.mtu).unwrap_or(1500);

    // Phase 3: regional RTT.
    let mut region_rtt_ms = BTreeMap::new();
    for region in &inputs.regions {
        match (inputs.region_rtt)(region) {
            Some(sample) => {
                region_rtt_ms.insert(region.clone(), sample);
            }
            None => phase_errors.push(ProbeError::PhaseFailed {
                phase: "regional-rtt",
                detail: format!("no RTT sample for region {region}"),
            }),
        }
    }

    // Phase 4: bandwidth sweep.
    let baseline_reference = best_mtu
        .map(|p| p.throughput_bps)
        .filter(|v| *v > 0.0)
        .unwrap_or(link_speed_bps / 10.0);
    let bandwidth_samples = bandwidth::sweep(baseline_reference, &mut inputs.bandwidth_measure);
    let (baseline_bps, burst_bps) = bandwidth::baseline_and_burst(&bandwidth_samples);
    let optimal_stream_count = bandwidth_samples
        .iter()
        .max_by(|a, b| a.throughput_bps.partial_cmp(&b.throughput_bps).unwrap())
        .map(|s| s.streams)
        .unwrap_or(1);

    // Phase 5: bottleneck classification.
    let bottleneck = classify::classify(link_speed_bps, baseline_bps, burst_bps);

    // Phase 6: recommendations.
    let max_rtt = region_rtt_ms.values().map(|r| r.max_ms).fold(0.0_f64, f64::max);
    let recommendations = classify::recommendations(
        optimal_mtu,
        baseline_bps,
        burst_bps,
        bottleneck,
        max_rtt,
        inputs.max_tunnels,
    );

    ProbeResult {
        optimal_mtu,
        baseline_bps,
        burst_bps,
        optimal_stream_count,
        bottleneck,
        region_rtt_ms,
        recommendations,
        phase_errors,
    }
}

/// Recommended tunnel count derived from a completed probe result:
/// `floor(0.8 * burst/baseline)` clamped to `[1, max_tunnels]`.
pub fn recommended_tunnel_count(result: &ProbeResult, max_tunnels: u32) -> u32 {
    if result.baseline_bps <= 0.0 {
        return 1;
    }
    let ratio = result.burst_bps / result.baseline_bps;
    ((0.8 * ratio).floor() as i64).clamp(1, max_tunnels as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_degrades_gracefully_with_no_tooling() {
        let result = run(ProbeInputs::default());
        assert!(result.optimal_mtu >= 1200);
        assert!(!result.recommendations.is_empty());
    }

    #[test]
    fn mtu_sweep_failure_is_recorded_but_not_fatal() {
        let inputs = ProbeInputs {
            mtu_probe: Box::new(|_| false),
            ..ProbeInputs::default()
        };
        let result = run(inputs);
        assert!(result.phase_errors.iter().any(|e| matches!(
            e,
            ProbeError::PhaseFailed { phase: "mtu-sweep", .. }
        )));
        assert_eq!(result.optimal_mtu, 1500, "falls back to the de-facto default");
    }

    #[test]
    fn recommended_tunnel_count_is_clamped() {
        let result = ProbeResult {
            optimal_mtu: 1500,
            baseline_bps: 1_000_000.0,
            burst_bps: 1_000_000_000.0,
            optimal_stream_count: 8,
            bottleneck: Bottleneck::Cloud,
            region_rtt_ms: BTreeMap::new(),
            recommendations: Vec::new(),
            phase_errors: Vec::new(),
        };
        assert_eq!(recommended_tunnel_count(&result, 8), 8);
    }
}
