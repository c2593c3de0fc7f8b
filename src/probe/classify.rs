//! Bottleneck classification.
//!
//! Partitions (local link speed, baseline, burst) space into exactly one
//! of {local, campus, internet, cloud}, per spec.md §4.3.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bottleneck {
    Local,
    Campus,
    Internet,
    Cloud,
}

impl fmt::Display for Bottleneck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Bottleneck::Local => "local",
            Bottleneck::Campus => "campus",
            Bottleneck::Internet => "internet",
            Bottleneck::Cloud => "cloud",
        };
        f.write_str(s)
    }
}

/// Classify the path's bottleneck. `local_speed` is the link speed, `baseline`
/// the single-stream throughput, `burst` the best multi-stream throughput.
///
/// Order matters: internet and campus are checked against the baseline
/// first; "cloud" wins over "local" when both `P/B < 2` and none of the
/// earlier conditions hold, per the explicit tie-breaker in spec.md §4.3.
pub fn classify(local_speed_bps: f64, baseline_bps: f64, burst_bps: f64) -> Bottleneck {
    if baseline_bps < local_speed_bps / 10.0 {
        return Bottleneck::Internet;
    }
    if baseline_bps < local_speed_bps / 2.0 {
        return Bottleneck::Campus;
    }
    if burst_bps / baseline_bps < 2.0 {
        return Bottleneck::Cloud;
    }
    Bottleneck::Local
}

/// Human-readable recommendations derived from a classification and the
/// probe's raw numbers, per spec.md §4.3 phase 6.
pub fn recommendations(
    optimal_mtu: u32,
    baseline_bps: f64,
    burst_bps: f64,
    bottleneck: Bottleneck,
    max_regional_rtt_ms: f64,
    max_tunnels: u32,
) -> Vec<String> {
    let mut out = Vec::new();

    if optimal_mtu > 1500 {
        out.push(format!("enable jumbo frames (optimal MTU {optimal_mtu})"));
    }

    out.push(format!("bottleneck classified as {bottleneck}"));

    if max_regional_rtt_ms > 100.0 {
        out.push("use a loss-aware congestion controller (observed RTT > 100ms)".to_string());
    }

    let ratio = if baseline_bps > 0.0 { burst_bps / baseline_bps } else { 0.0 };
    let suggested_tunnels = ((0.8 * ratio).floor() as i64).clamp(1, max_tunnels as i64) as u32;
    out.push(format!("set tunnel count to {suggested_tunnels}"));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_three_internet() {
        assert_eq!(classify(10e9, 100e6, 200e6), Bottleneck::Internet);
    }

    #[test]
    fn scenario_four_cloud() {
        assert_eq!(classify(10e9, 5e9, 6e9), Bottleneck::Cloud);
    }

    #[test]
    fn scenario_five_local() {
        assert_eq!(classify(1e9, 800e6, 1.6e9), Bottleneck::Local);
    }

    #[test]
    fn classification_always_returns_exactly_one_class() {
        for local in [1e8, 1e9, 1e10] {
            for baseline in [1e6, 1e8, 1e9] {
                for burst in [1e6, 1e8, 1e10] {
                    // just confirming classify() returns without panicking
                    // and is one of the four variants (exhaustive enum).
                    let _ = classify(local, baseline, burst);
                }
            }
        }
    }
}
