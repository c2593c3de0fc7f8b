//! Cross-module scenarios from spec.md §8 that don't belong to one file:
//! the named instance-class/bottleneck/scaler scenarios, plus the
//! cross-cutting invariants that span the tunnel manager and the
//! orchestrator's deployment round trip.

use cloud_mole::cloud::catalogue::{select_optimal, Selection};
use cloud_mole::config::{DeploymentConfig, NetworkSpec};
use cloud_mole::orchestrator;
use cloud_mole::probe::Bottleneck;
use cloud_mole::scaler::{ScaleAction, Scaler, ScalerConfig};

#[test]
fn scenario_one_instance_class_selection() {
    let selection = select_optimal(500_000_000.0, 30.0);
    assert_eq!(selection.class().id, "medium");
}

#[test]
fn scenario_two_budget_infeasible_falls_back_to_cheapest() {
    let selection = select_optimal(10_000_000_000.0, 0.50);
    assert!(matches!(selection, Selection::BudgetInfeasible { .. }));
    assert_eq!(selection.class().id, "nano");
}

#[test]
fn scenarios_three_to_five_bottleneck_classification() {
    use cloud_mole::probe::classify::classify;
    assert_eq!(classify(10e9, 100e6, 200e6), Bottleneck::Internet);
    assert_eq!(classify(10e9, 5e9, 6e9), Bottleneck::Cloud);
    assert_eq!(classify(1e9, 800e6, 1.6e9), Bottleneck::Local);
}

#[test]
fn scenario_six_scaler_decision() {
    let scaler = Scaler::new(ScalerConfig::default());
    let now = chrono::Utc::now();
    scaler.record_action_applied(now - chrono::Duration::minutes(3));
    scaler.record_tick(vec![880_000_000.0; 4], now);
    let action = scaler.evaluate(4, now);
    assert_eq!(
        action,
        ScaleAction::ScaleUp {
            to: 5,
            reason: "High utilisation: 88%".to_string(),
        }
    );
}

#[tokio::test]
async fn deployment_round_trip_leaves_no_active_tunnels_after_teardown() {
    let config = DeploymentConfig {
        network: NetworkSpec::Create {
            vpc_cidr: "10.100.0.0/16".into(),
            public_subnet_cidr: "10.100.0.0/24".into(),
            private_subnet_cidr: "10.100.1.0/24".into(),
        },
        tunnel_count: 2,
        auto_optimize: false,
        ..DeploymentConfig::default()
    };

    let (tunnels, scaler, result) = orchestrator::up(&config).await.expect("up should succeed against stubs");

    let active = tunnels.get_active_tunnels();
    assert_eq!(active.len(), 2, "active tunnel ids must be a dense prefix");
    let mut ids: Vec<u32> = active.iter().map(|t| t.id).collect();
    ids.sort();
    assert_eq!(ids, vec![0, 1]);

    let mut ports: Vec<u16> = active.iter().map(|t| t.listen_port).collect();
    ports.sort();
    ports.dedup();
    assert_eq!(ports.len(), 2, "no two active tunnels may share a listen port");
    for t in &active {
        assert_eq!(t.listen_port, config.base_port + t.id as u16);
    }

    orchestrator::down(&config.region, Some(&tunnels), Some(scaler), Some(&result))
        .await
        .expect("down should succeed");
    assert!(tunnels.get_active_tunnels().is_empty());
}

#[tokio::test]
async fn ensure_network_called_twice_with_same_inputs_is_idempotent() {
    let driver = cloud_mole::cloud::CloudDriver::new("us-east-1").await;
    let spec = NetworkSpec::Create {
        vpc_cidr: "10.123.0.0/16".into(),
        public_subnet_cidr: "10.123.0.0/24".into(),
        private_subnet_cidr: "10.123.1.0/24".into(),
    };
    let a = driver.ensure_network(&spec).await.unwrap();
    let b = driver.ensure_network(&spec).await.unwrap();
    assert_eq!(a.vpc_id, b.vpc_id);
}
