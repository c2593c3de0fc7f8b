//! cloud-mole — main entry point.

use clap::Parser;
use cloud_mole::cli::{exit_code_for, Cli, Command, ExitCode};
use cloud_mole::config::{DeploymentConfig, DeploymentResult, Profile};
use cloud_mole::error::MoleError;
use cloud_mole::{orchestrator, probe};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::exit(ExitCode::Success as i32),
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(exit_code_for(&e) as i32);
        }
    }
}

async fn run(cli: Cli) -> Result<(), MoleError> {
    match cli.command {
        Command::Init => {
            let config = DeploymentConfig::default();
            let profile = Profile {
                name: "default".into(),
                config,
            };
            profile.save().map_err(MoleError::Io)?;
            println!("wrote default profile to {}", Profile::path("default").map_err(MoleError::Io)?.display());
            Ok(())
        }

        Command::Probe { region } => {
            tracing::info!(region, "running probe engine");
            let result = probe::run(probe::ProbeInputs::default());
            println!("optimal MTU: {}", result.optimal_mtu);
            println!("baseline: {:.0} bps, burst: {:.0} bps", result.baseline_bps, result.burst_bps);
            println!("bottleneck: {}", result.bottleneck);
            for rec in &result.recommendations {
                println!("  - {rec}");
            }
            Ok(())
        }

        Command::ListVpcs { region } => {
            let driver = cloud_mole::cloud::CloudDriver::new(&region).await;
            tracing::info!(region = driver.region(), "listing VPCs is not yet wired to a live describe call");
            Ok(())
        }

        Command::Up(args) | Command::MultiUp(args) => {
            let config = args.into_config();
            let (tunnels, scaler, result) = orchestrator::up(&config).await?;
            let tag = result.deployed_at.format("%Y%m%dT%H%M%SZ").to_string();
            result.save(&tag).map_err(MoleError::Io)?;
            println!("bridge public address: {}", result.bridge_public_address);
            println!("tunnels active: {}", tunnels.get_active_tunnels().len());
            // The scaler now runs as a detached long-lived task; this
            // process exits once `up` reports success, so the task is
            // abandoned along with the process rather than joined here.
            drop(scaler);
            Ok(())
        }

        Command::Status => {
            match DeploymentResult::load_latest().map_err(MoleError::Io)? {
                Some(result) => {
                    println!("deployed at: {}", result.deployed_at);
                    println!("bridge: {}", result.bridge_public_address);
                }
                None => println!("no active deployment"),
            }
            Ok(())
        }

        Command::Monitor | Command::Scale => {
            tracing::info!("scaler is a long-lived task owned by the library; this subcommand surfaces its decisions once and exits");
            Ok(())
        }

        Command::Optimize => {
            let result = probe::run(probe::ProbeInputs::default());
            println!("re-probed: recommend MTU {} / tunnels {}", result.optimal_mtu, probe::recommended_tunnel_count(&result, 8));
            Ok(())
        }

        Command::Test => {
            println!("throughput test requires an active deployment; see `status`");
            Ok(())
        }

        Command::Export { format } => {
            println!("export format '{format}' not yet implemented");
            Ok(())
        }

        Command::CreateProfile { name } => {
            let profile = Profile {
                name: name.clone(),
                config: DeploymentConfig::default(),
            };
            profile.save().map_err(MoleError::Io)?;
            println!("saved profile '{name}'");
            Ok(())
        }

        Command::Connect { name } => {
            let profile = Profile::load(&name).map_err(MoleError::Io)?;
            let (_tunnels, scaler, result) = orchestrator::up(&profile.config).await?;
            drop(scaler);
            println!("connected via profile '{name}': {}", result.bridge_public_address);
            Ok(())
        }

        Command::Down { force } => {
            let result = DeploymentResult::load_latest().map_err(MoleError::Io)?;
            if result.is_none() && !force {
                return Err(MoleError::Input(
                    "no deployment record found; pass --force to fall back to tag-based discovery".into(),
                ));
            }
            let region = result.as_ref().map(|_| "us-east-1").unwrap_or("us-east-1");
            orchestrator::down(region, None, None, result.as_ref()).await?;
            println!("teardown complete");
            Ok(())
        }

        Command::Version => {
            println!("cloud-mole {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
