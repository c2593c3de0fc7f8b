//! Command-line surface.
//!
//! Out of scope as a *component* (spec.md §1), but the binary still needs
//! an entry point; this module is a thin adapter that parses arguments and
//! hands off into the library, following `cli/src/main.rs`'s
//! `#[derive(Parser)]`/`#[derive(Subcommand)]` shape.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cloud-mole")]
#[command(author = "cloud-mole")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Encrypted multi-tunnel overlay bridge to a cloud private subnet", long_about = None)]
pub struct Cli {
    /// Saved profile to load defaults from.
    #[arg(long, short)]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Initialize a new profile interactively.
    Init,
    /// Run the probe engine and print the recommendation record.
    Probe {
        #[arg(long, default_value = "us-east-1")]
        region: String,
    },
    /// List VPCs in the target region/account.
    ListVpcs {
        #[arg(long, default_value = "us-east-1")]
        region: String,
    },
    /// Stand up a deployment.
    Up(UpArgs),
    /// Stand up a deployment across multiple bridges from the start.
    MultiUp(UpArgs),
    /// Print the status of the current deployment.
    Status,
    /// Run the scaler loop in the foreground, printing decisions as they fire.
    Monitor,
    /// Force one scaler evaluation and apply its decision.
    Scale,
    /// Re-run the probe against a live deployment and report drift.
    Optimize,
    /// Run a one-off throughput test over the current tunnels.
    Test,
    /// Export the current deployment as an infrastructure-as-code template.
    Export {
        #[arg(long, default_value = "terraform")]
        format: String,
    },
    /// Save the current flags as a named profile.
    CreateProfile {
        name: String,
    },
    /// Bring tunnels up from a saved profile without re-provisioning.
    Connect {
        name: String,
    },
    /// Tear down the current deployment.
    Down {
        #[arg(long)]
        force: bool,
    },
    /// Print version information.
    Version,
}

#[derive(clap::Args)]
pub struct UpArgs {
    #[arg(long)]
    pub vpc: Option<String>,
    #[arg(long)]
    pub public_subnet: Option<String>,
    #[arg(long)]
    pub private_subnet: Option<String>,
    #[arg(long)]
    pub create_vpc: bool,
    #[arg(long, default_value = "10.100.0.0/16")]
    pub vpc_cidr: String,
    #[arg(long, default_value = "10.100.0.0/24")]
    pub public_subnet_cidr: String,
    #[arg(long, default_value = "10.100.1.0/24")]
    pub private_subnet_cidr: String,
    #[arg(long, default_value = "us-east-1")]
    pub region: String,
    #[arg(long)]
    pub auto_optimize: bool,
    #[arg(long)]
    pub tunnels: Option<u32>,
    #[arg(long)]
    pub instance_type: Option<String>,
    #[arg(long)]
    pub profile: Option<String>,
    #[arg(long)]
    pub enable_nat: bool,
    #[arg(long)]
    pub deploy_target: bool,
    #[arg(long)]
    pub target_instance_type: Option<String>,
    #[arg(long)]
    pub force: bool,
}

impl UpArgs {
    /// Build a `DeploymentConfig` from CLI flags, falling back to defaults
    /// for anything not supplied.
    pub fn into_config(self) -> crate::config::DeploymentConfig {
        use crate::config::{DeploymentConfig, NetworkSpec};

        let network = match (self.vpc, self.public_subnet, self.private_subnet) {
            (Some(vpc_id), Some(public_subnet_id), Some(private_subnet_id)) => NetworkSpec::Existing {
                vpc_id,
                public_subnet_id,
                private_subnet_id,
            },
            _ => NetworkSpec::Create {
                vpc_cidr: self.vpc_cidr,
                public_subnet_cidr: self.public_subnet_cidr,
                private_subnet_cidr: self.private_subnet_cidr,
            },
        };

        let defaults = DeploymentConfig::default();
        DeploymentConfig {
            network,
            region: self.region,
            tunnel_count: self.tunnels.unwrap_or(defaults.tunnel_count),
            bridge_instance_class: self.instance_type.unwrap_or(defaults.bridge_instance_class),
            auto_optimize: self.auto_optimize || defaults.auto_optimize,
            deploy_reachability_target: self.deploy_target,
            target_instance_class: self.target_instance_type,
            ..defaults
        }
    }
}

/// Exit codes, per spec.md §6.
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GenericFailure = 1,
    PreconditionFailed = 2,
    ElevationRefused = 3,
    CloudLimitExceeded = 4,
}

/// Map a `MoleError` to the exit code contract in spec.md §6.
pub fn exit_code_for(error: &crate::error::MoleError) -> ExitCode {
    use crate::error::MoleError;
    match error {
        MoleError::Input(_) => ExitCode::PreconditionFailed,
        MoleError::ElevationRefused(_) => ExitCode::ElevationRefused,
        MoleError::Cloud(crate::cloud::CloudError::QuotaExceeded { .. }) => ExitCode::CloudLimitExceeded,
        _ => ExitCode::GenericFailure,
    }
}
