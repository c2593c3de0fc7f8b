//! cloud-mole — encrypted multi-tunnel overlay bridge between an on-prem
//! host and a cloud private subnet.
//!
//! # Architecture
//!
//! ```text
//! orchestrator (C7) ─┬─▶ probe (C3)    measures the path, recommends MTU/tunnel count
//!                     ├─▶ cloud (C2)    provisions VPC/SG/keypair/bridge, idempotently
//!                     ├─▶ tunnel (C4)   keys, configures, and brings up N tunnels
//!                     ├─▶ scaler (C5)   watches live utilisation, drives C4/C6
//!                     └─▶ cluster (C6)  vertical→horizontal placement across bridges
//! ```
//!
//! `crypto` (C1) and `platform` are leaf collaborators used by several of
//! the above. `config` holds the persisted deployment/profile state; `cli`
//! and `main` are the thin binary entry point.

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod cli;
pub mod cloud;
pub mod cluster;
pub mod config;
pub mod crypto;
pub mod error;
pub mod orchestrator;
pub mod platform;
pub mod probe;
pub mod scaler;
pub mod tunnel;

pub use cluster::ClusterController;
pub use config::{DeploymentConfig, DeploymentResult};
pub use error::MoleError;
pub use scaler::Scaler;
pub use tunnel::TunnelManager;
