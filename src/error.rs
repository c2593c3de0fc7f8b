//! Error taxonomy
//!
//! Each component owns a focused error enum; `MoleError` wraps them for
//! call sites (mainly the orchestrator and the CLI) that cross component
//! boundaries. Recoverable conditions are handled inside the owning
//! component and never reach this type.

use thiserror::Error;

use crate::cloud::CloudError;
use crate::cluster::ClusterError;
use crate::orchestrator::OrchestratorError;
use crate::probe::ProbeError;
use crate::scaler::ScalerError;
use crate::tunnel::TunnelError;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum MoleError {
    #[error("key/identity error: {0}")]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Scaler(#[from] ScalerError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("invalid input: {0}")]
    Input(String),
    #[error("elevation refused: {0}")]
    ElevationRefused(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

/// Errors from the key & identity utility (C1).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("OS random number generator failed: {0}")]
    Rng(String),
    #[error("invalid base64 key encoding: {0}")]
    Encoding(String),
    #[error("SSH key generation failed: {0}")]
    Ssh(String),
}
