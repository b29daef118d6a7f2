//! Configuration management module for the quorum peer.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support (`CONFIG_PATH`)
//! - Environment variable overrides (`QUORUM__` prefix)
//! - Component-wise validation
mod cluster;
mod monitoring;
mod network;
mod quorum;
mod retry;
pub use cluster::*;
pub use monitoring::*;
pub use network::*;
pub use quorum::*;
pub use retry::*;

#[cfg(test)]
mod config_test;

use std::env;
use std::fmt::Debug;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

pub(crate) const ENV_PREFIX: &str = "QUORUM";

/// Main configuration container for the quorum peer
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct QuorumNodeConfig {
    /// Peer set, identity and directories
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Tick and limit parameters of the protocol
    #[serde(default)]
    pub quorum: QuorumConfig,
    /// Network communication parameters
    #[serde(default)]
    pub network: NetworkConfig,
    /// Retry policies for distributed operations
    #[serde(default)]
    pub retry: RetryPolicies,
    /// Metrics and monitoring settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Debug for QuorumNodeConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("QuorumNodeConfig")
            .field("cluster", &self.cluster)
            .field("quorum", &self.quorum)
            .finish()
    }
}

impl QuorumNodeConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers MUST call `validate()` before using the configuration.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// [`Self::new`] with `cluster_path`, when given, layered on top.
    pub fn load(cluster_path: Option<&str>) -> Result<Self> {
        let config = Self::new()?;
        match cluster_path {
            Some(path) => config.with_override_config(path),
            None => Ok(config),
        }
    }

    /// Applies additional configuration overrides from file without validation.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates configuration and returns validated instance.
    ///
    /// A failure here is a configuration error: fatal at startup, before any
    /// role is entered.
    pub fn validate(self) -> Result<Self> {
        self.cluster.validate()?;
        self.quorum.validate(self.cluster.servers.len())?;
        self.network.validate()?;
        self.retry.validate()?;
        self.monitoring.validate()?;
        Ok(self)
    }
}
