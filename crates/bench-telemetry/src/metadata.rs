//! Host and agent identity attached to persisted telemetry.

use chrono::Local;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Name reported as the producing application.
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Version reported as the producing application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

static HOST: Lazy<HostMetadata> = Lazy::new(HostMetadata::detect);

/// Facts about the machine the agent runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMetadata {
    /// Host name.
    pub machine_name: String,
    /// CPU architecture, e.g. `x86_64`.
    pub platform_architecture: String,
    /// OS family, e.g. `linux`.
    pub platform: String,
    /// OS version.
    pub os_version: String,
    /// Human-readable OS description.
    pub os_description: String,
    /// Local UTC offset, e.g. `+02:00`.
    pub timezone: String,
}

impl HostMetadata {
    /// Probes the current host.
    #[must_use]
    pub fn detect() -> Self {
        let machine_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            machine_name,
            platform_architecture: std::env::consts::ARCH.to_string(),
            platform: std::env::consts::OS.to_string(),
            os_version: System::os_version().unwrap_or_default(),
            os_description: System::long_os_version().unwrap_or_default(),
            timezone: Local::now().offset().to_string(),
        }
    }

    /// The current host, probed once per process.
    #[must_use]
    pub fn current() -> &'static Self {
        &HOST
    }
}

/// Identity of the agent run that produced the telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Agent (client) id.
    pub agent_id: String,
    /// Experiment id.
    pub experiment_id: String,
}

impl AgentMetadata {
    /// Creates agent metadata.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, experiment_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            experiment_id: experiment_id.into(),
        }
    }
}
