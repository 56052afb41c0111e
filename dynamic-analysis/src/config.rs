/// Configuration module for the analysis worker
///
/// This module provides centralized configuration management with support for:
/// - Environment variable loading (a `.env` file is honoured)
/// - Default values
/// - Configuration validation

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use shared::observability::{LogConfig, LogFormat, LogLevel};

use crate::engine::DEFAULT_PHASE_TIMEOUT;
use crate::error::ConfigError;
use crate::models::{Ecosystem, Package, DEFAULT_SANDBOX_IMAGE};
use crate::sandbox::{SandboxConfig, SandboxRuntime, DEFAULT_NETWORK_NAME, DEFAULT_TRACE_STRING_LIMIT};

/// Main configuration structure for the worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub worker: WorkerConfig,
    pub sandbox: SandboxSettings,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(&|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            worker: WorkerConfig::from_lookup(lookup)?,
            sandbox: SandboxSettings::from_lookup(lookup)?,
            storage: StorageConfig::from_lookup(lookup),
            logging: LoggingConfig::from_lookup(lookup)?,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.sandbox.validate()?;
        Ok(())
    }

    /// The package this worker analyzes
    pub fn package(&self) -> Package {
        let package = Package::new(
            self.worker.ecosystem,
            self.worker.package_name.clone(),
            self.worker.package_version.clone(),
        );
        match &self.worker.local_package {
            Some(path) => package.with_local_path(path.clone()),
            None => package,
        }
    }

    /// Sandbox description shared by every run of this worker
    pub fn sandbox_config(&self) -> SandboxConfig {
        let sandbox = &self.sandbox;
        SandboxConfig {
            image: sandbox.image.clone(),
            tag: sandbox.image_tag.clone(),
            pull: sandbox.pull,
            offline: sandbox.offline,
            copies: Vec::new(),
            entry_command: None,
            runtime: sandbox.runtime,
            network_name: sandbox.network.clone(),
            memory_limit_mb: sandbox.memory_limit_mb,
            cpu_limit: sandbox.cpu_limit,
            trace_syscalls: sandbox.trace_syscalls,
            trace_string_limit: sandbox.trace_string_limit,
            capture_packets: sandbox.capture_packets,
            capture_interface: sandbox.capture_interface.clone(),
        }
    }
}

fn non_empty(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn required(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str) -> Result<String, ConfigError> {
    non_empty(lookup, key).ok_or(ConfigError::Missing(key))
}

fn parsed<T>(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn flag(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match non_empty(lookup, key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            key,
            message: format!("expected a boolean, got '{}'", v),
        }),
    }
}

/// Task and package identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub task_id: String,
    pub api_url: String,
    pub internal_api_token: String,
    pub ecosystem: Ecosystem,
    pub package_name: String,
    pub package_version: String,
    pub local_package: Option<PathBuf>,
}

impl WorkerConfig {
    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let ecosystem = required(lookup, "PACKAGE_ECOSYSTEM")?;
        let ecosystem = ecosystem.parse::<Ecosystem>().map_err(|e| ConfigError::Invalid {
            key: "PACKAGE_ECOSYSTEM",
            message: e.to_string(),
        })?;

        Ok(Self {
            task_id: required(lookup, "TASK_ID")?,
            api_url: required(lookup, "API_URL")?,
            internal_api_token: required(lookup, "INTERNAL_API_TOKEN")?,
            ecosystem,
            package_name: required(lookup, "PACKAGE_NAME")?,
            package_version: non_empty(lookup, "PACKAGE_VERSION").unwrap_or_default(),
            local_package: non_empty(lookup, "LOCAL_PACKAGE").map(PathBuf::from),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.package_name.is_empty() {
            return Err(ConfigError::Missing("PACKAGE_NAME").into());
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: "API_URL",
                message: format!("'{}' is not an http(s) URL", self.api_url),
            }
            .into());
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_id: String::new(),
            api_url: "http://localhost:8000/api/internal/callback/".to_string(),
            internal_api_token: String::new(),
            ecosystem: Ecosystem::Npm,
            package_name: String::new(),
            package_version: String::new(),
            local_package: None,
        }
    }
}

/// Sandbox and phase execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    pub runtime: SandboxRuntime,
    pub image: String,
    pub image_tag: String,
    pub pull: bool,
    pub offline: bool,
    pub network: String,
    pub network_subnet: Option<String>,
    pub memory_limit_mb: u64,
    pub cpu_limit: f32,
    pub phase_timeout_seconds: u64,
    /// Replaces the per-ecosystem analysis script
    pub analysis_command: Option<Vec<String>>,
    pub trace_syscalls: bool,
    pub trace_string_limit: usize,
    pub capture_packets: bool,
    pub capture_interface: String,
}

impl SandboxSettings {
    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            runtime: parsed(lookup, "SANDBOX_RUNTIME", defaults.runtime)?,
            image: non_empty(lookup, "SANDBOX_IMAGE").unwrap_or(defaults.image),
            image_tag: non_empty(lookup, "SANDBOX_IMAGE_TAG").unwrap_or(defaults.image_tag),
            pull: !flag(lookup, "NO_PULL", !defaults.pull)?,
            offline: flag(lookup, "OFFLINE", defaults.offline)?,
            network: non_empty(lookup, "SANDBOX_NETWORK").unwrap_or(defaults.network),
            network_subnet: non_empty(lookup, "SANDBOX_NETWORK_SUBNET"),
            memory_limit_mb: parsed(lookup, "SANDBOX_MEMORY_LIMIT_MB", defaults.memory_limit_mb)?,
            cpu_limit: parsed(lookup, "SANDBOX_CPU_LIMIT", defaults.cpu_limit)?,
            phase_timeout_seconds: parsed(lookup, "PHASE_TIMEOUT_SECONDS", defaults.phase_timeout_seconds)?,
            analysis_command: non_empty(lookup, "ANALYSIS_COMMAND")
                .map(|cmd| cmd.split_whitespace().map(String::from).collect()),
            trace_syscalls: flag(lookup, "TRACE_SYSCALLS", defaults.trace_syscalls)?,
            trace_string_limit: parsed(lookup, "TRACE_STRING_LIMIT", defaults.trace_string_limit)?,
            capture_packets: flag(lookup, "CAPTURE_PACKETS", defaults.capture_packets)?,
            capture_interface: non_empty(lookup, "CAPTURE_INTERFACE").unwrap_or(defaults.capture_interface),
        })
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, message: &str| {
            Err(ConfigError::Invalid {
                key,
                message: message.to_string(),
            })
        };
        if self.phase_timeout_seconds == 0 {
            return invalid("PHASE_TIMEOUT_SECONDS", "must be greater than 0");
        }
        if self.memory_limit_mb < 256 {
            return invalid("SANDBOX_MEMORY_LIMIT_MB", "must be at least 256");
        }
        if self.cpu_limit <= 0.0 {
            return invalid("SANDBOX_CPU_LIMIT", "must be greater than 0");
        }
        if self.image.is_empty() {
            return invalid("SANDBOX_IMAGE", "must not be empty");
        }
        Ok(())
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            runtime: SandboxRuntime::Docker,
            image: DEFAULT_SANDBOX_IMAGE.to_string(),
            image_tag: "latest".to_string(),
            pull: true,
            offline: false,
            network: DEFAULT_NETWORK_NAME.to_string(),
            network_subnet: None,
            memory_limit_mb: 2048,
            cpu_limit: 1.0,
            phase_timeout_seconds: DEFAULT_PHASE_TIMEOUT.as_secs(),
            analysis_command: None,
            trace_syscalls: true,
            trace_string_limit: DEFAULT_TRACE_STRING_LIMIT,
            capture_packets: true,
            capture_interface: "any".to_string(),
        }
    }
}

/// Artifact destinations; an unset category is not uploaded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub dynamic_bucket: Option<String>,
    pub execution_log_bucket: Option<String>,
    pub file_writes_bucket: Option<String>,
    pub analyzed_pkg_bucket: Option<String>,
}

impl StorageConfig {
    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        Self {
            dynamic_bucket: non_empty(lookup, "DYNAMIC_BUCKET"),
            execution_log_bucket: non_empty(lookup, "EXECUTION_LOG_BUCKET"),
            file_writes_bucket: non_empty(lookup, "FILE_WRITES_BUCKET"),
            analyzed_pkg_bucket: non_empty(lookup, "ANALYZED_PKG_BUCKET"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| env::var(key).ok())
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            level: parsed(lookup, "LOG_LEVEL", defaults.level)?,
            format: parsed(lookup, "LOG_FORMAT", defaults.format)?,
        })
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            format: self.format,
            service_name: "dynamic-analysis".to_string(),
            ..LogConfig::default()
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
        }
    }
}
