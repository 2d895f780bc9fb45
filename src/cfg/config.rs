// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::PoolRole;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportConfig {
    /// Where to find the nodes this process talks to.
    pub nodes: NodesConfig,
    /// Authentication strategy applied to every outbound connection.
    pub auth: AuthConfig,
    /// Per-connection tuning (framing limits, admission, keepalive, backoff).
    pub connection: ConnectionTuning,
    /// Process-wide knobs outside any single connection.
    pub runtime: RuntimeConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Node discovery: either a registry file (`registry::load`) or an inline
/// list, plus which pool this process joins as.
pub struct NodesConfig {
    #[serde(default, rename = "RegistryPath")]
    /// Path to a `host:port`-per-line registry file (§6). Mutually
    /// exclusive with `static_addrs` only in spirit — both are merged if
    /// both are set, registry entries first.
    pub registry_path: Option<PathBuf>,

    #[serde(default, rename = "StaticAddrs")]
    /// Inline `host:port` entries, for tests and small deployments that
    /// don't want a separate registry file.
    pub static_addrs: Vec<String>,

    #[serde(rename = "PoolRole")]
    /// Whether this process's requests default to the primary node or may
    /// be spread across replicas.
    pub pool_role: PoolRole,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "Method")]
/// Authentication applied when a connection first comes up (the
/// Connecting -> Authenticating step of `ConnState`).
pub enum AuthConfig {
    #[serde(rename = "None")]
    None,
    #[serde(rename = "Hmac")]
    Hmac(HmacConfig),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Credentials file location for the HMAC challenge/response authenticator.
pub struct HmacConfig {
    #[serde(rename = "CredentialsPath")]
    pub credentials_path: PathBuf,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Knobs `ConnectionConfig` doesn't hardcode (spec.md deliberately leaves
/// reconnect backoff unprescribed; this is where a deployment pins it down).
pub struct ConnectionTuning {
    #[serde(rename = "MaxBodyLen")]
    /// Largest single message body `FrameCodec` will decode before treating
    /// the frame as malformed.
    pub max_body_len: u32,

    #[serde(rename = "MaxInFlightRequests")]
    /// Admission limit enforced by `RequestSet`'s semaphore.
    pub max_in_flight_requests: usize,

    #[serde(rename = "ConnectTimeout", with = "serde_millis")]
    /// Upper bound on a single TCP connect attempt.
    pub connect_timeout: Duration,

    #[serde(rename = "ReconnectBackoffMin", with = "serde_millis")]
    /// Backoff delay after the first failed reconnect attempt.
    pub reconnect_backoff_min: Duration,

    #[serde(rename = "ReconnectBackoffMax", with = "serde_millis")]
    /// Ceiling the exponential reconnect backoff saturates to.
    pub reconnect_backoff_max: Duration,

    #[serde(rename = "KeepaliveIdle", with = "serde_secs")]
    /// TCP keepalive idle time before the first probe.
    pub keepalive_idle: Duration,

    #[serde(rename = "KeepaliveInterval", with = "serde_secs")]
    /// Interval between TCP keepalive probes.
    pub keepalive_interval: Duration,

    #[serde(rename = "KeepaliveRetries")]
    /// Number of unacknowledged keepalive probes before the OS gives up on
    /// the socket.
    pub keepalive_retries: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Settings that apply to the whole process rather than to one connection.
pub struct RuntimeConfig {
    #[serde(default, rename = "ControlSocketPath")]
    /// Unix socket path for the `update-credentials` control listener.
    /// Omit to run without a control socket.
    pub control_socket_path: Option<PathBuf>,

    #[serde(rename = "LogConfigPath")]
    /// Path to the logging configuration consumed by `cfg::logger`.
    pub log_config_path: PathBuf,
}

const DEFAULT_MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

impl TransportConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: TransportConfig =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.nodes.registry_path.is_some() || !self.nodes.static_addrs.is_empty(),
            "at least one of nodes.RegistryPath or nodes.StaticAddrs must be set"
        );

        if self.connection.max_body_len == 0 {
            self.connection.max_body_len = DEFAULT_MAX_BODY_LEN;
        }
        ensure!(
            self.connection.max_in_flight_requests >= 1,
            "connection.MaxInFlightRequests must be >= 1"
        );
        ensure!(
            self.connection.reconnect_backoff_min <= self.connection.reconnect_backoff_max,
            "connection.ReconnectBackoffMin must not exceed ReconnectBackoffMax"
        );
        ensure!(
            self.connection.keepalive_retries >= 1,
            "connection.KeepaliveRetries must be >= 1"
        );

        if let AuthConfig::Hmac(hmac) = &self.auth {
            ensure!(
                hmac.credentials_path.as_os_str() != "",
                "auth.CredentialsPath must not be empty when Method is Hmac"
            );
        }

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds,
/// for the sub-second knobs (connect timeout, reconnect backoff).
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
