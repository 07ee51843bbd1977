// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::ConnectionStartState;

/// The full set of recognized configuration options. Loaded from YAML; the
/// pluggable function hooks
/// (compression, resolver, serializer reset, connection lifecycle callbacks)
/// are not representable in YAML and are supplied programmatically by the
/// embedding application when it builds a `Service`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Per-pool connection provisioning limits.
    pub pool: PoolConfig,
    /// Per-connection writer multiplexing limits.
    pub writer: WriterConfig,
    /// Inbound listener settings (server mode only).
    pub listener: ListenerConfig,
    /// Options that don't fit the other groups.
    pub runtime: RuntimeOptions,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PoolConfig {
    #[serde(rename = "MaxPerPoolConnectionCount")]
    /// Upper bound on live+pending connections per pool.
    pub max_per_pool_connection_count: usize,

    #[serde(rename = "SessionMutexCount")]
    /// Number of stripes in the pool-directory mutex array.
    pub session_mutex_count: usize,

    #[serde(rename = "MsgCancelConnectionWaitSeconds", with = "serde_secs")]
    /// How long a push-canceled visitor may wait on the guaranteed-delivery
    /// channel before giving up.
    pub msg_cancel_connection_wait: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WriterConfig {
    #[serde(rename = "MaxWriterMultiplexMessageCount")]
    /// `max_multiplex`: write-ids allowed in-flight at once per connection.
    pub max_writer_multiplex_message_count: usize,

    #[serde(rename = "MaxWriterWaitingMessageCount")]
    /// `max_waiting`: live write-slots (queued + in-flight) per connection.
    pub max_writer_waiting_message_count: usize,

    #[serde(rename = "MaxWriterPendingMessageCount")]
    /// `max_pending`: messages parked behind a full write queue.
    pub max_writer_pending_message_count: usize,

    #[serde(rename = "MaxWriterMessageContinuousPacketCount")]
    /// Packets a single message may occupy back-to-back before it is
    /// rotated to the back of the write queue.
    pub max_writer_message_continuous_packet_count: u32,
}

impl From<&WriterConfig> for crate::writer::WriterLimits {
    fn from(c: &WriterConfig) -> Self {
        crate::writer::WriterLimits {
            max_multiplex: c.max_writer_multiplex_message_count,
            max_waiting: c.max_writer_waiting_message_count,
            max_pending: c.max_writer_pending_message_count,
            max_continuous_packet_count: c.max_writer_message_continuous_packet_count,
        }
    }
}

impl From<&Config> for crate::pool::PoolLimits {
    fn from(c: &Config) -> Self {
        crate::pool::PoolLimits {
            max_per_pool_connection_count: c.pool.max_per_pool_connection_count,
            writer: (&c.writer).into(),
            msg_cancel_connection_wait: c.pool.msg_cancel_connection_wait,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ListenerConfig {
    #[serde(default, rename = "ListenAddressStr")]
    /// Address to bind for accepted connections; empty means "server mode
    /// disabled".
    pub listen_address_str: String,

    #[serde(default, rename = "DefaultListenPortStr")]
    /// Fallback port used when `listen_address_str` omits one.
    pub default_listen_port_str: String,

    #[serde(rename = "ServerOnly")]
    /// When set, the service refuses outgoing `send` calls: server-only
    /// services reject outgoing sends.
    pub server_only: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeOptions {
    #[serde(rename = "ConnectionStartState", default)]
    /// Whether freshly provisioned connections start `Active` or `Passive`.
    pub connection_start_state: ConnectionStartState,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants that the runtime relies on structurally (a
    /// pool with zero connections allowed, or zero mutex stripes, can never
    /// make progress).
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.pool.max_per_pool_connection_count >= 1,
            "MaxPerPoolConnectionCount must be >= 1"
        );
        ensure!(self.pool.session_mutex_count >= 1, "SessionMutexCount must be >= 1");

        ensure!(
            self.writer.max_writer_multiplex_message_count >= 1,
            "MaxWriterMultiplexMessageCount must be >= 1"
        );
        ensure!(
            self.writer.max_writer_waiting_message_count >= self.writer.max_writer_multiplex_message_count,
            "MaxWriterWaitingMessageCount must be >= MaxWriterMultiplexMessageCount"
        );
        ensure!(
            self.writer.max_writer_message_continuous_packet_count >= 1,
            "MaxWriterMessageContinuousPacketCount must be >= 1"
        );

        if self.listener.server_only {
            ensure!(
                !self.listener.listen_address_str.is_empty(),
                "ListenAddressStr is required when ServerOnly is set"
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
