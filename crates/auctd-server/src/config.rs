//! Server configuration.
//!
//! Loaded from a TOML file with `AUCTD_`-prefixed environment overrides.
//! Every field has a default so a minimal file (or none of the optional
//! sections) still yields a runnable configuration.

use crate::error::AppResult;
use auctd_clock::ClockConfig;
use auctd_core::{BehaviorKind, Price};
use auctd_session::DeliveryMode;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Dispatcher delivery mode, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryConfig {
    /// Inline draining for deterministic batch runs.
    Synchronous,
    /// Background worker for real-time play.
    #[default]
    Asynchronous,
}

impl From<DeliveryConfig> for DeliveryMode {
    fn from(value: DeliveryConfig) -> Self {
        match value {
            DeliveryConfig::Synchronous => DeliveryMode::Synchronous,
            DeliveryConfig::Asynchronous => DeliveryMode::Asynchronous,
        }
    }
}

/// Fee bounds enforced by the charge policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Minimum acceptable fee level.
    #[serde(default = "default_fee_min")]
    pub min: Decimal,
    /// Maximum acceptable fee level.
    #[serde(default = "default_fee_max")]
    pub max: Decimal,
    /// true: out-of-bounds schedules are rejected (day ban);
    /// false: they are silently clamped into bounds.
    #[serde(default = "default_fee_reject")]
    pub reject_out_of_bounds: bool,
}

fn default_fee_min() -> Decimal {
    Decimal::ZERO
}

fn default_fee_max() -> Decimal {
    Decimal::from(100)
}

fn default_fee_reject() -> bool {
    true
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            min: default_fee_min(),
            max: default_fee_max(),
            reject_out_of_bounds: default_fee_reject(),
        }
    }
}

/// Order bounds enforced by the order validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfig {
    #[serde(default = "default_order_min_price")]
    pub min_price: Decimal,
    #[serde(default = "default_order_max_price")]
    pub max_price: Decimal,
    #[serde(default = "default_order_max_quantity")]
    pub max_quantity: u32,
}

fn default_order_min_price() -> Decimal {
    Decimal::ONE
}

fn default_order_max_price() -> Decimal {
    Decimal::from(1_000_000)
}

fn default_order_max_quantity() -> u32 {
    1_000
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            min_price: default_order_min_price(),
            max_price: default_order_max_price(),
            max_quantity: default_order_max_quantity(),
        }
    }
}

/// Per-behavior penalty thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Wrong-phase messages tolerated per participant.
    #[serde(default = "default_wrong_phase_threshold")]
    pub wrong_phase_threshold: u32,
    /// Duplicate in-flight orders tolerated.
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_order_threshold: u32,
    /// Malformed messages tolerated.
    #[serde(default = "default_malformed_threshold")]
    pub malformed_threshold: u32,
    /// Fee violations before a day ban; 1 makes a rejection an
    /// immediate ban.
    #[serde(default = "default_fee_violation_threshold")]
    pub fee_violation_threshold: u32,
    /// Excessive reconnects before the identity is refused.
    #[serde(default = "default_reconnect_threshold")]
    pub reconnect_threshold: u32,
}

fn default_wrong_phase_threshold() -> u32 {
    10
}

fn default_duplicate_threshold() -> u32 {
    5
}

fn default_malformed_threshold() -> u32 {
    10
}

fn default_fee_violation_threshold() -> u32 {
    1
}

fn default_reconnect_threshold() -> u32 {
    1
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            wrong_phase_threshold: default_wrong_phase_threshold(),
            duplicate_order_threshold: default_duplicate_threshold(),
            malformed_threshold: default_malformed_threshold(),
            fee_violation_threshold: default_fee_violation_threshold(),
            reconnect_threshold: default_reconnect_threshold(),
        }
    }
}

impl BehaviorConfig {
    /// Threshold table consumed by the behavior controller.
    #[must_use]
    pub fn thresholds(&self) -> HashMap<BehaviorKind, u32> {
        HashMap::from([
            (BehaviorKind::WrongPhaseMessage, self.wrong_phase_threshold),
            (BehaviorKind::DuplicateOrder, self.duplicate_order_threshold),
            (BehaviorKind::MalformedMessage, self.malformed_threshold),
            (BehaviorKind::FeeViolation, self.fee_violation_threshold),
            (BehaviorKind::ExcessiveReconnect, self.reconnect_threshold),
        ])
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Shared-secret token every REGISTER must carry.
    #[serde(default = "default_auth_token")]
    pub auth_token: String,
    /// Dispatcher delivery mode.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Bounded wait for every outstanding request, in milliseconds.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Reconnections honored per identity before penalties start.
    #[serde(default = "default_reconnect_limit")]
    pub reconnect_limit: u32,
    /// Maximum wire frame size in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub orders: OrderConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1:9470".to_string()
}

fn default_auth_token() -> String {
    "change-me".to_string()
}

fn default_response_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_limit() -> u32 {
    3
}

fn default_max_frame_bytes() -> usize {
    8 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth_token: default_auth_token(),
            delivery: DeliveryConfig::default(),
            response_timeout_ms: default_response_timeout_ms(),
            reconnect_limit: default_reconnect_limit(),
            max_frame_bytes: default_max_frame_bytes(),
            clock: ClockConfig::default(),
            fees: FeeConfig::default(),
            orders: OrderConfig::default(),
            behavior: BehaviorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, then apply `AUCTD_*` environment
    /// overrides.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("AUCTD").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    #[must_use]
    pub fn fee_bounds(&self) -> (Price, Price) {
        (Price::new(self.fees.min), Price::new(self.fees.max))
    }
}
