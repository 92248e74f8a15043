//! The wire capability consumed by the agent core.
//!
//! The transport itself is deliberately opaque: everything in the core talks
//! to the [`Connection`] trait and only distinguishes "server unavailable"
//! from "registration rejected". A newline-delimited JSON TCP client is
//! bundled as the default transport.

pub mod tcp;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{GlobalId, PlatformId, SensorRecord};

pub use tcp::TcpConnection;

/// Errors surfaced by a [`Connection`].
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The collector could not be reached or the channel broke mid-call.
    #[error("collector unavailable: {reason}")]
    ServerUnavailable { reason: String },

    /// The collector answered and refused the registration.
    #[error("registration rejected: {reason}")]
    RegistrationRejected { reason: String },
}

impl ConnectionError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::ServerUnavailable {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::RegistrationRejected {
            reason: reason.into(),
        }
    }

    /// True when the failure is a definitive refusal rather than an outage.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::RegistrationRejected { .. })
    }
}

/// Uniquely describes an instrumented method to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub class_name: String,
    pub method_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter_types: Vec<String>,
}

impl MethodDescriptor {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            parameter_types: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameter_types: Vec<String>) -> Self {
        self.parameter_types = parameter_types;
        self
    }

    /// Fully qualified display form, e.g. `pkg.Type#method`.
    pub fn qualified_name(&self) -> String {
        format!("{}#{}", self.class_name, self.method_name)
    }
}

/// Describes a sensor type (a family of measurements) to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorTypeDescriptor {
    pub name: String,
}

impl SensorTypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Channel to the remote collector.
///
/// Register calls exchange local state for global identifiers; `send_batch`
/// ships finalized records. Implementations must be safe to share across the
/// background workers.
pub trait Connection: Send + Sync + 'static {
    /// Establishes the underlying channel.
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Whether the channel is currently usable.
    fn is_connected(&self) -> bool;

    /// Registers this agent process, yielding the platform id every other
    /// registration is scoped under.
    fn register_platform(
        &self,
        agent_name: &str,
    ) -> impl Future<Output = Result<PlatformId, ConnectionError>> + Send;

    /// Registers one instrumented method.
    fn register_method(
        &self,
        platform_id: PlatformId,
        descriptor: &MethodDescriptor,
    ) -> impl Future<Output = Result<GlobalId, ConnectionError>> + Send;

    /// Registers one sensor type.
    fn register_sensor_type(
        &self,
        platform_id: PlatformId,
        descriptor: &SensorTypeDescriptor,
    ) -> impl Future<Output = Result<GlobalId, ConnectionError>> + Send;

    /// Associates a registered sensor type with a registered method.
    fn add_sensor_type_to_method(
        &self,
        sensor_type_id: GlobalId,
        method_id: GlobalId,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Ships one shaped batch of records.
    fn send_batch(
        &self,
        records: &[SensorRecord],
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}
