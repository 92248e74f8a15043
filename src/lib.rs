//! probewire: the telemetry backbone of an APM agent.
//!
//! Instrumented code reports method timings and exception signals through
//! [`agent::Hooks`]; background workers register identifiers with a remote
//! collector and ship the buffered records on a cycle.

pub mod agent;
pub mod collector;
pub mod config;
pub mod connection;
pub mod correlate;
pub mod delivery;
pub mod platform;
pub mod record;
pub mod reduce;
pub mod registry;
pub mod strategy;
