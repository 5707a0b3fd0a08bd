//! The `hubsim` library crate simulates a device connected to a cloud
//! IoT hub.
//!
//! A simulated device can run any combination of three activities over a
//! single shared connection:
//!
//! - Sending device-to-cloud messages at a fixed interval
//! - Receiving cloud-to-device messages and settling each of them
//! - Uploading a local file to the storage associated with the hub
//!
//! The device connection is opened once before any activity starts, and
//! closed once after every activity has stopped, either because it has
//! reached its goal or because the simulation has been cancelled.
//!
//! Devices connect either over `MQTT` or over `HTTP`. When only a device
//! identifier is known, the device credentials are fetched from the hub
//! registry.
//!
//! `hubsim` relies on `tokio` as asynchronous executor: each activity is
//! an independent task, while a coordinator periodically checks their
//! liveness.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Simulated device activities.
pub mod activity;
/// Simulation configuration and its validation.
pub mod config;
/// Ownership of the device connection.
pub mod connection;
/// Device and hub connection strings.
pub mod connection_string;
/// Completion of a set of activities.
pub mod coordinator;
/// Error management.
pub mod error;
/// Messages exchanged with the hub.
pub mod message;
/// Device registry lookup.
pub mod registry;
/// Shared access signatures.
pub mod sas;
/// A device simulation session.
pub mod session;
/// Device transports.
pub mod transport;

pub use session::{SimulationSession, simulate};

#[cfg(test)]
mod tests;
