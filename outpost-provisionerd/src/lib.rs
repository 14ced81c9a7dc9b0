//! Provisioner daemon
//!
//! Connects to an Outpost server over the worker RPC WebSocket and runs the
//! jobs it hands out. The job loop itself lives in
//! [`outpost_orchestrator::provisionerd`]; this crate supplies the network
//! transport and the built-in echo provisioner.

pub mod client;
pub mod echo;

pub use client::{ClientConfig, ClientError, RemoteProvisionerApi};
pub use echo::EchoProvisioner;
