//! Core library for the hart provisioning tool.
//!
//! hart creates Salt minions and masters on cloud providers. A run creates
//! a node with a bootstrap payload, proves the node's identity over SSH
//! with a one-time canary, registers the minion key with the local Salt
//! master and checks connectivity. Any failure before registration tears
//! the node down again.

pub mod bootstrap;
pub mod config;
pub mod exec;
pub mod lifecycle;
pub mod provider;
pub mod roles;
pub mod ssh;
pub mod test_support;
pub mod token;
pub mod trust;
