//! Hotspan Net - wireless group lifecycle and the hotspot controller.
//!
//! This crate ties the radio and the proxy together:
//!
//! - [`WirelessGroup`] abstracts the platform radio that hosts the local
//!   group, with a scripted implementation for driving the controller
//!   without hardware
//! - [`NetworkController`] owns the start/stop state machine: it creates the
//!   group, runs the proxy against the group's address, and tears both down
//!   in order
//! - [`ServerConfig`] is the configuration surface external callers fill in
//!   before starting
//!
//! External callers observe [`RunningStatus`] and the current
//! [`NetworkGroupInfo`] through watch channels; they never mutate either.

mod config;
mod controller;
mod group;
mod status;

pub use config::{ConfigError, ServerConfig, ServerNetworkBand, DEFAULT_PROXY_PORT};
pub use controller::{NetworkController, ServerEvent, StartError};
pub use group::{
    GroupError, GroupEvent, NetworkGroupInfo, StaticGroup, SyntheticGroup, WirelessGroup,
};
pub use status::{FailureReason, RunningStatus};
