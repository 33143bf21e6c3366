//! Client identity and per-client state.
//!
//! A joined device is identified either by the IP address its connections
//! arrive from or by a resolved hostname. The two forms never compare equal
//! to each other; [`ClientIdentity::matches`] is the single place that rule
//! is defined.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::report::ByteTransferReport;

/// How a client on the hosted group is identified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientIdentity {
    /// Identified by source IP address.
    Ip(IpAddr),
    /// Identified by resolved hostname.
    Hostname(String),
}

impl ClientIdentity {
    /// Returns the canonical registry key for this identity.
    pub fn key(&self) -> String {
        match self {
            ClientIdentity::Ip(ip) => ip.to_string(),
            ClientIdentity::Hostname(name) => name.clone(),
        }
    }

    /// Returns true if `other` is the same kind of identity with the same
    /// underlying value. Cross-variant comparisons are never equal.
    pub fn matches(&self, other: &ClientIdentity) -> bool {
        match (self, other) {
            (ClientIdentity::Ip(a), ClientIdentity::Ip(b)) => a == b,
            (ClientIdentity::Hostname(a), ClientIdentity::Hostname(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientIdentity::Ip(ip) => write!(f, "{ip}"),
            ClientIdentity::Hostname(name) => write!(f, "{name}"),
        }
    }
}

impl From<IpAddr> for ClientIdentity {
    fn from(ip: IpAddr) -> Self {
        ClientIdentity::Ip(ip)
    }
}

/// A device that has joined the hosted group and pushed traffic through the
/// proxy at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TetherClient {
    /// The identity connections from this client present.
    pub identity: ClientIdentity,
    /// Display name; defaults to the identity string until renamed.
    pub nickname: String,
    /// When traffic from this client was last observed.
    pub last_seen: DateTime<Utc>,
    /// Cumulative transfer totals across all completed sessions.
    pub total_bytes: ByteTransferReport,
}

impl TetherClient {
    /// Creates a client record first seen now with the given initial report.
    pub fn new(identity: ClientIdentity, initial: ByteTransferReport) -> Self {
        let nickname = identity.key();
        Self {
            identity,
            nickname,
            last_seen: Utc::now(),
            total_bytes: initial,
        }
    }

    /// Folds another session's report into the cumulative totals and bumps
    /// the last-seen timestamp.
    pub fn merge_report(&mut self, report: &ByteTransferReport) {
        self.total_bytes = self.total_bytes.merge(report);
        self.last_seen = Utc::now();
    }

    /// Human-readable upload total for display.
    pub fn transfer_to_internet(&self) -> String {
        self.total_bytes.display_to_internet()
    }

    /// Human-readable download total for display.
    pub fn transfer_from_internet(&self) -> String {
        self.total_bytes.display_from_internet()
    }
}
