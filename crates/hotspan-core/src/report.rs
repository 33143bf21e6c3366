//! Byte transfer accounting.
//!
//! A [`ByteTransferReport`] is an immutable pair of directional counters
//! produced by each proxy session and accumulated per client. Merging two
//! reports is plain component-wise addition; 64-bit counters do not wrap for
//! realistic session lifetimes.

use serde::{Deserialize, Serialize};

const UNIT_JUMP: u64 = 1024;

/// Bytes moved through the proxy in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteTransferReport {
    /// Bytes received from the internet and handed to the client.
    pub internet_to_proxy: u64,
    /// Bytes received from the client and sent out to the internet.
    pub proxy_to_internet: u64,
}

impl ByteTransferReport {
    /// Creates a report from both directional counters.
    pub fn new(internet_to_proxy: u64, proxy_to_internet: u64) -> Self {
        Self {
            internet_to_proxy,
            proxy_to_internet,
        }
    }

    /// Returns an empty report.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns the component-wise sum of `self` and `other`.
    #[must_use]
    pub fn merge(&self, other: &ByteTransferReport) -> ByteTransferReport {
        ByteTransferReport {
            internet_to_proxy: self.internet_to_proxy + other.internet_to_proxy,
            proxy_to_internet: self.proxy_to_internet + other.proxy_to_internet,
        }
    }

    /// Returns true if no bytes moved in either direction.
    pub fn is_empty(&self) -> bool {
        self.internet_to_proxy == 0 && self.proxy_to_internet == 0
    }

    /// Human-readable download total (internet to proxy).
    pub fn display_from_internet(&self) -> String {
        format_bytes(self.internet_to_proxy)
    }

    /// Human-readable upload total (proxy to internet).
    pub fn display_to_internet(&self) -> String {
        format_bytes(self.proxy_to_internet)
    }
}

/// Formats a raw byte count with the largest fitting unit suffix.
pub fn format_bytes(total: u64) -> String {
    let mut amount = total;
    let mut suffix = " bytes";
    while amount > UNIT_JUMP {
        suffix = next_suffix(suffix);
        amount /= UNIT_JUMP;
    }
    format!("{amount}{suffix}")
}

fn next_suffix(suffix: &str) -> &'static str {
    match suffix {
        " bytes" => "KB",
        "KB" => "MB",
        "MB" => "GB",
        "GB" => "TB",
        _ => "PB",
    }
}
