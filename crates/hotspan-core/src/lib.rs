//! Hotspan Core - Client accounting, identity, and request-rewrite logic.
//!
//! This crate provides the shared building blocks for the Hotspan tethering
//! proxy:
//!
//! - Per-client bandwidth accounting ([`report`], [`client`])
//! - The seen/blocked client registry shared by all proxy sessions
//!   ([`registry`])
//! - The URL fixer pipeline applied to outbound request targets
//!   ([`urlfixer`])
//! - The permission capability queried before hosting a group
//!   ([`permission`])

pub mod client;
pub mod permission;
pub mod registry;
pub mod report;
pub mod urlfixer;

pub use client::{ClientIdentity, TetherClient};
pub use permission::{AlwaysGranted, PermissionGuard};
pub use registry::ClientRegistry;
pub use report::ByteTransferReport;
pub use urlfixer::{FixerPipeline, PsnUrlFixer, UrlFixer};
