//! strandwatch - federated monitoring and repair plane for files stored on
//! a content-addressed block network with alpha-entanglement redundancy.
//!
//! Each community node tracks a set of files, periodically probes block
//! availability, gossips views with peers that share responsibility for the
//! same file, and orchestrates collaborative data-block repair and strand
//! (parity tree) repair. The entanglement codec itself is an external
//! dependency; this crate only consumes the [`codec::EntanglementCodec`]
//! contract.
//!
//! # Architecture
//!
//! A single control-loop task ([`control::run`]) is the sole mutator of
//! [`model::ClusterState`], multiplexing:
//!
//! 1. monitor operations (start/stop/reset a file) from the HTTP surface;
//! 2. repair-coordinator operations and their completions;
//! 3. an inspection timer, driving [`inspector::inspect_file`];
//! 4. a view-share timer, driving [`view_sharer::share_file`].
//!
//! [`http::router`] exposes this over HTTP; [`adapters`] provides the
//! outbound boundaries to the block-network/cluster node and the discovery
//! service.

pub mod adapters;
pub mod codec;
pub mod collab;
pub mod config;
pub mod control;
pub mod error;
pub mod health;
pub mod http;
pub mod inspector;
pub mod model;
pub mod ops;
pub mod store;
pub mod strand;
pub mod view_sharer;

pub use config::SentinelConfig;
pub use error::{SentinelError, SentinelResult};
