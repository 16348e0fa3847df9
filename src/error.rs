//! Unified error type for the monitoring/repair control plane.
//!
//! Every component-boundary error named in the specification's error-handling
//! design maps onto one variant here: transient fetch failures, structural
//! damage surfaced by the codec, malformed peer requests, unreachable peers,
//! and fatal startup errors. Handlers recover at the boundary closest to the
//! fault; only `Fatal` ever propagates out of `main`.

use thiserror::Error;

/// Main error type for all sentinel operations.
#[derive(Error, Debug)]
pub enum SentinelError {
    /// Block or metadata fetch timed out or network-errored. Callers treat
    /// this as "block possibly absent", never as fatal.
    #[error("transient fetch failure for {what}: {source}")]
    TransientFetch {
        what: String,
        #[source]
        source: anyhow::Error,
    },

    /// The codec could not resolve a CID because an ancestor tree node is
    /// missing. Structural damage: escalates to collaborative or strand repair.
    #[error("unresolved intermediate node for file {file_cid} at index {index}")]
    ResolveIntermediate { file_cid: String, index: u64 },

    /// Malformed request body, unknown operation type, or a peer referenced
    /// in a repair record that was never registered.
    #[error("protocol error: {reason}")]
    ProtocolInvalid { reason: String },

    /// The discovery service (or a resolved peer) was unreachable.
    #[error("discovery unreachable for peer {peer}: {source}")]
    DiscoveryUnreachable {
        peer: String,
        #[source]
        source: anyhow::Error,
    },

    /// The external codec library returned an error that is not itself
    /// recoverable at this boundary (propagated from `codec` adapters).
    #[error("codec error: {0}")]
    Codec(String),

    /// The block-network/cluster adapter returned an unexpected error.
    #[error("storage adapter error: {0}")]
    Storage(String),

    /// Configuration could not be parsed or was missing a required value.
    #[error("configuration error: {field} - {message}")]
    Configuration { field: String, message: String },

    /// Startup-time failure: socket bind, or the discovery service rejected
    /// this node's self-announcement. Propagates to the CLI exit code.
    #[error("fatal startup error: {0}")]
    Fatal(String),
}

/// Result type alias for sentinel operations.
pub type SentinelResult<T> = Result<T, SentinelError>;
