//! Error types for the sync core.
//!
//! # Design
//! Network-level failures are `TransportError`; the consumer never returns
//! them to callers directly but turns them into `unhandled_exception`
//! callbacks. `CollectionError` covers misuse of the editable collection and
//! broken reconciliation contracts, and is returned as a plain `Result`.

use crate::record::LocalKey;

/// Failures raised while executing a single HTTP round-trip.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection refused, DNS failure, timeout and the like.
    #[error("network error: {0}")]
    Network(String),

    /// The response arrived but its body could not be read.
    #[error("failed to read response body: {0}")]
    Body(String),

    /// The request URL could not be parsed.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Errors returned by `EditableCollection` operations.
#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("no record with local key {0}")]
    UnknownRecord(LocalKey),

    /// A dirty child references an unpersisted parent that was not queued in
    /// `added` before it. The tree walk must visit parents first.
    #[error("unpersisted parent {parent} of record {child} is not queued for creation")]
    ParentNotQueued { child: LocalKey, parent: LocalKey },

    /// The record (or one of its descendants) is part of a POST that has not
    /// resolved yet.
    #[error("record {0} has a creation request in flight")]
    InFlight(LocalKey),

    #[error("server returned {returned} created records, {submitted} were submitted")]
    CreatedCountMismatch { submitted: usize, returned: usize },

    #[error("record at position {0} carries no identifier")]
    MissingIdentifier(usize),

    #[error("server echoed unknown client reference {0}")]
    UnknownClientRef(String),

    /// Moving a node under itself or one of its descendants.
    #[error("cannot move record {0} under its own subtree")]
    CyclicMove(LocalKey),
}

/// Errors returned by `OptionRegistry`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("option registry used before init")]
    NotInitialized,

    /// The list request ended with something other than `succeed`.
    #[error("loading option list {name} failed with {outcome} (status {status})")]
    LoadFailed {
        name: String,
        outcome: String,
        status: u16,
    },
}
