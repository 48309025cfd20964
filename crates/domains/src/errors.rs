//! # VoteError
//!
//! Every variant rejects the whole vote; nothing is partially applied.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{CollectionName, VoteType};

/// The error type for all voting operations.
#[derive(Error, Debug)]
pub enum VoteError {
    /// The user lacks the capability for this vote type.
    #[error("{collection}: permission denied for {action}")]
    PermissionDenied {
        collection: CollectionName,
        action: String,
    },

    /// The vote is structurally disallowed (debate replies, non-tag revisions).
    #[error("{collection}: {reason}")]
    InvalidOperation {
        collection: CollectionName,
        reason: String,
    },

    #[error("{collection} document not found with ID {id}")]
    DocumentNotFound { collection: CollectionName, id: Uuid },

    #[error("user not found with ID {0}")]
    UserNotFound(Uuid),

    /// Carries the message of the first rule the vote tripped.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("invalid vote type: {0}")]
    InvalidVoteType(String),

    #[error("vote type {0} has no capability action")]
    InvalidVoteTypeAction(VoteType),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// Infrastructure failure from a storage or hook adapter.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl VoteError {
    pub fn invalid_operation(collection: CollectionName, reason: impl Into<String>) -> Self {
        VoteError::InvalidOperation {
            collection,
            reason: reason.into(),
        }
    }
}

/// A specialized Result type for voting logic.
pub type Result<T> = std::result::Result<T, VoteError>;
