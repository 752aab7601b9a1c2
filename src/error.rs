//! Unified error handling for rosterd.
//!
//! This module provides the central error hierarchy for the registry control
//! plane, with error-code labeling for metrics and conversions to bus reply
//! strings.

use thiserror::Error;

// ============================================================================
// Registry Errors (inventory mutations)
// ============================================================================

/// Errors that can occur while mutating the proxy or backend registries.
///
/// Invariant violations abort the mutation and leave the registry unchanged;
/// they are surfaced to the operator and never silently retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An identifier was already present where it must not be. Fatal for the
    /// operation; operator action required.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("illegal status transition: {id} {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("unknown entry: {0}")]
    NotFound(String),

    /// Address already claimed by a live entry under a different identity.
    #[error("address {address}:{port} already registered to {holder}")]
    AddressInUse {
        address: String,
        port: u16,
        holder: String,
    },

    #[error("identifier space exhausted for role {0}")]
    Exhausted(&'static str),
}

impl RegistryError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Invariant(_) => "invariant",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::NotFound(_) => "not_found",
            Self::AddressInUse { .. } => "address_in_use",
            Self::Exhausted(_) => "exhausted",
        }
    }

    /// Whether this error must be escalated to the operator.
    pub fn is_invariant(&self) -> bool {
        matches!(
            self,
            Self::Invariant(_) | Self::IllegalTransition { .. } | Self::Exhausted(_)
        )
    }
}

/// Result type for registry mutations.
pub type RegistryResult<T> = Result<T, RegistryError>;

// ============================================================================
// Profile Errors (network configuration)
// ============================================================================

/// Errors from the network-configuration manager.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile not found: {0}")]
    NotFound(String),

    /// The profile failed validation. All errors are accumulated, not just
    /// the first one.
    #[error("profile validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// No profile is currently active (startup before seeding, or the active
    /// pointer references a deleted profile).
    #[error("no active profile")]
    NoActiveProfile,

    /// Document-store failure. The previously cached profile stays active.
    #[error("profile store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("profile document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ProfileError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::NoActiveProfile => "no_active_profile",
            Self::Store(_) => "store",
            Self::Malformed(_) => "malformed",
        }
    }

    /// Short human-readable string for `ok=false` bus replies. Structured
    /// detail (the per-field error list) travels separately.
    pub fn reply_message(&self) -> String {
        match self {
            Self::Validation(errors) => format!("validation failed: {}", errors.join(", ")),
            other => other.to_string(),
        }
    }
}

// ============================================================================
// Bus Errors (transport contract)
// ============================================================================

/// Errors from the message-bus abstraction.
#[derive(Debug, Error)]
pub enum BusError {
    /// A request did not receive a reply within the configured timeout.
    /// Retried once at the caller's discretion, never inside the core.
    #[error("bus request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("bus channel closed: {0}")]
    Closed(String),

    #[error("failed to encode or decode envelope: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BusError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Closed(_) => "closed",
            Self::Codec(_) => "codec",
        }
    }
}
