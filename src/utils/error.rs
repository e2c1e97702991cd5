//! Unified error type of the lease manager.

use std::error;
use std::fmt;
use std::io;

/// Error kinds surfaced by the lease manager and its handles.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LeaseError {
    /// No secretary is registered for the namespace.
    InvalidNamespace(String),

    /// Lease name rejected by the namespace's secretary.
    InvalidLeaseName(String),

    /// Holder (or pinning entity) name rejected by the namespace's secretary.
    InvalidHolderName(String),

    /// Requested lease duration rejected by the namespace's secretary.
    InvalidDuration(String),

    /// Claim denied: someone else holds the lease. Recoverable; retry later
    /// or treat as "not leader".
    LeaseHeld,

    /// The holder does not (or no longer) hold the lease.
    NotHeld,

    /// The holder's lease is still recorded but its expiry has passed.
    LeaseExpired,

    /// Transient fault of the backing store.
    StoreUnavailable(String),

    /// Cancelled while waiting for a lease to become free.
    WaitCancelled,

    /// The coordinator has stopped or is stopping.
    Stopped,

    /// Unrecoverable violation of a coordinator invariant.
    Invariant(String),

    /// Anything else, carried as its string representation.
    Msg(String),
}

impl LeaseError {
    pub fn msg(msg: impl ToString) -> Self {
        LeaseError::Msg(msg.to_string())
    }

    /// Returns true if the error is a transient store fault that a later
    /// attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, LeaseError::StoreUnavailable(_))
    }
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LeaseError::InvalidNamespace(ns) => {
                write!(f, "invalid lease namespace '{}'", ns)
            }
            LeaseError::InvalidLeaseName(name) => {
                write!(f, "invalid lease name '{}'", name)
            }
            LeaseError::InvalidHolderName(holder) => {
                write!(f, "invalid holder name '{}'", holder)
            }
            LeaseError::InvalidDuration(reason) => {
                write!(f, "invalid lease duration: {}", reason)
            }
            LeaseError::LeaseHeld => write!(f, "lease held by another holder"),
            LeaseError::NotHeld => write!(f, "lease not held"),
            LeaseError::LeaseExpired => write!(f, "lease expired"),
            LeaseError::StoreUnavailable(reason) => {
                write!(f, "lease store unavailable: {}", reason)
            }
            LeaseError::WaitCancelled => write!(f, "lease wait cancelled"),
            LeaseError::Stopped => write!(f, "lease manager stopped"),
            LeaseError::Invariant(reason) => {
                write!(f, "lease manager invariant violated: {}", reason)
            }
            LeaseError::Msg(msg) => write!(f, "{}", msg), // no literal quotes
        }
    }
}

impl error::Error for LeaseError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `LeaseError::Msg`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for LeaseError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                LeaseError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for channel errors, which all mean the other end (usually the
// coordinator task) is gone.
macro_rules! impl_from_chan_error {
    ($error:ty) => {
        impl From<$error> for LeaseError {
            fn from(_: $error) -> Self {
                LeaseError::Stopped
            }
        }
    };
}

// Same as above for channel errors generic over the message type.
macro_rules! impl_from_chan_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for LeaseError {
            fn from(_: $error) -> Self {
                LeaseError::Stopped
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);

impl_from_chan_error!(tokio::sync::oneshot::error::RecvError);

impl_from_chan_error_generic!(tokio::sync::mpsc::error::SendError<T>);
