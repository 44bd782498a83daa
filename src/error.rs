//! Unified error types for blesc.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! With the `defmt` feature every type implements `defmt::Format` for
//! efficient on-target logging.

use crate::bleam::protocol::Characteristic;

/// Top-level error type used across the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The target send queue is at capacity.
    QueueFull,

    /// Telemetry was offered while no session exists.
    NoSession,

    /// Runtime configuration is out of range.
    Config(ConfigError),
}

/// Rejected [`ScannerConfig`](crate::config::ScannerConfig) field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    QueueDepth,
    BatchSize,
    SampleWindow,
    ConnParams,
    RetryCap,
    Timeout,
    /// Eco scan window does not fit the shortest period.
    Eco,
}

/// Why discovery could not produce a complete handle set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryError {
    /// No primary service matching the expected BLEAM was reported.
    ServiceNotFound,
    /// The service was found without one of its characteristics.
    MissingCharacteristic(Characteristic),
    /// The control characteristic has no CCCD.
    MissingCccd,
    /// The link layer reported a failed discovery procedure.
    Procedure,
}

/// Provisioning writes that cannot be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProvisionError {
    /// Value has the wrong length for its characteristic.
    Length,
    /// All-zero key or node id.
    Zero,
    /// Key and node id are already set; a FAIL write starts over.
    Locked,
    /// Unknown or out-of-order status value.
    Status(u8),
}

/// Handshake abort reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HandshakeError {
    /// The notification CCCD write failed twice.
    NotifyEnable,
    /// Salt payload had the wrong length.
    MalformedSalt,
    /// TIME read returned the wrong length.
    MalformedTime,
    /// The TIME read itself failed.
    TimeRead,
    /// A signature write was not acknowledged.
    SignatureWrite,
    /// The signer could not produce a signature.
    Signing,
    /// The peer's countersignature of a mode change did not verify.
    Countersignature,
}

/// Identity list failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IdentityError {
    /// Every whitelist slot holds an active peer.
    ListFull,
}

/// Why a session ended (or is being torn down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    /// The link layer reported the disconnect (HCI reason code).
    Link(u8),
    /// Connect, parameter negotiation or a write failed.
    BadConnection,
    /// Discovery did not yield a complete handle set.
    ServiceNotFound,
    /// The handshake aborted.
    Handshake(HandshakeError),
    /// The handshake, or a mode confirmation, did not finish in time.
    HandshakeTimeout,
    /// Service discovery did not finish in time.
    DiscoveryTimeout,
    /// No application payload for too long.
    Inactivity,
    /// Both send queues drained and the session closes itself.
    Completed,
}

impl DisconnectReason {
    /// Failures that put the peer address on the blacklist.
    pub fn blacklists_peer(self) -> bool {
        !matches!(self, DisconnectReason::Link(_) | DisconnectReason::Completed)
    }
}

// Convenience conversions

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<HandshakeError> for DisconnectReason {
    fn from(e: HandshakeError) -> Self {
        DisconnectReason::Handshake(e)
    }
}

impl From<DiscoveryError> for DisconnectReason {
    fn from(e: DiscoveryError) -> Self {
        match e {
            DiscoveryError::Procedure => DisconnectReason::BadConnection,
            _ => DisconnectReason::ServiceNotFound,
        }
    }
}
