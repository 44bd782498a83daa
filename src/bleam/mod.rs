//! BLEAM session engine.
//!
//! The engine is a pure state machine: the firmware feeds link-layer
//! [`Event`]s into [`ConnectionManager::dispatch`] and carries out the
//! [`Action`]s it returns. Nothing in this module touches the radio, so the
//! whole session lifecycle runs under `cargo test` on the host.
//!
//! 1. **Connection Manager** - scan filtering, connect, parameter
//!    negotiation, discovery, handshake and teardown of one session.
//! 2. **Security Handshake** - salt, time and two-part signature exchange.
//! 3. **Mode Controller** - peer commands (DFU, reboot, unconfig).
//! 4. **Telemetry Pipeline** - batched ranging and health writes with one
//!    outstanding write per queue.
//! 5. **Identity Correlator** - address whitelist/blacklist with TTL.
//! 6. **Eco Schedule** - scan windows aligned to the system clock.

pub mod discovery;
pub mod eco;
pub mod event;
pub mod handshake;
pub mod identity;
pub mod manager;
pub mod mode;
pub mod peers;
pub mod protocol;
pub mod signer;
pub mod telemetry;
pub mod types;

pub use discovery::{HandleSet, HandleSetBuilder};
pub use eco::EcoSchedule;
pub use event::{Action, Event, Outbox, TimerId};
pub use identity::IdentityCorrelator;
pub use manager::{ConnectionManager, SessionState};
pub use peers::{KnownPeers, PeerRecord, PeerStore};
pub use protocol::{Command, HealthEvent, Mode, RangingSample, ServiceEvent};
pub use signer::{HmacSigner, Signer};
pub use types::{Address, BleamId, ConnHandle, ConnParams};
