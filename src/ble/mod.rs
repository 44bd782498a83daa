//! Bluetooth Low Energy subsystem.
//!
//! This module drives the Nordic SoftDevice S140 in **Central** role on
//! behalf of the session engine:
//!
//! 1. **Scanner** - forwards advertisements of BLEAMs (and Apple background
//!    advertisers) while scanning is switched on.
//! 2. **Link** - connects to the chosen BLEAM, runs GATT discovery and
//!    carries out the reads and writes the engine asks for.
//!
//! Both tasks report back as [`blesc::Event`]s. An unprovisioned scanner
//! instead runs the **Config Service** in Peripheral role until a client
//! hands it a key and node id. Communication with the
//! engine task is done via Embassy channels defined in the crate root.

pub mod config_service;
pub mod link;
pub mod scanner;

use blesc::bleam::types::{AttHandle, Payload};
use blesc::bleam::{Address, BleamId, ConnParams};
use defmt::Format;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Receiver, Sender};

/// Depth of the engine's event queue.
pub const EVENT_QUEUE_LEN: usize = 16;

pub type EventSender = Sender<'static, CriticalSectionRawMutex, blesc::Event, EVENT_QUEUE_LEN>;

/// Commands that the engine task sends to the scanner task.
#[derive(Clone, Copy, Format)]
pub enum ScanCommand {
    Start,
    Stop,
}

pub type ScanCommandReceiver = Receiver<'static, CriticalSectionRawMutex, ScanCommand, 4>;

/// Commands that the engine task sends to the link task.
#[derive(Clone, Format)]
pub enum LinkCommand {
    /// Connect to a BLEAM seen by the scanner.
    Connect { address: Address, params: ConnParams },
    /// Close the current connection.
    Disconnect,
    UpdateConnParams(ConnParams),
    /// Discover the BLEAM service derived from `id`.
    Discover(BleamId),
    Write { attr: AttHandle, data: Payload },
    Read { attr: AttHandle },
}

pub type LinkCommandReceiver = Receiver<'static, CriticalSectionRawMutex, LinkCommand, 8>;
