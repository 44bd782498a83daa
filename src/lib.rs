//! Host-testable library interface for blesc.
//!
//! Everything that does not touch the radio lives here: the BLEAM session
//! engine, the configuration-mode state behind the Config Service, its
//! configuration and error types, the advertisement parser and the
//! battery/reset helpers used to build health reports.
//!
//! Usage: `cargo test` (the firmware needs `--features embedded` and an
//! nRF52840 target).
//!
//! Note: The embedded binary uses main.rs with #![no_std] and #![no_main]
//! and drives [`bleam::ConnectionManager`] from its event loop.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod bleam;
pub mod config;
pub mod error;
pub mod provision;

// Internal module paths for the parts shared with the firmware tree
#[path = "ble/adv_parser.rs"]
mod ble_adv_parser_impl;

#[path = "power_logic.rs"]
mod power_logic_impl;

// ═══════════════════════════════════════════════════════════════════════════
// Re-exports
// ═══════════════════════════════════════════════════════════════════════════

pub use bleam::{Action, ConnectionManager, Event, Outbox, SessionState};
pub use config::ScannerConfig;
pub use error::{DisconnectReason, Error};

pub mod ble {
    pub mod adv_parser {
        pub use crate::ble_adv_parser_impl::{
            bleam_id_from_advertisement, extract_device_name, is_apple_background,
        };
    }
}

pub mod power_logic {
    pub use crate::power_logic_impl::{
        battery_decivolts, error_type_from_reset_reason, uptime_minutes, vdd_millivolts,
    };
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
