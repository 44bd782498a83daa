//! Everything that crosses the boundary between the session engine and
//! the link layer: events in, actions out.

use crate::bleam::protocol::{Mode, ServiceEvent};
use crate::bleam::signer::Salt;
use crate::bleam::types::{AdvData, Address, AttHandle, BleamId, ConnHandle, ConnParams, Payload};

/// Timers the engine can arm. Each id has at most one pending deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerId {
    /// Next connection parameter update attempt.
    ParamUpdate,
    /// Upper bound for service discovery.
    Discovery,
    /// Upper bound for the whole handshake, and for the peer's answer to a
    /// mode-change challenge.
    Handshake,
    /// Inactivity watchdog of an active session.
    Inactivity,
    /// Periodic purge of expired identity entries.
    IdentitySweep,
    /// End of an eco scan window, or the next wake-up after idling.
    EcoCycle,
}

impl TimerId {
    pub const ALL: [TimerId; 6] = [
        TimerId::ParamUpdate,
        TimerId::Discovery,
        TimerId::Handshake,
        TimerId::Inactivity,
        TimerId::IdentitySweep,
        TimerId::EcoCycle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Input to [`ConnectionManager::dispatch`](crate::bleam::ConnectionManager::dispatch).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Application asks the scanner to start looking for BLEAMs.
    StartScan,
    /// Application asks the scanner to stop scanning.
    StopScan,
    ScanReport {
        address: Address,
        rssi: i8,
        data: AdvData,
    },
    Connected {
        handle: ConnHandle,
        address: Address,
    },
    ConnectFailed {
        address: Address,
    },
    Disconnected {
        handle: ConnHandle,
        /// HCI reason code.
        reason: u8,
    },
    /// The link applied new parameters; `interval` in 1.25 ms units.
    ConnParamsUpdated {
        handle: ConnHandle,
        interval: u16,
    },
    /// Our parameter update request failed.
    ConnParamsRejected {
        handle: ConnHandle,
    },
    /// The peer asked for different parameters.
    ConnParamsRequested {
        handle: ConnHandle,
        params: ConnParams,
    },
    ServiceDiscovered {
        handle: ConnHandle,
        uuid: [u8; 16],
    },
    CharacteristicDiscovered {
        handle: ConnHandle,
        uuid16: u16,
        value_handle: AttHandle,
        cccd_handle: Option<AttHandle>,
    },
    DiscoveryComplete {
        handle: ConnHandle,
        ok: bool,
    },
    Notification {
        handle: ConnHandle,
        attr: AttHandle,
        data: Payload,
    },
    ReadResponse {
        handle: ConnHandle,
        attr: AttHandle,
        ok: bool,
        data: Payload,
    },
    WriteComplete {
        handle: ConnHandle,
        attr: AttHandle,
        ok: bool,
    },
    /// Answer to [`Action::GenerateSalt`].
    SaltGenerated {
        handle: ConnHandle,
        salt: Salt,
    },
    TimerFired(TimerId),
}

impl Event {
    /// Connection handle the event refers to, if any.
    pub fn conn_handle(&self) -> Option<ConnHandle> {
        match self {
            Event::Connected { handle, .. }
            | Event::Disconnected { handle, .. }
            | Event::ConnParamsUpdated { handle, .. }
            | Event::ConnParamsRejected { handle }
            | Event::ConnParamsRequested { handle, .. }
            | Event::ServiceDiscovered { handle, .. }
            | Event::CharacteristicDiscovered { handle, .. }
            | Event::DiscoveryComplete { handle, .. }
            | Event::Notification { handle, .. }
            | Event::ReadResponse { handle, .. }
            | Event::WriteComplete { handle, .. }
            | Event::SaltGenerated { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// Report for connection parameters the link now runs with, when nobody
    /// on our side asked for them: an update if they fit `requested`,
    /// otherwise a request the engine answers with its own range.
    pub fn params_applied(handle: ConnHandle, requested: &ConnParams, applied: ConnParams) -> Event {
        // Applied parameters carry the interval in both bounds.
        if requested.accepts_interval(applied.min_interval) {
            Event::ConnParamsUpdated {
                handle,
                interval: applied.min_interval,
            }
        } else {
            Event::ConnParamsRequested {
                handle,
                params: applied,
            }
        }
    }
}

/// Side effect requested by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    StartScan,
    StopScan,
    Connect {
        address: Address,
        params: ConnParams,
    },
    Disconnect {
        handle: ConnHandle,
    },
    UpdateConnParams {
        handle: ConnHandle,
        params: ConnParams,
    },
    /// Discover the service of BLEAM `id` and report it as discovery events.
    DiscoverServices {
        handle: ConnHandle,
        id: BleamId,
    },
    Write {
        handle: ConnHandle,
        attr: AttHandle,
        data: Payload,
    },
    Read {
        handle: ConnHandle,
        attr: AttHandle,
    },
    /// (Re)arm `timer`; an already pending deadline is replaced.
    StartTimer {
        timer: TimerId,
        after_ms: u64,
    },
    CancelTimer(TimerId),
    /// Draw a random challenge salt; answered with [`Event::SaltGenerated`].
    GenerateSalt {
        handle: ConnHandle,
    },
    Notify(ServiceEvent),
    /// A terminal mode was confirmed by the peer and must be carried out by
    /// the caller.
    ModeRequested(Mode),
}

/// Maximum actions one dispatch can produce.
pub const OUTBOX_CAPACITY: usize = 16;

/// Actions collected during one dispatch call.
#[derive(Debug, Default)]
pub struct Outbox {
    actions: heapless::Vec<Action, OUTBOX_CAPACITY>,
}

impl Outbox {
    pub const fn new() -> Self {
        Self {
            actions: heapless::Vec::new(),
        }
    }

    pub fn push(&mut self, action: Action) {
        if let Err(dropped) = self.actions.push(action) {
            error!("outbox full, dropping {:?}", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    /// Hand the collected actions to the caller and empty the box.
    pub fn drain(&mut self) -> impl Iterator<Item = Action> {
        core::mem::take(&mut self.actions).into_iter()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    pub fn contains(&self, action: &Action) -> bool {
        self.actions.contains(action)
    }

    /// Writes requested in this batch, in order.
    pub fn writes(&self) -> impl Iterator<Item = (AttHandle, &Payload)> {
        self.actions.iter().filter_map(|a| match a {
            Action::Write { attr, data, .. } => Some((*attr, data)),
            _ => None,
        })
    }

    /// Service events published in this batch, in order.
    pub fn notifications(&self) -> impl Iterator<Item = ServiceEvent> + '_ {
        self.actions.iter().filter_map(|a| match a {
            Action::Notify(e) => Some(*e),
            _ => None,
        })
    }
}
