//! Mode controller - validates peer commands against the session phase.

use crate::bleam::protocol::{Command, Mode};

/// Session phase as seen by the mode controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    /// Before the handshake (negotiation, discovery).
    Setup,
    Authenticating,
    Active,
    /// A terminal mode waits for the peer's countersignature.
    ConfirmingMode,
}

/// Why a command was not acted upon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rejection {
    /// SALT/SIGN1/SIGN2 outside the handshake.
    HandshakeOnly,
    /// Mode change before the session is authenticated.
    NotActive,
    /// A terminal mode is already set for this session.
    AlreadyTerminal,
    /// Another mode change is waiting for its countersignature.
    ConfirmationPending,
}

/// What to do with a peer command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Belongs to the handshake; route it there.
    Handshake,
    /// Terminal mode requested. It only takes effect once the peer
    /// countersigns our challenge, see [`ModeController::confirm`].
    Challenge(Mode),
    /// Half of the countersignature of a pending mode change.
    Countersignature,
    Rejected(Rejection),
}

/// Operating mode of the current session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModeController {
    mode: Mode,
}

impl ModeController {
    pub const fn new() -> Self {
        Self { mode: Mode::None }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Ranging batches may only be sent in RSSI mode.
    pub fn ranging_enabled(&self) -> bool {
        self.mode == Mode::Rssi
    }

    /// Called once the handshake succeeded.
    pub fn enter_active(&mut self) {
        if self.mode == Mode::None {
            self.mode = Mode::Rssi;
        }
    }

    /// Classify a peer command. Never changes the mode by itself.
    pub fn handle_command(&self, cmd: Command, phase: Phase) -> Verdict {
        let verdict = self.judge(cmd, phase);
        match verdict {
            Verdict::Challenge(mode) => info!("mode: {:?} requested, challenging", mode),
            Verdict::Rejected(why) => warn!("mode: {:?} rejected ({:?})", cmd, why),
            Verdict::Handshake | Verdict::Countersignature => {}
        }
        verdict
    }

    /// The peer proved the request; switch to the terminal `mode`.
    pub fn confirm(&mut self, mode: Mode) {
        if self.mode.is_terminal() {
            return;
        }
        info!("mode: {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
    }

    fn judge(&self, cmd: Command, phase: Phase) -> Verdict {
        if cmd.is_handshake() {
            return match (phase, cmd) {
                (Phase::Authenticating, _) => Verdict::Handshake,
                (Phase::ConfirmingMode, Command::Sign1 | Command::Sign2) => Verdict::Countersignature,
                _ => Verdict::Rejected(Rejection::HandshakeOnly),
            };
        }
        let requested = match cmd {
            Command::Dfu => Mode::Dfu,
            Command::Reboot => Mode::Reboot,
            _ => Mode::Unconfig,
        };
        match phase {
            Phase::ConfirmingMode => Verdict::Rejected(Rejection::ConfirmationPending),
            Phase::Active if self.mode.is_terminal() => Verdict::Rejected(Rejection::AlreadyTerminal),
            Phase::Active => Verdict::Challenge(requested),
            _ => Verdict::Rejected(Rejection::NotActive),
        }
    }
}
