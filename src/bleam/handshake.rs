//! Security handshake - salt, time and a two-part signature.
//!
//! ```text
//!  EnablingNotifications ──CCCD ok──▶ AwaitingSalt ──salt──▶ AwaitingTime
//!                                                                │ time
//!                 Done ◀──SIGN2 ok── SendingSecondHalf ◀──SIGN1 ok── SendingFirstHalf
//! ```
//!
//! Every step waits for the completion of the previous one. Input that
//! arrives out of order is dropped without producing a transmission;
//! malformed input or a failed write aborts the handshake.

use crate::bleam::discovery::HandleSet;
use crate::bleam::event::{Action, Outbox};
use crate::bleam::protocol::{
    parse_salt, parse_time, signature_part, Command, ServiceEvent, CCCD_NOTIFY,
};
use crate::bleam::signer::{Salt, Signature, Signer};
use crate::bleam::types::{payload, AttHandle, ConnHandle};
use crate::config::{SALT_SIZE, SIGNATURE_PART_SIZE};
use crate::error::HandshakeError;

#[derive(Clone, Debug, PartialEq, Eq)]
enum State {
    EnablingNotifications { retried: bool },
    AwaitingSalt,
    AwaitingTime { salt: Salt },
    SendingFirstHalf { second: [u8; SIGNATURE_PART_SIZE] },
    SendingSecondHalf,
    Done,
}

/// Coarse handshake progress, for logging and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    EnablingNotifications,
    AwaitingSalt,
    AwaitingTime,
    SendingFirstHalf,
    SendingSecondHalf,
    Done,
}

/// Result of feeding one input to the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Still running (the input may have been ignored).
    Pending,
    /// Signature fully written; carries the peer's time of day (ms).
    Done { peer_time: u32 },
    /// Unrecoverable; the session must be torn down.
    Failed(HandshakeError),
}

/// One handshake run, bound to a connection and its handle set.
#[derive(Clone, Debug)]
pub struct Handshake {
    conn: ConnHandle,
    handles: HandleSet,
    state: State,
    peer_time: u32,
}

impl Handshake {
    /// Start by enabling notifications on the control characteristic.
    pub fn start(conn: ConnHandle, handles: HandleSet, out: &mut Outbox) -> Self {
        let hs = Self {
            conn,
            handles,
            state: State::EnablingNotifications { retried: false },
            peer_time: 0,
        };
        hs.write_cccd(out);
        hs
    }

    pub fn step(&self) -> Step {
        match self.state {
            State::EnablingNotifications { .. } => Step::EnablingNotifications,
            State::AwaitingSalt => Step::AwaitingSalt,
            State::AwaitingTime { .. } => Step::AwaitingTime,
            State::SendingFirstHalf { .. } => Step::SendingFirstHalf,
            State::SendingSecondHalf => Step::SendingSecondHalf,
            State::Done => Step::Done,
        }
    }

    fn write_cccd(&self, out: &mut Outbox) {
        out.push(Action::Write {
            handle: self.conn,
            attr: self.handles.control_cccd,
            data: payload(&CCCD_NOTIFY),
        });
    }

    /// A write issued by the handshake completed.
    pub fn on_write_complete(&mut self, attr: AttHandle, ok: bool, out: &mut Outbox) -> Progress {
        match self.state.clone() {
            State::EnablingNotifications { retried } if attr == self.handles.control_cccd => {
                if ok {
                    info!("handshake: notifications enabled");
                    out.push(Action::Notify(ServiceEvent::NotificationEnabled));
                    self.state = State::AwaitingSalt;
                } else if !retried {
                    warn!("handshake: CCCD write failed, retrying once");
                    self.state = State::EnablingNotifications { retried: true };
                    self.write_cccd(out);
                } else {
                    return Progress::Failed(HandshakeError::NotifyEnable);
                }
                Progress::Pending
            }
            State::SendingFirstHalf { second } if attr == self.handles.sign => {
                if !ok {
                    return Progress::Failed(HandshakeError::SignatureWrite);
                }
                out.push(Action::Write {
                    handle: self.conn,
                    attr: self.handles.sign,
                    data: signature_part(Command::Sign2, &second),
                });
                self.state = State::SendingSecondHalf;
                Progress::Pending
            }
            State::SendingSecondHalf if attr == self.handles.sign => {
                if !ok {
                    return Progress::Failed(HandshakeError::SignatureWrite);
                }
                info!("handshake: signature sent");
                out.push(Action::Notify(ServiceEvent::DoneSendingSignature));
                self.state = State::Done;
                Progress::Done {
                    peer_time: self.peer_time,
                }
            }
            _ => {
                warn!("handshake: unexpected write complete on {=u16}", attr);
                Progress::Pending
            }
        }
    }

    /// A notification or SIGN read response carrying a salt.
    pub fn on_salt(&mut self, data: &[u8], out: &mut Outbox) -> Progress {
        if self.state != State::AwaitingSalt {
            warn!("handshake: salt out of order, ignored");
            return Progress::Pending;
        }
        let Some(salt) = parse_salt(data) else {
            return Progress::Failed(HandshakeError::MalformedSalt);
        };
        debug!("handshake: salt {:?}", salt);
        out.push(Action::Notify(ServiceEvent::ReceivedSalt));
        out.push(Action::Read {
            handle: self.conn,
            attr: self.handles.time,
        });
        self.state = State::AwaitingTime { salt };
        Progress::Pending
    }

    /// TIME read response.
    pub fn on_time(
        &mut self,
        ok: bool,
        data: &[u8],
        signer: &impl Signer,
        out: &mut Outbox,
    ) -> Progress {
        let State::AwaitingTime { salt } = self.state else {
            warn!("handshake: time out of order, ignored");
            return Progress::Pending;
        };
        if !ok {
            return Progress::Failed(HandshakeError::TimeRead);
        }
        let Some(time) = parse_time(data) else {
            return Progress::Failed(HandshakeError::MalformedTime);
        };
        out.push(Action::Notify(ServiceEvent::ReceivedTime));
        let Some(signature) = signer.sign(&salt, time) else {
            return Progress::Failed(HandshakeError::Signing);
        };
        self.peer_time = time;
        let (first, second) = split(&signature);
        out.push(Action::Write {
            handle: self.conn,
            attr: self.handles.sign,
            data: signature_part(Command::Sign1, &first),
        });
        self.state = State::SendingFirstHalf { second };
        Progress::Pending
    }
}

fn split(signature: &Signature) -> ([u8; SIGNATURE_PART_SIZE], [u8; SIGNATURE_PART_SIZE]) {
    let mut first = [0u8; SIGNATURE_PART_SIZE];
    let mut second = [0u8; SIGNATURE_PART_SIZE];
    first.copy_from_slice(&signature[..SIGNATURE_PART_SIZE]);
    second.copy_from_slice(&signature[SIGNATURE_PART_SIZE..]);
    (first, second)
}

/// `[SALT][salt]` message, as a BLEAM sends it.
pub fn salt_message(salt: &Salt) -> heapless::Vec<u8, { 1 + SALT_SIZE }> {
    let mut msg = heapless::Vec::new();
    let _ = msg.push(Command::Salt as u8);
    let _ = msg.extend_from_slice(salt);
    msg
}
