//! Connection manager - the single dispatch point of the scanner.
//!
//! ```text
//!  Idle ─StartScan─▶ Scanning ─window full─▶ Connecting ─Connected─▶ ParamNegotiation
//!                       ▲                                                  │
//!                       │                                             Discovering
//!                       │                                                  │
//!                  (resume) ◀── Disconnected ◀── Active(mode) ◀── Authenticating
//!                                                     │    ▲
//!                                           DFU/REBOOT/UNCONFIG  countersigned
//!                                                     ▼    │
//!                                                 ConfirmingMode
//! ```
//!
//! Every radio event, write completion and timer firing goes through
//! [`ConnectionManager::dispatch`]. Handlers run to completion and only
//! push [`Action`]s; nothing here blocks or calls back into the link.
//! A link-layer disconnect wins over whatever the session was doing.

use crate::ble::adv_parser::{bleam_id_from_advertisement, is_apple_background};
use crate::bleam::discovery::{HandleSet, HandleSetBuilder};
use crate::bleam::eco::EcoSchedule;
use crate::bleam::event::{Action, Event, Outbox, TimerId};
use crate::bleam::handshake::{Handshake, Progress};
use crate::bleam::identity::IdentityCorrelator;
use crate::bleam::mode::{ModeController, Phase, Verdict};
use crate::bleam::peers::PeerStore;
use crate::bleam::protocol::{
    parse_signature_part, signature_part, within_data_len, Characteristic, Command, HealthEvent, Mode,
    RangingSample, ServiceEvent, CCCD_OFF,
};
use crate::bleam::signer::{Salt, Signature, Signer};
use crate::bleam::telemetry::{Completion, Telemetry};
use crate::bleam::types::{payload, Address, AttHandle, BleamId, ConnHandle};
use crate::config::{ScannerConfig, SIGNATURE_PART_SIZE};
use crate::error::{DiscoveryError, DisconnectReason, Error, HandshakeError};

/// Timers owned by a session; all cancelled when it ends.
const SESSION_TIMERS: [TimerId; 4] = [
    TimerId::ParamUpdate,
    TimerId::Discovery,
    TimerId::Handshake,
    TimerId::Inactivity,
];

const MS_PER_DAY: u64 = 86_400_000;

/// Externally visible state of the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    ParamNegotiation,
    Discovering,
    Authenticating,
    Active(Mode),
    /// Waiting for the peer to countersign a request for this mode.
    ConfirmingMode(Mode),
    /// Disconnect requested, waiting for the link to confirm.
    Disconnected,
}

#[derive(Debug)]
enum Stage {
    ParamNegotiation { attempts: u8, errors: u8 },
    Discovering(HandleSetBuilder),
    Authenticating { handles: HandleSet, handshake: Handshake },
    Active { handles: HandleSet, disabling_notifications: bool },
    /// Active session holding a terminal mode request until the peer signs
    /// our challenge salt.
    ConfirmingMode {
        handles: HandleSet,
        mode: Mode,
        salt: Option<Salt>,
        first_half: Option<[u8; SIGNATURE_PART_SIZE]>,
    },
}

/// Peer time of day (ms since midnight) and our clock when it was read.
#[derive(Clone, Copy, Debug)]
struct PeerClock {
    time_of_day: u32,
    at: u64,
}

#[derive(Debug)]
struct Session {
    handle: ConnHandle,
    address: Address,
    id: BleamId,
    stage: Stage,
    mode: ModeController,
    telemetry: Telemetry,
    last_activity: u64,
    authenticated: bool,
    clock: Option<PeerClock>,
}

#[derive(Debug)]
enum Link {
    Idle,
    Scanning,
    Connecting {
        address: Address,
        id: BleamId,
    },
    InSession(Session),
    Closing {
        handle: ConnHandle,
        address: Address,
        id: BleamId,
        authenticated: bool,
        reason: DisconnectReason,
    },
}

/// What a session handler wants the manager to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Next {
    Stay,
    Activate { peer_time: u32 },
    Disconnect(DisconnectReason),
}

/// Where the eco duty cycle stands while scanning is wanted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EcoPhase {
    /// Scanning; `nearby` once a BLEAM was heard in this window.
    Window { nearby: bool },
    Sleeping,
}

impl From<Progress> for Next {
    fn from(p: Progress) -> Self {
        match p {
            Progress::Pending => Next::Stay,
            Progress::Done { peer_time } => Next::Activate { peer_time },
            Progress::Failed(e) => {
                warn!("handshake aborted: {:?}", e);
                Next::Disconnect(e.into())
            }
        }
    }
}

impl Session {
    fn new(handle: ConnHandle, address: Address, id: BleamId, config: &ScannerConfig, now: u64) -> Self {
        Self {
            handle,
            address,
            id,
            stage: Stage::ParamNegotiation {
                attempts: 0,
                errors: 0,
            },
            mode: ModeController::new(),
            telemetry: Telemetry::new(config),
            last_activity: now,
            authenticated: false,
            clock: None,
        }
    }

    fn state(&self) -> SessionState {
        match self.stage {
            Stage::ParamNegotiation { .. } => SessionState::ParamNegotiation,
            Stage::Discovering(_) => SessionState::Discovering,
            Stage::Authenticating { .. } => SessionState::Authenticating,
            Stage::Active { .. } => SessionState::Active(self.mode.mode()),
            Stage::ConfirmingMode { mode, .. } => SessionState::ConfirmingMode(mode),
        }
    }

    fn start_discovery(&mut self, config: &ScannerConfig, out: &mut Outbox) {
        info!("session: discovering services");
        out.push(Action::CancelTimer(TimerId::ParamUpdate));
        self.stage = Stage::Discovering(HandleSetBuilder::for_bleam(self.id));
        out.push(Action::DiscoverServices {
            handle: self.handle,
            id: self.id,
        });
        out.push(Action::StartTimer {
            timer: TimerId::Discovery,
            after_ms: config.discovery_timeout_ms,
        });
    }

    /// Run the telemetry send loops if the session is active.
    fn pump(&mut self, now: u64, out: &mut Outbox) {
        let Stage::Active { handles, .. } = &self.stage else {
            return;
        };
        if self
            .telemetry
            .pump(self.handle, handles, self.mode.ranging_enabled(), out)
            > 0
        {
            self.last_activity = now;
        }
    }

    fn on_param_timer(&mut self, config: &ScannerConfig, out: &mut Outbox) -> Next {
        let Stage::ParamNegotiation { attempts, .. } = &mut self.stage else {
            return Next::Stay;
        };
        if *attempts >= config.param_update_max_attempts {
            info!("session: no answer to parameter updates, continuing");
            self.start_discovery(config, out);
            return Next::Stay;
        }
        *attempts += 1;
        debug!("session: parameter update attempt {=u8}", *attempts);
        out.push(Action::UpdateConnParams {
            handle: self.handle,
            params: config.conn_params,
        });
        out.push(Action::StartTimer {
            timer: TimerId::ParamUpdate,
            after_ms: config.param_update_next_delay_ms,
        });
        Next::Stay
    }

    fn on_params_updated(&mut self, config: &ScannerConfig, interval: u16, out: &mut Outbox) -> Next {
        if !matches!(self.stage, Stage::ParamNegotiation { .. }) {
            debug!("session: parameters changed to {=u16}", interval);
            return Next::Stay;
        }
        if config.conn_params.accepts_interval(interval) {
            self.start_discovery(config, out);
        } else {
            debug!("session: interval {=u16} outside requested range", interval);
        }
        Next::Stay
    }

    fn on_params_rejected(&mut self, config: &ScannerConfig) -> Next {
        let Stage::ParamNegotiation { errors, .. } = &mut self.stage else {
            return Next::Stay;
        };
        *errors += 1;
        warn!("session: parameter update rejected ({=u8})", *errors);
        if *errors >= config.param_update_max_attempts {
            Next::Disconnect(DisconnectReason::BadConnection)
        } else {
            Next::Stay
        }
    }

    fn on_discovery_complete(&mut self, config: &ScannerConfig, ok: bool, out: &mut Outbox) -> Next {
        let Stage::Discovering(builder) = &mut self.stage else {
            return Next::Stay;
        };
        out.push(Action::CancelTimer(TimerId::Discovery));
        let result = if ok {
            core::mem::take(builder).finish()
        } else {
            Err(DiscoveryError::Procedure)
        };
        match result {
            Ok(handles) => {
                info!("session: BLEAM service complete, authenticating");
                out.push(Action::Notify(ServiceEvent::DiscoveryComplete));
                let handshake = Handshake::start(self.handle, handles, out);
                out.push(Action::StartTimer {
                    timer: TimerId::Handshake,
                    after_ms: config.handshake_timeout_ms,
                });
                self.stage = Stage::Authenticating { handles, handshake };
                Next::Stay
            }
            Err(e) => {
                warn!("session: {:?}", e);
                Next::Disconnect(e.into())
            }
        }
    }

    fn on_notification(
        &mut self,
        now: u64,
        attr: AttHandle,
        data: &[u8],
        config: &ScannerConfig,
        signer: &impl Signer,
        out: &mut Outbox,
    ) -> Next {
        if !within_data_len(data) {
            warn!("session: oversized notification ({=usize} bytes) dropped", data.len());
            return Next::Stay;
        }
        let Some(&first) = data.first() else {
            warn!("session: empty notification dropped");
            return Next::Stay;
        };
        let cmd = match Command::try_from(first) {
            Ok(cmd) => cmd,
            Err(byte) => {
                warn!("session: unknown command {=u8}", byte);
                return Next::Stay;
            }
        };
        match &mut self.stage {
            Stage::Authenticating { handles, handshake } => {
                if !matches!(
                    handles.characteristic(attr),
                    Some(Characteristic::Notify | Characteristic::Sign)
                ) {
                    return Next::Stay;
                }
                match self.mode.handle_command(cmd, Phase::Authenticating) {
                    Verdict::Handshake if cmd == Command::Salt => handshake.on_salt(data, out).into(),
                    Verdict::Handshake => {
                        warn!("session: {:?} is ours to send, ignored", cmd);
                        Next::Stay
                    }
                    _ => Next::Stay,
                }
            }
            Stage::Active { handles, .. } => {
                if handles.characteristic(attr) != Some(Characteristic::Notify) {
                    return Next::Stay;
                }
                self.last_activity = now;
                if let Verdict::Challenge(mode) = self.mode.handle_command(cmd, Phase::Active) {
                    self.stage = Stage::ConfirmingMode {
                        handles: *handles,
                        mode,
                        salt: None,
                        first_half: None,
                    };
                    out.push(Action::GenerateSalt { handle: self.handle });
                    out.push(Action::StartTimer {
                        timer: TimerId::Handshake,
                        after_ms: config.handshake_timeout_ms,
                    });
                }
                Next::Stay
            }
            Stage::ConfirmingMode { handles, .. } => {
                if handles.characteristic(attr) != Some(Characteristic::Notify) {
                    return Next::Stay;
                }
                self.last_activity = now;
                match self.mode.handle_command(cmd, Phase::ConfirmingMode) {
                    Verdict::Countersignature => self.on_countersignature(cmd, data, signer, out),
                    _ => Next::Stay,
                }
            }
            _ => {
                self.mode.handle_command(cmd, Phase::Setup);
                Next::Stay
            }
        }
    }

    /// Our challenge salt is ready; send it to the peer on SIGN.
    fn on_salt_generated(&mut self, generated: Salt, out: &mut Outbox) -> Next {
        let Stage::ConfirmingMode { handles, salt, .. } = &mut self.stage else {
            debug!("session: challenge salt without pending mode ignored");
            return Next::Stay;
        };
        if salt.is_some() {
            return Next::Stay;
        }
        *salt = Some(generated);
        out.push(Action::Write {
            handle: self.handle,
            attr: handles.sign,
            data: signature_part(Command::Salt, &generated),
        });
        Next::Stay
    }

    /// SIGN1 then SIGN2 must carry HMAC(app key, challenge salt || peer
    /// time). Anything else ends the session.
    fn on_countersignature(&mut self, cmd: Command, data: &[u8], signer: &impl Signer, out: &mut Outbox) -> Next {
        let refused = Next::Disconnect(HandshakeError::Countersignature.into());
        let Stage::ConfirmingMode {
            handles,
            mode,
            salt,
            first_half,
        } = &mut self.stage
        else {
            return Next::Stay;
        };
        let Some(salt) = salt else {
            warn!("session: countersignature before our challenge");
            return refused;
        };
        let Some(part) = parse_signature_part(cmd, data) else {
            warn!("session: malformed {:?}", cmd);
            return refused;
        };
        let first = match (cmd, *first_half) {
            (Command::Sign1, None) => {
                *first_half = Some(part);
                return Next::Stay;
            }
            (Command::Sign2, Some(first)) => first,
            _ => {
                warn!("session: {:?} out of order", cmd);
                return refused;
            }
        };
        let mut signature: Signature = [0; SIGNATURE_PART_SIZE * 2];
        signature[..SIGNATURE_PART_SIZE].copy_from_slice(&first);
        signature[SIGNATURE_PART_SIZE..].copy_from_slice(&part);
        let time = self.clock.map_or(0, |clock| clock.time_of_day);
        if !signer.verify(salt, time, &signature) {
            warn!("session: countersignature does not verify");
            return refused;
        }

        let (handles, mode) = (*handles, *mode);
        out.push(Action::CancelTimer(TimerId::Handshake));
        self.mode.confirm(mode);
        out.push(Action::ModeRequested(mode));
        out.push(Action::Write {
            handle: self.handle,
            attr: handles.control_cccd,
            data: payload(&CCCD_OFF),
        });
        self.stage = Stage::Active {
            handles,
            disabling_notifications: true,
        };
        Next::Stay
    }

    fn on_read_response(
        &mut self,
        attr: AttHandle,
        ok: bool,
        data: &[u8],
        signer: &impl Signer,
        out: &mut Outbox,
    ) -> Next {
        if !within_data_len(data) {
            warn!("session: oversized read response ({=usize} bytes) dropped", data.len());
            return Next::Stay;
        }
        let Stage::Authenticating { handles, handshake } = &mut self.stage else {
            debug!("session: read response outside handshake ignored");
            return Next::Stay;
        };
        if attr == handles.time {
            handshake.on_time(ok, data, signer, out).into()
        } else if attr == handles.sign && ok {
            handshake.on_salt(data, out).into()
        } else {
            Next::Stay
        }
    }

    fn on_write_complete(
        &mut self,
        now: u64,
        attr: AttHandle,
        ok: bool,
        config: &ScannerConfig,
        out: &mut Outbox,
    ) -> Next {
        match &mut self.stage {
            Stage::Authenticating { handshake, .. } => handshake.on_write_complete(attr, ok, out).into(),
            Stage::ConfirmingMode { handles, .. } => {
                if attr == handles.sign {
                    return if ok {
                        debug!("session: challenge sent");
                        Next::Stay
                    } else {
                        warn!("session: challenge write failed");
                        Next::Disconnect(DisconnectReason::BadConnection)
                    };
                }
                // Telemetry resumes, if at all, once the mode is settled.
                match self.telemetry.on_write_complete(handles, attr, ok) {
                    Completion::Failed(stream) => {
                        warn!("session: {:?} write failed", stream);
                        Next::Disconnect(DisconnectReason::BadConnection)
                    }
                    _ => Next::Stay,
                }
            }
            Stage::Active {
                handles,
                disabling_notifications,
            } => {
                if attr == handles.control_cccd && *disabling_notifications {
                    *disabling_notifications = false;
                    if ok {
                        out.push(Action::Notify(ServiceEvent::NotificationDisabled));
                    } else {
                        warn!("session: disabling notifications failed");
                    }
                    return Next::Stay;
                }
                match self.telemetry.on_write_complete(handles, attr, ok) {
                    Completion::NotOurs => Next::Stay,
                    Completion::Failed(stream) => {
                        warn!("session: {:?} write failed", stream);
                        Next::Disconnect(DisconnectReason::BadConnection)
                    }
                    Completion::Sent { drained: true, .. } => {
                        info!("session: telemetry drained");
                        out.push(Action::Notify(ServiceEvent::DoneSending));
                        if config.close_when_drained {
                            Next::Disconnect(DisconnectReason::Completed)
                        } else {
                            Next::Stay
                        }
                    }
                    Completion::Sent { drained: false, .. } => {
                        if self
                            .telemetry
                            .pump(self.handle, handles, self.mode.ranging_enabled(), out)
                            > 0
                        {
                            self.last_activity = now;
                        }
                        Next::Stay
                    }
                }
            }
            _ => {
                debug!("session: write complete on {=u16} ignored", attr);
                Next::Stay
            }
        }
    }

    fn on_inactivity_timer(&mut self, now: u64, config: &ScannerConfig, out: &mut Outbox) -> Next {
        if !matches!(self.stage, Stage::Active { .. } | Stage::ConfirmingMode { .. }) {
            return Next::Stay;
        }
        let idle = now.saturating_sub(self.last_activity);
        if idle >= config.inactivity_timeout_ms {
            warn!("session: inactive for {=u64} ms", idle);
            return Next::Disconnect(DisconnectReason::Inactivity);
        }
        out.push(Action::StartTimer {
            timer: TimerId::Inactivity,
            after_ms: config.inactivity_timeout_ms - idle,
        });
        Next::Stay
    }
}

/// Owns the whole scanner context: scan filtering, the current session,
/// identity lists and the known-peer store.
pub struct ConnectionManager<S, P> {
    config: ScannerConfig,
    signer: S,
    peers: P,
    identity: IdentityCorrelator,
    link: Link,
    scan_wanted: bool,
    sweep_armed: bool,
    eco_phase: EcoPhase,
    /// Last peer clock reading; survives the session it came from.
    system_clock: Option<PeerClock>,
    last_disconnect: Option<DisconnectReason>,
}

impl<S: Signer, P: PeerStore> ConnectionManager<S, P> {
    pub fn new(config: ScannerConfig, signer: S, peers: P) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            identity: IdentityCorrelator::new(config.identity_ttl_ms),
            config,
            signer,
            peers,
            link: Link::Idle,
            scan_wanted: false,
            sweep_armed: false,
            eco_phase: EcoPhase::Sleeping,
            system_clock: None,
            last_disconnect: None,
        })
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        match &self.link {
            Link::Idle => SessionState::Idle,
            Link::Scanning => SessionState::Scanning,
            Link::Connecting { .. } => SessionState::Connecting,
            Link::InSession(session) => session.state(),
            Link::Closing { .. } => SessionState::Disconnected,
        }
    }

    /// Mode of the current session (`None` without one).
    pub fn mode(&self) -> Mode {
        match &self.link {
            Link::InSession(session) => session.mode.mode(),
            _ => Mode::None,
        }
    }

    pub fn conn_handle(&self) -> Option<ConnHandle> {
        match &self.link {
            Link::InSession(session) => Some(session.handle),
            Link::Closing { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// BLEAM of the current (or connecting) session.
    pub fn peer_id(&self) -> Option<BleamId> {
        match &self.link {
            Link::Connecting { id, .. } | Link::Closing { id, .. } => Some(*id),
            Link::InSession(session) => Some(session.id),
            _ => None,
        }
    }

    pub fn telemetry(&self) -> Option<&Telemetry> {
        match &self.link {
            Link::InSession(session) => Some(&session.telemetry),
            _ => None,
        }
    }

    /// Why the last session ended.
    pub fn last_disconnect(&self) -> Option<DisconnectReason> {
        self.last_disconnect
    }

    /// Peer time of day (ms since midnight) extrapolated to `now`, once the
    /// handshake has read it.
    pub fn peer_time(&self, now: u64) -> Option<u32> {
        let Link::InSession(Session {
            clock: Some(clock), ..
        }) = &self.link
        else {
            return None;
        };
        let elapsed = now.saturating_sub(clock.at);
        Some(((clock.time_of_day as u64 + elapsed) % MS_PER_DAY) as u32)
    }

    /// Scanner time of day (ms since midnight). Counts from boot until a
    /// handshake has read the time from a BLEAM.
    pub fn system_time(&self, now: u64) -> u32 {
        let (base, at) = self
            .system_clock
            .map_or((0, 0), |clock| (clock.time_of_day as u64, clock.at));
        ((base + now.saturating_sub(at)) % MS_PER_DAY) as u32
    }

    /// Whether the eco cycle currently has the radio asleep.
    pub fn eco_sleeping(&self) -> bool {
        self.config.eco.is_some() && self.eco_phase == EcoPhase::Sleeping && matches!(self.link, Link::Idle)
    }

    pub fn identity(&self) -> &IdentityCorrelator {
        &self.identity
    }

    pub fn peers(&self) -> &P {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut P {
        &mut self.peers
    }

    /// Queue a ranging sample for the current session.
    pub fn enqueue_ranging(&mut self, now: u64, sample: RangingSample, out: &mut Outbox) -> Result<(), Error> {
        let Link::InSession(session) = &mut self.link else {
            return Err(Error::NoSession);
        };
        session.telemetry.enqueue_ranging(sample)?;
        session.pump(now, out);
        Ok(())
    }

    /// Queue a health event for the current session.
    pub fn enqueue_health(&mut self, now: u64, event: HealthEvent, out: &mut Outbox) -> Result<(), Error> {
        let Link::InSession(session) = &mut self.link else {
            return Err(Error::NoSession);
        };
        session.telemetry.enqueue_health(event)?;
        session.pump(now, out);
        Ok(())
    }

    /// Feed one event; resulting side effects are appended to `out`.
    pub fn dispatch(&mut self, now: u64, event: Event, out: &mut Outbox) {
        match event {
            Event::StartScan => self.start_scan(now, out),
            Event::StopScan => self.stop_scan(out),
            Event::ScanReport {
                address,
                rssi,
                data,
            } => self.on_scan_report(now, address, rssi, &data, out),
            Event::Connected { handle, address } => self.on_connected(now, handle, address, out),
            Event::ConnectFailed { address } => self.on_connect_failed(now, address, out),
            Event::Disconnected { handle, reason } => self.on_disconnected(now, handle, reason, out),
            Event::TimerFired(timer) => self.on_timer(now, timer, out),
            other => self.on_session_event(now, other, out),
        }
    }

    fn start_scan(&mut self, now: u64, out: &mut Outbox) {
        self.scan_wanted = true;
        if !self.sweep_armed {
            self.sweep_armed = true;
            out.push(Action::StartTimer {
                timer: TimerId::IdentitySweep,
                after_ms: self.config.identity_sweep_ms,
            });
        }
        if let Link::Idle = self.link {
            self.resume_scan(now, out);
        } else {
            debug!("scanner: scan resumes after the current session");
        }
    }

    fn stop_scan(&mut self, out: &mut Outbox) {
        self.scan_wanted = false;
        if self.config.eco.is_some() {
            self.eco_phase = EcoPhase::Sleeping;
            out.push(Action::CancelTimer(TimerId::EcoCycle));
        }
        if let Link::Scanning = self.link {
            info!("scanner: idle");
            self.link = Link::Idle;
            out.push(Action::StopScan);
        }
    }

    /// Go (back) to scanning, through a fresh eco window when duty cycling.
    fn resume_scan(&mut self, now: u64, out: &mut Outbox) {
        self.link = Link::Scanning;
        out.push(Action::StartScan);
        match self.config.eco {
            Some(eco) => {
                info!("scanner: eco window open");
                self.identity.sweep(now);
                self.eco_phase = EcoPhase::Window { nearby: false };
                out.push(Action::StartTimer {
                    timer: TimerId::EcoCycle,
                    after_ms: eco.scan_window_ms,
                });
            }
            None => info!("scanner: scanning"),
        }
    }

    fn on_eco_timer(&mut self, now: u64, eco: EcoSchedule, out: &mut Outbox) {
        match (self.eco_phase, self.state()) {
            (EcoPhase::Window { nearby: true }, SessionState::Scanning) => {
                debug!("scanner: BLEAMs around, window extended");
                self.eco_phase = EcoPhase::Window { nearby: false };
                out.push(Action::StartTimer {
                    timer: TimerId::EcoCycle,
                    after_ms: eco.scan_window_ms,
                });
            }
            (EcoPhase::Window { nearby: false }, SessionState::Scanning) => {
                let sleep = eco.until_next_wake(self.system_time(now));
                info!("scanner: nothing heard, sleeping {=u64} ms", sleep);
                self.link = Link::Idle;
                self.eco_phase = EcoPhase::Sleeping;
                out.push(Action::StopScan);
                out.push(Action::StartTimer {
                    timer: TimerId::EcoCycle,
                    after_ms: sleep,
                });
            }
            (EcoPhase::Sleeping, SessionState::Idle) if self.scan_wanted => self.resume_scan(now, out),
            _ => debug!("scanner: eco timer ignored"),
        }
    }

    fn on_scan_report(&mut self, now: u64, address: Address, rssi: i8, data: &[u8], out: &mut Outbox) {
        if !matches!(self.link, Link::Scanning) {
            return;
        }
        let id = match bleam_id_from_advertisement(data) {
            Some(id) => {
                if let Err(e) = self.identity.whitelist(address, id, now) {
                    warn!("scanner: whitelist: {:?}", e);
                }
                id
            }
            None if is_apple_background(data) => {
                match self.identity.lookup_whitelist(&address, now).and_then(|r| r.id) {
                    Some(id) => id,
                    None => return,
                }
            }
            None => return,
        };
        if self.identity.is_blacklisted(&address, Some(&id), now) {
            debug!("scanner: {:?} is blacklisted", address);
            return;
        }
        if let EcoPhase::Window { nearby } = &mut self.eco_phase {
            *nearby = true;
        }
        let sample = RangingSample {
            sender: self.config.node_id,
            rssi,
            aoa: 0,
            timestamp: now,
        };
        let window = self.config.samples_before_connect;
        if !self.peers.record_sample(id, address, sample, now, window) {
            return;
        }
        info!("scanner: connecting to {:?}", address);
        out.push(Action::StopScan);
        out.push(Action::Connect {
            address,
            params: self.config.conn_params,
        });
        self.link = Link::Connecting { address, id };
    }

    fn on_connected(&mut self, now: u64, handle: ConnHandle, address: Address, out: &mut Outbox) {
        let Link::Connecting { address: expected, id } = self.link else {
            warn!("scanner: unexpected connection {=u16}, closing", handle);
            out.push(Action::Disconnect { handle });
            return;
        };
        if address != expected {
            warn!("scanner: connected to {:?}, expected {:?}", address, expected);
        }
        info!("session: connected, handle {=u16}", handle);
        self.link = Link::InSession(Session::new(handle, address, id, &self.config, now));
        out.push(Action::StartTimer {
            timer: TimerId::ParamUpdate,
            after_ms: self.config.param_update_first_delay_ms,
        });
    }

    fn on_connect_failed(&mut self, now: u64, address: Address, out: &mut Outbox) {
        let Link::Connecting { id, .. } = self.link else {
            return;
        };
        warn!("scanner: connection to {:?} failed", address);
        out.push(Action::Notify(ServiceEvent::BadConnection));
        self.identity.blacklist(address, Some(id), now);
        self.last_disconnect = Some(DisconnectReason::BadConnection);
        if self.scan_wanted {
            self.resume_scan(now, out);
        } else {
            self.link = Link::Idle;
        }
    }

    fn on_disconnected(&mut self, now: u64, handle: ConnHandle, reason: u8, out: &mut Outbox) {
        let (address, id, authenticated, cause) = match &mut self.link {
            Link::InSession(session) if session.handle == handle => {
                for timer in SESSION_TIMERS {
                    out.push(Action::CancelTimer(timer));
                }
                session.telemetry.clear();
                (
                    session.address,
                    session.id,
                    session.authenticated,
                    DisconnectReason::Link(reason),
                )
            }
            Link::Closing {
                handle: closing,
                address,
                id,
                authenticated,
                reason: cause,
            } if *closing == handle => (*address, *id, *authenticated, *cause),
            _ => {
                debug!("scanner: disconnect of {=u16} ignored", handle);
                return;
            }
        };
        info!("session: disconnected (reason {=u8:#x})", reason);
        if authenticated {
            self.identity.set_active(&address, false, now);
        }
        self.peers.remove(&id);
        self.last_disconnect = Some(cause);
        out.push(Action::Notify(ServiceEvent::Disconnected));
        if self.scan_wanted && self.config.resume_scan_after_session {
            self.resume_scan(now, out);
        } else {
            self.link = Link::Idle;
        }
    }

    fn on_timer(&mut self, now: u64, timer: TimerId, out: &mut Outbox) {
        match timer {
            TimerId::IdentitySweep => {
                self.identity.sweep(now);
                out.push(Action::StartTimer {
                    timer: TimerId::IdentitySweep,
                    after_ms: self.config.identity_sweep_ms,
                });
                return;
            }
            TimerId::EcoCycle => {
                if let Some(eco) = self.config.eco {
                    self.on_eco_timer(now, eco, out);
                }
                return;
            }
            _ => {}
        }
        let Link::InSession(session) = &mut self.link else {
            debug!("scanner: stale {:?} timer ignored", timer);
            return;
        };
        let next = match timer {
            TimerId::ParamUpdate => session.on_param_timer(&self.config, out),
            TimerId::Discovery if matches!(session.stage, Stage::Discovering(_)) => {
                warn!("session: discovery timed out");
                Next::Disconnect(DisconnectReason::DiscoveryTimeout)
            }
            TimerId::Handshake
                if matches!(
                    session.stage,
                    Stage::Authenticating { .. } | Stage::ConfirmingMode { .. }
                ) =>
            {
                warn!("session: no answer from the peer in time");
                Next::Disconnect(DisconnectReason::HandshakeTimeout)
            }
            TimerId::Inactivity => session.on_inactivity_timer(now, &self.config, out),
            _ => Next::Stay,
        };
        self.apply(now, next, out);
    }

    fn on_session_event(&mut self, now: u64, event: Event, out: &mut Outbox) {
        let Link::InSession(session) = &mut self.link else {
            debug!("scanner: {:?} without session ignored", event);
            return;
        };
        if event.conn_handle() != Some(session.handle) {
            debug!("session: event for stale handle ignored");
            return;
        }
        let next = match event {
            Event::ConnParamsUpdated { interval, .. } => {
                session.on_params_updated(&self.config, interval, out)
            }
            Event::ConnParamsRejected { .. } => session.on_params_rejected(&self.config),
            Event::ConnParamsRequested { params, .. } => {
                out.push(Action::UpdateConnParams {
                    handle: session.handle,
                    params: self.config.conn_params.reconcile(&params),
                });
                Next::Stay
            }
            Event::ServiceDiscovered { uuid, .. } => {
                if let Stage::Discovering(builder) = &mut session.stage {
                    builder.on_service(&uuid);
                }
                Next::Stay
            }
            Event::CharacteristicDiscovered {
                uuid16,
                value_handle,
                cccd_handle,
                ..
            } => {
                if let Stage::Discovering(builder) = &mut session.stage {
                    builder.on_characteristic(uuid16, value_handle, cccd_handle);
                }
                Next::Stay
            }
            Event::DiscoveryComplete { ok, .. } => session.on_discovery_complete(&self.config, ok, out),
            Event::Notification { attr, data, .. } => {
                session.on_notification(now, attr, &data, &self.config, &self.signer, out)
            }
            Event::SaltGenerated { salt, .. } => session.on_salt_generated(salt, out),
            Event::ReadResponse { attr, ok, data, .. } => {
                session.on_read_response(attr, ok, &data, &self.signer, out)
            }
            Event::WriteComplete { attr, ok, .. } => {
                session.on_write_complete(now, attr, ok, &self.config, out)
            }
            _ => Next::Stay,
        };
        self.apply(now, next, out);
    }

    fn apply(&mut self, now: u64, next: Next, out: &mut Outbox) {
        match next {
            Next::Stay => {}
            Next::Activate { peer_time } => self.activate(now, peer_time, out),
            Next::Disconnect(reason) => self.force_disconnect(now, reason, out),
        }
    }

    fn activate(&mut self, now: u64, peer_time: u32, out: &mut Outbox) {
        let Link::InSession(session) = &mut self.link else {
            return;
        };
        let Stage::Authenticating { handles, .. } = session.stage else {
            return;
        };
        out.push(Action::CancelTimer(TimerId::Handshake));
        session.stage = Stage::Active {
            handles,
            disabling_notifications: false,
        };
        session.mode.enter_active();
        session.authenticated = true;
        session.last_activity = now;
        let clock = PeerClock {
            time_of_day: peer_time,
            at: now,
        };
        session.clock = Some(clock);
        self.system_clock = Some(clock);
        if let Err(e) = self.identity.whitelist(session.address, session.id, now) {
            warn!("session: whitelist: {:?}", e);
        }
        self.identity.set_active(&session.address, true, now);
        info!("session: active");
        out.push(Action::Notify(ServiceEvent::Connected));
        out.push(Action::StartTimer {
            timer: TimerId::Inactivity,
            after_ms: self.config.inactivity_timeout_ms,
        });

        if let Some(mut record) = self.peers.get(&session.id).cloned() {
            for sample in record.samples.iter() {
                if session.telemetry.enqueue_ranging(*sample).is_err() {
                    debug!("session: ranging queue full, scan samples truncated");
                    break;
                }
            }
            record.samples.clear();
            self.peers.put(record);
        }
        session.pump(now, out);
    }

    /// Tear the session down from our side. The link's disconnect event
    /// completes it.
    fn force_disconnect(&mut self, now: u64, reason: DisconnectReason, out: &mut Outbox) {
        if !matches!(self.link, Link::InSession(_)) {
            return;
        }
        let Link::InSession(session) = core::mem::replace(&mut self.link, Link::Idle) else {
            return;
        };
        info!("session: closing ({:?})", reason);
        for timer in SESSION_TIMERS {
            out.push(Action::CancelTimer(timer));
        }
        out.push(Action::Disconnect {
            handle: session.handle,
        });
        match reason {
            DisconnectReason::ServiceNotFound => {
                out.push(Action::Notify(ServiceEvent::ServiceNotFound))
            }
            DisconnectReason::Completed | DisconnectReason::Link(_) => {}
            _ => out.push(Action::Notify(ServiceEvent::BadConnection)),
        }
        if reason.blacklists_peer() {
            self.identity.blacklist(session.address, Some(session.id), now);
        }
        self.link = Link::Closing {
            handle: session.handle,
            address: session.address,
            id: session.id,
            authenticated: session.authenticated,
            reason,
        };
    }
}
