//! Integration tests for the BLEAM session engine, driven through the
//! public API with a scripted link layer.

use blesc::bleam::protocol::{uuid_for, Characteristic, HealthEvent, ErrorType, SERVICE_UUID16};
use blesc::bleam::types::{AdvData, Payload};
use blesc::bleam::{
    Address, BleamId, ConnHandle, HmacSigner, KnownPeers, Mode, PeerStore, RangingSample,
    ServiceEvent, Signer, TimerId,
};
use blesc::config::{OverflowPolicy, IDENTITY_TTL_MS, INACTIVITY_TIMEOUT_MS, SALT_SIZE};
use blesc::error::HandshakeError;
use blesc::{Action, ConnectionManager, DisconnectReason, Error, Event, Outbox, ScannerConfig, SessionState};

const ID: BleamId = BleamId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA]);
const ADDR: Address = Address([0x10, 0x32, 0x54, 0x76, 0x98, 0xDA]);
const CONN: ConnHandle = 1;
const KEY: [u8; 16] = [0x5A; 16];
const SALT: [u8; SALT_SIZE] = [0xC3; SALT_SIZE];
const CHALLENGE: [u8; SALT_SIZE] = [0x9E; SALT_SIZE];
const PEER_TIME: u32 = 12 * 3_600_000;

const CONTROL: u16 = 0x10;
const CONTROL_CCCD: u16 = 0x11;
const SIGN: u16 = 0x20;
const RSSI: u16 = 0x30;
const HEALTH: u16 = 0x40;
const TIME: u16 = 0x50;

type Manager = ConnectionManager<HmacSigner, KnownPeers<8>>;

/// Manager plus the scanner clock, with helpers playing the link layer.
struct Harness {
    m: Manager,
    now: u64,
}

fn bytes(data: &[u8]) -> Payload {
    Payload::from_slice(data).unwrap()
}

fn advert() -> AdvData {
    let mut adv = AdvData::new();
    adv.extend_from_slice(&[0x02, 0x01, 0x06, 17, 0x07]).unwrap();
    adv.extend_from_slice(&uuid_for(&ID, SERVICE_UUID16)).unwrap();
    adv
}

fn salt_notification() -> Event {
    let mut data = vec![0u8];
    data.extend_from_slice(&SALT);
    Event::Notification {
        handle: CONN,
        attr: CONTROL,
        data: bytes(&data),
    }
}

fn write_complete(attr: u16) -> Event {
    Event::WriteComplete {
        handle: CONN,
        attr,
        ok: true,
    }
}

fn sample(rssi: i8) -> RangingSample {
    RangingSample {
        sender: 7,
        rssi,
        aoa: 0,
        timestamp: 0,
    }
}

impl Harness {
    fn new(config: ScannerConfig) -> Self {
        let m = ConnectionManager::new(config, HmacSigner::new(KEY), KnownPeers::new()).unwrap();
        Self { m, now: 1_000 }
    }

    fn step(&mut self, event: Event) -> Outbox {
        let mut out = Outbox::new();
        self.m.dispatch(self.now, event, &mut out);
        out
    }

    fn advance(&mut self, ms: u64) {
        self.now += ms;
    }

    fn scan_report(&mut self, rssi: i8) -> Outbox {
        self.step(Event::ScanReport {
            address: ADDR,
            rssi,
            data: advert(),
        })
    }

    /// Scan until the sample window is full and the link is up.
    fn connect(&mut self) {
        self.step(Event::StartScan);
        let window = self.m.config().samples_before_connect;
        for i in 0..window {
            self.advance(100);
            let out = self.scan_report(-60 - i as i8);
            let connects = out.iter().any(|a| matches!(a, Action::Connect { .. }));
            assert_eq!(connects, i + 1 == window);
        }
        assert_eq!(self.m.state(), SessionState::Connecting);
        self.step(Event::Connected {
            handle: CONN,
            address: ADDR,
        });
        assert_eq!(self.m.state(), SessionState::ParamNegotiation);
    }

    fn negotiate(&mut self) {
        self.advance(50);
        let out = self.step(Event::TimerFired(TimerId::ParamUpdate));
        assert!(out.iter().any(|a| matches!(a, Action::UpdateConnParams { .. })));
        let out = self.step(Event::ConnParamsUpdated {
            handle: CONN,
            interval: 160,
        });
        assert!(out.contains(&Action::DiscoverServices { handle: CONN, id: ID }));
        assert_eq!(self.m.state(), SessionState::Discovering);
    }

    fn discover(&mut self) -> Outbox {
        self.step(Event::ServiceDiscovered {
            handle: CONN,
            uuid: uuid_for(&ID, SERVICE_UUID16),
        });
        for (c, value_handle) in [
            (Characteristic::Notify, CONTROL),
            (Characteristic::Sign, SIGN),
            (Characteristic::Rssi, RSSI),
            (Characteristic::Health, HEALTH),
            (Characteristic::Time, TIME),
        ] {
            self.step(Event::CharacteristicDiscovered {
                handle: CONN,
                uuid16: c.uuid16(),
                value_handle,
                cccd_handle: (c == Characteristic::Notify).then_some(CONTROL_CCCD),
            });
        }
        self.step(Event::DiscoveryComplete { handle: CONN, ok: true })
    }

    /// Run the handshake to completion; returns the final dispatch output.
    fn authenticate(&mut self) -> Outbox {
        self.step(write_complete(CONTROL_CCCD));
        self.step(salt_notification());
        self.step(Event::ReadResponse {
            handle: CONN,
            attr: TIME,
            ok: true,
            data: bytes(&PEER_TIME.to_le_bytes()),
        });
        self.step(write_complete(SIGN));
        self.step(write_complete(SIGN))
    }

    fn activate(config: ScannerConfig) -> (Self, Outbox) {
        let mut h = Self::new(config);
        h.connect();
        h.negotiate();
        h.discover();
        let out = h.authenticate();
        assert_eq!(h.m.state(), SessionState::Active(Mode::Rssi));
        (h, out)
    }
}

fn rssi_writes(out: &Outbox) -> usize {
    out.writes().filter(|(attr, _)| *attr == RSSI).count()
}

fn control(data: &[u8]) -> Event {
    Event::Notification {
        handle: CONN,
        attr: CONTROL,
        data: bytes(data),
    }
}

/// SIGN1 and SIGN2 notifications carrying `key`'s signature of the challenge.
fn countersignature(key: [u8; 16]) -> (Event, Event) {
    let signature = HmacSigner::new(key).sign(&CHALLENGE, PEER_TIME).unwrap();
    let mut first = vec![2u8];
    first.extend_from_slice(&signature[..16]);
    let mut second = vec![3u8];
    second.extend_from_slice(&signature[16..]);
    (control(&first), control(&second))
}

impl Harness {
    /// Request `command` and answer the salt request with our challenge.
    fn challenge(&mut self, command: u8, mode: Mode) {
        let out = self.step(control(&[command]));
        assert!(out.contains(&Action::GenerateSalt { handle: CONN }));
        assert!(out.iter().any(|a| matches!(
            a,
            Action::StartTimer {
                timer: TimerId::Handshake,
                ..
            }
        )));
        assert!(!out.iter().any(|a| matches!(a, Action::ModeRequested(_))));
        assert_eq!(self.m.state(), SessionState::ConfirmingMode(mode));

        let out = self.step(Event::SaltGenerated {
            handle: CONN,
            salt: CHALLENGE,
        });
        let mut expected = vec![0u8];
        expected.extend_from_slice(&CHALLENGE);
        assert_eq!(out.writes().next(), Some((SIGN, &bytes(&expected))));
        assert!(self.step(write_complete(SIGN)).is_empty());
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Session lifecycle
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn full_session_from_scan_to_resumed_scan() {
    let config = ScannerConfig {
        node_id: 7,
        ..Default::default()
    };
    let mut h = Harness::new(config);
    h.connect();
    h.negotiate();

    let out = h.discover();
    assert_eq!(h.m.state(), SessionState::Authenticating);
    assert!(out.contains(&Action::Notify(ServiceEvent::DiscoveryComplete)));
    assert_eq!(out.writes().next(), Some((CONTROL_CCCD, &bytes(&[0x01, 0x00]))));

    let out = h.step(write_complete(CONTROL_CCCD));
    assert_eq!(out.notifications().collect::<Vec<_>>(), [ServiceEvent::NotificationEnabled]);

    let out = h.step(salt_notification());
    assert!(out.contains(&Action::Notify(ServiceEvent::ReceivedSalt)));
    assert!(out.contains(&Action::Read { handle: CONN, attr: TIME }));

    let signature = HmacSigner::new(KEY).sign(&SALT, PEER_TIME).unwrap();
    let out = h.step(Event::ReadResponse {
        handle: CONN,
        attr: TIME,
        ok: true,
        data: bytes(&PEER_TIME.to_le_bytes()),
    });
    assert!(out.contains(&Action::Notify(ServiceEvent::ReceivedTime)));
    let (attr, data) = out.writes().next().unwrap();
    assert_eq!(attr, SIGN);
    assert_eq!(data[0], 2);
    assert_eq!(&data[1..], &signature[..16]);

    let out = h.step(write_complete(SIGN));
    let (attr, data) = out.writes().next().unwrap();
    assert_eq!(attr, SIGN);
    assert_eq!(data[0], 3);
    assert_eq!(&data[1..], &signature[16..]);

    let out = h.step(write_complete(SIGN));
    assert_eq!(h.m.state(), SessionState::Active(Mode::Rssi));
    assert!(out.contains(&Action::Notify(ServiceEvent::DoneSendingSignature)));
    assert!(out.contains(&Action::Notify(ServiceEvent::Connected)));
    assert!(out.contains(&Action::CancelTimer(TimerId::Handshake)));

    // The five scan samples go out as one ranging batch.
    let (attr, data) = out.writes().next().unwrap();
    assert_eq!(attr, RSSI);
    assert_eq!(data.len(), 20);
    assert_eq!(&data[..4], &[7, 0, (-60i8) as u8, 0]);
    assert_eq!(data[16 + 2], (-64i8) as u8);

    let out = h.step(write_complete(RSSI));
    assert!(out.contains(&Action::Notify(ServiceEvent::DoneSending)));

    let health = HealthEvent::General {
        battery: 30,
        firmware_id: 8,
        uptime_min: 2,
        system_time: PEER_TIME / 1000,
        last_error_id: 0,
        last_error_type: ErrorType::HardReset,
    };
    let mut out = Outbox::new();
    h.m.enqueue_health(h.now, health, &mut out).unwrap();
    let (attr, data) = out.writes().next().unwrap();
    assert_eq!(attr, HEALTH);
    assert_eq!(data.len(), 15);

    let out = h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x13,
    });
    assert!(out.contains(&Action::Notify(ServiceEvent::Disconnected)));
    assert!(out.contains(&Action::CancelTimer(TimerId::Inactivity)));
    assert!(out.contains(&Action::StartScan));
    assert_eq!(h.m.state(), SessionState::Scanning);
    assert_eq!(h.m.last_disconnect(), Some(DisconnectReason::Link(0x13)));
    assert!(h.m.peers().get(&ID).is_none());

    let entry = h.m.identity().lookup_whitelist(&ADDR, h.now).unwrap();
    assert_eq!(entry.id, Some(ID));
    assert!(!entry.active);
}

#[test]
fn peer_time_follows_the_scanner_clock_and_wraps_at_midnight() {
    let mut h = Harness::new(ScannerConfig {
        samples_before_connect: 1,
        ..Default::default()
    });
    h.connect();
    h.negotiate();
    h.discover();
    h.step(write_complete(CONTROL_CCCD));
    h.step(salt_notification());
    assert_eq!(h.m.peer_time(h.now), None);

    let almost_midnight: u32 = 86_399_000;
    h.step(Event::ReadResponse {
        handle: CONN,
        attr: TIME,
        ok: true,
        data: bytes(&almost_midnight.to_le_bytes()),
    });
    h.step(write_complete(SIGN));
    h.step(write_complete(SIGN));

    assert_eq!(h.m.peer_time(h.now), Some(almost_midnight));
    assert_eq!(h.m.peer_time(h.now + 500), Some(86_399_500));
    assert_eq!(h.m.peer_time(h.now + 2_000), Some(1_000));
}

// ═══════════════════════════════════════════════════════════════════════════
// Handshake ordering
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn out_of_order_handshake_input_is_ignored() {
    let mut h = Harness::new(ScannerConfig::default());
    h.connect();
    h.negotiate();
    h.discover();

    // Salt before notifications are enabled.
    assert!(h.step(salt_notification()).is_empty());
    // Time before salt.
    let time = Event::ReadResponse {
        handle: CONN,
        attr: TIME,
        ok: true,
        data: bytes(&PEER_TIME.to_le_bytes()),
    };
    assert!(h.step(time.clone()).is_empty());
    // SIGN write-complete before any signature was sent.
    assert!(h.step(write_complete(SIGN)).is_empty());
    assert_eq!(h.m.state(), SessionState::Authenticating);

    h.step(write_complete(CONTROL_CCCD));
    let out = h.step(salt_notification());
    assert!(out.contains(&Action::Read { handle: CONN, attr: TIME }));

    // A second salt changes nothing.
    assert!(h.step(salt_notification()).is_empty());

    // Only SIGN1 goes out; SIGN2 waits for its completion.
    let out = h.step(time);
    let writes: Vec<_> = out.writes().collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1[0], 2);

    let out = h.step(write_complete(SIGN));
    let writes: Vec<_> = out.writes().collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1[0], 3);
}

#[test]
fn handshake_timeout_disconnects_and_blacklists_for_ttl() {
    let mut h = Harness::new(ScannerConfig {
        samples_before_connect: 1,
        ..Default::default()
    });
    h.connect();
    h.negotiate();
    h.discover();
    h.step(write_complete(CONTROL_CCCD));

    h.advance(5_000);
    let blacklisted_at = h.now;
    let out = h.step(Event::TimerFired(TimerId::Handshake));
    assert!(out.contains(&Action::Disconnect { handle: CONN }));
    assert!(out.contains(&Action::Notify(ServiceEvent::BadConnection)));
    assert_eq!(h.m.state(), SessionState::Disconnected);

    h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x16,
    });
    assert_eq!(h.m.state(), SessionState::Scanning);
    assert_eq!(h.m.last_disconnect(), Some(DisconnectReason::HandshakeTimeout));

    let ids = h.m.identity();
    assert!(ids.is_blacklisted(&ADDR, None, blacklisted_at + IDENTITY_TTL_MS - 1));
    assert!(!ids.is_blacklisted(&ADDR, None, blacklisted_at + IDENTITY_TTL_MS + 1));

    // Reports from the blacklisted BLEAM are ignored until the entry expires.
    h.advance(10);
    assert!(h.scan_report(-50).is_empty());
    h.now = blacklisted_at + IDENTITY_TTL_MS + 1;
    let out = h.scan_report(-50);
    assert!(out.contains(&Action::Connect {
        address: ADDR,
        params: h.m.config().conn_params,
    }));
}

#[test]
fn stalled_discovery_disconnects_and_blacklists() {
    let mut h = Harness::new(ScannerConfig {
        samples_before_connect: 1,
        ..Default::default()
    });
    h.connect();
    h.negotiate();
    h.step(Event::ServiceDiscovered {
        handle: CONN,
        uuid: uuid_for(&ID, SERVICE_UUID16),
    });

    h.advance(h.m.config().discovery_timeout_ms);
    let out = h.step(Event::TimerFired(TimerId::Discovery));
    assert!(out.contains(&Action::Disconnect { handle: CONN }));
    assert!(out.contains(&Action::Notify(ServiceEvent::BadConnection)));
    assert!(h.m.identity().is_blacklisted(&ADDR, Some(&ID), h.now));

    // The link layer's late discovery result changes nothing.
    assert!(h.step(Event::DiscoveryComplete { handle: CONN, ok: true }).is_empty());
    h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x16,
    });
    assert_eq!(h.m.last_disconnect(), Some(DisconnectReason::DiscoveryTimeout));
}

// ═══════════════════════════════════════════════════════════════════════════
// Telemetry flow control
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn ranging_queue_holds_depth_entries_with_one_write_outstanding() {
    let config = ScannerConfig {
        queue_depth: 4,
        ranging_per_message: 2,
        samples_before_connect: 2,
        ..Default::default()
    };
    let (mut h, out) = Harness::activate(config);

    // The two scan samples form the first batch.
    assert_eq!(rssi_writes(&out), 1);
    assert_eq!(h.m.telemetry().unwrap().ranging().in_flight(), 2);

    let mut out = Outbox::new();
    assert_eq!(h.m.enqueue_ranging(h.now, sample(-70), &mut out), Ok(()));
    assert_eq!(h.m.enqueue_ranging(h.now, sample(-71), &mut out), Ok(()));
    assert_eq!(h.m.enqueue_ranging(h.now, sample(-72), &mut out), Err(Error::QueueFull));
    assert_eq!(rssi_writes(&out), 0);

    let out = h.step(write_complete(RSSI));
    let ranging = h.m.telemetry().unwrap().ranging();
    assert_eq!(ranging.len(), 2);
    assert_eq!(ranging.front().map(|s| s.rssi), Some(-70));
    let (_, data) = out.writes().next().unwrap();
    assert_eq!(data.len(), 8);
    assert_eq!(data[2], (-70i8) as u8);
    assert_eq!(data[6], (-71i8) as u8);

    let mut out = Outbox::new();
    assert_eq!(h.m.enqueue_ranging(h.now, sample(-72), &mut out), Ok(()));
    assert_eq!(rssi_writes(&out), 0);
}

#[test]
fn failed_telemetry_write_tears_the_session_down() {
    let (mut h, _) = Harness::activate(ScannerConfig::default());
    let out = h.step(Event::WriteComplete {
        handle: CONN,
        attr: RSSI,
        ok: false,
    });
    assert!(out.contains(&Action::Disconnect { handle: CONN }));
    assert!(out.contains(&Action::Notify(ServiceEvent::BadConnection)));

    let mut out = Outbox::new();
    h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x16,
    });
    assert_eq!(h.m.enqueue_ranging(h.now, sample(-70), &mut out), Err(Error::NoSession));
}

#[test]
fn session_closes_itself_once_drained_when_configured() {
    let config = ScannerConfig {
        close_when_drained: true,
        ..Default::default()
    };
    let (mut h, _) = Harness::activate(config);

    let out = h.step(write_complete(RSSI));
    assert!(out.contains(&Action::Notify(ServiceEvent::DoneSending)));
    assert!(out.contains(&Action::Disconnect { handle: CONN }));
    assert!(!out.contains(&Action::Notify(ServiceEvent::BadConnection)));

    h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x16,
    });
    assert_eq!(h.m.last_disconnect(), Some(DisconnectReason::Completed));
    assert!(!h.m.identity().is_blacklisted(&ADDR, Some(&ID), h.now));
}

#[test]
fn drop_oldest_evicts_queued_samples_but_not_the_batch_in_flight() {
    let config = ScannerConfig {
        queue_depth: 4,
        ranging_per_message: 2,
        samples_before_connect: 2,
        overflow_policy: OverflowPolicy::DropOldest,
        ..Default::default()
    };
    let (mut h, _) = Harness::activate(config);
    assert_eq!(h.m.telemetry().unwrap().ranging().in_flight(), 2);

    let mut out = Outbox::new();
    for rssi in [-70, -71, -72, -73] {
        assert_eq!(h.m.enqueue_ranging(h.now, sample(rssi), &mut out), Ok(()));
    }
    let ranging = h.m.telemetry().unwrap().ranging();
    assert_eq!(ranging.len(), 4);
    assert_eq!(ranging.in_flight(), 2);

    // -70 and -71 were evicted; the next batch carries the newest two.
    let out = h.step(write_complete(RSSI));
    let (_, data) = out.writes().next().unwrap();
    assert_eq!(data[2], (-72i8) as u8);
    assert_eq!(data[6], (-73i8) as u8);
}

// ═══════════════════════════════════════════════════════════════════════════
// Identity correlation
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn blacklisted_bleam_is_ignored_under_a_new_address() {
    let mut h = Harness::new(ScannerConfig {
        samples_before_connect: 1,
        ..Default::default()
    });
    h.connect();
    h.negotiate();
    h.discover();
    h.advance(5_000);
    h.step(Event::TimerFired(TimerId::Handshake));
    h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x16,
    });
    assert_eq!(h.m.state(), SessionState::Scanning);

    // Same BLEAM, rotated address: whitelisted under the new address but
    // still refused through its id.
    let rotated = Address([0x99, 0x88, 0x77, 0x66, 0x55, 0xC4]);
    h.advance(100);
    let out = h.step(Event::ScanReport {
        address: rotated,
        rssi: -40,
        data: advert(),
    });
    assert!(out.is_empty());
    assert_eq!(h.m.state(), SessionState::Scanning);
    let ids = h.m.identity();
    assert_eq!(ids.lookup_whitelist(&rotated, h.now).and_then(|r| r.id), Some(ID));
    assert!(ids.lookup_blacklist(&rotated, h.now).is_none());
    assert!(ids.is_blacklisted(&rotated, Some(&ID), h.now));
}

// ═══════════════════════════════════════════════════════════════════════════
// Mode gating
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn reboot_stops_ranging_even_with_queued_samples() {
    let (mut h, _) = Harness::activate(ScannerConfig {
        ranging_per_message: 2,
        ..Default::default()
    });
    assert_eq!(h.m.telemetry().unwrap().ranging().len(), 5);

    h.step(control(&[4]));
    // The in-flight batch completes while the challenge is pending; nothing
    // new goes out.
    let out = h.step(write_complete(RSSI));
    assert_eq!(rssi_writes(&out), 0);
    assert_eq!(h.m.telemetry().unwrap().ranging().len(), 3);
    assert_eq!(h.m.mode(), Mode::Rssi);

    let out = h.step(Event::SaltGenerated {
        handle: CONN,
        salt: CHALLENGE,
    });
    assert_eq!(out.writes().count(), 1);
    let (sign1, sign2) = countersignature(KEY);
    assert!(h.step(sign1).is_empty());
    let out = h.step(sign2);
    assert!(out.contains(&Action::ModeRequested(Mode::Reboot)));
    assert!(out.contains(&Action::CancelTimer(TimerId::Handshake)));
    assert_eq!(out.writes().next(), Some((CONTROL_CCCD, &bytes(&[0x00, 0x00]))));
    assert_eq!(h.m.state(), SessionState::Active(Mode::Reboot));
    assert_eq!(h.m.telemetry().unwrap().ranging().len(), 3);

    // Further mode commands are refused once a terminal mode is set.
    assert!(h.step(control(&[1])).is_empty());
    assert_eq!(h.m.mode(), Mode::Reboot);

    let out = h.step(write_complete(CONTROL_CCCD));
    assert_eq!(out.notifications().collect::<Vec<_>>(), [ServiceEvent::NotificationDisabled]);
}

#[test]
fn countersigned_dfu_request_is_carried_out() {
    let (mut h, _) = Harness::activate(ScannerConfig::default());
    h.challenge(1, Mode::Dfu);

    let (sign1, sign2) = countersignature(KEY);
    h.step(sign1);
    let out = h.step(sign2);
    assert!(out.contains(&Action::ModeRequested(Mode::Dfu)));
    assert!(!out.iter().any(|a| matches!(a, Action::Disconnect { .. })));
    assert_eq!(h.m.state(), SessionState::Active(Mode::Dfu));
    assert!(!h.m.identity().is_blacklisted(&ADDR, Some(&ID), h.now));
}

#[test]
fn wrong_countersignature_blacklists_without_changing_mode() {
    let (mut h, _) = Harness::activate(ScannerConfig::default());
    h.challenge(5, Mode::Unconfig);

    let (sign1, sign2) = countersignature([0x00; 16]);
    assert!(h.step(sign1).is_empty());
    let out = h.step(sign2);
    assert!(!out.iter().any(|a| matches!(a, Action::ModeRequested(_))));
    assert!(out.contains(&Action::Disconnect { handle: CONN }));
    assert!(out.contains(&Action::Notify(ServiceEvent::BadConnection)));
    assert!(h.m.identity().is_blacklisted(&ADDR, Some(&ID), h.now));
    assert_eq!(h.m.state(), SessionState::Disconnected);

    h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x16,
    });
    assert_eq!(
        h.m.last_disconnect(),
        Some(DisconnectReason::Handshake(HandshakeError::Countersignature))
    );
}

#[test]
fn second_half_first_is_refused() {
    let (mut h, _) = Harness::activate(ScannerConfig::default());
    h.challenge(4, Mode::Reboot);

    let (_, sign2) = countersignature(KEY);
    let out = h.step(sign2);
    assert!(out.contains(&Action::Disconnect { handle: CONN }));
    assert!(!out.iter().any(|a| matches!(a, Action::ModeRequested(_))));
}

#[test]
fn unanswered_challenge_times_out() {
    let (mut h, _) = Harness::activate(ScannerConfig::default());
    h.challenge(4, Mode::Reboot);

    h.advance(5_000);
    let out = h.step(Event::TimerFired(TimerId::Handshake));
    assert!(out.contains(&Action::Disconnect { handle: CONN }));
    assert!(!out.iter().any(|a| matches!(a, Action::ModeRequested(_))));
    assert!(h.m.identity().is_blacklisted(&ADDR, None, h.now));

    h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x16,
    });
    assert_eq!(h.m.last_disconnect(), Some(DisconnectReason::HandshakeTimeout));
}

#[test]
fn mode_commands_before_active_are_rejected() {
    let mut h = Harness::new(ScannerConfig::default());
    h.connect();
    h.negotiate();
    h.discover();
    h.step(write_complete(CONTROL_CCCD));

    let out = h.step(Event::Notification {
        handle: CONN,
        attr: CONTROL,
        data: bytes(&[5]),
    });
    assert!(out.is_empty());
    assert_eq!(h.m.state(), SessionState::Authenticating);
}

// ═══════════════════════════════════════════════════════════════════════════
// Timeouts and teardown
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn inactivity_timer_rearms_for_the_remaining_time() {
    let (mut h, _) = Harness::activate(ScannerConfig {
        ranging_per_message: 2,
        ..Default::default()
    });
    // The next batch goes out 1 s in, which counts as activity.
    h.advance(1_000);
    let out = h.step(write_complete(RSSI));
    assert_eq!(rssi_writes(&out), 1);

    h.advance(INACTIVITY_TIMEOUT_MS - 1_000);
    let out = h.step(Event::TimerFired(TimerId::Inactivity));
    assert_eq!(
        out.iter().collect::<Vec<_>>(),
        [&Action::StartTimer {
            timer: TimerId::Inactivity,
            after_ms: 1_000,
        }]
    );
}

#[test]
fn inactivity_timeout_disconnects_exactly_once() {
    let (mut h, _) = Harness::activate(ScannerConfig::default());
    h.advance(INACTIVITY_TIMEOUT_MS);

    let out = h.step(Event::TimerFired(TimerId::Inactivity));
    assert_eq!(
        out.iter()
            .filter(|a| matches!(a, Action::Disconnect { .. }))
            .count(),
        1
    );
    assert!(out.contains(&Action::Notify(ServiceEvent::BadConnection)));

    // Nothing happens for the closing session any more.
    assert!(h.step(Event::TimerFired(TimerId::Inactivity)).is_empty());
    assert!(h.step(salt_notification()).is_empty());
    assert!(h.step(write_complete(RSSI)).is_empty());
    let mut out = Outbox::new();
    assert_eq!(h.m.enqueue_ranging(h.now, sample(-70), &mut out), Err(Error::NoSession));

    h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x16,
    });
    assert_eq!(h.m.last_disconnect(), Some(DisconnectReason::Inactivity));
}

#[test]
fn repeated_disconnect_events_are_no_ops() {
    let (mut h, _) = Harness::activate(ScannerConfig::default());
    let first = h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x08,
    });
    assert!(first.contains(&Action::Notify(ServiceEvent::Disconnected)));
    let state = h.m.state();

    let again = h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x08,
    });
    assert!(again.is_empty());
    assert_eq!(h.m.state(), state);
}

#[test]
fn stop_scan_during_session_idles_after_it() {
    let (mut h, _) = Harness::activate(ScannerConfig::default());
    assert!(h.step(Event::StopScan).is_empty());

    let out = h.step(Event::Disconnected {
        handle: CONN,
        reason: 0x13,
    });
    assert!(!out.contains(&Action::StartScan));
    assert_eq!(h.m.state(), SessionState::Idle);
}
