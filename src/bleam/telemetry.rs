//! Telemetry pipeline - bounded send queues with batching and
//! at-most-one-outstanding-write flow control.
//!
//! Entries of an in-flight batch stay at the front of their queue until
//! the write completes; only then is the front advanced past them. A
//! queue never has more than one outstanding write.

use heapless::Deque;

use crate::bleam::discovery::HandleSet;
use crate::bleam::event::{Action, Outbox};
use crate::bleam::protocol::{HealthEvent, RangingSample, WireRecord};
use crate::bleam::types::{AttHandle, ConnHandle, Payload};
use crate::config::{OverflowPolicy, ScannerConfig, MAX_DATA_LEN, MAX_QUEUE_DEPTH};
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueState {
    Idle,
    Busy { in_flight: usize },
}

/// Fixed-capacity FIFO of one telemetry kind.
#[derive(Debug)]
pub struct SendQueue<T> {
    entries: Deque<T, MAX_QUEUE_DEPTH>,
    depth: usize,
    policy: OverflowPolicy,
    state: QueueState,
}

impl<T: WireRecord> SendQueue<T> {
    /// `depth` is clamped to the compile-time capacity.
    pub fn new(depth: usize, policy: OverflowPolicy) -> Self {
        Self {
            entries: Deque::new(),
            depth: depth.clamp(1, MAX_QUEUE_DEPTH),
            policy,
            state: QueueState::Idle,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, QueueState::Busy { .. })
    }

    pub fn front(&self) -> Option<&T> {
        self.entries.front()
    }

    /// Entries written but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        match self.state {
            QueueState::Idle => 0,
            QueueState::Busy { in_flight } => in_flight,
        }
    }

    pub fn push(&mut self, item: T) -> Result<(), Error> {
        if self.entries.len() >= self.depth {
            match self.policy {
                OverflowPolicy::RejectNew => return Err(Error::QueueFull),
                OverflowPolicy::DropOldest => self.drop_oldest_unsent()?,
            }
        }
        self.entries.push_back(item).map_err(|_| Error::QueueFull)
    }

    /// Remove the oldest entry that is not part of the in-flight batch.
    fn drop_oldest_unsent(&mut self) -> Result<(), Error> {
        let in_flight = self.in_flight();
        if in_flight >= self.entries.len() {
            return Err(Error::QueueFull);
        }
        let mut held: heapless::Vec<T, MAX_QUEUE_DEPTH> = heapless::Vec::new();
        for _ in 0..in_flight {
            if let Some(e) = self.entries.pop_front() {
                let _ = held.push(e);
            }
        }
        let _ = self.entries.pop_front();
        while let Some(e) = held.pop() {
            let _ = self.entries.push_front(e);
        }
        debug!("queue overflow: oldest unsent entry dropped");
        Ok(())
    }

    /// Pack up to `max` front entries into one payload and mark the queue
    /// busy. Returns `None` when busy or empty.
    pub fn begin_batch(&mut self, max: usize) -> Option<Payload> {
        if self.is_busy() {
            return None;
        }
        let mut payload = Payload::new();
        let mut count = 0;
        for entry in self.entries.iter().take(max) {
            if payload.len() + entry.wire_len() > MAX_DATA_LEN {
                break;
            }
            entry.encode(&mut payload);
            count += 1;
        }
        if count == 0 {
            return None;
        }
        self.state = QueueState::Busy { in_flight: count };
        Some(payload)
    }

    /// The outstanding write was acknowledged: advance past its entries.
    /// Returns how many entries were released (0 if nothing was in flight).
    pub fn complete(&mut self) -> usize {
        let QueueState::Busy { in_flight } = self.state else {
            return 0;
        };
        for _ in 0..in_flight {
            let _ = self.entries.pop_front();
        }
        self.state = QueueState::Idle;
        in_flight
    }

    /// Discard everything, including an unacknowledged batch.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.state = QueueState::Idle;
    }
}

/// Which queue a write belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stream {
    Ranging,
    Health,
}

/// Outcome of a telemetry write completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The write was not a telemetry write.
    NotOurs,
    /// Acknowledged; `drained` when both queues are now empty and idle.
    Sent { stream: Stream, drained: bool },
    /// The link refused the write.
    Failed(Stream),
}

/// Ranging and health queues of one session.
#[derive(Debug)]
pub struct Telemetry {
    ranging: SendQueue<RangingSample>,
    health: SendQueue<HealthEvent>,
    ranging_per_message: usize,
    health_per_message: usize,
}

impl Telemetry {
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            ranging: SendQueue::new(config.queue_depth, config.overflow_policy),
            health: SendQueue::new(config.queue_depth, config.overflow_policy),
            ranging_per_message: config.ranging_per_message,
            health_per_message: config.health_per_message,
        }
    }

    pub fn ranging(&self) -> &SendQueue<RangingSample> {
        &self.ranging
    }

    pub fn health(&self) -> &SendQueue<HealthEvent> {
        &self.health
    }

    pub fn enqueue_ranging(&mut self, sample: RangingSample) -> Result<(), Error> {
        self.ranging.push(sample)
    }

    pub fn enqueue_health(&mut self, event: HealthEvent) -> Result<(), Error> {
        self.health.push(event)
    }

    /// Run both send loops once. Ranging only goes out when
    /// `ranging_enabled`; health goes out whenever the session is active.
    /// Returns the number of writes issued.
    pub fn pump(
        &mut self,
        conn: ConnHandle,
        handles: &HandleSet,
        ranging_enabled: bool,
        out: &mut Outbox,
    ) -> usize {
        let mut issued = 0;
        if ranging_enabled {
            if let Some(data) = self.ranging.begin_batch(self.ranging_per_message) {
                debug!("telemetry: ranging batch of {=usize}", self.ranging.in_flight());
                out.push(Action::Write {
                    handle: conn,
                    attr: handles.rssi,
                    data,
                });
                issued += 1;
            }
        }
        if let Some(data) = self.health.begin_batch(self.health_per_message) {
            debug!("telemetry: health batch of {=usize}", self.health.in_flight());
            out.push(Action::Write {
                handle: conn,
                attr: handles.health,
                data,
            });
            issued += 1;
        }
        issued
    }

    /// Continuation entry point for every write completion.
    pub fn on_write_complete(&mut self, handles: &HandleSet, attr: AttHandle, ok: bool) -> Completion {
        let (stream, busy) = if attr == handles.rssi {
            (Stream::Ranging, self.ranging.is_busy())
        } else if attr == handles.health {
            (Stream::Health, self.health.is_busy())
        } else {
            return Completion::NotOurs;
        };
        if !busy {
            warn!("telemetry: completion without outstanding {:?} write", stream);
            return Completion::NotOurs;
        }
        if !ok {
            return Completion::Failed(stream);
        }
        match stream {
            Stream::Ranging => self.ranging.complete(),
            Stream::Health => self.health.complete(),
        };
        Completion::Sent {
            stream,
            drained: self.is_drained(),
        }
    }

    /// Both queues empty with nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.ranging.is_empty()
            && self.health.is_empty()
            && !self.ranging.is_busy()
            && !self.health.is_busy()
    }

    pub fn clear(&mut self) {
        let dropped = self.ranging.len() + self.health.len();
        if dropped > 0 {
            info!("telemetry: discarding {=usize} unsent entries", dropped);
        }
        self.ranging.clear();
        self.health.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN: ConnHandle = 1;

    fn handles() -> HandleSet {
        HandleSet {
            control: 0x10,
            control_cccd: 0x11,
            sign: 0x12,
            rssi: 0x14,
            health: 0x16,
            time: 0x18,
        }
    }

    fn sample(n: u16) -> RangingSample {
        RangingSample {
            sender: n,
            rssi: -50,
            aoa: 0,
            timestamp: n as u64,
        }
    }

    fn general() -> HealthEvent {
        HealthEvent::General {
            battery: 30,
            firmware_id: 8,
            uptime_min: 1,
            system_time: 2,
            last_error_id: 0,
            last_error_type: crate::bleam::protocol::ErrorType::HardReset,
        }
    }

    fn small_config() -> ScannerConfig {
        ScannerConfig {
            queue_depth: 4,
            ranging_per_message: 2,
            ..Default::default()
        }
    }

    #[test]
    fn reject_new_at_capacity_then_room_after_one_cycle() {
        let mut t = Telemetry::new(&small_config());
        for n in 0..4 {
            assert_eq!(t.enqueue_ranging(sample(n)), Ok(()));
        }
        assert_eq!(t.enqueue_ranging(sample(4)), Err(Error::QueueFull));

        let mut out = Outbox::new();
        assert_eq!(t.pump(CONN, &handles(), true, &mut out), 1);
        let (attr, data) = out.writes().next().unwrap();
        assert_eq!(attr, 0x14);
        assert_eq!(data.len(), 8);
        assert_eq!(&data[..2], &0u16.to_le_bytes());

        assert_eq!(
            t.on_write_complete(&handles(), 0x14, true),
            Completion::Sent {
                stream: Stream::Ranging,
                drained: false
            }
        );
        assert_eq!(t.ranging().len(), 2);
        assert_eq!(t.ranging().front(), Some(&sample(2)));
        assert_eq!(t.enqueue_ranging(sample(4)), Ok(()));
    }

    #[test]
    fn one_outstanding_write_per_queue() {
        let mut t = Telemetry::new(&small_config());
        for n in 0..4 {
            t.enqueue_ranging(sample(n)).unwrap();
        }
        let mut out = Outbox::new();
        assert_eq!(t.pump(CONN, &handles(), true, &mut out), 1);
        assert_eq!(t.pump(CONN, &handles(), true, &mut out), 0);
        assert_eq!(out.writes().count(), 1);
        assert_eq!(t.ranging().in_flight(), 2);
    }

    #[test]
    fn batch_boundary_is_queue_empty() {
        let mut t = Telemetry::new(&ScannerConfig::default());
        t.enqueue_ranging(sample(7)).unwrap();
        let mut out = Outbox::new();
        t.pump(CONN, &handles(), true, &mut out);
        assert_eq!(out.writes().next().unwrap().1.len(), 4);
    }

    #[test]
    fn default_batch_fills_a_write() {
        let mut t = Telemetry::new(&ScannerConfig::default());
        for n in 0..7 {
            t.enqueue_ranging(sample(n)).unwrap();
        }
        let mut out = Outbox::new();
        t.pump(CONN, &handles(), true, &mut out);
        assert_eq!(out.writes().next().unwrap().1.len(), MAX_DATA_LEN);
        assert_eq!(t.ranging().in_flight(), 5);
    }

    #[test]
    fn ranging_waits_for_rssi_mode_but_health_does_not() {
        let mut t = Telemetry::new(&small_config());
        t.enqueue_ranging(sample(1)).unwrap();
        t.enqueue_health(general()).unwrap();
        let mut out = Outbox::new();
        assert_eq!(t.pump(CONN, &handles(), false, &mut out), 1);
        let (attr, data) = out.writes().next().unwrap();
        assert_eq!(attr, 0x16);
        assert_eq!(data.len(), 15);
        assert!(!t.ranging().is_busy());
    }

    #[test]
    fn health_batches_respect_payload_size() {
        let cfg = ScannerConfig {
            health_per_message: 3,
            ..Default::default()
        };
        let mut t = Telemetry::new(&cfg);
        t.enqueue_health(general()).unwrap();
        t.enqueue_health(general()).unwrap();
        let mut out = Outbox::new();
        t.pump(CONN, &handles(), true, &mut out);
        assert_eq!(t.health().in_flight(), 1);
    }

    #[test]
    fn completion_reports_drain() {
        let mut t = Telemetry::new(&small_config());
        t.enqueue_health(general()).unwrap();
        let mut out = Outbox::new();
        t.pump(CONN, &handles(), true, &mut out);
        assert!(!t.is_drained());
        assert_eq!(
            t.on_write_complete(&handles(), 0x16, true),
            Completion::Sent {
                stream: Stream::Health,
                drained: true
            }
        );
    }

    #[test]
    fn stray_completions_are_ignored() {
        let mut t = Telemetry::new(&small_config());
        assert_eq!(t.on_write_complete(&handles(), 0x14, true), Completion::NotOurs);
        assert_eq!(t.on_write_complete(&handles(), 0x12, true), Completion::NotOurs);
    }

    #[test]
    fn failed_write_is_reported() {
        let mut t = Telemetry::new(&small_config());
        t.enqueue_ranging(sample(1)).unwrap();
        let mut out = Outbox::new();
        t.pump(CONN, &handles(), true, &mut out);
        assert_eq!(
            t.on_write_complete(&handles(), 0x14, false),
            Completion::Failed(Stream::Ranging)
        );
    }

    #[test]
    fn drop_oldest_keeps_in_flight_entries() {
        let mut q: SendQueue<RangingSample> = SendQueue::new(3, OverflowPolicy::DropOldest);
        for n in 0..3 {
            q.push(sample(n)).unwrap();
        }
        assert!(q.begin_batch(1).is_some());
        q.push(sample(3)).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.front(), Some(&sample(0)));
        assert_eq!(q.complete(), 1);
        assert_eq!(q.front(), Some(&sample(2)));
    }

    #[test]
    fn drop_oldest_cannot_evict_a_fully_in_flight_queue() {
        let mut q: SendQueue<RangingSample> = SendQueue::new(2, OverflowPolicy::DropOldest);
        q.push(sample(0)).unwrap();
        q.push(sample(1)).unwrap();
        assert!(q.begin_batch(2).is_some());
        assert_eq!(q.push(sample(2)), Err(Error::QueueFull));
    }

    #[test]
    fn clear_discards_unsent_and_in_flight() {
        let mut t = Telemetry::new(&small_config());
        t.enqueue_ranging(sample(1)).unwrap();
        let mut out = Outbox::new();
        t.pump(CONN, &handles(), true, &mut out);
        t.clear();
        assert!(t.is_drained());
        assert_eq!(t.on_write_complete(&handles(), 0x14, true), Completion::NotOurs);
    }
}
