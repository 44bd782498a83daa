//! Deadline service answering the engine's timer requests.
//!
//! Each [`TimerId`] has at most one pending deadline. A new `Start`
//! replaces the old deadline and `Cancel` clears it; expiry is reported as
//! `Event::TimerFired` through the engine's event channel.

use crate::ble::EventSender;
use blesc::bleam::TimerId;
use blesc::Event;
use defmt::{debug, Format};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Receiver;
use embassy_time::{Duration, Instant, Timer};

#[derive(Clone, Copy, Format)]
pub enum TimerCommand {
    Start { timer: TimerId, after_ms: u64 },
    Cancel(TimerId),
}

pub type TimerCommandReceiver = Receiver<'static, CriticalSectionRawMutex, TimerCommand, 8>;

struct Deadlines([Option<Instant>; TimerId::ALL.len()]);

impl Deadlines {
    const fn new() -> Self {
        Self([None; TimerId::ALL.len()])
    }

    fn apply(&mut self, cmd: TimerCommand) {
        match cmd {
            TimerCommand::Start { timer, after_ms } => {
                self.0[timer.index()] = Some(Instant::now() + Duration::from_millis(after_ms));
            }
            TimerCommand::Cancel(timer) => self.0[timer.index()] = None,
        }
    }

    /// Earliest pending deadline.
    fn next(&self) -> Option<(TimerId, Instant)> {
        TimerId::ALL
            .into_iter()
            .filter_map(|timer| self.0[timer.index()].map(|at| (timer, at)))
            .min_by_key(|(_, at)| *at)
    }
}

/// Timer task body.
pub async fn run(cmd_rx: &TimerCommandReceiver, events: &EventSender) -> ! {
    let mut deadlines = Deadlines::new();

    loop {
        let next = deadlines.next();
        let expiry = async {
            match next {
                Some((_, at)) => Timer::at(at).await,
                None => core::future::pending::<()>().await,
            }
        };

        match select(cmd_rx.receive(), expiry).await {
            Either::First(cmd) => deadlines.apply(cmd),
            Either::Second(()) => {
                if let Some((timer, _)) = next {
                    deadlines.0[timer.index()] = None;
                    debug!("Timer {:?} fired", timer);
                    events.send(Event::TimerFired(timer)).await;
                }
            }
        }
    }
}
