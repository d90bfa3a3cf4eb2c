//! Long lived update controller.
//!
//! The agent owns the partition store and the image source, consumes start
//! requests from a [`TriggerReceiver`], enforces that at most one session
//! runs at a time and emits the idle heartbeat between sessions. After a
//! committed session it invokes the platform restart hook.

use core::sync::atomic::{AtomicBool, Ordering};

use fugit_timer::TimerDurationU32;

use crate::config::Config;
use crate::error::AbortReason;
use crate::session::{SessionState, UpdateSession};
use crate::store::PartitionStore;
use crate::stream::ImageSource;
use crate::trigger::TriggerReceiver;

/// Platform reboot hook, invoked once after a committed update. On real
/// hardware this does not return.
pub trait Restarter {
    fn restart(&mut self);
}

/// Terminal result of one session, as reported by [`UpdateAgent::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionOutcome {
    Committed,
    Aborted(AbortReason),
}

pub struct UpdateAgent<'a, S, P, T, R, const TIMER_HZ: u32>
where
    S: ImageSource,
    P: PartitionStore,
    T: fugit_timer::Timer<TIMER_HZ>,
    R: Restarter,
{
    source: S,
    store: P,
    triggers: TriggerReceiver<'a>,
    heartbeat: T,
    restarter: R,
    config: Config,
    in_flight: AtomicBool,
    heartbeats: u32,
}

impl<'a, S, P, T, R, const TIMER_HZ: u32> UpdateAgent<'a, S, P, T, R, TIMER_HZ>
where
    S: ImageSource,
    P: PartitionStore,
    T: fugit_timer::Timer<TIMER_HZ>,
    R: Restarter,
{
    pub fn new(
        source: S,
        store: P,
        triggers: TriggerReceiver<'a>,
        mut heartbeat: T,
        restarter: R,
        config: Config,
    ) -> Self {
        heartbeat
            .start(TimerDurationU32::<TIMER_HZ>::millis(
                config.heartbeat_period_ms,
            ))
            .ok();
        Self {
            source,
            store,
            triggers,
            heartbeat,
            restarter,
            config,
            in_flight: AtomicBool::new(false),
            heartbeats: 0,
        }
    }

    /// True between a session's admission entry and its terminal transition.
    pub fn update_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Idle heartbeats emitted since construction.
    pub fn heartbeats(&self) -> u32 {
        self.heartbeats
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    /// One worker iteration. Runs a full session when a start request is
    /// pending, otherwise services the idle heartbeat.
    pub fn poll(&mut self) -> Option<SessionOutcome> {
        if self.triggers.take() {
            let outcome = self.run_session();
            // Requests raised while the session ran are not retries.
            self.triggers.drain();
            self.in_flight.store(false, Ordering::SeqCst);
            if outcome == SessionOutcome::Committed {
                info!("Restarting into the new image");
                self.restarter.restart();
            }
            Some(outcome)
        } else {
            self.idle_tick();
            None
        }
    }

    fn run_session(&mut self) -> SessionOutcome {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return SessionOutcome::Aborted(AbortReason::PartitionBusy);
        }
        info!("Starting firmware update");
        let stream = match self.source.open() {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to open the image stream: {:?}", e);
                return SessionOutcome::Aborted(AbortReason::TransportFailure(e));
            }
        };
        let mut session = UpdateSession::new(stream, &mut self.store, &self.config);
        match *session.run() {
            SessionState::Committed => SessionOutcome::Committed,
            SessionState::Aborted(reason) => SessionOutcome::Aborted(reason),
            _ => unreachable!(),
        }
    }

    fn idle_tick(&mut self) {
        if self.heartbeat.wait().is_ok() {
            self.heartbeats = self.heartbeats.wrapping_add(1);
            info!("Waiting for a new firmware ({})", self.heartbeats);
            self.heartbeat
                .start(TimerDurationU32::<TIMER_HZ>::millis(
                    self.config.heartbeat_period_ms,
                ))
                .ok();
        }
    }
}
