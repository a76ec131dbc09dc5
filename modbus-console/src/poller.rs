//! Ownership of the two polling timers and the debounced debug-log stop.
//!
//! Timer tasks never touch state themselves; they only push tick events into
//! the application channel. All handle manipulation happens here, behind the
//! narrow start/stop interface, so rapid toggle sequences cannot produce
//! duplicate intervals.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::app::Event;

pub const STATUS_POLL_PERIOD: Duration = Duration::from_millis(1000);
pub const DEBUG_POLL_PERIOD: Duration = Duration::from_millis(1500);
pub const DEBUG_STOP_GRACE: Duration = Duration::from_millis(2500);

/// Poll periods and the debug-stop grace window. Tests shrink these.
#[derive(Clone, Copy, Debug)]
pub struct Timing {
    pub status_period: Duration,
    pub debug_period: Duration,
    pub debug_stop_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            status_period: STATUS_POLL_PERIOD,
            debug_period: DEBUG_POLL_PERIOD,
            debug_stop_grace: DEBUG_STOP_GRACE,
        }
    }
}

/// What a timer task is asking the application loop to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Poll {
    Status,
    DebugLog,
    /// The debounced debug stop reached its deadline. The generation lets the
    /// poller ignore deadlines that were cancelled or superseded while the
    /// event sat in the queue.
    DebugStopElapsed(u64),
}

enum DebugState {
    Stopped,
    Running {
        poll: JoinHandle<()>,
    },
    StopPending {
        poll: JoinHandle<()>,
        timer: JoinHandle<()>,
        gen: u64,
    },
}

pub struct Poller {
    tx: mpsc::Sender<Event>,
    timing: Timing,
    status: Option<JoinHandle<()>>,
    debug: DebugState,
    stop_gen: u64,
}

impl Poller {
    pub fn new(tx: mpsc::Sender<Event>, timing: Timing) -> Self {
        Poller {
            tx,
            timing,
            status: None,
            debug: DebugState::Stopped,
            stop_gen: 0,
        }
    }

    /// Idempotent: an already-running status timer is torn down first, so
    /// there is never more than one. The first tick fires immediately.
    pub fn start_status(&mut self) {
        if let Some(poll) = self.status.take() {
            poll.abort();
        }
        self.status = Some(ticker(
            self.tx.clone(),
            self.timing.status_period,
            Poll::Status,
        ));
        debug!("status polling started");
    }

    pub fn stop_status(&mut self) {
        if let Some(poll) = self.status.take() {
            poll.abort();
            debug!("status polling stopped");
        }
    }

    pub fn status_running(&self) -> bool {
        self.status.is_some()
    }

    /// True while the debug timer exists, including the grace window of a
    /// pending stop.
    pub fn debug_running(&self) -> bool {
        !matches!(self.debug, DebugState::Stopped)
    }

    /// Starts debug polling when the log panel is visible and the link is
    /// still being watched (status polling active or a disconnect not yet
    /// settled). Called while a debounced stop is pending it cancels the
    /// stop and keeps the same timer running.
    pub fn start_debug_if_needed(&mut self, panel_open: bool, disconnect_pending: bool) {
        match std::mem::replace(&mut self.debug, DebugState::Stopped) {
            DebugState::StopPending { poll, timer, .. } => {
                timer.abort();
                self.debug = DebugState::Running { poll };
                debug!("pending debug stop cancelled");
            }
            running @ DebugState::Running { .. } => {
                self.debug = running;
            }
            DebugState::Stopped => {
                if panel_open && (self.status_running() || disconnect_pending) {
                    self.debug = DebugState::Running {
                        poll: ticker(self.tx.clone(), self.timing.debug_period, Poll::DebugLog),
                    };
                    debug!("debug polling started");
                } else {
                    debug!("debug polling not started");
                }
            }
        }
    }

    /// Immediate mode tears the timer down synchronously. Delayed mode keeps
    /// it running and schedules the teardown after the grace window;
    /// re-invoking resets the window instead of stacking timers.
    pub fn stop_debug(&mut self, immediate: bool) {
        match std::mem::replace(&mut self.debug, DebugState::Stopped) {
            DebugState::Stopped => {}
            DebugState::Running { poll } => {
                if immediate {
                    poll.abort();
                    debug!("debug polling stopped");
                } else {
                    self.debug = self.schedule_stop(poll);
                }
            }
            DebugState::StopPending { poll, timer, .. } => {
                timer.abort();
                if immediate {
                    poll.abort();
                    debug!("debug polling stopped");
                } else {
                    self.debug = self.schedule_stop(poll);
                }
            }
        }
    }

    /// Finalizes a pending stop when its deadline event arrives; stale
    /// deadlines (cancelled or rescheduled since) are ignored.
    pub fn debug_stop_elapsed(&mut self, gen: u64) {
        match std::mem::replace(&mut self.debug, DebugState::Stopped) {
            DebugState::StopPending {
                poll,
                timer: _,
                gen: pending,
            } if pending == gen => {
                poll.abort();
                debug!("debug polling stopped (delayed)");
            }
            other => {
                self.debug = other;
                debug!(gen, "stale debug stop deadline ignored");
            }
        }
    }

    pub fn stop_all(&mut self, debug_immediate: bool) {
        self.stop_status();
        self.stop_debug(debug_immediate);
        debug!("all polling stop requested");
    }

    fn schedule_stop(&mut self, poll: JoinHandle<()>) -> DebugState {
        self.stop_gen += 1;
        let gen = self.stop_gen;
        let grace = self.timing.debug_stop_grace;
        let tx = self.tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(Event::Poll(Poll::DebugStopElapsed(gen))).await;
        });
        debug!(gen, ?grace, "debug stop scheduled");
        DebugState::StopPending { poll, timer, gen }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop_status();
        self.stop_debug(true);
    }
}

fn ticker(tx: mpsc::Sender<Event>, period: Duration, poll: Poll) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if tx.send(Event::Poll(poll)).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn test_poller() -> (Poller, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(64);
    let timing = Timing {
        status_period: Duration::from_millis(10),
        debug_period: Duration::from_millis(15),
        debug_stop_grace: Duration::from_millis(25),
    };
    (Poller::new(tx, timing), rx)
}

#[cfg(test)]
async fn next_poll(rx: &mut mpsc::Receiver<Event>) -> Poll {
    match rx.recv().await {
        Some(Event::Poll(poll)) => poll,
        other => panic!("expected a poll event, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn status_start_is_idempotent() {
    let (mut poller, mut rx) = test_poller();
    poller.start_status();
    poller.start_status();

    // With exactly one timer the first tick is immediate and the next two
    // arrive one period apart; a duplicate would halve the spacing.
    let t0 = tokio::time::Instant::now();
    for _ in 0..3 {
        assert_eq!(next_poll(&mut rx).await, Poll::Status);
    }
    assert_eq!(t0.elapsed(), Duration::from_millis(20));
}

#[tokio::test(start_paused = true)]
async fn status_stop_is_safe_when_not_running() {
    let (mut poller, mut rx) = test_poller();
    poller.stop_status();
    assert!(!poller.status_running());

    poller.start_status();
    assert_eq!(next_poll(&mut rx).await, Poll::Status);
    poller.stop_status();
    poller.stop_status();

    // No further ticks after the stop.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn debug_gate_requires_panel_and_liveness() {
    let (mut poller, _rx) = test_poller();

    poller.start_debug_if_needed(false, false);
    assert!(!poller.debug_running());

    poller.start_debug_if_needed(true, false);
    assert!(!poller.debug_running());

    // A disconnect still in flight keeps the gate open without status polling.
    poller.start_debug_if_needed(true, true);
    assert!(poller.debug_running());
}

#[tokio::test(start_paused = true)]
async fn delayed_stop_keeps_polling_through_grace() {
    let (mut poller, mut rx) = test_poller();
    poller.start_status();
    poller.start_debug_if_needed(true, false);
    assert!(poller.debug_running());

    poller.stop_debug(false);
    assert!(poller.debug_running());

    // The deadline event eventually arrives and only then is the timer gone.
    loop {
        match next_poll(&mut rx).await {
            Poll::DebugStopElapsed(gen) => {
                poller.debug_stop_elapsed(gen);
                break;
            }
            _ => {}
        }
    }
    assert!(!poller.debug_running());
}

#[tokio::test(start_paused = true)]
async fn reopen_within_grace_cancels_the_stop() {
    let (mut poller, mut rx) = test_poller();
    poller.start_status();
    poller.start_debug_if_needed(true, false);

    poller.stop_debug(false);
    tokio::time::sleep(Duration::from_millis(5)).await;
    poller.start_debug_if_needed(true, false);
    assert!(poller.debug_running());

    // Well past the original grace deadline the timer must still be alive:
    // the pending stop was cancelled, not merely postponed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(poller.debug_running());
    let mut saw_debug_tick = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            Event::Poll(Poll::DebugStopElapsed(gen)) => poller.debug_stop_elapsed(gen),
            Event::Poll(Poll::DebugLog) => saw_debug_tick = true,
            _ => {}
        }
    }
    assert!(saw_debug_tick);
    assert!(poller.debug_running());
}

#[tokio::test(start_paused = true)]
async fn stale_deadline_is_ignored_after_cancel() {
    let (mut poller, mut rx) = test_poller();
    poller.start_status();
    poller.start_debug_if_needed(true, false);

    poller.stop_debug(false);
    // Wait until the deadline event is already queued, then cancel.
    let gen = loop {
        match next_poll(&mut rx).await {
            Poll::DebugStopElapsed(gen) => break gen,
            _ => {}
        }
    };
    poller.start_debug_if_needed(true, false);

    // Dispatching the stale deadline must not kill the resumed session.
    poller.debug_stop_elapsed(gen);
    assert!(poller.debug_running());
}

#[tokio::test(start_paused = true)]
async fn renewed_stop_supersedes_the_first_deadline() {
    let (mut poller, mut rx) = test_poller();
    poller.start_status();
    poller.start_debug_if_needed(true, false);

    poller.stop_debug(false);
    let first = loop {
        match next_poll(&mut rx).await {
            Poll::DebugStopElapsed(gen) => break gen,
            _ => {}
        }
    };
    // Reset the window before the first deadline is dispatched.
    poller.start_debug_if_needed(true, false);
    poller.stop_debug(false);

    poller.debug_stop_elapsed(first);
    assert!(poller.debug_running(), "first deadline is stale");

    let second = loop {
        match next_poll(&mut rx).await {
            Poll::DebugStopElapsed(gen) => break gen,
            _ => {}
        }
    };
    assert!(second > first);
    poller.debug_stop_elapsed(second);
    assert!(!poller.debug_running());
}

#[tokio::test(start_paused = true)]
async fn immediate_stop_cuts_the_timer_now() {
    let (mut poller, mut rx) = test_poller();
    poller.start_status();
    poller.start_debug_if_needed(true, false);
    let _ = next_poll(&mut rx).await;

    poller.stop_debug(true);
    assert!(!poller.debug_running());

    poller.stop_all(true);
    assert!(!poller.status_running());

    // Ticks queued before the stop may still be delivered; nothing new may
    // arrive afterwards.
    while rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}
