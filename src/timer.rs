//! Cancellable timer pair for debounce and restart scheduling.
//!
//! Each engine owns exactly two logical timers: one pending transcript
//! notification and one pending device restart. Arming a slot replaces
//! any deadline already in it, so timers never stack. All deadlines live
//! on a single per-engine worker thread driven by a crossbeam channel;
//! dropping the `Timers` handle disconnects the channel and the worker
//! exits.

use std::time::Instant;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use tracing::debug;

/// The two timer slots an engine may have armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSlot {
    /// Debounced transcript notification.
    Notify,
    /// Pending auto-restart of the capture device.
    Restart,
}

enum Cmd {
    Arm(TimerSlot, Instant),
    Cancel(TimerSlot),
    CancelAll,
}

/// Handle to the worker thread. One per engine.
pub struct Timers {
    tx: Sender<Cmd>,
}

impl Timers {
    /// Spawn the worker. `on_fire` runs on the worker thread whenever an
    /// armed deadline elapses.
    pub fn spawn<F>(on_fire: F) -> Self
    where
        F: Fn(TimerSlot) + Send + 'static,
    {
        let (tx, rx) = unbounded::<Cmd>();

        std::thread::Builder::new()
            .name("viva-speech-timers".into())
            .spawn(move || {
                let mut notify_at: Option<Instant> = None;
                let mut restart_at: Option<Instant> = None;

                loop {
                    let now = Instant::now();

                    if notify_at.is_some_and(|t| t <= now) {
                        notify_at = None;
                        on_fire(TimerSlot::Notify);
                        continue;
                    }
                    if restart_at.is_some_and(|t| t <= now) {
                        restart_at = None;
                        on_fire(TimerSlot::Restart);
                        continue;
                    }

                    let next = match (notify_at, restart_at) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (Some(a), None) => Some(a),
                        (None, Some(b)) => Some(b),
                        (None, None) => None,
                    };

                    let cmd = match next {
                        Some(deadline) => match rx.recv_deadline(deadline) {
                            Ok(cmd) => cmd,
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match rx.recv() {
                            Ok(cmd) => cmd,
                            Err(_) => break,
                        },
                    };

                    match cmd {
                        Cmd::Arm(TimerSlot::Notify, at) => notify_at = Some(at),
                        Cmd::Arm(TimerSlot::Restart, at) => restart_at = Some(at),
                        Cmd::Cancel(TimerSlot::Notify) => notify_at = None,
                        Cmd::Cancel(TimerSlot::Restart) => restart_at = None,
                        Cmd::CancelAll => {
                            notify_at = None;
                            restart_at = None;
                        }
                    }
                }

                debug!("timer worker exiting");
            })
            .expect("failed to spawn viva-speech timer thread");

        Self { tx }
    }

    /// Arm `slot` to fire at `deadline`, replacing any pending deadline.
    pub fn arm(&self, slot: TimerSlot, deadline: Instant) {
        let _ = self.tx.send(Cmd::Arm(slot, deadline));
    }

    pub fn cancel(&self, slot: TimerSlot) {
        let _ = self.tx.send(Cmd::Cancel(slot));
    }

    pub fn cancel_all(&self) {
        let _ = self.tx.send(Cmd::CancelAll);
    }
}
