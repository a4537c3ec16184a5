//! Reconnection scheduling: bounded exponential backoff plus the timer
//! that drives a pending retry.
//!
//! Backoff is computed, not stored: `delay_for(n)` is a pure function of
//! the failure count, non-decreasing and bounded by the cap. The timer is
//! the only armed state; at most one is pending per controller and it is
//! disarmed on any teardown path.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub multiplier: f64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// `delay_for(0)` is the base delay; growth is geometric up to the cap.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        // powi saturates to inf for huge exponents; the cap makes the
        // result finite either way, but keep the exponent sane.
        let exponent = failures.min(64) as i32;
        let raw = self.base_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.cap_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether `retry_count` failures have spent the attempt budget.
    #[must_use]
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }
}

/// Ticks emitted by an armed [`RetryTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTick {
    /// Whole seconds remaining until the retry fires. Emitted once on arm
    /// and then every second, for surfacing "retrying in Ns" to the user.
    Countdown { seconds_left: u64 },
    /// The delay elapsed; the controller should attempt now.
    Fire,
}

/// One-shot countdown timer feeding a controller's event channel.
///
/// Arming replaces any pending timer. Disarming is idempotent and also
/// happens on drop, so an abandoned controller never fires a stale retry.
#[derive(Debug, Default)]
pub struct RetryTimer {
    guard: Option<CancellationToken>,
}

impl RetryTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.guard.is_some()
    }

    /// Arm the timer for `delay`, sending ticks into `events`.
    ///
    /// The initial countdown is sent synchronously so state observers see
    /// the pending retry before this call returns.
    pub fn arm<E>(&mut self, delay: Duration, events: mpsc::UnboundedSender<E>)
    where
        E: From<RetryTick> + Send + 'static,
    {
        self.disarm();
        let token = CancellationToken::new();
        self.guard = Some(token.clone());

        let seconds_left = delay.as_secs_f64().ceil() as u64;
        let _ = events.send(RetryTick::Countdown { seconds_left }.into());

        tokio::spawn(async move {
            let deadline = Instant::now() + delay;
            let fire = tokio::time::sleep_until(deadline);
            tokio::pin!(fire);
            let mut ticker = tokio::time::interval_at(
                Instant::now() + Duration::from_secs(1),
                Duration::from_secs(1),
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = &mut fire => {
                        let _ = events.send(RetryTick::Fire.into());
                        return;
                    }
                    _ = ticker.tick() => {
                        let remaining = deadline
                            .saturating_duration_since(Instant::now())
                            .as_secs_f64()
                            .ceil() as u64;
                        if remaining > 0 {
                            let _ = events
                                .send(RetryTick::Countdown { seconds_left: remaining }.into());
                        }
                    }
                }
            }
        });
    }

    /// Cancel any pending retry. Safe to call when nothing is armed.
    pub fn disarm(&mut self) {
        if let Some(token) = self.guard.take() {
            token.cancel();
        }
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
