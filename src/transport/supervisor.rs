//! Bounded reconnection after an established connection is lost.
//!
//! The supervisor only keeps the schedule and the attempt counter. The event
//! loop in `client` arms a timer at [`ReconnectSupervisor::deadline`], performs
//! the connect itself and reports the outcome back. It never touches the
//! connection directly.
//!
//! ```text
//!            loss                 timer                 ok
//!   Idle ──────────► Scheduled ──────────► Attempting ─────► Idle
//!                        ▲                     │
//!                        └──── failed, n<max ──┤
//!                                              └── failed, n==max ──► Exhausted
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Default number of reconnect attempts before giving up.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Fixed-interval retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before each attempt (not exponential).
    pub interval: Duration,
    /// Attempts after a loss before the supervisor gives up. Zero disables
    /// automatic reconnection.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL,
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Connected, or disconnected on purpose.
    Idle,
    /// Waiting for the timer before the next attempt.
    Scheduled,
    /// A connect attempt is running.
    Attempting,
    /// Gave up; only a manual connect restarts things.
    Exhausted,
}

/// Point-in-time view for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_loss: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    state: SupervisorState,
    attempts: u32,
    next_attempt: Option<Instant>,
    last_loss: Option<DateTime<Utc>>,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: SupervisorState::Idle,
            attempts: 0,
            next_attempt: None,
            last_loss: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.policy.max_attempts,
            last_loss: self.last_loss,
        }
    }

    /// When the next attempt is due, if one is scheduled.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SupervisorState::Scheduled => self.next_attempt,
            _ => None,
        }
    }

    /// An established connection went away.
    ///
    /// Schedules the first attempt one interval from `now`. Returns the
    /// scheduled time, or `None` if nothing was scheduled (already recovering,
    /// exhausted, or reconnection disabled).
    pub fn on_connection_lost(&mut self, now: Instant) -> Option<Instant> {
        self.last_loss = Some(Utc::now());

        if self.state != SupervisorState::Idle {
            return None;
        }
        if self.policy.max_attempts == 0 {
            self.state = SupervisorState::Exhausted;
            return None;
        }

        self.schedule(now)
    }

    /// The timer fired. Returns the 1-based number of the attempt starting.
    pub fn begin_attempt(&mut self) -> u32 {
        self.state = SupervisorState::Attempting;
        self.next_attempt = None;
        self.attempts + 1
    }

    pub fn attempt_succeeded(&mut self) {
        if self.attempts > 0 {
            info!("Reconnected after {} failed attempt(s)", self.attempts);
        }
        self.reset();
    }

    /// The attempt failed. Re-arms the timer or gives up.
    pub fn attempt_failed(&mut self, now: Instant) -> SupervisorState {
        self.attempts += 1;

        if self.attempts >= self.policy.max_attempts {
            warn!(
                "Giving up after {} reconnect attempts",
                self.policy.max_attempts
            );
            self.state = SupervisorState::Exhausted;
            self.next_attempt = None;
        } else {
            self.schedule(now);
        }
        self.state
    }

    /// Forget any schedule and zero the counter.
    ///
    /// Called on every successful connect and on manual disconnect.
    pub fn reset(&mut self) {
        self.state = SupervisorState::Idle;
        self.attempts = 0;
        self.next_attempt = None;
    }

    fn schedule(&mut self, now: Instant) -> Option<Instant> {
        let at = now + self.policy.interval;
        self.state = SupervisorState::Scheduled;
        self.next_attempt = Some(at);
        Some(at)
    }
}
