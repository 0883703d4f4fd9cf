//! Escalating reconnect timer.
//!
//! A [`BackoffTimer`] fires immediately when armed and then keeps firing,
//! waiting a little longer after every fire. Each fire is delivered to the
//! owner as a [`TimerSignal::Tick`] over a channel; the owner decides what
//! a tick means. Every arming gets a fresh epoch, so ticks still queued
//! from before a `stop()` can be told apart and dropped.

use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How the delay grows with the attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Always `seed`.
    Fixed,
    /// `seed * attempts`.
    #[default]
    Linear,
    /// `seed * 2^(attempts - 1)`.
    Exponential,
}

/// What happens once `max_attempts` fires have happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Start counting again from the first attempt.
    #[default]
    Reset,
    /// Disarm and report exhaustion.
    Stop,
}

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_ms", rename = "seed_ms")]
    pub seed: Duration,
    pub strategy: Strategy,
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    pub overrun: OverrunPolicy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            seed: Duration::from_secs(1),
            strategy: Strategy::Linear,
            max_attempts: 1000,
            max_delay: Duration::from_secs(60),
            overrun: OverrunPolicy::Reset,
        }
    }
}

impl BackoffConfig {
    pub fn with_seed(mut self, seed: Duration) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_overrun(mut self, overrun: OverrunPolicy) -> Self {
        self.overrun = overrun;
        self
    }

    /// Delay to wait after fire number `attempts` (1-based).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let delay = match self.strategy {
            Strategy::Fixed => Some(self.seed),
            Strategy::Linear => self.seed.checked_mul(attempts),
            Strategy::Exponential => 2u32
                .checked_pow(attempts - 1)
                .and_then(|factor| self.seed.checked_mul(factor)),
        };
        delay.map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Signals delivered to the timer's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSignal {
    /// The timer fired for the `attempts`th time since it was armed and
    /// will fire again after `delay`.
    Tick {
        epoch: u64,
        attempts: u32,
        delay: Duration,
    },
    /// `max_attempts` was reached under [`OverrunPolicy::Stop`].
    Exhausted { epoch: u64 },
}

impl TimerSignal {
    pub fn epoch(&self) -> u64 {
        match self {
            TimerSignal::Tick { epoch, .. } | TimerSignal::Exhausted { epoch } => *epoch,
        }
    }
}

/// Attempt count and epoch, shared between the timer and its task. The
/// task only writes while its epoch is current.
#[derive(Debug, Default)]
struct Count {
    epoch: u64,
    attempts: u32,
}

/// Read handle on a timer's attempt count.
#[derive(Debug, Clone)]
pub(crate) struct AttemptCounter(Arc<Mutex<Count>>);

impl AttemptCounter {
    pub(crate) fn get(&self) -> u32 {
        self.0.lock().attempts
    }
}

/// An escalating retry timer. Must be armed from within a Tokio runtime.
pub struct BackoffTimer {
    config: BackoffConfig,
    signals: mpsc::UnboundedSender<TimerSignal>,
    count: Arc<Mutex<Count>>,
    task: Option<JoinHandle<()>>,
}

impl BackoffTimer {
    pub fn new(mut config: BackoffConfig, signals: mpsc::UnboundedSender<TimerSignal>) -> Self {
        config.max_attempts = config.max_attempts.max(1);
        Self {
            config,
            signals,
            count: Arc::new(Mutex::new(Count::default())),
            task: None,
        }
    }

    /// Arms the timer; the first fire is immediate. Returns `false` if it
    /// was already armed.
    pub fn start(&mut self) -> bool {
        self.arm(None)
    }

    /// Arms the timer with the first fire one `seed` away. Returns `false`
    /// if it was already armed.
    pub fn start_deferred(&mut self) -> bool {
        self.arm(Some(self.config.seed))
    }

    fn arm(&mut self, first_delay: Option<Duration>) -> bool {
        if self.is_armed() {
            return false;
        }
        let epoch = {
            let mut count = self.count.lock();
            count.epoch += 1;
            count.attempts = 0;
            count.epoch
        };
        self.task = Some(tokio::spawn(Self::run(
            self.config.clone(),
            epoch,
            first_delay,
            self.count.clone(),
            self.signals.clone(),
        )));
        true
    }

    /// Disarms the timer and resets the attempt count. Returns `false` if
    /// it was not armed.
    pub fn stop(&mut self) -> bool {
        let task = self.task.take();
        {
            let mut count = self.count.lock();
            count.attempts = 0;
            if task.is_some() {
                count.epoch += 1;
            }
        }
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Whether the timer will fire again.
    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Fires since the timer was last armed or reset.
    pub fn attempts(&self) -> u32 {
        self.count.lock().attempts
    }

    pub(crate) fn counter(&self) -> AttemptCounter {
        AttemptCounter(self.count.clone())
    }

    /// Epoch of the current arming. Signals from other epochs are stale.
    pub fn epoch(&self) -> u64 {
        self.count.lock().epoch
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    async fn run(
        config: BackoffConfig,
        epoch: u64,
        first_delay: Option<Duration>,
        count: Arc<Mutex<Count>>,
        signals: mpsc::UnboundedSender<TimerSignal>,
    ) {
        if let Some(delay) = first_delay {
            tokio::time::sleep(delay).await;
        }
        loop {
            let current = {
                let mut count = count.lock();
                if count.epoch != epoch {
                    return;
                }
                let next = count.attempts + 1;
                if next <= config.max_attempts {
                    count.attempts = next;
                    Some(next)
                } else if config.overrun == OverrunPolicy::Reset {
                    count.attempts = 1;
                    Some(1)
                } else {
                    None
                }
            };
            let Some(current) = current else {
                tracing::debug!("Backoff exhausted after {} attempts", config.max_attempts);
                let _ = signals.send(TimerSignal::Exhausted { epoch });
                return;
            };

            let delay = config.delay_for(current);
            let tick = TimerSignal::Tick {
                epoch,
                attempts: current,
                delay,
            };
            if signals.send(tick).is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
        }
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for BackoffTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffTimer")
            .field("config", &self.config)
            .field("attempts", &self.attempts())
            .field("epoch", &self.epoch())
            .field("armed", &self.is_armed())
            .finish()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
