//! Adaptive load shedding for accept-heavy reactors.
//!
//! The controller maintains an exponentially smoothed estimate of the time
//! the loop spends per ready key, predicts the cost of the next tick, and
//! converts any excess over the target tick time into a drop probability.
//! Admission is a Bernoulli trial against that probability, so shedding
//! stays proportional under sustained overload and decays to zero a fixed
//! step per tick once load subsides.

use std::cell::Cell;
use std::time::Duration;

/// Tuning knobs for [`ThrottlingController`].
#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Time budget per tick; predicted cost above it triggers throttling.
    pub target_time: Duration,
    /// Allowance for external stalls. A tick exceeding the prediction by
    /// more than this is clamped before it pollutes the estimate.
    pub stall_time: Duration,
    /// Smoothing window for the per-key time and throttling averages.
    pub smoothing_window: Duration,
    /// How much the throttling probability decays each tick.
    pub throttling_decrease: f64,
    /// Seed for the per-key time estimate, in keys per second.
    pub initial_keys_per_second: f64,
    /// Initial throttling probability.
    pub initial_throttling: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            target_time: Duration::from_millis(20),
            stall_time: Duration::from_millis(20),
            smoothing_window: Duration::from_secs(10),
            throttling_decrease: 0.1,
            initial_keys_per_second: 100.0,
            initial_throttling: 0.0,
        }
    }
}

/// Per-reactor adaptive throttling controller.
///
/// The reactor drives [`recalculate`](Self::recalculate) after each poll
/// and [`update_round`](Self::update_round) after the work phases; servers
/// consult [`is_request_throttled`](Self::is_request_throttled) on every
/// accepted connection.
pub struct ThrottlingController {
    target_time_ms: f64,
    stall_time_ms: f64,
    smoothing_window_ms: f64,
    throttling_decrease: f64,

    // intermediate counters for the current round
    buffered_requests: Cell<u32>,
    buffered_throttled: Cell<u32>,

    // exponentially smoothed values
    smoothed_throttling: Cell<f64>,
    smoothed_time_per_key_ms: Cell<f64>,

    throttling: Cell<f64>,

    // cumulative counters
    total_requests: Cell<u64>,
    total_throttled: Cell<u64>,
    total_time_ms: Cell<u64>,
    rounds: Cell<u64>,
    rounds_zero_throttling: Cell<u64>,
    rounds_over_target: Cell<u64>,
    rounds_stalled: Cell<u64>,
}

impl ThrottlingController {
    pub fn new(config: ThrottleConfig) -> ThrottlingController {
        assert!(
            config.target_time > Duration::ZERO,
            "target time must be positive"
        );
        assert!(
            config.smoothing_window > Duration::ZERO,
            "smoothing window must be positive"
        );
        assert!(
            (0.0..=1.0).contains(&config.throttling_decrease),
            "throttling decrease must lie in [0;1]"
        );
        assert!(
            config.initial_keys_per_second > 0.0,
            "initial keys per second must be positive"
        );
        assert!(
            config.initial_throttling >= 0.0,
            "initial throttling must not be negative"
        );

        ThrottlingController {
            target_time_ms: config.target_time.as_secs_f64() * 1000.0,
            stall_time_ms: config.stall_time.as_secs_f64() * 1000.0,
            smoothing_window_ms: config.smoothing_window.as_secs_f64() * 1000.0,
            throttling_decrease: config.throttling_decrease,
            buffered_requests: Cell::new(0),
            buffered_throttled: Cell::new(0),
            smoothed_throttling: Cell::new(config.initial_throttling),
            smoothed_time_per_key_ms: Cell::new(1000.0 / config.initial_keys_per_second),
            throttling: Cell::new(config.initial_throttling),
            total_requests: Cell::new(0),
            total_throttled: Cell::new(0),
            total_time_ms: Cell::new(0),
            rounds: Cell::new(0),
            rounds_zero_throttling: Cell::new(0),
            rounds_over_target: Cell::new(0),
            rounds_stalled: Cell::new(0),
        }
    }

    pub fn with_defaults() -> ThrottlingController {
        ThrottlingController::new(ThrottleConfig::default())
    }

    /// Bernoulli admission trial: `true` means shed this request.
    pub fn is_request_throttled(&self) -> bool {
        self.buffered_requests.set(self.buffered_requests.get() + 1);
        if f64::from(fastrand::f32()) < self.throttling.get() {
            self.buffered_throttled.set(self.buffered_throttled.get() + 1);
            return true;
        }
        false
    }

    /// Recomputes the drop probability from the predicted cost of `keys`
    /// ready keys. Called once per tick, right after the poll returns.
    pub fn recalculate(&self, keys: usize) {
        let predicted_ms = keys as f64 * self.smoothed_time_per_key_ms.get();

        let mut throttling = self.smoothed_throttling.get() - self.throttling_decrease;
        if throttling < 0.0 {
            throttling = 0.0;
        }
        if predicted_ms > self.target_time_ms {
            let extra = 1.0 - self.target_time_ms / predicted_ms;
            if extra > throttling {
                throttling = extra;
                self.rounds_over_target.set(self.rounds_over_target.get() + 1);
            }
        }

        if throttling == 0.0 {
            self.rounds_zero_throttling
                .set(self.rounds_zero_throttling.get() + 1);
        }
        self.rounds.set(self.rounds.get() + 1);

        self.throttling.set(throttling);
    }

    /// Folds the round's measurements into the smoothed estimates.
    ///
    /// `keys` is the ready-key count of the round and `round_time` the time
    /// spent in the work phases.
    pub fn update_round(&self, keys: usize, round_time: Duration) {
        let mut round_ms = round_time.as_secs_f64() * 1000.0;
        if !(0.0..=60_000.0).contains(&round_ms) {
            tracing::warn!(round_ms, "invalid round time, skipping throttling update");
            return;
        }

        let predicted_ms = keys as f64 * self.smoothed_time_per_key_ms.get();
        if self.stall_time_ms != 0.0 && round_ms > predicted_ms + self.stall_time_ms {
            tracing::debug!(round_ms, keys, "stall detected");
            round_ms = predicted_ms + self.stall_time_ms;
            self.rounds_stalled.set(self.rounds_stalled.get() + 1);
        }

        let weight = 1.0 - 1.0 / self.smoothing_window_ms;

        let requests = self.buffered_requests.get();
        if requests != 0 {
            let throttled = self.buffered_throttled.get();
            debug_assert!(throttled <= requests);
            let value = f64::from(throttled) / f64::from(requests);
            let smoothed = self.smoothed_throttling.get();
            self.smoothed_throttling
                .set((smoothed - value) * weight.powi(requests as i32) + value);
            self.total_requests
                .set(self.total_requests.get() + u64::from(requests));
            self.total_throttled
                .set(self.total_throttled.get() + u64::from(throttled));
            self.buffered_requests.set(0);
            self.buffered_throttled.set(0);
        }

        if keys != 0 {
            let value = round_ms / keys as f64;
            let smoothed = self.smoothed_time_per_key_ms.get();
            self.smoothed_time_per_key_ms
                .set((smoothed - value) * weight.powi(keys.min(i32::MAX as usize) as i32) + value);
        }

        self.total_time_ms
            .set(self.total_time_ms.get() + round_ms as u64);
    }

    /// Current drop probability, in `[0;1]`.
    pub fn throttling(&self) -> f64 {
        self.throttling.get()
    }

    pub fn avg_time_per_key(&self) -> Duration {
        Duration::from_secs_f64(self.smoothed_time_per_key_ms.get() / 1000.0)
    }

    pub fn avg_keys_per_second(&self) -> f64 {
        1000.0 / self.smoothed_time_per_key_ms.get()
    }

    pub fn avg_throttling(&self) -> f64 {
        self.smoothed_throttling.get()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.get()
    }

    pub fn total_requests_throttled(&self) -> u64 {
        self.total_throttled.get()
    }

    pub fn total_processed(&self) -> u64 {
        self.total_requests.get() - self.total_throttled.get()
    }

    pub fn rounds(&self) -> u64 {
        self.rounds.get()
    }

    pub fn rounds_zero_throttling(&self) -> u64 {
        self.rounds_zero_throttling.get()
    }

    pub fn rounds_over_target(&self) -> u64 {
        self.rounds_over_target.get()
    }

    pub fn rounds_stalled(&self) -> u64 {
        self.rounds_stalled.get()
    }
}
