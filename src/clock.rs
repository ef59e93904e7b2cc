//! Monotonic timebase and delay strategies (C1).
//!
//! Every deadline in the runtime is computed against [`std::time::Instant`],
//! never wall-clock time, so delay strategies are immune to clock adjustment.
//! Backoff math is grounded in the same saturating-arithmetic style used for
//! HTTP retry scheduling elsewhere in the corpus: every strategy caps out at
//! a safe ceiling rather than overflowing or panicking on a large attempt
//! count.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// A strategy for computing the delay before the next attempt, given a
/// 1-based attempt number.
#[derive(Clone)]
pub enum DelayStrategy {
    /// No delay — the next attempt is scheduled immediately.
    Immediate,
    /// A fixed delay before every attempt.
    By(Duration),
    /// Delay until an absolute deadline, regardless of attempt number.
    From(Instant),
    /// `base * factor^(attempt - 1)`, saturating rather than overflowing.
    Exponential { base: Duration, factor: f64 },
    /// A caller-supplied function from attempt number to delay.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl DelayStrategy {
    /// Compute the delay to wait before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            DelayStrategy::Immediate => Duration::ZERO,
            DelayStrategy::By(d) => *d,
            DelayStrategy::From(deadline) => {
                deadline.saturating_duration_since(Instant::now())
            }
            DelayStrategy::Exponential { base, factor } => {
                let exponent = attempt.saturating_sub(1).min(32);
                let multiplier = factor.max(1.0).powi(exponent as i32);
                let nanos = (base.as_nanos() as f64 * multiplier).min(u64::MAX as f64);
                Duration::from_nanos(nanos as u64)
            }
            DelayStrategy::Custom(f) => f(attempt),
        }
    }

    /// Compute the absolute deadline for attempt `attempt`, anchored to `now`.
    pub fn deadline_for(&self, attempt: u32, now: Instant) -> Instant {
        now + self.delay_for(attempt)
    }
}

impl Default for DelayStrategy {
    fn default() -> Self {
        DelayStrategy::Immediate
    }
}

impl std::fmt::Debug for DelayStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelayStrategy::Immediate => write!(f, "Immediate"),
            DelayStrategy::By(d) => write!(f, "By({d:?})"),
            DelayStrategy::From(i) => write!(f, "From({i:?})"),
            DelayStrategy::Exponential { base, factor } => {
                write!(f, "Exponential {{ base: {base:?}, factor: {factor} }}")
            }
            DelayStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Block the current thread until `deadline`, or return immediately if
/// `deadline` has already passed.
///
/// Used by the scheduler thread that drives retry re-attempts; never called
/// from within an operation's own `execute` body on a worker thread that
/// must remain free for other work.
pub fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        std::thread::sleep(deadline - now);
    }
}
