use std::time::Duration;

/// Jitter strategy applied on top of the capped exponential delay.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Jitter {
    /// Deterministic delays. Used by tests.
    None,
    /// Full jitter: uniform in `[0, capped_delay]`. Used by the ingestion
    /// bridge so a fleet of bridges does not thunder the broker in lockstep.
    Full,
    /// Banded jitter: `capped_delay * (1 ± factor)`. Used by the client.
    Factor(f64),
}

/// Exponential backoff with cap and jitter, indexed by attempt number so the
/// schedule is computable without timers.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: Jitter,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: Jitter) -> Self {
        Self { base, cap, jitter }
    }

    /// Ingestion policy: base 1s, cap 30s, full jitter.
    pub fn ingestion() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), Jitter::Full)
    }

    /// Capped exponential without jitter: `min(cap, base * 2^attempt)`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(63) as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for the given attempt (0-based), with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.raw_delay(attempt).as_millis() as f64;
        let ms = match self.jitter {
            Jitter::None => capped,
            Jitter::Full => {
                let span = capped as u64;
                if span == 0 {
                    0.0
                } else {
                    (random_u64() % (span + 1)) as f64
                }
            }
            Jitter::Factor(factor) => {
                let range = capped * factor;
                let jitter = (random_u64() % (range as u64 * 2 + 1)) as f64 - range;
                (capped + jitter).max(0.0)
            }
        };
        Duration::from_millis(ms as u64)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

/// Simple non-cryptographic random u64 using thread-local xorshift state.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
                | 1
        );
    }

    STATE.with(|s| {
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}
