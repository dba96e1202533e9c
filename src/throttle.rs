//! Global upload/download rate limiting.
//!
//! Token-bucket throttles with a measured-rate view. The peer I/O layer
//! acquires bytes before moving them and notes what it actually moved; the
//! embedder reads [`Throttle::rate`] for display and scheduling decisions.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

const RATE_WINDOW: Duration = Duration::from_secs(5);

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    // The bucket holds up to two seconds of budget for bursts.
    fn new(bytes_per_sec: u64) -> Self {
        let max_tokens = if bytes_per_sec == 0 {
            f64::MAX
        } else {
            (bytes_per_sec * 2) as f64
        };
        Self {
            tokens: max_tokens,
            max_tokens,
            tokens_per_sec: if bytes_per_sec == 0 {
                f64::MAX
            } else {
                bytes_per_sec as f64
            },
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);
    }

    // Takes `bytes` from the bucket, returning how long the caller should
    // wait before using them.
    fn take(&mut self, bytes: f64, now: Instant) -> Duration {
        self.refill(now);

        if self.tokens >= bytes {
            self.tokens -= bytes;
            Duration::ZERO
        } else {
            let needed = bytes - self.tokens;
            self.tokens = 0.0;
            Duration::from_secs_f64(needed / self.tokens_per_sec)
        }
    }
}

struct RateWindow {
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            total: 0,
        }
    }

    fn note(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back((now, bytes));
        self.total += bytes;
        self.expire(now);
    }

    fn rate(&mut self, now: Instant) -> u64 {
        self.expire(now);
        self.total / RATE_WINDOW.as_secs()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(ts, bytes)) = self.samples.front() {
            if now.duration_since(ts) > RATE_WINDOW {
                self.samples.pop_front();
                self.total -= bytes;
            } else {
                break;
            }
        }
    }
}

/// One direction's global throttle: a byte budget plus a measured rate.
///
/// A limit of zero means unlimited; [`acquire`] then never waits.
///
/// [`acquire`]: Throttle::acquire
pub struct Throttle {
    limit: Mutex<u64>,
    bucket: Mutex<TokenBucket>,
    rate: Mutex<RateWindow>,
}

impl Throttle {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            limit: Mutex::new(bytes_per_sec),
            bucket: Mutex::new(TokenBucket::new(bytes_per_sec)),
            rate: Mutex::new(RateWindow::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// The configured limit in bytes per second; zero means unlimited.
    pub fn limit(&self) -> u64 {
        *self.limit.lock()
    }

    pub fn set_limit(&self, bytes_per_sec: u64) {
        *self.limit.lock() = bytes_per_sec;
        *self.bucket.lock() = TokenBucket::new(bytes_per_sec);
    }

    /// Waits until `bytes` of budget are available.
    pub async fn acquire(&self, bytes: usize) {
        let wait = self.bucket.lock().take(bytes as f64, Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Records bytes actually transferred, feeding the rate view.
    pub fn note(&self, bytes: u64) {
        self.rate.lock().note(bytes, Instant::now());
    }

    /// The measured transfer rate in bytes per second, averaged over the
    /// sampling window.
    pub fn rate(&self) -> u64 {
        self.rate.lock().rate(Instant::now())
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}
