//! Fixed-window rate limiting per `moltbotId`, applied after signature
//! verification so the limiter keys on an authenticated identity rather than
//! an IP address — §4.5/§6 "100 requests/min per moltbotId, 1-minute window".

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    buckets: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(window_secs: u64, max_requests: u32) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            max_requests,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `moltbot_id` is still within its request budget for
    /// the current window, incrementing its counter as a side effect.
    pub fn allow(&self, moltbot_id: &str) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let entry = buckets
            .entry(moltbot_id.to_string())
            .or_insert((now, 0));
        if now.duration_since(entry.0) > self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.max_requests {
            return false;
        }
        entry.1 += 1;
        true
    }
}
