//! In-memory sliding-window rate limiting, per IP and per site.
//! Sharded mutexes over a hashed key, so one hot site/IP does not serialize
//! every other caller behind a single lock.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const SHARDS: usize = 32;

type Shard = Mutex<HashMap<String, VecDeque<Instant>>>;

pub struct RateLimiter {
    ip_shards: [Shard; SHARDS],
    site_shards: [Shard; SHARDS],
    per_ip_limit: u32,
    per_site_limit: u32,
}

pub enum Scope {
    Ip,
    Site,
}

impl RateLimiter {
    pub fn new(per_ip_limit: u32, per_site_limit: u32) -> Self {
        Self {
            ip_shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
            site_shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
            per_ip_limit,
            per_site_limit,
        }
    }

    /// Records one request against `key` under `scope` and returns `Ok(())`
    /// if it is within the limit, or `Err(retry_after)` otherwise. Entries
    /// older than the window are dropped on every call rather than on a
    /// separate sweep — the queue for a key never grows past its own limit.
    pub fn check(&self, scope: Scope, key: &str) -> Result<(), Duration> {
        let (shards, limit) = match scope {
            Scope::Ip => (&self.ip_shards, self.per_ip_limit),
            Scope::Site => (&self.site_shards, self.per_site_limit),
        };
        let shard = &shards[shard_index(key)];
        let now = Instant::now();

        let mut map = shard.lock().unwrap_or_else(|e| e.into_inner());
        let queue = map.entry(key.to_string()).or_default();
        while let Some(front) = queue.front() {
            if now.duration_since(*front) > WINDOW {
                queue.pop_front();
            } else {
                break;
            }
        }

        if queue.len() as u32 >= limit {
            let retry_after = WINDOW
                .checked_sub(now.duration_since(*queue.front().unwrap_or(&now)))
                .unwrap_or(Duration::from_secs(1));
            return Err(retry_after);
        }

        queue.push_back(now);
        Ok(())
    }
}

fn shard_index(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}
