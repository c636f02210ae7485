use std::sync::Arc;
use std::time::Duration;

use log::trace;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::{Error, Result};

// per-host concurrency cap plus an optional request pacing interval. the
// semaphore is fair (fifo) so a burst of requests to one host drains in
// arrival order. a host without a throttle simply has no entry and callers
// skip the acquire, which keeps tests simple.

pub struct Throttle {
    key: String,
    sem: Arc<Semaphore>,
    capacity: usize,
    // minimum spacing between dispatches, from reqPerSec
    interval: Option<Duration>,
    last: Mutex<Option<Instant>>,
}

pub struct ThrottleGuard {
    _permit: OwnedSemaphorePermit,
}

impl Throttle {
    pub fn new(key: impl Into<String>, capacity: usize, req_per_sec: Option<f64>) -> Throttle {
        let capacity = capacity.max(1);
        let interval = req_per_sec
            .filter(|rps| *rps > 0.0)
            .map(|rps| Duration::from_secs_f64(1.0 / rps));
        Throttle {
            key: key.into(),
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // suspends until a slot frees up; a closed semaphore (client shutdown
    // mid-acquire) surfaces as Canceled
    pub async fn acquire(&self) -> Result<ThrottleGuard> {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Canceled)?;
        Ok(ThrottleGuard { _permit: permit })
    }

    pub fn try_acquire(&self) -> Option<ThrottleGuard> {
        self.sem
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| ThrottleGuard { _permit: permit })
    }

    // sleeps long enough that dispatches to this host stay under the
    // configured rate; serializes on the timestamp lock so concurrent
    // callers each claim their own slot in line
    pub async fn pace(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let mut last = self.last.lock().await;
        let now = Instant::now();
        let at = match *last {
            Some(prev) if prev + interval > now => prev + interval,
            _ => now,
        };
        *last = Some(at);
        drop(last);
        if at > now {
            trace!("rate limit on {}: sleeping {:?}", self.key, at - now);
            tokio::time::sleep_until(at).await;
        }
    }
}

// acquires a slot on every distinct throttle in the list. ordering is
// canonical (sorted by key) and duplicates count once, so two tasks
// multi-acquiring overlapping sets cannot deadlock against each other.
// holding the returned guards while multi-acquiring again is the caller's
// deadlock to avoid; the guard type is linear so the usual pattern of one
// grant per operation makes that structurally hard to hit.
pub async fn acquire_many(throttles: &[Arc<Throttle>]) -> Result<Vec<ThrottleGuard>> {
    let mut sorted: Vec<&Arc<Throttle>> = throttles.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    sorted.dedup_by(|a, b| Arc::ptr_eq(a, b) || a.key == b.key);
    let mut guards = Vec::with_capacity(sorted.len());
    for t in sorted {
        guards.push(t.acquire().await?);
    }
    Ok(guards)
}
