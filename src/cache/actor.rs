use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::debug;

/// (namespace, key) — the unit of serialization for every cache operation
pub(crate) type CacheKey = (String, String);

/// Result of a fill broadcast to parked callers. The error is a plain string
/// so one failure can be delivered to every waiter.
pub(crate) type FillResult = Result<Value, String>;

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub value: Value,
    pub inserted_at: Instant,
    pub ttl: Duration,
    pub stale_window: Duration,
}

impl CacheEntry {
    fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.inserted_at)
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.age(now) <= self.ttl
    }

    /// Past ttl + stale_window the entry may no longer be served at all
    fn is_hard_expired(&self, now: Instant) -> bool {
        self.age(now) > self.ttl + self.stale_window
    }
}

pub(crate) enum CacheCommand {
    Get {
        key: CacheKey,
        reply: oneshot::Sender<Option<(Value, bool, Duration)>>,
    },
    Set {
        key: CacheKey,
        value: Value,
        ttl: Duration,
        stale_window: Duration,
        reply: oneshot::Sender<()>,
    },
    Delete {
        key: CacheKey,
        reply: oneshot::Sender<bool>,
    },
    ClearNamespace {
        namespace: String,
        reply: oneshot::Sender<usize>,
    },
    ClearAll {
        reply: oneshot::Sender<usize>,
    },
    /// The read side of get_with_stale_revalidate: the shard decides
    /// atomically whether this caller serves, claims the fill, or parks.
    Lookup {
        key: CacheKey,
        reply: oneshot::Sender<LookupReply>,
    },
    /// A claim holder reporting back. Stores on success, releases the claim
    /// either way, and wakes every parked waiter.
    Complete {
        key: CacheKey,
        result: FillResult,
        ttl: Duration,
        stale_window: Duration,
    },
    /// Maintenance: drop every hard-expired entry in this shard
    SweepExpired {
        reply: oneshot::Sender<usize>,
    },
    EntryCount {
        reply: oneshot::Sender<usize>,
    },
}

pub(crate) enum LookupReply {
    /// Within ttl: serve as-is
    Fresh { value: Value, age: Duration },
    /// Within the stale window: serve immediately; `claimed` tells the caller
    /// it won the single-flight claim and must run the refresh in the background
    Stale {
        value: Value,
        age: Duration,
        claimed: bool,
    },
    /// Miss or hard-expired, claim won: compute synchronously, then Complete
    MissClaimed,
    /// Miss with a fill already in flight: park until the claim holder reports
    MissWait(oneshot::Receiver<FillResult>),
}

/// One shard of the cache: a task that owns its slice of the key space.
/// Commands are handled strictly in arrival order, which is what gives each
/// key FIFO-serialized reads, writes, and single-flight claims. Fills never
/// run inside the loop; the shard only tracks who holds the claim.
pub(crate) struct CacheShard {
    shard_id: usize,
    entries: HashMap<CacheKey, CacheEntry>,
    /// Presence of a key = a fill claim is held; the vec holds parked waiters
    in_flight: HashMap<CacheKey, Vec<oneshot::Sender<FillResult>>>,
    rx: mpsc::Receiver<CacheCommand>,
}

impl CacheShard {
    pub(crate) fn spawn(shard_id: usize, buffer: usize) -> mpsc::Sender<CacheCommand> {
        let (tx, rx) = mpsc::channel(buffer);
        let shard = CacheShard {
            shard_id,
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            rx,
        };
        tokio::spawn(shard.run());
        tx
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd);
        }
        debug!("cache shard {} shutting down", self.shard_id);
    }

    fn handle(&mut self, cmd: CacheCommand) {
        match cmd {
            CacheCommand::Get { key, reply } => {
                let _ = reply.send(self.lookup_value(&key));
            }
            CacheCommand::Set {
                key,
                value,
                ttl,
                stale_window,
                reply,
            } => {
                self.entries.insert(
                    key,
                    CacheEntry {
                        value,
                        inserted_at: Instant::now(),
                        ttl,
                        stale_window,
                    },
                );
                let _ = reply.send(());
            }
            CacheCommand::Delete { key, reply } => {
                let _ = reply.send(self.entries.remove(&key).is_some());
            }
            CacheCommand::ClearNamespace { namespace, reply } => {
                let before = self.entries.len();
                self.entries.retain(|(ns, _), _| *ns != namespace);
                let _ = reply.send(before - self.entries.len());
            }
            CacheCommand::ClearAll { reply } => {
                let removed = self.entries.len();
                self.entries.clear();
                let _ = reply.send(removed);
            }
            CacheCommand::Lookup { key, reply } => {
                let decision = self.decide_lookup(&key);
                let _ = reply.send(decision);
            }
            CacheCommand::Complete {
                key,
                result,
                ttl,
                stale_window,
            } => {
                let waiters = self.in_flight.remove(&key).unwrap_or_default();
                if let Ok(value) = &result {
                    self.entries.insert(
                        key,
                        CacheEntry {
                            value: value.clone(),
                            inserted_at: Instant::now(),
                            ttl,
                            stale_window,
                        },
                    );
                }
                // A failed fill leaves any prior (stale) entry in place; it
                // keeps serving until hard expiry forces a synchronous retry.
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            }
            CacheCommand::SweepExpired { reply } => {
                let now = Instant::now();
                let before = self.entries.len();
                self.entries.retain(|_, entry| !entry.is_hard_expired(now));
                let _ = reply.send(before - self.entries.len());
            }
            CacheCommand::EntryCount { reply } => {
                let _ = reply.send(self.entries.len());
            }
        }
    }

    fn lookup_value(&mut self, key: &CacheKey) -> Option<(Value, bool, Duration)> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_hard_expired(now) {
                self.entries.remove(key);
                return None;
            }
            let age = entry.age(now);
            return Some((entry.value.clone(), !entry.is_fresh(now), age));
        }
        None
    }

    fn decide_lookup(&mut self, key: &CacheKey) -> LookupReply {
        let now = Instant::now();

        let state = self.entries.get(key).map(|entry| {
            (
                entry.value.clone(),
                entry.age(now),
                entry.is_fresh(now),
                entry.is_hard_expired(now),
            )
        });

        match state {
            Some((value, age, true, _)) => LookupReply::Fresh { value, age },
            Some((value, age, false, false)) => {
                // Stale window: serve immediately, at most one claim
                let claimed = if self.in_flight.contains_key(key) {
                    false
                } else {
                    self.in_flight.insert(key.clone(), Vec::new());
                    true
                };
                LookupReply::Stale {
                    value,
                    age,
                    claimed,
                }
            }
            Some((_, _, false, true)) | None => {
                // Hard-expired entries are dropped and refilled synchronously
                self.entries.remove(key);
                match self.in_flight.get_mut(key) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        LookupReply::MissWait(rx)
                    }
                    None => {
                        self.in_flight.insert(key.clone(), Vec::new());
                        LookupReply::MissClaimed
                    }
                }
            }
        }
    }
}
