//! First-answer-wins resolution across every configured upstream.
//!
//! Each query gets its own [`Slot`]: a oneshot sender behind a mutex. An
//! attempt that succeeds takes the sender out and sends while still holding
//! the lock, so claiming the win and handing over the answer are one step.
//! Whoever finds the slot empty lost the race (or the race is over) and drops
//! its answer. The resolver waits for the slot's receiver or the deadline,
//! whichever comes first, then empties the slot before letting go of the
//! receiver.

use anyhow::{Context, Result};
use hickory_proto::op::Message;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::reply::{empty_reply, provider_record, stamp_reply};
use crate::upstream::Upstream;

/// What the listener sends back for one query
#[derive(Debug)]
pub struct RaceOutcome {
    /// Whether an upstream answered before the deadline
    pub won: bool,
    /// The winning reply, or an empty reply addressed to the query
    pub response: Message,
    /// Label of the winning upstream
    pub upstream: Option<String>,
}

impl RaceOutcome {
    fn empty(query: &Message) -> Self {
        Self {
            won: false,
            response: empty_reply(query),
            upstream: None,
        }
    }
}

struct Winner {
    response: Message,
    upstream: String,
}

/// Single-claim handoff shared by the attempts of one query
struct Slot {
    sender: Mutex<Option<oneshot::Sender<Winner>>>,
    /// Attempts that have neither failed nor been abandoned yet
    pending: AtomicUsize,
}

impl Slot {
    fn new(sender: oneshot::Sender<Winner>, attempts: usize) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            pending: AtomicUsize::new(attempts),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<oneshot::Sender<Winner>>> {
        // Nothing in the critical section can leave the option half-updated
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot and hand `winner` over. Returns false if the slot was
    /// already claimed or closed, in which case `winner` is dropped.
    fn deliver(&self, winner: Winner) -> bool {
        let mut sender = self.lock();
        match sender.take() {
            Some(sender) => sender.send(winner).is_ok(),
            None => false,
        }
    }

    /// Record a failed attempt; the last one closes the slot so the resolver
    /// stops waiting
    fn fail(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.close();
        }
    }

    fn close(&self) {
        self.lock().take();
    }
}

/// Races a query against every upstream and keeps the first answer
pub struct Resolver {
    upstreams: Vec<Arc<Upstream>>,
    timeout: Duration,
    provider_record: bool,
}

impl Resolver {
    pub fn new(upstreams: Vec<Upstream>, timeout: Duration) -> Self {
        Self {
            upstreams: upstreams.into_iter().map(Arc::new).collect(),
            timeout,
            provider_record: true,
        }
    }

    /// Whether winning replies carry a `dns.provider.` TXT record
    pub fn with_provider_record(mut self, enabled: bool) -> Self {
        self.provider_record = enabled;
        self
    }

    /// Build every configured upstream; any invalid upstream is a fatal
    /// configuration error
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut upstreams = Vec::with_capacity(config.upstreams.len());
        for (idx, upstream_config) in config.upstreams.iter().enumerate() {
            let upstream = Upstream::new(upstream_config.clone())
                .with_context(|| format!("Upstream #{} is misconfigured", idx + 1))?;
            info!(
                "Initialized upstream: {} ({:?} mode)",
                upstream.label(),
                upstream.config().mode
            );
            upstreams.push(upstream);
        }

        if upstreams.is_empty() {
            warn!("No upstreams configured, every query will get an empty reply");
        }

        Ok(Self::new(upstreams, config.server.timeout())
            .with_provider_record(config.server.provider_record))
    }

    /// Resolve `query` against all upstreams. Always produces a reply
    /// addressed to `query` within the timeout.
    pub async fn resolve(&self, query: &Message) -> RaceOutcome {
        if self.upstreams.is_empty() {
            return RaceOutcome::empty(query);
        }

        let (sender, mut receiver) = oneshot::channel();
        let slot = Arc::new(Slot::new(sender, self.upstreams.len()));
        let shared_query = Arc::new(query.clone());

        for upstream in &self.upstreams {
            let upstream = upstream.clone();
            let slot = slot.clone();
            let query = shared_query.clone();
            let provider_record_enabled = self.provider_record;

            tokio::spawn(async move {
                let attempt = upstream.attempt(&query).await;
                let Some(mut response) = attempt.response else {
                    slot.fail();
                    return;
                };

                if provider_record_enabled {
                    response.add_answer(provider_record(upstream.label(), attempt.latency));
                }

                let winner = Winner {
                    response,
                    upstream: upstream.label().to_string(),
                };
                if !slot.deliver(winner) {
                    debug!("Discarding late answer from {}", upstream.label());
                }
            });
        }

        let delivered = tokio::time::timeout(self.timeout, &mut receiver).await;
        // Late attempts must find the slot empty, never a dropped receiver
        slot.close();
        drop(receiver);

        match delivered {
            Ok(Ok(Winner {
                mut response,
                upstream,
            })) => {
                stamp_reply(&mut response, query);
                RaceOutcome {
                    won: true,
                    response,
                    upstream: Some(upstream),
                }
            }
            Ok(Err(_)) => {
                debug!("All {} upstreams failed, answering empty", self.upstreams.len());
                RaceOutcome::empty(query)
            }
            Err(_) => {
                debug!("No upstream answered within {:?}, answering empty", self.timeout);
                RaceOutcome::empty(query)
            }
        }
    }
}
