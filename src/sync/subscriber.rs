//! ZMQ notification subscriber.
//!
//! Listens for the daemon's `hashtx` and `hashblock` publications and drives
//! the reconciliation engine from them. Each message may carry a per-topic
//! sequence number as a trailing 4-byte frame; a gap in that sequence means
//! notifications were dropped, and the only safe response is a full rescan
//! before handling the message itself.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sync::SyncError;
use crate::sync::engine::ReconcileEngine;

const TOPIC_HASHTX: &[u8] = b"hashtx";
const TOPIC_HASHBLOCK: &[u8] = b"hashblock";

/// How long to sleep between non-blocking socket polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum FeedError {
    /// The feed ended normally.
    #[error("notification feed closed")]
    Closed,

    #[error("notification transport failure: {0}")]
    Transport(String),
}

impl From<zmq::Error> for FeedError {
    fn from(e: zmq::Error) -> Self {
        FeedError::Transport(e.to_string())
    }
}

/// Source of raw multipart notification messages.
#[async_trait]
pub trait NotificationFeed: Send {
    async fn next(&mut self) -> Result<Vec<Vec<u8>>, FeedError>;
}

/// SUB socket over the daemon's `zmqpubhashtx`/`zmqpubhashblock` endpoint.
pub struct ZmqFeed {
    socket: zmq::Socket,
}

impl ZmqFeed {
    pub fn connect(endpoint: &str) -> Result<Self, FeedError> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::SUB)?;
        socket.set_subscribe(TOPIC_HASHTX)?;
        socket.set_subscribe(TOPIC_HASHBLOCK)?;
        socket.connect(endpoint)?;
        info!(%endpoint, "subscribed to daemon notifications");
        Ok(Self { socket })
    }
}

#[async_trait]
impl NotificationFeed for ZmqFeed {
    async fn next(&mut self) -> Result<Vec<Vec<u8>>, FeedError> {
        // Non-blocking receive with an async sleep between polls, so the
        // task stays cooperative without a blocking-thread handoff.
        loop {
            match self.socket.recv_multipart(zmq::DONTWAIT) {
                Ok(frames) => return Ok(frames),
                Err(zmq::Error::EAGAIN) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Per-topic sequence bookkeeping. The first observation of a topic is never
/// a gap.
#[derive(Default)]
struct SequenceTracker {
    last: HashMap<Vec<u8>, u32>,
}

impl SequenceTracker {
    /// Record a sequence number, reporting whether it reveals a gap.
    fn observe(&mut self, topic: &[u8], seq: u32) -> bool {
        let gap = match self.last.get(topic) {
            Some(&prev) => seq != prev.wrapping_add(1),
            None => false,
        };
        self.last.insert(topic.to_vec(), seq);
        gap
    }
}

pub struct EventSubscriber {
    engine: ReconcileEngine,
    tracker: SequenceTracker,
}

impl EventSubscriber {
    pub fn new(engine: ReconcileEngine) -> Self {
        Self {
            engine,
            tracker: SequenceTracker::default(),
        }
    }

    /// Consume the feed until it closes. Per-message failures are logged
    /// and the loop keeps going; only a transport failure ends it with an
    /// error.
    pub async fn run(&mut self, feed: &mut dyn NotificationFeed) -> Result<(), SyncError> {
        loop {
            let frames = match feed.next().await {
                Ok(frames) => frames,
                Err(FeedError::Closed) => {
                    info!("notification feed closed, stopping");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = self.handle_message(&frames).await {
                warn!(error = %e, "failed to handle notification, continuing");
            }
        }
    }

    async fn handle_message(&mut self, frames: &[Vec<u8>]) -> Result<(), SyncError> {
        let Some(topic) = frames.first() else {
            debug!("empty notification, ignoring");
            return Ok(());
        };

        // Trailing 4-byte frame is the publisher's per-topic sequence
        // number. Older daemons omit it.
        if frames.len() >= 3 {
            if let [a, b, c, d] = frames[frames.len() - 1][..] {
                let seq = u32::from_le_bytes([a, b, c, d]);
                if self.tracker.observe(topic, seq) {
                    warn!(
                        topic = %String::from_utf8_lossy(topic),
                        seq,
                        "notification sequence gap, rescanning"
                    );
                    self.engine.rescan().await?;
                }
            }
        }

        match topic.as_slice() {
            TOPIC_HASHTX => {
                let Some(payload) = frames.get(1) else {
                    debug!("hashtx notification without payload, ignoring");
                    return Ok(());
                };
                let txid = hex::encode(payload);
                debug!(%txid, "transaction notification");
                self.engine.handle_tx_hash(&txid).await
            }
            TOPIC_HASHBLOCK => {
                debug!("block notification");
                self.engine.rescan().await
            }
            other => {
                debug!(topic = %String::from_utf8_lossy(other), "ignoring unknown topic");
                Ok(())
            }
        }
    }
}
