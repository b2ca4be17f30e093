use anyhow::{anyhow, Result};
use atrium_api::app::bsky::actor::profile::Record as ProfileRecord;
use atrium_api::app::bsky::feed::like::Record as LikeRecord;
use atrium_api::app::bsky::feed::post::Record as PostRecord;
use atrium_api::app::bsky::feed::repost::Record as RepostRecord;
use atrium_api::app::bsky::graph::follow::Record as FollowRecord;
use atrium_repo::blockstore::{AsyncBlockStoreRead, CarStore};
use futures::StreamExt;
use ipld_core::cid::Cid;
use serde::de::DeserializeOwned;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::cursor::CursorStore;
use crate::failed::{FailedMessage, FailedMessageStore};
use crate::handlers::RecordHandlers;
use crate::lexicon::{self, Commit, RepoMessage, RepoOperation, NSID};
use crate::limiter::{RateLimiter, BASELINE_MIN_TIME};
use crate::metrics;
use crate::stream::frames::Frame;
use crate::subscription::Subscription;

// A message is retried this many times through the failed queue before it
// is discarded.
const MAX_MESSAGE_RETRIES: u32 = 3;

// Bound on messages being handled at once; within a message ops run in
// order, but distinct commits may overlap.
const MAX_CONCURRENT_MESSAGES: usize = 64;

// Adaptive throttle: sampled every 15 s, these event rates widen the gap
// between outbound API calls while the firehose runs hot.
const THROTTLE_INTERVAL: Duration = Duration::from_secs(15);
const HOT_EPS: f64 = 350.0;
const WARM_EPS: f64 = 280.0;
const HOT_MIN_TIME: Duration = Duration::from_millis(750);
const WARM_MIN_TIME: Duration = Duration::from_millis(300);

// WebSocket connection wrapper
struct RepoSubscription {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RepoSubscription {
    async fn new(relay_url: &str, cursor: Option<i64>) -> Result<Self> {
        let ws_url = match cursor {
            Some(seq) => format!("{}/xrpc/{}?cursor={}", relay_url, NSID, seq),
            None => format!("{}/xrpc/{}", relay_url, NSID),
        };
        info!("Connecting to firehose at: {}", ws_url);

        let (stream, _) = connect_async(ws_url).await?;
        info!("WebSocket connection established");

        Ok(RepoSubscription { stream })
    }
}

impl Subscription for RepoSubscription {
    async fn next(&mut self) -> Option<Result<Frame>> {
        while let Some(result) = self.stream.next().await {
            match result {
                Ok(Message::Binary(data)) => return Some(Frame::try_from(&data[..])),
                Ok(Message::Close(_)) => return None,
                // Pings and pongs are handled by tungstenite itself.
                Ok(_) => continue,
                Err(e) => return Some(Err(anyhow::Error::new(e))),
            }
        }
        None
    }
}

fn decode_record<T: DeserializeOwned>(collection: &str, block: &[u8]) -> Result<T> {
    serde_ipld_dagcbor::from_slice(block)
        .map_err(|e| anyhow!("Failed to decode {} record: {}", collection, e))
}

fn split_path(path: &str) -> (&str, &str) {
    match path.split_once('/') {
        Some((collection, rkey)) => (collection, rkey),
        None => (path, ""),
    }
}

fn failure_key(message: &RepoMessage) -> String {
    match message {
        RepoMessage::Commit(c) => format!("{}::{}", c.repo, c.rev),
        RepoMessage::Handle(m) => format!("{}::#handle", m.did),
        RepoMessage::Identity(m) => format!("{}::#identity", m.did),
        RepoMessage::Tombstone(m) => format!("{}::#tombstone", m.did),
        RepoMessage::Account(m) => format!("{}::#account", m.did),
        RepoMessage::Info(m) => format!("info::{}", m.name),
    }
}

/// Decodes typed messages off the stream and routes them to the record
/// handlers. The single catch site for handler errors: a failed message is
/// captured into the durable queue and the cursor still advances, since the
/// message is then replayed from the queue at startup.
pub struct Dispatcher {
    handlers: RecordHandlers,
    cursor: Arc<CursorStore>,
    failed: Arc<FailedMessageStore>,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        handlers: RecordHandlers,
        cursor: Arc<CursorStore>,
        failed: Arc<FailedMessageStore>,
    ) -> Self {
        Self {
            handlers,
            cursor,
            failed,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_MESSAGES)),
        }
    }

    /// Process one framed message body. Validation failures are fatal to
    /// the message only; handler failures are captured into the failed
    /// queue under `<repo>::<rev>` (commits) or `<did>::<kind>`.
    pub async fn process_body(&self, t: &str, body: &[u8], advance_cursor: bool) {
        let message = match lexicon::parse_message(t, body) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(t, "Skipping unhandled message type");
                return;
            }
            Err(e) => {
                warn!(t, "Rejecting message that failed validation: {}", e);
                return;
            }
        };

        metrics::EVENTS_PROCESSED.inc();

        if let Err(e) = self.handle_message(&message).await {
            metrics::COMMITS_FAILED.inc();
            let key = failure_key(&message);
            error!(key = %key, "Capturing failed message: {:#}", e);
            if let Err(e) = self
                .failed
                .insert(
                    &key,
                    FailedMessage {
                        kind: t.to_string(),
                        body: body.to_vec(),
                        retries: 0,
                    },
                )
                .await
            {
                error!("Failed to persist failed message: {}", e);
            }
        }

        if advance_cursor {
            if let Some(seq) = message.seq() {
                self.cursor.advance(seq).await;
            }
        }
    }

    async fn handle_message(&self, message: &RepoMessage) -> Result<()> {
        match message {
            RepoMessage::Commit(commit) => self.handle_commit(commit).await,
            RepoMessage::Handle(m) => self.handlers.handle_update(&m.did, &m.handle).await,
            // An identity message carries no profile fields; treat it as a
            // refresh of the actor by DID.
            RepoMessage::Identity(m) => self.handlers.actor_update(&m.did, None).await,
            RepoMessage::Tombstone(m) => self.handlers.actor_delete(&m.did).await,
            RepoMessage::Account(m) => {
                debug!(did = %m.did, active = m.active, "Skipping account message");
                Ok(())
            }
            RepoMessage::Info(m) => {
                info!(name = %m.name, message = ?m.message, "Relay info");
                Ok(())
            }
        }
    }

    async fn handle_commit(&self, commit: &Commit) -> Result<()> {
        if commit.blocks.is_empty() {
            return Ok(());
        }

        let mut car = CarStore::open(Cursor::new(&commit.blocks[..]))
            .await
            .map_err(|e| anyhow!("Failed to open CAR for {}: {}", commit.repo, e))?;

        for op in &commit.ops {
            let uri = format!("at://{}/{}", commit.repo, op.path);
            match op.action.as_str() {
                "create" | "update" => {
                    let Some(cid) = op.cid else {
                        debug!(uri = %uri, "Skipping op without a record cid");
                        continue;
                    };

                    let mut block = Vec::new();
                    if car.read_block_into(cid, &mut block).await.is_err() {
                        debug!(uri = %uri, "Record block missing from commit CAR");
                        continue;
                    }

                    self.dispatch_record(commit, op, &uri, cid, &block).await?;
                }
                "delete" => self.dispatch_delete(commit, op, &uri).await?,
                other => debug!(action = other, "Skipping unknown op action"),
            }
        }

        Ok(())
    }

    async fn dispatch_record(
        &self,
        commit: &Commit,
        op: &RepoOperation,
        uri: &str,
        cid: Cid,
        block: &[u8],
    ) -> Result<()> {
        let (collection, rkey) = split_path(&op.path);
        let repo = commit.repo.as_str();

        match (collection, op.action.as_str()) {
            ("app.bsky.feed.post", "create") => {
                let record: PostRecord = decode_record(collection, block)?;
                self.handlers
                    .post_create(repo, uri, &cid.to_string(), &record)
                    .await
            }
            ("app.bsky.feed.like", "create") => {
                let record: LikeRecord = decode_record(collection, block)?;
                self.handlers.like_create(repo, rkey, &record).await
            }
            ("app.bsky.feed.repost", "create") => {
                let record: RepostRecord = decode_record(collection, block)?;
                self.handlers.repost_create(repo, rkey, &record).await
            }
            ("app.bsky.graph.follow", "create") => {
                let record: FollowRecord = decode_record(collection, block)?;
                self.handlers.follow_create(repo, rkey, &record).await
            }
            ("app.bsky.actor.profile", "create") => self.handlers.actor_create(repo).await,
            ("app.bsky.actor.profile", "update") => {
                let record: ProfileRecord = decode_record(collection, block)?;
                self.handlers.actor_update(repo, Some(&record)).await
            }
            _ => {
                debug!(collection, action = %op.action, "Skipping unhandled record kind");
                Ok(())
            }
        }
    }

    async fn dispatch_delete(&self, commit: &Commit, op: &RepoOperation, uri: &str) -> Result<()> {
        let (collection, rkey) = split_path(&op.path);
        let repo = commit.repo.as_str();

        match collection {
            "app.bsky.feed.post" => self.handlers.post_delete(uri).await,
            "app.bsky.feed.like" => self.handlers.like_delete(repo, rkey).await,
            "app.bsky.feed.repost" => self.handlers.repost_delete(repo, rkey).await,
            "app.bsky.graph.follow" => self.handlers.follow_delete(repo, rkey).await,
            _ => {
                debug!(collection, "Skipping unhandled delete");
                Ok(())
            }
        }
    }

    /// Drain the failed-message queue and re-run each entry, before the
    /// live subscription starts. Entries that fail again go back with an
    /// incremented retry counter until the budget runs out.
    pub async fn replay_failed_messages(&self) -> Result<()> {
        let entries = self.failed.drain().await?;
        if entries.is_empty() {
            return Ok(());
        }
        info!("Replaying {} failed messages", entries.len());

        for (key, entry) in entries {
            metrics::FAILED_REPLAYS.inc();
            let message = match lexicon::parse_message(&entry.kind, &entry.body) {
                Ok(Some(message)) => message,
                _ => {
                    warn!(key = %key, "Discarding undecodable failed message");
                    continue;
                }
            };

            match self.handle_message(&message).await {
                Ok(()) => debug!(key = %key, "Replayed failed message"),
                Err(e) => {
                    let retries = entry.retries + 1;
                    if retries >= MAX_MESSAGE_RETRIES {
                        warn!(key = %key, "Discarding message after {} attempts: {:#}", retries, e);
                    } else {
                        self.failed
                            .insert(
                                &key,
                                FailedMessage {
                                    kind: entry.kind,
                                    body: entry.body,
                                    retries,
                                },
                            )
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }
}

pub async fn run_firehose_consumer(
    relay_url: String,
    dispatcher: Arc<Dispatcher>,
    cursor: Arc<CursorStore>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    info!("Starting firehose consumer");

    // Failed messages from the previous run are retried before any new
    // message can race them.
    if let Err(e) = dispatcher.replay_failed_messages().await {
        error!("Failed-message replay aborted: {:#}", e);
    }

    // Maximum reconnection attempts
    const MAX_RECONNECTS: u32 = 10;
    // Base delay between reconnection attempts (exponentially increased)
    let mut reconnect_delay = 1;
    let mut reconnect_attempts = 0;

    'outer: loop {
        let last_cursor = cursor.get().await;
        info!("Connecting to firehose, starting from cursor: {:?}", last_cursor);

        let mut subscription = match RepoSubscription::new(&relay_url, last_cursor).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Failed to connect to firehose: {}", e);

                reconnect_attempts += 1;
                if reconnect_attempts >= MAX_RECONNECTS {
                    return Err(anyhow!("Max reconnection attempts reached"));
                }

                // Exponential backoff, capped at 60 seconds
                let delay = Duration::from_secs(reconnect_delay);
                reconnect_delay = std::cmp::min(reconnect_delay * 2, 60);

                info!(
                    "Retrying in {} seconds (attempt {}/{})",
                    delay.as_secs(),
                    reconnect_attempts,
                    MAX_RECONNECTS
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue 'outer,
                    _ = &mut shutdown => {
                        info!("Received shutdown signal while waiting to reconnect");
                        break 'outer;
                    }
                }
            }
        };

        'inner: loop {
            tokio::select! {
                frame = subscription.next() => {
                    match frame {
                        Some(Ok(Frame::Message(Some(t), message))) => {
                            let permit = match dispatcher.semaphore.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break 'outer,
                            };
                            let dispatcher = Arc::clone(&dispatcher);
                            tokio::spawn(async move {
                                dispatcher.process_body(&t, &message.body, true).await;
                                drop(permit);
                            });

                            reconnect_attempts = 0;
                            reconnect_delay = 1;
                        }
                        Some(Ok(Frame::Message(None, _))) => {
                            // Ignore message with no type
                        }
                        Some(Ok(Frame::Error(e))) => {
                            error!(error = ?e.error, message = ?e.message, "Received error frame from firehose");
                            break 'inner;
                        }
                        Some(Err(e)) => {
                            error!("Error decoding frame: {}", e);
                            break 'inner;
                        }
                        None => {
                            warn!("Firehose stream closed by server");
                            break 'inner;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal, stopping firehose consumer");
                    break 'outer;
                }
            }
        }

        warn!("Connection interrupted, attempting to reconnect");
    }

    info!("Firehose consumer stopped");
    Ok(())
}

/// Sample the event rate and widen the outbound rate limiter's minimum gap
/// while the firehose is hot, so resolver fan-out doesn't burn the request
/// budget exactly when the stream needs it most.
pub async fn run_adaptive_throttle(limiter: Arc<RateLimiter>, verbose: bool) {
    let mut interval = tokio::time::interval(THROTTLE_INTERVAL);
    let mut last_total = metrics::EVENTS_PROCESSED.get();
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let total = metrics::EVENTS_PROCESSED.get();
        let eps = (total - last_total) / THROTTLE_INTERVAL.as_secs_f64();
        last_total = total;

        let min_time = if eps >= HOT_EPS {
            HOT_MIN_TIME
        } else if eps >= WARM_EPS {
            WARM_MIN_TIME
        } else {
            BASELINE_MIN_TIME
        };

        if min_time != limiter.min_time() {
            info!(eps, ?min_time, "Adjusting outbound rate limit");
            limiter.set_min_time(min_time);
        }

        if verbose {
            info!("Firehose rate: {:.0} events/s", eps);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn splits_collection_and_rkey() {
        assert_eq!(
            split_path("app.bsky.feed.post/3k2aexample"),
            ("app.bsky.feed.post", "3k2aexample")
        );
        assert_eq!(split_path("app.bsky.actor.profile/self"), ("app.bsky.actor.profile", "self"));
        assert_eq!(split_path("malformed"), ("malformed", ""));
    }

    #[test]
    fn failure_keys_identify_message() {
        let commit = RepoMessage::Commit(Commit {
            seq: 1,
            rebase: false,
            too_big: false,
            repo: "did:plc:alice".to_string(),
            rev: "rev42".to_string(),
            since: None,
            blocks: vec![],
            ops: vec![],
            time: Utc::now(),
        });
        assert_eq!(failure_key(&commit), "did:plc:alice::rev42");

        let tombstone = RepoMessage::Tombstone(lexicon::Tombstone {
            seq: 2,
            did: "did:plc:bob".to_string(),
            time: Utc::now(),
        });
        assert_eq!(failure_key(&tombstone), "did:plc:bob::#tombstone");
    }
}
