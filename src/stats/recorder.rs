//! Per-request statistics recording.
//!
//! Requests push events into a bounded lock-free channel and return
//! immediately; a single background worker drains the channel, folds the
//! events into a batch, and flushes the batch to the KV store as one
//! pipelined burst at most every flush interval. Overflow drops events
//! rather than blocking the pipeline, and flush failures never propagate
//! to request handling.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio_util::sync::CancellationToken;

use super::keys::{StatsKeys, api_fields};
use crate::{
    kv::{KvClient, KvOp, KvStore},
    models::{ApiType, Flag},
};

/// TTL applied to every counter the flush touches (only where none is set
/// yet, so windows are not extended on every flush).
const COUNTER_TTL: Duration = Duration::from_secs(60 * 60);

/// The latency sample list is capped at this many entries.
pub const LATENCY_SAMPLE_CAP: usize = 500;

/// Timing of one external API call inside a request.
#[derive(Debug, Clone, Copy)]
pub struct ApiCall {
    pub duration_ms: u64,
    pub error: bool,
}

/// One request's worth of statistics.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub user_id: Option<String>,
    pub blocked: bool,
    pub cached: bool,
    pub flags: Vec<Flag>,
    pub latency_ms: u64,
    pub text_call: Option<ApiCall>,
    pub image_call: Option<ApiCall>,
}

/// Configuration for the recorder.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Maximum time events wait before being flushed.
    pub flush_interval: Duration,
    /// Maximum pending events before new ones are dropped.
    pub max_pending_events: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            max_pending_events: 10_000,
        }
    }
}

pub struct StatsRecorder {
    sender: Sender<RequestEvent>,
    receiver: Receiver<RequestEvent>,
    config: RecorderConfig,
    shutdown: CancellationToken,
    dropped_count: AtomicU64,
}

impl StatsRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        let capacity = config.max_pending_events.max(1);
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self {
            sender,
            receiver,
            config,
            shutdown: CancellationToken::new(),
            dropped_count: AtomicU64::new(0),
        }
    }

    /// Record one request. Lock-free; never blocks and never errors.
    pub fn record(&self, event: RequestEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let count = self.dropped_count.fetch_add(1, Ordering::Relaxed);
                // Log every 100 drops to avoid log spam.
                if count % 100 == 0 {
                    tracing::warn!(
                        dropped = count + 1,
                        max_pending = self.config.max_pending_events,
                        "Stats channel full, dropping events"
                    );
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                // Worker has shut down; silently drop.
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Number of events waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Start the background flush worker.
    ///
    /// The worker is the single consumer of the channel, which also makes
    /// it the only armed "flush timer": batches coalesce naturally at one
    /// flush per interval.
    pub fn start_worker(self: &Arc<Self>, kv: Arc<KvClient>) -> tokio::task::JoinHandle<()> {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = Vec::new();

            loop {
                recorder.drain(&mut events);
                if !events.is_empty() {
                    Self::flush(&kv, &mut events).await;
                }

                if recorder.shutdown.is_cancelled() {
                    recorder.drain(&mut events);
                    if !events.is_empty() {
                        Self::flush(&kv, &mut events).await;
                    }
                    tracing::info!("Stats recorder worker shutting down");
                    break;
                }

                tokio::select! {
                    _ = recorder.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(recorder.config.flush_interval) => {}
                }
            }
        })
    }

    /// Signal the worker to flush remaining events and stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn drain(&self, events: &mut Vec<RequestEvent>) {
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
    }

    /// Flush a batch as one pipelined burst, retrying once before giving
    /// the batch up.
    async fn flush(kv: &Arc<KvClient>, events: &mut Vec<RequestEvent>) {
        let ops = build_flush_ops(events);
        let count = events.len();
        events.clear();

        if ops.is_empty() {
            return;
        }

        for attempt in 1..=2u32 {
            match kv.pipeline(ops.clone()).await {
                Ok(_) => {
                    tracing::debug!(events = count, "Stats batch flushed");
                    return;
                }
                Err(e) if attempt == 1 => {
                    tracing::warn!(error = %e, "Stats flush failed, retrying once");
                }
                Err(e) => {
                    tracing::error!(error = %e, events = count, "Stats flush failed, batch dropped");
                }
            }
        }
    }
}

/// Fold events into the pipelined KV burst.
///
/// Counter increments are emitted before the expiries so a fresh key
/// exists by the time its `EXPIRE NX` runs.
pub(crate) fn build_flush_ops(events: &[RequestEvent]) -> Vec<KvOp> {
    if events.is_empty() {
        return Vec::new();
    }

    let total = events.len() as i64;
    let blocked = events.iter().filter(|e| e.blocked).count() as i64;
    let cached = events.iter().filter(|e| e.cached).count() as i64;

    let mut ops = Vec::new();
    let mut touched: Vec<String> = Vec::new();

    ops.push(KvOp::IncrBy {
        key: StatsKeys::requests_total().to_string(),
        delta: total,
    });
    touched.push(StatsKeys::requests_total().to_string());

    if blocked > 0 {
        ops.push(KvOp::IncrBy {
            key: StatsKeys::requests_blocked().to_string(),
            delta: blocked,
        });
        touched.push(StatsKeys::requests_blocked().to_string());
    }

    ops.push(KvOp::IncrBy {
        key: StatsKeys::requests_cached().to_string(),
        delta: cached,
    });
    touched.push(StatsKeys::requests_cached().to_string());

    // Latency samples, newest first, capped at the list window.
    let samples: Vec<String> = events
        .iter()
        .rev()
        .take(LATENCY_SAMPLE_CAP)
        .map(|e| e.latency_ms.to_string())
        .collect();
    ops.push(KvOp::LPush {
        key: StatsKeys::latency_list().to_string(),
        values: samples,
    });
    ops.push(KvOp::LTrim {
        key: StatsKeys::latency_list().to_string(),
        start: 0,
        stop: LATENCY_SAMPLE_CAP as i64 - 1,
    });

    // Per-flag counters, accumulated across the batch in arrival order.
    let mut flag_counts: Vec<(String, i64)> = Vec::new();
    for event in events {
        for flag in &event.flags {
            let name = flag.to_string();
            match flag_counts.iter_mut().find(|(f, _)| *f == name) {
                Some((_, count)) => *count += 1,
                None => flag_counts.push((name, 1)),
            }
        }
    }
    for (flag, count) in flag_counts {
        let key = StatsKeys::flag(&flag);
        ops.push(KvOp::IncrBy {
            key: key.clone(),
            delta: count,
        });
        touched.push(key);
    }

    // Per-user counters.
    let mut user_counts: Vec<(String, i64)> = Vec::new();
    for event in events {
        if let Some(user) = &event.user_id {
            match user_counts.iter_mut().find(|(u, _)| u == user) {
                Some((_, count)) => *count += 1,
                None => user_counts.push((user.clone(), 1)),
            }
        }
    }
    for (user, count) in user_counts {
        let key = StatsKeys::requests_user(&user);
        ops.push(KvOp::IncrBy {
            key: key.clone(),
            delta: count,
        });
        touched.push(key);
    }

    // Per-API-type hashes.
    for (api, pick) in [
        (ApiType::Text, (|e: &RequestEvent| e.text_call) as fn(&RequestEvent) -> Option<ApiCall>),
        (ApiType::Image, |e: &RequestEvent| e.image_call),
    ] {
        let calls: Vec<ApiCall> = events.iter().filter_map(pick).collect();
        if calls.is_empty() {
            continue;
        }
        let key = StatsKeys::api_stats(api);
        ops.push(KvOp::HIncrBy {
            key: key.clone(),
            field: api_fields::CALLS.to_string(),
            delta: calls.len() as i64,
        });
        ops.push(KvOp::HIncrBy {
            key: key.clone(),
            field: api_fields::TOTAL_TIME.to_string(),
            delta: calls.iter().map(|c| c.duration_ms as i64).sum(),
        });
        let errors = calls.iter().filter(|c| c.error).count() as i64;
        if errors > 0 {
            ops.push(KvOp::HIncrBy {
                key: key.clone(),
                field: api_fields::ERRORS.to_string(),
                delta: errors,
            });
        }
        touched.push(key);
    }

    touched.push(StatsKeys::latency_list().to_string());
    for key in touched {
        ops.push(KvOp::ExpireNx {
            key,
            ttl: COUNTER_TTL,
        });
    }

    ops
}
