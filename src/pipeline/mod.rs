//! The moderation pipeline.
//!
//! One operation: [`ModerationPipeline::filter`]. It composes the verdict
//! cache, the deterministic pre-screen, and the AI providers into a single
//! decision, then returns the verdict to the caller *before* any
//! non-essential work runs: cache stores, statistics, and the request log
//! line are fanned out as background tasks that can neither delay the
//! response nor surface errors to it.
//!
//! Failure policy at a glance: text analysis fails open (allow, marked
//! `error`), image analysis fails closed (block, marked `image_error`),
//! and an internal panic is caught at the boundary and converted into a
//! safe allow-with-`error` verdict.

mod image;

use std::{sync::Arc, time::Instant};

use futures::FutureExt;
pub use image::{ImageError, PreparedImage, prepare_image};
use tokio_util::task::TaskTracker;

use crate::{
    cache::{Fingerprint, VerdictCache},
    config::LimitsConfig,
    models::{FilterRequest, FilterVerdict, Flag, union_flags},
    providers::ProviderRegistry,
    screen::{PreScreener, REASON_CLEAN, mask_simple_patterns},
    stats::{ApiCall, RequestEvent, StatsRecorder},
};

/// Flags that mark a verdict as produced under failure; such verdicts are
/// never cached so a recovered provider is consulted again immediately.
fn is_transient(verdict: &FilterVerdict) -> bool {
    verdict.flags.iter().any(|flag| match flag {
        Flag::Error => true,
        Flag::Other(s) => s == "image_error",
        _ => false,
    })
}

pub struct ModerationPipeline {
    screener: PreScreener,
    cache: Arc<VerdictCache>,
    registry: Arc<ProviderRegistry>,
    recorder: Arc<StatsRecorder>,
    limits: LimitsConfig,
    /// Tracks the spawned background tasks so shutdown can wait for the
    /// last stores and stats events instead of dropping them mid-flight.
    background: TaskTracker,
}

impl ModerationPipeline {
    pub fn new(
        screener: PreScreener,
        cache: Arc<VerdictCache>,
        registry: Arc<ProviderRegistry>,
        recorder: Arc<StatsRecorder>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            screener,
            cache,
            registry,
            recorder,
            limits,
            background: TaskTracker::new(),
        }
    }

    /// Wait for in-flight background work (graceful shutdown).
    pub async fn drain_background(&self) {
        self.background.close();
        self.background.wait().await;
    }

    /// Moderate one request.
    ///
    /// Total: every failure mode inside the pipeline maps to a verdict,
    /// and a panic maps to the safe allow-with-`error` shape.
    #[tracing::instrument(
        name = "pipeline.filter",
        skip_all,
        fields(
            request_id = %uuid::Uuid::new_v4(),
            user = user_id.as_deref().unwrap_or("-"),
        )
    )]
    pub async fn filter(&self, request: FilterRequest, user_id: Option<String>) -> FilterVerdict {
        let started = Instant::now();
        match std::panic::AssertUnwindSafe(self.execute(request, user_id, started))
            .catch_unwind()
            .await
        {
            Ok(verdict) => verdict,
            Err(_) => {
                tracing::error!("Pipeline panicked; returning safe verdict");
                FilterVerdict::internal_error()
            }
        }
    }

    async fn execute(
        &self,
        mut request: FilterRequest,
        user_id: Option<String>,
        started: Instant,
    ) -> FilterVerdict {
        if request.is_empty() {
            return FilterVerdict::blocked("no content", Vec::new());
        }
        request.truncate_history();

        // Decode the image up front: its digest is part of the cache
        // fingerprint, and an unusable image settles the request here.
        let image = match self.prepare_image(&request) {
            Ok(image) => image,
            Err(verdict) => {
                self.dispatch_background(None, &verdict, user_id, started, false, None, None);
                return verdict;
            }
        };

        let fingerprint = Fingerprint::compute(&request, image.as_ref().map(|i| i.digest));

        if let Some(cached) = self.cache.get(fingerprint).await {
            self.dispatch_background(None, &cached, user_id, started, true, None, None);
            return cached;
        }

        let mut blocked = false;
        let mut reason = String::new();
        let mut flags: Vec<Flag> = Vec::new();
        let mut filtered_message: Option<String> = None;
        let mut text_call: Option<ApiCall> = None;
        let mut image_call: Option<ApiCall> = None;

        if !request.text.trim().is_empty() {
            let outcome = self.screener.evaluate(&request.text, &request.policy);
            union_flags(&mut flags, outcome.flags.iter().cloned());

            let mut escalate = false;
            if outcome.should_block {
                if !request.policy.return_filtered_message {
                    blocked = true;
                    reason = outcome.reason.clone();
                } else if outcome.only_simple_violations() {
                    // Simple patterns are masked locally; no model needed.
                    filtered_message = mask_simple_patterns(&request.text);
                    blocked = true;
                    reason = outcome.reason.clone();
                } else {
                    escalate = true;
                }
            } else if outcome.needs_review {
                escalate = true;
            } else {
                reason = outcome.reason.clone();
            }

            if escalate {
                let call_started = Instant::now();
                let analysis = self
                    .registry
                    .analyze_text(request.tier, &request.text, &request.history, &request.policy)
                    .await;
                text_call = Some(ApiCall {
                    duration_ms: call_started.elapsed().as_millis() as u64,
                    error: analysis.is_failure(),
                });

                union_flags(&mut flags, analysis.flags.iter().cloned());
                reason = analysis.reason.clone();
                if !analysis.is_failure() && analysis.is_violation {
                    blocked = true;
                    if request.policy.return_filtered_message && filtered_message.is_none() {
                        filtered_message = analysis.filtered_content.clone();
                    }
                }
                // Failures fall through unblocked: text analysis is
                // fail-open, the `error` flag annotates the verdict.
            }
        }

        if !blocked && let Some(prepared) = &image {
            let call_started = Instant::now();
            let analysis = self
                .registry
                .analyze_image(request.tier, &prepared.bytes, prepared.mime, &request.policy)
                .await;
            image_call = Some(ApiCall {
                duration_ms: call_started.elapsed().as_millis() as u64,
                error: analysis.is_failure(),
            });

            if analysis.is_failure() {
                // Image analysis is fail-closed in all cases.
                blocked = true;
                union_flags(&mut flags, [Flag::Error.image_scoped()]);
                reason = "Image analysis failed".to_string();
            } else {
                union_flags(&mut flags, analysis.flags.iter().map(Flag::image_scoped));
                if analysis.is_violation {
                    blocked = true;
                    reason = analysis.reason.clone();
                } else if reason.is_empty() {
                    reason = analysis.reason.clone();
                }
            }
        }

        if reason.is_empty() {
            reason = REASON_CLEAN.to_string();
        }
        if !request.policy.return_filtered_message {
            filtered_message = None;
        }

        let verdict = FilterVerdict {
            blocked,
            reason,
            flags,
            filtered_message,
        };

        self.dispatch_background(
            Some(fingerprint),
            &verdict,
            user_id,
            started,
            false,
            text_call,
            image_call,
        );
        verdict
    }

    /// Decode the request's image when the policy asks for image analysis.
    /// An unusable image is fail-closed: the verdict blocks right here.
    fn prepare_image(&self, request: &FilterRequest) -> Result<Option<PreparedImage>, FilterVerdict> {
        if !request.policy.analyze_images {
            return Ok(None);
        }
        let Some(encoded) = request.image.as_deref().filter(|i| !i.is_empty()) else {
            return Ok(None);
        };

        match image::prepare_image(encoded, self.limits.max_image_bytes) {
            Ok(prepared) => Ok(Some(prepared)),
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting unusable image");
                Err(FilterVerdict::blocked(
                    format!("Image rejected: {}", e),
                    vec![Flag::Error.image_scoped()],
                ))
            }
        }
    }

    /// Fan out the post-response work: statistics, cache store, log line.
    ///
    /// Everything here runs after the caller already holds the verdict;
    /// nothing may block the response or surface an error to it.
    fn dispatch_background(
        &self,
        store_as: Option<Fingerprint>,
        verdict: &FilterVerdict,
        user_id: Option<String>,
        started: Instant,
        cached: bool,
        text_call: Option<ApiCall>,
        image_call: Option<ApiCall>,
    ) {
        let latency_ms = started.elapsed().as_millis() as u64;
        let verdict = verdict.clone();
        let cache = Arc::clone(&self.cache);
        let recorder = Arc::clone(&self.recorder);

        self.background.spawn(async move {
            recorder.record(RequestEvent {
                user_id,
                blocked: verdict.blocked,
                cached,
                flags: verdict.flags.clone(),
                latency_ms,
                text_call,
                image_call,
            });

            if let Some(fingerprint) = store_as
                && !is_transient(&verdict)
            {
                cache.put(fingerprint, &verdict, None).await;
            }

            tracing::info!(
                blocked = verdict.blocked,
                cached,
                latency_ms,
                flags = verdict.flags.len(),
                "Moderation request complete"
            );
        });
    }
}
