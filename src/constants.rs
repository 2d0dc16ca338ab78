//! Centralized default values shared across modules.
//!
//! Pulling these into one place keeps call sites free of magic numbers and
//! gives `Config::default()` a single source of truth to mirror.

use std::time::Duration;

/// Default wall-clock budget for a single step execution attempt.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wall-clock budget for an entire plan, across all levels and retries.
pub const DEFAULT_PLAN_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of steps the orchestrator may run concurrently.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default bounded channel capacity used for progress-event delivery.
pub const DEFAULT_PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Default number of recent progress events kept for late subscribers to replay.
pub const DEFAULT_REPLAY_BUFFER_SIZE: usize = 512;

/// Default number of retry attempts before a step is treated as permanently failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay used by the backoff strategies in [`crate::retry`].
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Default ceiling applied to any computed backoff delay.
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Quality score (0.0-1.0) at or above which the quality gate approves outright.
pub const DEFAULT_QUALITY_TARGET: f64 = 0.8;

/// Quality score below which the quality gate escalates to human review
/// instead of retrying.
pub const DEFAULT_QUALITY_MIN: f64 = 0.4;

/// Default number of documents requested from the retriever per query.
pub const DEFAULT_RETRIEVAL_TOP_K: usize = 10;

/// Default Reciprocal Rank Fusion constant `k` (see C4 in the design docs).
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Default oneshot/mpsc timeout used by approval and intervention requests.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Default bounded channel capacity for intervention request/response pairs.
pub const DEFAULT_INTERVENTION_CHANNEL_CAPACITY: usize = 32;

/// Default symmetric jitter fraction applied to computed backoff delays
/// (spec §4.7: ±10%, not the positive-only skew an earlier revision used).
pub const DEFAULT_JITTER_FRACTION: f64 = 0.1;

/// Default width of the quality gate's "ambiguous" band below `target`
/// within which a result is escalated to human review rather than retried
/// outright (spec §4.6).
pub const DEFAULT_QUALITY_REVIEW_BAND: f64 = 0.1;

/// Default number of quality-gate retry attempts allowed before a
/// below-`min` result is rejected outright instead of retried again.
pub const DEFAULT_QUALITY_MAX_ATTEMPTS: u32 = 3;

/// Default weight given to median step quality_score in the aggregator's
/// confidence computation (spec §4.10, step 4).
pub const DEFAULT_CONFIDENCE_QUALITY_WEIGHT: f64 = 0.6;

/// Default weight given to mean top-k citation relevance_score in the
/// aggregator's confidence computation (spec §4.10, step 4).
pub const DEFAULT_CONFIDENCE_RELEVANCE_WEIGHT: f64 = 0.4;

/// Default number of top-ranked cited documents averaged for the relevance
/// half of the aggregator's confidence computation.
pub const DEFAULT_CONFIDENCE_TOP_K: usize = 5;
