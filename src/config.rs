//! Runtime configuration.
//!
//! A single [`Config`] struct is threaded through every component rather
//! than each one reading ambient defaults, so a caller can construct a
//! configuration once (optionally loading it from TOML) and hand the same
//! value to the `Analysis`, `Retrieval`, `Orchestrator`, etc. builders.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, Result};

/// Retry-related configuration, consumed by [`crate::retry::RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first) before giving up.
    pub max_attempts: u32,
    /// Base delay used by the configured backoff strategy.
    pub base_delay: Duration,
    /// Upper bound on any single computed delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

/// Quality-gate thresholds, consumed by [`crate::quality::QualityGate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Score at or above which a result is approved outright.
    pub target: f64,
    /// Score below which a result is retried (while attempts remain) or
    /// rejected (once they don't), rather than approved.
    pub min: f64,
    /// Width of the ambiguous band immediately below `target` within which
    /// a result is escalated to human review rather than auto-approved
    /// with a warning.
    pub review_band: f64,
    /// Number of quality-driven retry attempts allowed before a
    /// below-`min` result is rejected outright.
    pub max_attempts: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_QUALITY_TARGET,
            min: DEFAULT_QUALITY_MIN,
            review_band: DEFAULT_QUALITY_REVIEW_BAND,
            max_attempts: DEFAULT_QUALITY_MAX_ATTEMPTS,
        }
    }
}

/// Retrieval tuning, consumed by [`crate::retrieval::Retriever`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of documents requested per query.
    pub top_k: usize,
    /// Reciprocal Rank Fusion constant `k`.
    pub rrf_k: f64,
    /// Whether to expand the query before retrieval.
    pub expand: bool,
    /// Whether LLM re-ranking is attempted after fusion.
    pub rerank: bool,
    /// Per-source weight multipliers applied during fusion, keyed by
    /// [`crate::retrieval::SearchBackend::name`]. A source with no entry
    /// here defaults to a weight of `1.0`.
    pub source_weights: std::collections::BTreeMap<String, f64>,
    /// Which re-rank scoring mode to apply after fusion, when `rerank` is
    /// enabled.
    pub rerank_mode: crate::retrieval::RerankMode,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_RETRIEVAL_TOP_K,
            rrf_k: DEFAULT_RRF_K,
            expand: true,
            rerank: false,
            source_weights: std::collections::BTreeMap::new(),
            rerank_mode: crate::retrieval::RerankMode::default(),
        }
    }
}

/// Aggregation tuning, consumed by [`crate::aggregator::Aggregator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Weight given to the median approved-step quality_score.
    pub quality_weight: f64,
    /// Weight given to the mean relevance_score of the top-k cited documents.
    pub relevance_weight: f64,
    /// How many top-ranked cited documents to average for the relevance half.
    pub top_k: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            quality_weight: DEFAULT_CONFIDENCE_QUALITY_WEIGHT,
            relevance_weight: DEFAULT_CONFIDENCE_RELEVANCE_WEIGHT,
            top_k: DEFAULT_CONFIDENCE_TOP_K,
        }
    }
}

/// Top-level configuration for an orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of steps run concurrently within one level.
    pub max_concurrency: usize,
    /// Per-step execution timeout.
    pub per_step_timeout: Duration,
    /// Whole-plan execution timeout.
    pub per_plan_timeout: Duration,
    /// Retry tuning.
    pub retry: RetryConfig,
    /// Quality-gate tuning.
    pub quality: QualityConfig,
    /// Retrieval tuning.
    pub retrieval: RetrievalConfig,
    /// Aggregation/confidence tuning.
    pub aggregation: AggregationConfig,
    /// Capacity of the progress-stream replay buffer.
    pub stream_buffer_size: usize,
    /// Whether the hypothesis service runs before execution.
    pub hypothesis_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            per_step_timeout: DEFAULT_STEP_TIMEOUT,
            per_plan_timeout: DEFAULT_PLAN_TIMEOUT,
            retry: RetryConfig::default(),
            quality: QualityConfig::default(),
            retrieval: RetrievalConfig::default(),
            aggregation: AggregationConfig::default(),
            stream_buffer_size: DEFAULT_REPLAY_BUFFER_SIZE,
            hypothesis_enabled: true,
        }
    }
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Internal(format!("invalid config: {e}")))
    }

    /// Reject configurations that cannot produce sensible behavior.
    ///
    /// Deep failures inside the orchestrator are harder to diagnose than a
    /// rejection at construction time, so every invariant checkable without
    /// running anything is checked here.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Internal(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Internal(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality.target) {
            return Err(Error::Internal("quality.target must be in [0.0, 1.0]".into()));
        }
        if !(0.0..=1.0).contains(&self.quality.min) {
            return Err(Error::Internal("quality.min must be in [0.0, 1.0]".into()));
        }
        if self.quality.min > self.quality.target {
            return Err(Error::Internal(
                "quality.min must not exceed quality.target".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(Error::Internal("retrieval.top_k must be at least 1".into()));
        }
        if self.aggregation.top_k == 0 {
            return Err(Error::Internal("aggregation.top_k must be at least 1".into()));
        }
        Ok(())
    }
}
