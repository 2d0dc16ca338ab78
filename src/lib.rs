//! Dependency-driven process orchestration core.
//!
//! This crate turns a natural-language query into a typed, dependency-
//! ordered execution plan and runs it to completion: [`analysis`] (C1)
//! extracts intent and entities, [`hypothesis`] (C11) decides whether to
//! ask a clarifying question first, [`process`] (C2) instantiates a
//! template into a [`types::ProcessTree`], [`dependency`] (C3) levels it
//! into a concurrency-safe execution order, [`retrieval`] (C4) fuses
//! hybrid search results, [`step_runner`] (C5) dispatches typed work,
//! [`quality`] (C6) and [`retry`] (C7) decide what happens to a marginal
//! result, [`orchestrator`] (C8) drives the whole thing with bounded
//! concurrency and human-in-the-loop intervention, [`progress`] (C9)
//! streams what happened, and [`aggregator`] (C10) turns completed steps
//! into a final answer.
//!
//! The backing search/generation/storage systems themselves are external
//! interfaces: [`retrieval::SearchBackend`], [`generation::Generator`],
//! and [`persistence::CheckpointStore`] are the trait boundaries a caller
//! implements; this crate does not ship a concrete backend for any of
//! them.

pub mod aggregator;
pub mod analysis;
pub mod config;
pub mod constants;
pub mod dependency;
pub mod error;
pub mod generation;
pub mod hypothesis;
pub mod orchestrator;
pub mod persistence;
pub mod process;
pub mod progress;
pub mod quality;
pub mod retrieval;
pub mod retry;
pub mod step_runner;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod test_support;

pub use error::{Error, Result};
