//! Alert engine pipeline.
//!
//! Every run flows through:
//! 1. `Normalizer::normalize()`: raw records to canonical signals
//! 2. `Deduplicator::dedupe()`: within-run and cross-run duplicates removed
//! 3. `FusionEngine::fuse()`: one aggregate per (location, category)
//! 4. `decision::decide()`: cooldown state machine, emits alerts
//!
//! `runner::AlertPipeline` wires the steps to sources, the store and the
//! dispatcher. Steps 1–4 are synchronous and deterministic for a given input.

pub mod decision;
pub mod dedup;
pub mod fusion;
pub mod normalizer;
pub mod runner;
pub mod types;

pub use runner::AlertPipeline;
