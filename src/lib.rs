//! Prepper Alerts: signal fusion and alert decision engine.

pub mod api;
pub mod artifact;
pub mod config;
pub mod error;
pub mod locations;
pub mod notify;
pub mod pipeline;
pub mod sources;
pub mod store;
