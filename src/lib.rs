//! Sports prediction-market picker.
//!
//! Live sports markets are scored by a historical model, a sentiment model
//! and a hybrid stage that combines them. Predictions are persisted and
//! later reconciled against settled markets to track per-stage accuracy.

pub mod config;
pub mod data;
pub mod models;
pub mod monitoring;
pub mod pipeline;
pub mod storage;
