//! HTTP handlers

pub mod alerts;
pub mod health;
pub mod ingest;
