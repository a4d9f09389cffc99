//! Floodgate - Multi-Algorithm Rate Limiting Engine
//!
//! This crate implements an in-process admission control engine. Each inbound
//! request is matched against a prioritized set of configurable rules, and
//! each rule enforces its quota with one of four algorithms (token bucket,
//! sliding window, fixed window, leaky bucket) over a chosen scope (global,
//! per-user, per-IP, per-API-key, per-endpoint). State lives entirely in
//! memory; each engine instance is self-contained.

pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod request;
pub mod rules;
pub mod stats;
