//! Floodgate - Adaptive Rate Limiting
//!
//! This crate decides whether a request may proceed under a per-category
//! quota. Counters live in Redis so every serving process shares them; a
//! circuit breaker falls back to in-process counters when Redis misbehaves.
//! Repeat offenders get progressively smaller quotas, and sustained abuse of
//! sensitive endpoints raises security alerts.

pub mod alert;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod ratelimit;
