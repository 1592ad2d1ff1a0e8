//! Gatekeeper - Sliding-Window Distributed Rate Limiting
//!
//! This crate implements a rate limiting engine for multi-tenant API
//! platforms. Each node decides from in-memory sliding windows and
//! reconciles with a shared origin counter store (Redis, a gossip mesh, or
//! process memory) only when its local view cannot be trusted. Granted cost
//! is propagated to the origin asynchronously.

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod origin;
pub mod ratelimit;
