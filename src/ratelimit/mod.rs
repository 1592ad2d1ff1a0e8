//! Rate limiting logic and state management.

mod breaker;
mod registry;
mod replay;
mod request;
mod service;
mod window;

pub use breaker::{CircuitBreaker, CircuitState};
pub use registry::{Bucket, BucketRegistry, BucketSnapshot, SweepStats};
pub use replay::{ReplayEvent, ReplayQueue};
pub use request::{BucketKey, RatelimitRequest, RatelimitResponse, MAX_DURATION, MIN_DURATION};
pub use service::{Service, ServiceBuilder};
pub use window::{calculate_rate_limit, sequence_for, BucketState, Evaluation, Window};
