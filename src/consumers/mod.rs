//! The consumer runtime: registered subscriptions, per-subscription worker
//! fan-out, transport-failure supervision, and the dead-letter retry
//! pipeline.

mod retry;
mod subscription;
mod supervisor;
mod worker;

pub use retry::RetryClient;
pub use subscription::{ConsumeHandler, Subscription};
