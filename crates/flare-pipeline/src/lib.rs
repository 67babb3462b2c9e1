//! # Flare Pipeline
//!
//! Queueing and delivery for Flare reports:
//!
//! - **Notifier**: the producer interface; filters, packages and enqueues
//! - **Payload queues**: one bounded FIFO per destination
//! - **Queue controller**: the registry of live queues and the background
//!   drain loop that truncates and delivers under a global rate limit
//! - **Offline store**: the seam undeliverable payloads are handed to

pub mod completion;
pub mod controller;
pub mod error;
pub mod notifier;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod store;

pub use completion::ReportStatus;
pub use controller::{QueueController, QueueControllerBuilder, ShutdownReport};
pub use error::{PipelineError, Result};
pub use notifier::{Notifier, ReportReceipt};
pub use queue::{EnqueueOutcome, PayloadQueue, QueueSettings};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use store::{InMemoryStore, PayloadStore};
