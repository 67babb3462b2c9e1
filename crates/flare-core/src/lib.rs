//! # Flare Core
//!
//! Shared building blocks for the Flare reporting client:
//!
//! - **Payloads**: the wire envelope (`access_token` + `data`) with a cached
//!   serialized size
//! - **Reports**: producer-side descriptions of an event, packaged into payloads
//! - **Scrubbing**: redaction of sensitive keys and free-text patterns
//! - **Truncation**: size-reduction strategies and the iterative engine that
//!   applies them until a payload fits its byte ceiling
//! - **Diagnostics**: the internal event hub monitors subscribe to
//! - **Configuration**: the resolved client configuration

pub mod config;
pub mod error;
pub mod events;
pub mod outcome;
pub mod payload;
pub mod report;
pub mod scrub;
pub mod truncation;

pub use config::{FlareConfig, OverflowPolicy, ShutdownMode};
pub use error::{FlareError, Result};
pub use events::{DropReason, EventHub, InternalEvent, RateLimitSource, SubscriptionId};
pub use outcome::DeliveryOutcome;
pub use payload::{Body, Data, Destination, Level, Payload};
pub use report::Report;
pub use scrub::Scrubber;
pub use truncation::{TruncationEngine, TruncationReport, TruncationStrategy};
