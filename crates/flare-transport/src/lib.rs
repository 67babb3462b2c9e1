//! # Flare Transport
//!
//! Delivery of payloads to the collector. [`PayloadSender`] is the seam the
//! drain loop calls; [`HttpSender`] is the real implementation and
//! [`classify`] maps HTTP responses onto [`flare_core::DeliveryOutcome`].

pub mod client;
pub mod error;
pub mod http;
pub mod mock;
pub mod response;
pub mod sender;

pub use client::SenderFactory;
pub use error::{Result, TransportError};
pub use http::{HttpSender, HttpSenderConfig, ACCESS_TOKEN_HEADER};
pub use mock::{RecordingSender, ScriptStep, ScriptedSender};
pub use response::{classify, parse_retry_after, ApiResponse};
pub use sender::PayloadSender;
