//! Core domain types for the courier messaging toolkit.
//!
//! Provides the message model, listener callback traits, trace identifiers,
//! and time abstractions shared by the delivery engine and broker adapters.
//! All other crates depend on these foundational types for type safety and
//! consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod listener;
pub mod message;
pub mod time;
pub mod trace;

pub use listener::{DeliveryContext, FnListener, MessageListener};
pub use message::{normalize_name, AckMode, Message};
pub use time::{Clock, RealClock, TestClock};
pub use trace::TraceId;
