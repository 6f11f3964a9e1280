//! `conductor-middleware` – The Nervous System
//!
//! Routes events between modules, the orchestrator's engines and external
//! observers without caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – topic-partitioned publish/subscribe event bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
