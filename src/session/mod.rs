//! Upload sessions against the ingestion endpoint.
//!
//! A [`ClientSession`] owns one connection at a time, builds
//! [`AddEventsRequest`](crate::request::AddEventsRequest) values bound to
//! its identity, and classifies every send outcome as a [`SendStatus`].
//! Failures close the connection and arm a reconnect cooldown; lifetime
//! counters are available through [`ClientSession::stats`].

mod address;
mod client;
mod config;
mod status;
mod throttle;
mod user_agent;

pub use address::{InvalidServerAddress, ServerAddress};
pub use client::{ClientSession, SecondsProvider, SessionStats, system_seconds_provider};
pub use config::{DEFAULT_REQUEST_TIMEOUT, SessionConfig};
pub use status::{SendResult, SendStatus};
