//! Resilient Brevo contact client.
//!
//! This crate provides:
//! - BrevoClient: create-or-update a contact with rate limiting, a circuit
//!   breaker and bounded exponential retries
//! - DeliveryError: closed transient / fatal / validation classification
//! - Clock and ContactTransport seams so time and HTTP can be replaced in tests
//!
//! Rate window and circuit state belong to one client instance. Two clients
//! never share a budget or a breaker.

mod circuit;
mod client;
mod clock;
mod config;
mod contact;
mod error;
mod rate_limit;
mod transport;

pub use circuit::CircuitSnapshot;
pub use client::{BrevoClient, DeliveryResponse};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::BrevoClientConfig;
pub use contact::BrevoContact;
pub use error::{DeliveryError, TransportError};
pub use transport::{ContactTransport, HttpTransport, TransportResponse};
