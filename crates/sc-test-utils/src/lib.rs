//! # Stream Controller Test Utilities
//!
//! Shared test utilities for the stream controller.
//!
//! This crate provides in-memory fakes and fixtures for isolated
//! controller testing without a real transport or rendering stack.
//!
//! ## Modules
//!
//! - `fake_transport` - In-memory transport hub with failure injection
//! - `fake_sink` - Recording rendering surface with steerable readings
//! - `fixtures` - Pre-configured streams and configuration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::{FakeSink, FakeTransport, fixtures};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let transport = FakeTransport::new();
//!     let sink = FakeSink::new();
//!
//!     // Steer the fake before or during the test...
//!     transport.set_strip_media(true);
//!     sink.set_buffer_ahead(0.1);
//! }
//! ```

pub mod fake_sink;
pub mod fake_transport;
pub mod fixtures;

pub use fake_sink::FakeSink;
pub use fake_transport::{FakeTransport, RegistrationRecord};
