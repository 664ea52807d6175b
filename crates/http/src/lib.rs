//! `reqwest` implementation of the coach conversation transports.

pub mod client;
pub mod config;
pub mod error;

pub use client::CoachApiClient;
pub use config::{ApiConfig, DEFAULT_EXPLAIN_PATH, DEFAULT_MESSAGE_PATH, DEFAULT_STREAM_PATH};
pub use error::HttpError;
