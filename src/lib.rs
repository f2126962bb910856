//! Proxxy - Rotating Proxy Gateway
//!
//! A forward HTTP proxy that authenticates clients against a shared secret and
//! tunnels each connection through the next upstream proxy in rotation.
//!
//! ## Features
//!
//! - Round-robin rotation over a fixed upstream list
//! - Basic authentication for clients and per-upstream credentials
//! - Raw TCP tunnelling after the request head is forwarded

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{GatewayError, Result};
