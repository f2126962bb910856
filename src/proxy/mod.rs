//! Proxy gateway implementation
//!
//! This module provides the gateway functionality including:
//! - Inbound request parsing and connection hijacking
//! - Shared-secret proxy authentication
//! - Round-robin upstream rotation
//! - Raw bidirectional relay to the selected upstream

pub mod conn;
pub mod handler;
pub mod middleware;
pub mod rotation;
pub mod server;
pub mod tunnel;

pub use conn::{ClientTransport, Hijacked, InboundConn, RequestHead};
pub use handler::{GatewayConfig, TunnelGateway};
pub use rotation::{ProxySelector, RoundRobinPool};
pub use server::ProxyServer;
pub use tunnel::{Tunnel, TunnelStats};
