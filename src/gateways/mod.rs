//! Request gateway implementations.
//!
//! | Feature        | Gateway        |
//! |----------------|----------------|
//! | `gateway-http` | `HttpGateway`  |
//!
//! Tests and embedders with their own API client implement
//! [`RequestGateway`](crate::gateway::RequestGateway) directly.

#[cfg(feature = "gateway-http")]
pub mod http;

#[cfg(feature = "gateway-http")]
pub use http::HttpGateway;
