//! Shared wire types for the touchline messenger.
//!
//! - [`objects`] holds the domain enums, the JSON bus events, the protobuf
//!   stream envelopes and the HTTP request/response objects.
//! - [`client`] (behind the `client` feature) is a small streaming client
//!   for the WebSocket gateway.

#[cfg(feature = "client")]
pub mod client;
pub mod objects;
