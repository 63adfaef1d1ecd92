//! Secure transports for reaching the relay node.
//!
//! The proxy only depends on the `SecureTransport` trait; the bundled
//! implementation here makes the binary usable on its own.

pub mod connect_relay;

pub use connect_relay::ConnectRelayTransport;
