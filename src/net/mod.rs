//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (id, live-connection tracking)
//!     → prebuffered.rs (request head peeked without consuming it)
//!     → Hand off to HTTP layer
//!
//! Tunnel:
//!     address.rs (target normalization)
//!     → dial.rs (direct or through the relay node)
//!     → relay.rs (bidirectional byte copy)
//! ```

pub mod address;
pub mod connection;
pub mod dial;
pub mod listener;
pub mod prebuffered;
pub mod relay;
