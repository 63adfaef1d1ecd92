//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (peek first request head)
//!         ├─ CONNECT → connect.rs (hijack, 200 line, dial, relay)
//!         └─ other   → hyper HTTP/1 server
//!                        ├─ CONNECT → connect.rs (via upgrade)
//!                        └─ other   → forward.rs (through the relay node)
//! ```

pub mod connect;
pub mod forward;
pub mod request;
pub mod response;
pub mod server;

pub use request::RequestHead;
pub use server::HttpServer;
