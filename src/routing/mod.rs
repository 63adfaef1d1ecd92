//! Routing subsystem.
//!
//! Decides per target host whether a tunnel goes through the relay node or
//! is dialed directly. Rules are compiled at startup and immutable at runtime.

pub mod matcher;

pub use matcher::{DomainRules, DomainSuffix};
