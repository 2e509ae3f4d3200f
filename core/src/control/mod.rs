//! Control plane: protobuf protocol, command executor, image lifecycle and
//! the TCP service
//!
//! Clients manage the emulated devices through a framed protobuf protocol:
//! a `PbCommand` per connection, answered by one `PbResult`. All mutations
//! run against the shared [`crate::daemon::Daemon`] state under its lock.

pub mod context;
pub mod executor;
pub mod framing;
pub mod image;
pub mod locale;
pub mod proto;
pub mod response;
pub mod service;
