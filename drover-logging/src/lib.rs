//! Structured logging infrastructure for drover
//!
//! This crate provides:
//! - Subscriber initialisation for controller and worker processes
//! - The [`LogRecord`] wire type carried over the control channel
//! - A forwarding layer that ships worker records to the controller
//! - Re-emission of forwarded records on the controller side

pub mod forward;
pub mod init;
pub mod record;

// Re-export main types for convenience
pub use forward::{emit_forwarded, ForwardingLayer, RecordSink};
pub use init::{init_forwarding_tracing, init_simple_tracing, LogOutput};
pub use record::{LogLevel, LogRecord};
