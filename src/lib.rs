//! Infers the start and completion of an opaque external computation from
//! sockets on a local port, matching worker processes and their CPU usage.

pub mod artifact;
pub mod config;
pub mod detector;
pub mod hooks;
pub mod observer;
pub mod orchestrator;
pub mod signal_source;
pub mod signals;
pub mod sockets;
pub mod status;
pub mod wait;
