//! Reusable logging, OTLP tracing/metrics and trace propagation for flag-proxy.

pub mod config;
pub mod otlp;
pub mod propagation;
pub mod spans;

pub use config::{OtlpProtocol, TracingConfig};
pub use otlp::{init_tracing, TracingGuard};
pub use propagation::set_remote_parent;
