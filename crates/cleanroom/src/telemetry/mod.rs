//! Structured logging and optional OpenTelemetry span export.
//!
//! Logs are JSON lines on stderr. Spans are exported over OTLP/gRPC only when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//!
//! # Telemetry invariants
//!
//! - **No key material** must appear in any span attribute, event field, or
//!   error message: no DEK bytes, no PEM text, no access tokens.
//! - Key buffers print `[REDACTED]` under `Debug`.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`); `RUST_LOG`
//!   takes precedence.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
