//! In-process metrics, rendered as Prometheus text by the `/metrics` handler.

pub mod metrics;
