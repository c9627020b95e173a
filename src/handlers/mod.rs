//! HTTP handlers outside the webhook pipeline

pub mod status;

pub use status::{status_router, PipelineMetrics, StatusState};
