pub mod metrics;

pub use metrics::{
    GlobalMetrics, HandlerMetrics, HandlerSummary, LiveMetrics, MetricsSnapshot, MAX_TRACKED_HANDLERS,
    OTHER_HANDLERS,
};
