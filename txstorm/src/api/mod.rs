//! HTTP API for exposing live run metrics.

mod metrics;
mod server;

pub use self::{
    metrics::{MetricsCollector, MetricsState, StatSource},
    server::Server,
};
