pub mod api;
pub mod cfg;
pub mod client;
pub mod cmd;
pub mod coordinator;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod logging;
pub mod proto;
pub mod runtime;
mod shaper;
pub mod standalone;
pub mod stat;
pub mod worker;

pub use crate::error::Error;
