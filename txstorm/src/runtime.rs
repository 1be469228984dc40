use core::future;
use std::sync::Arc;

use crate::{
    cfg::ModeConfig,
    client::Registry,
    coordinator::Coordinator,
    engine::{RpcConnector, RpcDiscover},
    error::Error,
    standalone::Standalone,
    worker::Worker,
};

/// Completes on the first interrupt signal.
///
/// Never completes if trapping is disabled or the signal handler cannot be
/// installed.
pub async fn interrupt(trap: bool) {
    if !trap {
        return future::pending().await;
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("failed to listen for interrupts: {err}");
        future::pending::<()>().await;
    }
}

/// Dispatches the selected mode.
#[derive(Debug)]
pub struct Runtime {
    cfg: ModeConfig,
    registry: Arc<Registry>,
}

impl Runtime {
    /// Constructs a runtime with the built-in client factories.
    pub fn new(cfg: ModeConfig) -> Self {
        Self::with_registry(cfg, Registry::builtin())
    }

    pub fn with_registry(cfg: ModeConfig, registry: Registry) -> Self {
        Self {
            cfg,
            registry: Arc::new(registry),
        }
    }

    pub async fn run(self) -> Result<(), Error> {
        match self.cfg {
            ModeConfig::Standalone(cfg) => {
                Standalone::new(cfg, self.registry, RpcConnector, RpcDiscover).run().await?;
            }
            ModeConfig::Coordinator(cfg, coord) => {
                Coordinator::new(cfg, coord, &self.registry)?.run().await?;
            }
            ModeConfig::Worker(cfg) => {
                Worker::new(cfg, self.registry, RpcConnector, RpcDiscover).run().await?;
            }
        }

        Ok(())
    }
}
