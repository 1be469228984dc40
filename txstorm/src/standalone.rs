use core::pin::pin;
use std::sync::Arc;

use crate::{
    cfg::Config,
    client::Registry,
    endpoint::{Discover, EndpointPool},
    engine::{Connector, EngineGroup, Exit},
    error::Error,
    runtime,
    stat::AggregateStats,
};

/// Runs the load engine in-process, without a coordinator.
#[derive(Debug)]
pub struct Standalone<C, D> {
    cfg: Config,
    registry: Arc<Registry>,
    connector: Arc<C>,
    discover: D,
}

impl<C, D> Standalone<C, D>
where
    C: Connector,
    D: Discover,
{
    pub fn new(cfg: Config, registry: Arc<Registry>, connector: C, discover: D) -> Self {
        Self {
            cfg,
            registry,
            connector: Arc::new(connector),
            discover,
        }
    }

    /// Runs the test and writes the aggregate stats, if configured.
    ///
    /// Nothing is connected unless the config is valid and enough endpoints
    /// are resolved.
    pub async fn run(self) -> Result<AggregateStats, Error> {
        self.cfg.validate()?;
        let clients = self.registry.new_clients(&self.cfg)?;
        let pool = EndpointPool::resolve(&self.cfg, &self.discover).await?;

        let cfg = Arc::new(self.cfg);
        let mut group = EngineGroup::spawn(cfg.clone(), self.connector, &pool, clients);
        let mut interrupt = pin!(runtime::interrupt(!cfg.no_trap_interrupts));
        let mut interrupted = false;
        let mut num_failed = 0;

        loop {
            tokio::select! {
                exit = group.join_next() => match exit {
                    Some(Exit::Failed(..)) => num_failed += 1,
                    Some(..) => {}
                    None => break,
                },
                _ = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    log::warn!("interrupted, stopping connections ...");
                    group.cancel();
                }
            }
        }

        if num_failed > 0 {
            log::warn!("{num_failed} connection(s) failed");
        }

        let stats = AggregateStats::from_snapshots(&group.snapshots());
        log::info!("finished: {stats}");
        if let Some(path) = &cfg.stats_output {
            stats.write_file(path)?;
        }

        Ok(stats)
    }
}
