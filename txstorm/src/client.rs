//! Pluggable transaction generators.

use core::fmt::{self, Debug, Formatter};
use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;

pub use self::kvstore::{min_suffix_len, KvStoreClient, KvStoreClientFactory};
use crate::{
    cfg::Config,
    error::{ClientError, ConfigError},
};

mod kvstore;

/// Per-connection transaction generator.
///
/// Implementations own whatever local state they need to make sure no two
/// generated transactions collide, across all connections and workers of the
/// run. Generation must never perform I/O.
pub trait Client: Send {
    /// Generates the next transaction payload.
    fn generate_tx(&mut self) -> Result<Bytes, ClientError>;
}

/// Constructor of [`Client`]s, registered under a unique name.
pub trait ClientFactory: Send + Sync {
    /// Checks that the given config satisfies this generator's structural
    /// requirements, for example minimum transaction size.
    fn validate_config(&self, cfg: &Config) -> Result<(), ConfigError>;

    /// Creates a new client for a single connection.
    fn new_client(&self, cfg: &Config) -> Result<Box<dyn Client>, ConfigError>;
}

/// Explicit registry of client factories.
///
/// Built once at process entry, then shared read-only.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, Arc<dyn ClientFactory>>,
}

impl Registry {
    /// Constructs an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a registry with all built-in factories.
    pub fn builtin() -> Self {
        let mut factories: HashMap<String, Arc<dyn ClientFactory>> = HashMap::new();
        factories.insert(KvStoreClientFactory::NAME.to_string(), Arc::new(KvStoreClientFactory));

        Self { factories }
    }

    /// Registers the factory under the given name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), ConfigError>
    where
        F: ClientFactory + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(ConfigError::DuplicateFactory(name));
        }

        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn ClientFactory>, ConfigError> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownFactory(name.to_string()))
    }

    /// Returns registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Validates the config against the selected factory and creates one
    /// client per configured connection.
    pub fn new_clients(&self, cfg: &Config) -> Result<Vec<Box<dyn Client>>, ConfigError> {
        let factory = self.lookup(&cfg.client_factory)?;
        factory.validate_config(cfg)?;

        (0..cfg.connections).map(|_| factory.new_client(cfg)).collect()
    }
}

impl Debug for Registry {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        fmt.debug_struct("Registry").field("factories", &self.names()).finish()
    }
}
