//! Target endpoints and their selection policy.

use core::{
    fmt::{self, Display, Formatter},
    future::Future,
    str::FromStr,
    time::Duration,
};
use std::collections::{BTreeMap, BTreeSet};

use http::Uri;
use tokio::time::{self, Instant};

use crate::{
    cfg::{Config, EndpointSelectMethod},
    error::{ConfigError, ConnectionError, ConnectivityError, Error},
};

/// Default RPC port for endpoints given without one.
pub const DEFAULT_RPC_PORT: u16 = 26657;
/// Pause between discovery rounds.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Target network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Constructs a new endpoint.
    ///
    /// Bare IPv6 literals are bracketed, so that the authority stays
    /// parseable.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let mut host = host.into();
        if host.contains(':') && !host.starts_with('[') {
            host = format!("[{host}]");
        }

        Self { host, port }
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns "host:port", suitable both for connecting and as the HTTP
    /// "Host" header.
    #[inline]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Parses "host", "host:port" or a URL like "ws://host:port/websocket".
    ///
    /// Only the authority is kept.
    fn from_str(v: &str) -> Result<Self, Self::Err> {
        let err = || ConfigError::InvalidEndpoint(v.to_string());

        let uri: Uri = if v.contains("://") {
            v.parse().map_err(|_| err())?
        } else {
            format!("http://{v}").parse().map_err(|_| err())?
        };

        let host = uri.host().filter(|h| !h.is_empty()).ok_or_else(err)?;
        let port = uri.port_u16().unwrap_or(DEFAULT_RPC_PORT);

        Ok(Self::new(host, port))
    }
}

impl Display for Endpoint {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        write!(fmt, "{}:{}", self.host, self.port)
    }
}

/// What an endpoint knows about its peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetInfo {
    /// Number of peers the endpoint is connected to.
    pub n_peers: usize,
    /// RPC endpoints of those peers.
    pub peers: Vec<Endpoint>,
}

/// Peer discovery.
pub trait Discover: Send + Sync {
    /// Queries the given endpoint about its peers.
    fn net_info(&self, endpoint: &Endpoint) -> impl Future<Output = Result<NetInfo, ConnectionError>> + Send;
}

/// Set of usable endpoints.
///
/// Mutated only while resolving, read-only afterwards.
#[derive(Debug, Clone)]
pub struct EndpointPool {
    endpoints: Vec<Endpoint>,
}

impl EndpointPool {
    /// Builds a pool from a non-empty list of endpoints.
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, ConnectivityError> {
        if endpoints.is_empty() {
            return Err(ConnectivityError::InsufficientEndpoints { got: 0, expected: 1 });
        }

        Ok(Self { endpoints })
    }

    /// Resolves the usable endpoint set according to the config's selection
    /// method.
    ///
    /// With discovery enabled this retries until at least
    /// `cfg.expect_peers` usable endpoints are found or the peer connect
    /// timeout elapses.
    pub async fn resolve<D>(cfg: &Config, discover: &D) -> Result<Self, Error>
    where
        D: Discover,
    {
        let supplied = cfg
            .endpoints
            .iter()
            .map(|v| v.parse())
            .collect::<Result<Vec<Endpoint>, _>>()?;

        let (mut endpoints, expected) = match cfg.endpoint_select_method {
            EndpointSelectMethod::Supplied => (supplied, 1),
            method => {
                let expected = cfg.expect_peers.max(1);
                let deadline = Instant::now() + cfg.peer_connect_timeout();
                let endpoints = Self::discover(discover, &supplied, method, cfg.min_connectivity, expected, deadline).await;
                (endpoints, expected)
            }
        };

        if cfg.max_endpoints > 0 {
            endpoints.truncate(cfg.max_endpoints);
        }
        if endpoints.len() < expected {
            return Err(ConnectivityError::InsufficientEndpoints { got: endpoints.len(), expected }.into());
        }

        log::info!(
            "resolved {} endpoint(s): {}",
            endpoints.len(),
            endpoints.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );

        Ok(Self::new(endpoints)?)
    }

    async fn discover<D>(
        discover: &D,
        supplied: &[Endpoint],
        method: EndpointSelectMethod,
        min_connectivity: usize,
        expected: usize,
        deadline: Instant,
    ) -> Vec<Endpoint>
    where
        D: Discover,
    {
        loop {
            let found = Self::crawl(discover, supplied, deadline).await;

            let usable: Vec<Endpoint> = found
                .into_iter()
                .filter(|(endpoint, _)| method == EndpointSelectMethod::Any || !supplied.contains(endpoint))
                .filter(|(_, n_peers)| *n_peers >= min_connectivity)
                .map(|(endpoint, _)| endpoint)
                .collect();

            if usable.len() >= expected || Instant::now() >= deadline {
                return usable;
            }

            log::info!("discovered {}/{} usable endpoint(s), waiting for more ...", usable.len(), expected);
            time::sleep_until(deadline.min(Instant::now() + DISCOVERY_INTERVAL)).await;
        }
    }

    /// Queries the supplied endpoints, then their peers.
    ///
    /// Returns reachable endpoints with their own peer counts. Unreachable
    /// endpoints are dropped.
    async fn crawl<D>(discover: &D, supplied: &[Endpoint], deadline: Instant) -> BTreeMap<Endpoint, usize>
    where
        D: Discover,
    {
        let mut found = BTreeMap::new();
        let mut peers = BTreeSet::new();

        for endpoint in supplied {
            if let Some(info) = Self::query(discover, endpoint, deadline).await {
                found.insert(endpoint.clone(), info.n_peers);
                peers.extend(info.peers);
            }
        }

        for endpoint in peers {
            if found.contains_key(&endpoint) {
                continue;
            }
            if let Some(info) = Self::query(discover, &endpoint, deadline).await {
                found.insert(endpoint, info.n_peers);
            }
        }

        found
    }

    async fn query<D>(discover: &D, endpoint: &Endpoint, deadline: Instant) -> Option<NetInfo>
    where
        D: Discover,
    {
        match time::timeout_at(deadline, discover.net_info(endpoint)).await {
            Ok(Ok(info)) => Some(info),
            Ok(Err(err)) => {
                log::debug!("failed to query {endpoint}: {err}");
                None
            }
            Err(..) => {
                log::debug!("timed out querying {endpoint}");
                None
            }
        }
    }

    /// Maps a connection index to an endpoint, round-robin.
    #[inline]
    pub fn select(&self, idx: usize) -> &Endpoint {
        &self.endpoints[idx % self.endpoints.len()]
    }

    #[inline]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
