//! Tendermint-style JSON-RPC over HTTP/1.

use bytes::Bytes;
use http::{header, Request};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1::{self, SendRequest};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::net::TcpStream;

use super::{io::TokioIo, Connector, Transport};
use crate::{
    cfg::BroadcastMode,
    endpoint::{Discover, Endpoint, NetInfo, DEFAULT_RPC_PORT},
    error::ConnectionError,
};

/// Connects to RPC endpoints over plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcConnector;

impl Connector for RpcConnector {
    type Transport = RpcTransport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Transport, ConnectionError> {
        RpcTransport::connect(endpoint).await
    }
}

/// Persistent HTTP/1 connection to a single RPC endpoint.
#[derive(Debug)]
pub struct RpcTransport {
    /// Value of the "Host" header.
    authority: String,
    sender: SendRequest<Empty<Bytes>>,
}

impl RpcTransport {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, ConnectionError> {
        let authority = endpoint.authority();
        let stream = TcpStream::connect(&authority)
            .await
            .map_err(|err| ConnectionError::Connect(format!("{endpoint}: {err}")))?;
        stream
            .set_nodelay(true)
            .map_err(|err| ConnectionError::Connect(format!("{endpoint}: {err}")))?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| ConnectionError::Connect(format!("{endpoint}: {err}")))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("connection failed: {err}");
            }
        });

        Ok(Self { authority, sender })
    }

    /// Performs a GET request, returning the response body of a 2xx reply.
    async fn get(&mut self, path: &str) -> Result<Bytes, ConnectionError> {
        self.sender.ready().await.map_err(transport_err)?;

        let req = Request::get(path)
            .header(header::HOST, &self.authority)
            .body(Empty::new())
            .map_err(transport_err)?;
        let resp = self.sender.send_request(req).await.map_err(transport_err)?;

        let status = resp.status();
        let body = resp.into_body().collect().await.map_err(transport_err)?.to_bytes();
        if !status.is_success() {
            return Err(ConnectionError::Status(status.as_u16()));
        }

        Ok(body)
    }
}

impl Transport for RpcTransport {
    async fn send(&mut self, tx: Bytes, mode: BroadcastMode) -> Result<(), ConnectionError> {
        let path = format!("/{}?tx=0x{}", mode.method(), hex::encode(&tx));
        let body = self.get(&path).await?;

        match mode {
            BroadcastMode::Async => Ok(()),
            BroadcastMode::Sync | BroadcastMode::Commit => check_broadcast(&body, mode),
        }
    }
}

#[inline]
fn transport_err<E>(err: E) -> ConnectionError
where
    E: ToString,
{
    ConnectionError::Transport(err.to_string())
}

/// Checks a broadcast response for JSON-RPC and application level errors.
fn check_broadcast(body: &[u8], mode: BroadcastMode) -> Result<(), ConnectionError> {
    let v: Value =
        serde_json::from_slice(body).map_err(|err| ConnectionError::Transport(format!("invalid response: {err}")))?;

    if let Some(err) = v.get("error").filter(|v| !v.is_null()) {
        return Err(ConnectionError::Rpc(err.to_string()));
    }

    let result = v
        .get("result")
        .ok_or_else(|| ConnectionError::Transport("response has no result".into()))?;
    let results = match mode {
        BroadcastMode::Commit => vec![
            result.get("check_tx"),
            result.get("deliver_tx").or_else(|| result.get("tx_result")),
        ],
        _ => vec![Some(result)],
    };

    for result in results.into_iter().flatten() {
        let code = result.get("code").and_then(Value::as_u64).unwrap_or(0);
        if code != 0 {
            let log = result.get("log").and_then(Value::as_str).unwrap_or_default();
            return Err(ConnectionError::Rpc(format!("code {code}: {log}")));
        }
    }

    Ok(())
}

/// Discovers peers through the `/net_info` RPC method.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcDiscover;

impl Discover for RpcDiscover {
    async fn net_info(&self, endpoint: &Endpoint) -> Result<NetInfo, ConnectionError> {
        let mut transport = RpcTransport::connect(endpoint).await?;
        let body = transport.get("/net_info").await?;

        parse_net_info(&body)
    }
}

#[derive(Debug, Deserialize)]
struct NetInfoResponse {
    result: NetInfoResult,
}

#[derive(Debug, Deserialize)]
struct NetInfoResult {
    #[serde(deserialize_with = "deserialize_u64_or_str")]
    n_peers: u64,
    #[serde(default)]
    peers: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
struct Peer {
    remote_ip: String,
    #[serde(default)]
    node_info: PeerNodeInfo,
}

#[derive(Debug, Default, Deserialize)]
struct PeerNodeInfo {
    #[serde(default)]
    other: PeerOther,
}

#[derive(Debug, Default, Deserialize)]
struct PeerOther {
    #[serde(default)]
    rpc_address: String,
}

/// Numbers are encoded as strings by some node versions.
fn deserialize_u64_or_str<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }

    match Repr::deserialize(de)? {
        Repr::Num(v) => Ok(v),
        Repr::Str(v) => v.parse().map_err(serde::de::Error::custom),
    }
}

fn parse_net_info(body: &[u8]) -> Result<NetInfo, ConnectionError> {
    let resp: NetInfoResponse =
        serde_json::from_slice(body).map_err(|err| ConnectionError::Transport(format!("invalid net_info: {err}")))?;

    let peers = resp
        .result
        .peers
        .into_iter()
        .map(|peer| {
            // The advertised RPC address usually binds to "0.0.0.0", only
            // its port is meaningful.
            let port = peer
                .node_info
                .other
                .rpc_address
                .parse::<Endpoint>()
                .map(|v| v.port())
                .unwrap_or(DEFAULT_RPC_PORT);
            Endpoint::new(peer.remote_ip, port)
        })
        .collect();

    Ok(NetInfo {
        n_peers: resp.result.n_peers as usize,
        peers,
    })
}
