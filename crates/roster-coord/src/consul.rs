//! Consul backend
//!
//! Maps the coordination contract onto the Consul HTTP API:
//!
//! | Contract            | Consul                                               |
//! |---------------------|------------------------------------------------------|
//! | session             | `PUT /v1/session/create` with `Behavior=delete`, TTL renewed in the background |
//! | ephemeral create    | `PUT /v1/txn`: `check-not-exists` + `lock` with the session |
//! | persistent create   | `PUT /v1/txn`: `check-not-exists` + `set`            |
//! | children            | `GET /v1/kv/<path>/?keys&separator=/`                |
//! | children version    | `X-Consul-Index` of the children listing             |
//! | one-shot watch      | blocking queries on the listing until the child set differs |
//!
//! Paths map to keys by dropping the leading slash. Consul keys have no real
//! hierarchy, so creating a node does not require its parent to exist.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{
    Children, CoordinationBackend, Connector, CreateMode, NodeData, Notification, SessionState,
    WatchCallback, WatchEvent, spawn_notification_task, validate_path,
};
use crate::error::{CoordError, Result};

const INDEX_HEADER: &str = "X-Consul-Index";
/// Consul accepts session TTLs between 10s and 24h.
const MIN_SESSION_TTL_SECS: u64 = 10;
const MAX_SESSION_TTL_SECS: u64 = 86400;
const BLOCKING_WAIT: Duration = Duration::from_secs(30);
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct SessionCreateRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "Behavior")]
    behavior: &'a str,
    #[serde(rename = "LockDelay")]
    lock_delay: &'a str,
}

#[derive(Deserialize)]
struct SessionCreateResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct KvEntry {
    #[serde(rename = "Value", default)]
    value: Option<String>,
    #[serde(rename = "Session", default)]
    session: Option<String>,
}

#[derive(Serialize)]
struct TxnKvOp<'a> {
    #[serde(rename = "Verb")]
    verb: &'a str,
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(rename = "Session", skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
}

#[derive(Serialize)]
struct TxnOp<'a> {
    #[serde(rename = "KV")]
    kv: TxnKvOp<'a>,
}

/// Map a transport failure. Failures before the request reached the agent
/// are connection errors; anything later may have been applied.
fn transport_error(e: reqwest::Error) -> CoordError {
    if e.is_connect() {
        CoordError::Connection(e.to_string())
    } else if e.is_timeout() {
        CoordError::Timeout
    } else {
        CoordError::ConnectionLoss(e.to_string())
    }
}

async fn status_error(what: &str, response: reqwest::Response) -> CoordError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        CoordError::ConnectionLoss(format!("{} returned {}: {}", what, status, body))
    } else {
        CoordError::Backend(format!("{} returned {}: {}", what, status, body))
    }
}

fn path_to_key(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Opens Consul sessions against one agent.
pub struct ConsulConnector {
    address: String,
    base_url: String,
    http: reqwest::Client,
    session_name: String,
}

impl ConsulConnector {
    /// `address` is `host:port` or a full `http(s)://` URL of the agent.
    pub fn new(address: &str, connect_timeout: Duration) -> Result<Self> {
        let trimmed = address.trim_end_matches('/');
        let base_url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };

        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| CoordError::Backend(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            address: address.to_string(),
            base_url,
            http,
            session_name: "roster-broker".to_string(),
        })
    }

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Connector for ConsulConnector {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self, session_ttl: Duration) -> Result<Arc<dyn CoordinationBackend>> {
        let ttl_secs = session_ttl
            .as_secs()
            .clamp(MIN_SESSION_TTL_SECS, MAX_SESSION_TTL_SECS);

        let request = SessionCreateRequest {
            name: &self.session_name,
            ttl: format!("{}s", ttl_secs),
            behavior: "delete",
            lock_delay: "0s",
        };

        let response = self
            .http
            .put(format!("{}/v1/session/create", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| match transport_error(e) {
                CoordError::ConnectionLoss(msg) => CoordError::Connection(msg),
                other => other,
            })?;

        if !response.status().is_success() {
            return Err(match status_error("session create", response).await {
                CoordError::ConnectionLoss(msg) => CoordError::Connection(msg),
                other => other,
            });
        }

        let created: SessionCreateResponse = response
            .json()
            .await
            .map_err(|e| CoordError::Backend(format!("bad session create response: {}", e)))?;

        let (state_tx, _) = watch::channel(SessionState::Connected);
        let shared = Arc::new(SessionShared {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            events: spawn_notification_task(created.id.clone()),
            session_id: created.id,
            state: state_tx,
        });

        let renew_every = Duration::from_secs(ttl_secs) / 3;
        let renewer = tokio::spawn(run_renewals(shared.clone(), renew_every));

        info!(
            "Created Consul session {} (ttl {}s) at {}",
            shared.session_id, ttl_secs, self.base_url
        );

        Ok(Arc::new(ConsulSession { shared, renewer }))
    }
}

struct SessionShared {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
    events: mpsc::UnboundedSender<Notification>,
    state: watch::Sender<SessionState>,
}

impl SessionShared {
    fn check_state(&self) -> Result<()> {
        match *self.state.borrow() {
            SessionState::Connected => Ok(()),
            SessionState::Expired => Err(CoordError::SessionExpired(self.session_id.clone())),
            SessionState::Closed => Err(CoordError::SessionClosed),
        }
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key)
    }

    fn notify(&self, event: WatchEvent, callback: WatchCallback) {
        if self.events.send((event, callback)).is_err() {
            debug!("Notification task of session {} is gone", self.session_id);
        }
    }

    async fn read_entry(&self, key: &str) -> Result<Option<KvEntry>> {
        let response = self
            .http
            .get(self.kv_url(key))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error("kv get", response).await);
        }

        let entries: Vec<KvEntry> = response
            .json()
            .await
            .map_err(|e| CoordError::Backend(format!("bad kv response for {}: {}", key, e)))?;
        Ok(entries.into_iter().next())
    }

    /// List child names of `path`, optionally as a blocking query.
    async fn list_children(&self, path: &str, wait: Option<(u64, Duration)>) -> Result<Children> {
        let key = path_to_key(path);
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        };

        let mut request = self
            .http
            .get(self.kv_url(&prefix))
            .query(&[("keys", ""), ("separator", "/")]);
        if let Some((index, wait)) = wait {
            request = request
                .query(&[
                    ("index", index.to_string()),
                    ("wait", format!("{}s", wait.as_secs())),
                ])
                .timeout(wait + wait / 16 + Duration::from_secs(5));
        }

        let response = request.send().await.map_err(transport_error)?;
        let version = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Children {
                names: BTreeSet::new(),
                version,
            });
        }
        if !response.status().is_success() {
            return Err(status_error("kv keys", response).await);
        }

        let keys: Vec<String> = response
            .json()
            .await
            .map_err(|e| CoordError::Backend(format!("bad keys response for {}: {}", path, e)))?;

        let names = keys
            .iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .map(|rest| rest.trim_end_matches('/'))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Children { names, version })
    }
}

async fn run_renewals(shared: Arc<SessionShared>, period: Duration) {
    let url = format!("{}/v1/session/renew/{}", shared.base_url, shared.session_id);
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if *shared.state.borrow() != SessionState::Connected {
            break;
        }

        match shared.http.put(&url).send().await {
            Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                warn!("Consul session {} expired", shared.session_id);
                shared.state.send_replace(SessionState::Expired);
                break;
            }
            Ok(response) if !response.status().is_success() => {
                warn!(
                    "Renewing Consul session {} returned {}",
                    shared.session_id,
                    response.status()
                );
            }
            Ok(_) => debug!("Renewed Consul session {}", shared.session_id),
            Err(e) => warn!("Failed to renew Consul session {}: {}", shared.session_id, e),
        }
    }
}

/// Resolves once the session leaves `Connected`, with the new state.
async fn session_ended(state: &mut watch::Receiver<SessionState>) -> SessionState {
    loop {
        let current = *state.borrow_and_update();
        if current != SessionState::Connected {
            return current;
        }
        if state.changed().await.is_err() {
            return SessionState::Closed;
        }
    }
}

async fn run_watch(
    shared: Arc<SessionShared>,
    path: String,
    observed: Children,
    callback: WatchCallback,
) {
    let mut state = shared.state.subscribe();
    let mut index = observed.version;

    loop {
        tokio::select! {
            ended = session_ended(&mut state) => {
                if ended == SessionState::Expired {
                    shared.notify(WatchEvent::session_expired(path), callback);
                }
                return;
            }
            result = shared.list_children(&path, Some((index, BLOCKING_WAIT))) => match result {
                Ok(children) if children.names != observed.names => {
                    shared.notify(WatchEvent::children_changed(path), callback);
                    return;
                }
                Ok(children) => {
                    // a backwards index means the agent's index was reset
                    index = if children.version < index { 0 } else { children.version };
                }
                Err(e) => {
                    debug!("Watch on {} failed: {}, retrying", path, e);
                    tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// One Consul session.
pub struct ConsulSession {
    shared: Arc<SessionShared>,
    renewer: JoinHandle<()>,
}

impl ConsulSession {
    async fn create_txn(&self, key: &str, payload: Bytes, mode: CreateMode) -> Result<()> {
        let value = Some(BASE64.encode(&payload));
        let write = match mode {
            CreateMode::Ephemeral => TxnKvOp {
                verb: "lock",
                key,
                value,
                session: Some(&self.shared.session_id),
            },
            CreateMode::Persistent => TxnKvOp {
                verb: "set",
                key,
                value,
                session: None,
            },
        };
        let ops = [
            TxnOp {
                kv: TxnKvOp {
                    verb: "check-not-exists",
                    key,
                    value: None,
                    session: None,
                },
            },
            TxnOp { kv: write },
        ];

        let response = self
            .shared
            .http
            .put(format!("{}/v1/txn", self.shared.base_url))
            .json(&ops)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => match self.shared.read_entry(key).await? {
                Some(entry) => Err(CoordError::NodeExists {
                    path: format!("/{}", key),
                    owner: entry.session,
                }),
                None => Err(CoordError::ConnectionLoss(format!(
                    "create of /{} raced with a delete",
                    key
                ))),
            },
            _ => Err(status_error("txn", response).await),
        }
    }
}

impl Drop for ConsulSession {
    fn drop(&mut self) {
        self.renewer.abort();
    }
}

#[async_trait]
impl CoordinationBackend for ConsulSession {
    fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    async fn create(&self, path: &str, payload: Bytes, mode: CreateMode) -> Result<()> {
        validate_path(path)?;
        self.shared.check_state()?;
        self.create_txn(path_to_key(path), payload, mode).await?;
        debug!("Created {:?} key {}", mode, path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.shared.check_state()?;
        let key = path_to_key(path);
        if self.shared.read_entry(key).await?.is_none() {
            return Err(CoordError::NoNode(path.to_string()));
        }

        let response = self
            .shared
            .http
            .delete(self.shared.kv_url(key))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("kv delete", response).await);
        }
        debug!("Deleted key {}", path);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<NodeData> {
        validate_path(path)?;
        self.shared.check_state()?;
        let entry = self
            .shared
            .read_entry(path_to_key(path))
            .await?
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;

        let payload = match entry.value {
            Some(encoded) => BASE64
                .decode(encoded)
                .map(Bytes::from)
                .map_err(|e| CoordError::Backend(format!("bad value encoding at {}: {}", path, e)))?,
            None => Bytes::new(),
        };

        Ok(NodeData {
            payload,
            owner: entry.session,
        })
    }

    async fn get_children(&self, path: &str) -> Result<Children> {
        validate_path(path)?;
        self.shared.check_state()?;
        self.shared.list_children(path, None).await
    }

    async fn watch_children(
        &self,
        path: &str,
        observed: &Children,
        callback: WatchCallback,
    ) -> Result<()> {
        validate_path(path)?;
        self.shared.check_state()?;
        tokio::spawn(run_watch(
            self.shared.clone(),
            path.to_string(),
            observed.clone(),
            callback,
        ));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.shared.state.send_replace(SessionState::Closed) != SessionState::Connected {
            return Ok(());
        }
        self.renewer.abort();

        let response = self
            .shared
            .http
            .put(format!(
                "{}/v1/session/destroy/{}",
                self.shared.base_url, self.shared.session_id
            ))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("session destroy", response).await);
        }
        info!("Destroyed Consul session {}", self.shared.session_id);
        Ok(())
    }
}
