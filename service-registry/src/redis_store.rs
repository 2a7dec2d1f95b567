use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Script};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::{join_path, parent_path, validate_path};
use crate::{CoordinationStore, CreateMode, Error, NodeStat, WatchEvent};

const DEFAULT_PREFIX: &str = "coord";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30;

/// Heartbeats per TTL period.
const HEARTBEATS_PER_TTL: u32 = 6;

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {'nonode', ARGV[6]}
end
local path = ARGV[1]
if ARGV[7] == '1' then
  local seq = redis.call('INCR', KEYS[3]) - 1
  path = path .. string.format('%010d', seq)
end
local key = ARGV[8] .. path
if redis.call('EXISTS', key) == 1 then
  return {'exists', path}
end
redis.call('HSET', key, 'data', ARGV[2], 'version', 0, 'owner', ARGV[3])
if tonumber(ARGV[4]) > 0 then
  redis.call('PEXPIRE', key, ARGV[4])
end
local name
if ARGV[6] == '/' then
  name = string.sub(path, 2)
else
  name = string.sub(path, string.len(ARGV[6]) + 2)
end
redis.call('SADD', KEYS[2], name)
redis.call('PUBLISH', ARGV[5], cjson.encode({event='children_changed', path=ARGV[6]}))
return {'ok', path}
"#;

const DELETE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {'nonode', '0'}
end
if ARGV[1] ~= '' then
  local v = redis.call('HGET', KEYS[1], 'version')
  if v ~= ARGV[1] then
    return {'badversion', v or '0'}
  end
end
if redis.call('SCARD', KEYS[2]) > 0 then
  return {'notempty', '0'}
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[3], ARGV[2])
redis.call('PUBLISH', ARGV[3], cjson.encode({event='children_changed', path=ARGV[4]}))
return {'ok', '0'}
"#;

const PRUNE_SCRIPT: &str = r#"
local removed = 0
for _, name in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', ARGV[1] .. name) == 0 then
    redis.call('SREM', KEYS[1], name)
    removed = removed + 1
  end
end
if removed > 0 then
  redis.call('PUBLISH', ARGV[2], cjson.encode({event='children_changed', path=ARGV[3]}))
end
return removed
"#;

/// JSON message format for Pub/Sub
#[derive(serde::Serialize, serde::Deserialize, Debug)]
struct PubSubMessage {
    event: String, // "children_changed"
    path: String,
}

/// Session state shared with the background tasks.
struct SessionState {
    /// Ephemeral nodes created by this session.
    owned: Mutex<HashSet<String>>,
    /// Armed one-shot children watches.
    watches: Mutex<HashSet<String>>,
    /// Parents ever listed with a watch; pruned on every heartbeat.
    watched_parents: Mutex<HashSet<String>>,
    event_tx: mpsc::UnboundedSender<WatchEvent>,
}

impl SessionState {
    fn fire_watch(&self, path: &str) {
        if self.watches.lock().remove(path) {
            let _ = self.event_tx.send(WatchEvent::ChildrenChanged {
                path: path.to_string(),
            });
        }
    }

    fn fire_all_watches(&self) {
        let armed: Vec<String> = self.watches.lock().drain().collect();
        for path in armed {
            let _ = self.event_tx.send(WatchEvent::ChildrenChanged { path });
        }
    }
}

/// Coordination session backed by Redis.
///
/// Nodes are hashes (`data`, `version`, `owner`), child names live in a set
/// per parent, and every child-set change is published on one channel.
/// Ephemeral nodes carry a TTL that this session's heartbeat keeps alive,
/// so a crashed process drops out within one TTL.
pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
    channel: String,
    session_id: u64,
    session_ttl: Duration,
    state: Arc<SessionState>,
    create_script: Script,
    delete_script: Script,
    cancel_token: CancellationToken,
    /// Child of `cancel_token`; stops only the TTL refresh.
    heartbeat_cancel: CancellationToken,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        tracing::debug!(
            session_id = self.session_id,
            "RedisStore dropped (close should be called explicitly)"
        );
    }
}

impl RedisStore {
    /// Open a session with the default key prefix and TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unreachable.
    pub async fn connect(
        redis_url: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<WatchEvent>), Error> {
        Self::connect_with(
            redis_url,
            None,
            Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
        )
        .await
    }

    /// Open a session with an optional key prefix (for test isolation) and
    /// a custom ephemeral-node TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unreachable or the TTL is zero.
    pub async fn connect_with(
        redis_url: &str,
        prefix: Option<&str>,
        session_ttl: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<WatchEvent>), Error> {
        if session_ttl.as_millis() == 0 {
            return Err(Error::Config("session TTL must be positive".to_string()));
        }

        let prefix = prefix.unwrap_or(DEFAULT_PREFIX).to_string();
        let channel = format!("{}:events", prefix);

        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let session_id: u64 = conn.incr(format!("{}:sessions", prefix), 1).await?;

        // Root node
        let root_key = format!("{}:node:/", prefix);
        let _: () = redis::pipe()
            .hset_nx(&root_key, "data", "")
            .hset_nx(&root_key, "version", 0)
            .hset_nx(&root_key, "owner", 0)
            .query_async(&mut conn)
            .await?;

        // Subscribe before handing out the session so no change is missed
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState {
            owned: Mutex::new(HashSet::new()),
            watches: Mutex::new(HashSet::new()),
            watched_parents: Mutex::new(HashSet::new()),
            event_tx,
        });
        let cancel_token = CancellationToken::new();
        let heartbeat_cancel = cancel_token.child_token();

        let pubsub_handle = Self::spawn_pubsub_task(
            client,
            pubsub,
            channel.clone(),
            state.clone(),
            cancel_token.clone(),
        );
        let heartbeat_handle = Self::spawn_heartbeat_task(
            conn.clone(),
            prefix.clone(),
            channel.clone(),
            session_id,
            session_ttl,
            state.clone(),
            heartbeat_cancel.clone(),
        );

        tracing::info!(session_id, prefix = %prefix, "Opened Redis coordination session");

        let store = Self {
            conn,
            prefix,
            channel,
            session_id,
            session_ttl,
            state,
            create_script: Script::new(CREATE_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
            cancel_token,
            heartbeat_cancel,
            handles: Mutex::new(vec![pubsub_handle, heartbeat_handle]),
        };
        Ok((Arc::new(store), event_rx))
    }

    fn node_key(&self, path: &str) -> String {
        node_key(&self.prefix, path)
    }

    fn children_key(&self, path: &str) -> String {
        children_key(&self.prefix, path)
    }

    fn spawn_heartbeat_task(
        conn: MultiplexedConnection,
        prefix: String,
        channel: String,
        session_id: u64,
        session_ttl: Duration,
        state: Arc<SessionState>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut conn = conn;
            let ttl_ms = session_ttl.as_millis() as i64;
            let mut heartbeat_interval = tokio::time::interval(session_ttl / HEARTBEATS_PER_TTL);
            let prune_script = Script::new(PRUNE_SCRIPT);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!(session_id, "Heartbeat task shutting down");
                        break;
                    }

                    _ = heartbeat_interval.tick() => {
                        match heartbeat_once(&mut conn, &prefix, &channel, ttl_ms, &state, &prune_script).await {
                            Ok(lost) => {
                                consecutive_failures = 0;
                                if lost > 0 {
                                    tracing::warn!(session_id, lost, "Ephemeral nodes expired, session lost");
                                }
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                let backoff_ms = 100 * 2u64.pow(consecutive_failures.min(6));
                                tracing::error!(
                                    session_id,
                                    failures = consecutive_failures,
                                    backoff_ms,
                                    "Heartbeat failed: {}, backing off",
                                    e
                                );
                                tokio::select! {
                                    _ = cancel_token.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_pubsub_task(
        client: redis::Client,
        pubsub: PubSub,
        channel: String,
        state: Arc<SessionState>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut pubsub = Some(pubsub);
            loop {
                if cancel_token.is_cancelled() {
                    break;
                }

                let conn = match pubsub.take() {
                    Some(conn) => conn,
                    None => {
                        let mut conn = match client.get_async_pubsub().await {
                            Ok(c) => c,
                            Err(e) => {
                                tracing::error!("Failed to get Pub/Sub connection: {}", e);
                                tokio::select! {
                                    _ = cancel_token.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                                }
                            }
                        };
                        if let Err(e) = conn.subscribe(&channel).await {
                            tracing::error!("Failed to resubscribe to {}: {}", channel, e);
                            tokio::select! {
                                _ = cancel_token.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                            }
                        }
                        // Changes may have happened while disconnected
                        state.fire_all_watches();
                        conn
                    }
                };

                if let Err(e) = Self::run_pubsub_loop(conn, &state, &cancel_token).await {
                    if !cancel_token.is_cancelled() {
                        tracing::warn!("Pub/Sub loop error, reconnecting: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            tracing::debug!("Pub/Sub task shutting down");
        })
    }

    async fn run_pubsub_loop(
        mut pubsub: PubSub,
        state: &SessionState,
        cancel_token: &CancellationToken,
    ) -> Result<(), Error> {
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    break;
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        // Stream ended, reconnect
                        return Err(Error::Connection("Pub/Sub stream ended".to_string()));
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!("Failed to get Pub/Sub payload: {}", e);
                            continue;
                        }
                    };

                    let parsed: PubSubMessage = match serde_json::from_str(&payload) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!("Failed to parse Pub/Sub message: {}", e);
                            continue;
                        }
                    };

                    match parsed.event.as_str() {
                        "children_changed" => {
                            tracing::trace!(path = %parsed.path, "Children changed (via Pub/Sub)");
                            state.fire_watch(&parsed.path);
                        }
                        other => {
                            tracing::warn!("Unknown Pub/Sub event: {}", other);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// End the session: stop background tasks and delete every ephemeral
    /// node this session created.
    ///
    /// # Errors
    ///
    /// Returns an error if deleting an ephemeral node fails.
    pub async fn close(&self) -> Result<(), Error> {
        // Stop heartbeat first so it cannot extend TTLs we are about to drop
        self.cancel_token.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let owned: Vec<String> = self.state.owned.lock().drain().collect();
        for path in &owned {
            match self.delete(path, None).await {
                Ok(()) | Err(Error::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            session_id = self.session_id,
            removed = owned.len(),
            "Closed Redis coordination session"
        );
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, Error> {
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| Error::NodeExists(path.to_string()))?;

        let (owner, ttl_ms, sequential) = match mode {
            CreateMode::Persistent => (0, 0, "0"),
            CreateMode::EphemeralSequential => {
                (self.session_id, self.session_ttl.as_millis() as u64, "1")
            }
        };

        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .create_script
            .key(self.node_key(parent))
            .key(self.children_key(parent))
            .key(format!("{}:seq:{}", self.prefix, parent))
            .arg(path)
            .arg(data)
            .arg(owner)
            .arg(ttl_ms)
            .arg(&self.channel)
            .arg(parent)
            .arg(sequential)
            .arg(format!("{}:node:", self.prefix))
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [status, actual] if status == "ok" => {
                if mode.is_ephemeral() {
                    self.state.owned.lock().insert(actual.clone());
                }
                Ok(actual.clone())
            }
            [status, actual] if status == "exists" => Err(Error::NodeExists(actual.clone())),
            [status, missing] if status == "nonode" => Err(Error::NoNode(missing.clone())),
            other => Err(Error::Connection(format!("unexpected create reply: {:?}", other))),
        }
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, Error> {
        validate_path(path)?;
        let mut conn = self.conn.clone();
        let (version, owner): (Option<u64>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.node_key(path))
            .arg("version")
            .arg("owner")
            .query_async(&mut conn)
            .await?;

        Ok(version.map(|version| NodeStat {
            version,
            ephemeral_owner: owner.unwrap_or(0),
        }))
    }

    async fn delete(&self, path: &str, version: Option<u64>) -> Result<(), Error> {
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| Error::NotEmpty(path.to_string()))?;
        let name = &path[parent.len() + usize::from(parent != "/")..];
        let expected = version.map(|v| v.to_string()).unwrap_or_default();

        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .delete_script
            .key(self.node_key(path))
            .key(self.children_key(path))
            .key(self.children_key(parent))
            .arg(&expected)
            .arg(name)
            .arg(&self.channel)
            .arg(parent)
            .invoke_async(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("ok") => {
                self.state.owned.lock().remove(path);
                Ok(())
            }
            Some("nonode") => Err(Error::NoNode(path.to_string())),
            Some("notempty") => Err(Error::NotEmpty(path.to_string())),
            Some("badversion") => Err(Error::BadVersion {
                path: path.to_string(),
                expected: version.unwrap_or_default(),
                actual: reply.get(1).and_then(|v| v.parse().ok()).unwrap_or_default(),
            }),
            _ => Err(Error::Connection(format!("unexpected delete reply: {:?}", reply))),
        }
    }

    async fn children(&self, path: &str, watch: bool) -> Result<Vec<String>, Error> {
        validate_path(path)?;
        let mut conn = self.conn.clone();

        let present: bool = conn.exists(self.node_key(path)).await?;
        if !present {
            return Err(Error::NoNode(path.to_string()));
        }

        // Arm before reading: a change racing the read fires the watch
        // instead of being lost
        if watch {
            self.state.watches.lock().insert(path.to_string());
            self.state.watched_parents.lock().insert(path.to_string());
        }

        let mut names: Vec<String> = conn.smembers(self.children_key(path)).await?;
        if names.is_empty() {
            return Ok(names);
        }

        // Expired ephemerals linger in the set until pruned
        let mut pipe = redis::pipe();
        for name in &names {
            pipe.exists(self.node_key(&join_path(path, name)));
        }
        let alive: Vec<bool> = pipe.query_async(&mut conn).await?;
        let mut alive = alive.into_iter();
        names.retain(|_| alive.next().unwrap_or(false));
        names.sort();
        Ok(names)
    }

    async fn data(&self, path: &str) -> Result<Vec<u8>, Error> {
        validate_path(path)?;
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = conn.hget(self.node_key(path), "data").await?;
        data.ok_or_else(|| Error::NoNode(path.to_string()))
    }

    fn session_id(&self) -> u64 {
        self.session_id
    }
}

fn node_key(prefix: &str, path: &str) -> String {
    format!("{}:node:{}", prefix, path)
}

fn children_key(prefix: &str, path: &str) -> String {
    format!("{}:children:{}", prefix, path)
}

/// Extend TTLs of owned ephemerals and prune expired children of watched
/// parents. Returns how many owned nodes had already expired; any such loss
/// is reported to the session as `SessionExpired`.
async fn heartbeat_once(
    conn: &mut MultiplexedConnection,
    prefix: &str,
    channel: &str,
    ttl_ms: i64,
    state: &SessionState,
    prune_script: &Script,
) -> Result<usize, Error> {
    let owned: Vec<String> = state.owned.lock().iter().cloned().collect();
    let mut lost = 0;
    for path in owned {
        let refreshed: bool = conn.pexpire(node_key(prefix, &path), ttl_ms).await?;
        if !refreshed {
            state.owned.lock().remove(&path);
            lost += 1;
        }
    }
    if lost > 0 {
        let _ = state.event_tx.send(WatchEvent::SessionExpired);
    }

    let parents: Vec<String> = state.watched_parents.lock().iter().cloned().collect();
    for parent in parents {
        let removed: u64 = prune_script
            .key(children_key(prefix, &parent))
            .arg(node_key(prefix, &join_path(&parent, "")))
            .arg(channel)
            .arg(&parent)
            .invoke_async(&mut *conn)
            .await?;
        if removed > 0 {
            tracing::info!(parent = %parent, removed, "Pruned expired members");
        }
    }

    Ok(lost)
}
