use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::{Error, Registration, ServiceRegistry, Unregistration};

/// Tries at withdrawing our member node before a leader transition gives up.
pub const UNREGISTER_ATTEMPTS: u32 = 5;

/// Role assigned to this process by the election mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leader" => Ok(Self::Leader),
            "worker" => Ok(Self::Worker),
            other => Err(Error::Config(format!(
                "unknown role '{}' (expected leader or worker)",
                other
            ))),
        }
    }
}

/// Entry points an election mechanism calls once it has decided our role.
#[async_trait]
pub trait ElectionCallback: Send + Sync {
    async fn on_elected_leader(&self);
    async fn on_worker(&self);
}

/// Drives the [`ServiceRegistry`] through the call sequence for a role.
///
/// Transitions are serialized, so two assignments delivered back to back
/// run one after the other.
pub struct RoleTransitionHandler {
    registry: Arc<ServiceRegistry>,
    port: u16,
    advertised_host: Option<String>,
    transition_lock: Mutex<()>,
}

impl RoleTransitionHandler {
    pub fn new(registry: Arc<ServiceRegistry>, port: u16) -> Self {
        Self {
            registry,
            port,
            advertised_host: None,
            transition_lock: Mutex::new(()),
        }
    }

    /// Advertise `host` instead of the discovered local hostname.
    pub fn with_advertised_host(mut self, host: impl Into<String>) -> Self {
        self.advertised_host = Some(host.into());
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub async fn apply(&self, role: Role) {
        tracing::info!(%role, "Role assigned");
        match role {
            Role::Leader => self.on_elected_leader().await,
            Role::Worker => self.on_worker().await,
        }
    }

    /// Stop advertising ourselves, then start watching the worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if our member node still cannot be removed after
    /// [`UNREGISTER_ATTEMPTS`] tries, in which case no subscription is made,
    /// or if the subscription itself fails.
    pub async fn become_leader(&self) -> Result<Arc<Vec<String>>, Error> {
        let _guard = self.transition_lock.lock().await;

        // No-op if we joined as leader; removes our worker node otherwise
        self.unregister_with_retry().await?;
        self.registry.subscribe_to_updates().await
    }

    async fn unregister_with_retry(&self) -> Result<Unregistration, Error> {
        let mut attempt: u32 = 1;
        loop {
            match self.registry.unregister().await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_connection() && attempt < UNREGISTER_ATTEMPTS => {
                    let backoff_ms = 100 * 2u64.pow(attempt.min(6));
                    tracing::warn!(
                        attempt,
                        backoff_ms,
                        "Unregister before taking leadership failed: {}, retrying",
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Advertise `http://<host>:<port>` in the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressResolution`] if the local host cannot be
    /// determined, or the registry failure.
    pub async fn become_worker(&self) -> Result<Registration, Error> {
        let _guard = self.transition_lock.lock().await;

        let address = resolve_local_address(self.advertised_host.as_deref(), self.port).await?;
        self.registry.register(&address).await
    }
}

#[async_trait]
impl ElectionCallback for RoleTransitionHandler {
    async fn on_elected_leader(&self) {
        match self.become_leader().await {
            Ok(addresses) => {
                tracing::info!(workers = addresses.len(), "Leader subscribed to membership updates")
            }
            Err(e) => tracing::error!(error = %e, "Leader transition failed"),
        }
    }

    async fn on_worker(&self) {
        if let Err(e) = self.become_worker().await {
            // Unregistered workers are invisible to the cluster but keep running
            tracing::error!(error = %e, port = self.port, "Worker failed to register");
        }
    }
}

/// Build the address this process advertises.
///
/// An explicit `advertised_host` is used as given, since it may name a
/// proxy or an external DNS entry that does not resolve from this machine.
/// Otherwise the hostname comes from `HOSTNAME` or `/etc/hostname` and must
/// resolve. That is the machine's configured name, not a reverse-resolved
/// canonical FQDN; set `ADVERTISED_HOST` when peers need a fully qualified
/// name.
pub async fn resolve_local_address(advertised_host: Option<&str>, port: u16) -> Result<String, Error> {
    let host = match advertised_host {
        Some(host) => host.to_string(),
        None => {
            let host = local_hostname().await?;
            let found = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(|e| Error::AddressResolution(format!("{}: {}", host, e)))?
                .next()
                .is_some();
            if !found {
                return Err(Error::AddressResolution(format!(
                    "{} resolved to no addresses",
                    host
                )));
            }
            host
        }
    };

    Ok(format_address(&host, port))
}

pub fn format_address(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

async fn local_hostname() -> Result<String, Error> {
    if let Ok(host) = std::env::var("HOSTNAME") {
        let host = host.trim().to_string();
        if !host.is_empty() {
            return Ok(host);
        }
    }

    let host = tokio::fs::read_to_string("/etc/hostname")
        .await
        .map_err(|e| Error::AddressResolution(format!("no hostname available: {}", e)))?;
    let host = host.trim().to_string();
    if host.is_empty() {
        return Err(Error::AddressResolution("hostname is empty".to_string()));
    }
    Ok(host)
}
