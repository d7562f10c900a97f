//! Directory client for amesh.
//!
//! The cross-host rendezvous point is an etcd v3 keyspace: lease-based
//! presence, ordered change notification, and consistent read-then-watch.
//! This crate wraps [`etcd_client`] with the handful of operations the
//! agent and the control tool need, and derives the deterministic node and
//! lease identifiers.
//!
//! Every operation can fail transiently; callers log once per failure run,
//! sleep a beat and reconnect (the workers re-snapshot or re-register on
//! their own).

use etcd_client::{
    Client, ConnectOptions, DeleteOptions, GetOptions, LeaseGrantOptions, PutOptions,
    WatchOptions,
};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub use etcd_client::{EventType, WatchResponse, WatchStream, Watcher};

/// Errors from directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The underlying etcd operation failed (connection, auth, I/O).
    #[error("etcd operation failed: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// A lease refresh found the lease gone on the server side.
    #[error("lease {lease_id:#x} expired on the server")]
    LeaseExpired {
        /// The expired lease id.
        lease_id: i64,
    },

    /// The watch stream ended without a local cancellation.
    #[error("watch stream closed by the server")]
    WatchClosed,
}

/// Convenience result alias for directory operations.
pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Derives the node id from a public key when none is configured.
#[must_use]
pub fn derive_node_id(pubkey: &str) -> String {
    Uuid::new_v3(&Uuid::NAMESPACE_DNS, pubkey.as_bytes()).to_string()
}

/// Derives the deterministic lease id for a node.
///
/// The same node always claims the same lease, so a re-registration after
/// a crash supplants the stale lease instead of racing its expiry.
#[must_use]
pub fn derive_lease_id(node_id: &str) -> i64 {
    let id = Uuid::new_v3(&Uuid::NAMESPACE_DNS, node_id.as_bytes());
    (id.as_u128() % (i64::MAX as u128)) as i64
}

/// Connection parameters for the directory.
#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    /// `host:port` of the etcd endpoint.
    pub endpoint: String,
    /// Key prefix the mesh lives under.
    pub prefix: String,
    /// Optional authentication user.
    pub username: Option<String>,
    /// Optional authentication password.
    pub password: Option<String>,
}

/// Factory for directory connections.
///
/// The workers open a fresh connection per cycle; a failed connection is
/// simply dropped and retried.
#[derive(Clone, Debug)]
pub struct Directory {
    config: DirectoryConfig,
}

impl Directory {
    /// Creates a directory handle from connection parameters.
    #[must_use]
    pub fn new(config: DirectoryConfig) -> Self {
        Self { config }
    }

    /// The key prefix the mesh lives under.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Opens a client connection.
    pub async fn connect(&self) -> Result<DirectoryClient> {
        let mut options = ConnectOptions::new();
        if let (Some(user), Some(password)) = (&self.config.username, &self.config.password) {
            options = options.with_user(user, password);
        }
        debug!(endpoint = %self.config.endpoint, "connecting to directory");
        let client = Client::connect([self.config.endpoint.as_str()], Some(options)).await?;
        Ok(DirectoryClient {
            client,
            prefix: self.config.prefix.clone(),
        })
    }
}

/// One observed directory change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEvent {
    /// Put or delete.
    pub event_type: EventType,
    /// Full key, `<prefix>/<node_id>/<field>`.
    pub key: String,
    /// Value for puts; empty for deletes.
    pub value: String,
}

/// Flattens a watch response into owned events, dropping any the server
/// sent without a key/value payload.
#[must_use]
pub fn events_of(response: &WatchResponse) -> Vec<DirEvent> {
    response
        .events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            Some(DirEvent {
                event_type: event.event_type(),
                key: kv.key_str().ok()?.to_string(),
                value: kv.value_str().ok().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// A live connection to the directory.
pub struct DirectoryClient {
    client: Client,
    prefix: String,
}

impl DirectoryClient {
    /// Bounded snapshot of every key under the mesh prefix.
    pub async fn get_prefix(&mut self) -> Result<Vec<(String, String)>> {
        let response = self
            .client
            .get(self.prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await?;
        let mut kvs = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            kvs.push((kv.key_str()?.to_string(), kv.value_str()?.to_string()));
        }
        Ok(kvs)
    }

    /// Starts a watch over `<prefix>/`; the returned [`Watcher`] cancels
    /// the blocking stream read.
    pub async fn watch_prefix(&mut self) -> Result<(Watcher, WatchStream)> {
        let watched = format!("{}/", self.prefix);
        let (watcher, stream) = self
            .client
            .watch(watched.as_str(), Some(WatchOptions::new().with_prefix()))
            .await?;
        Ok((watcher, stream))
    }

    /// Claims the deterministic lease for this node.
    ///
    /// If a previous incarnation's lease with the same id is still alive,
    /// it is revoked and the id granted fresh, supplanting the stale
    /// registration.
    pub async fn lease_allocate(&mut self, ttl: i64, lease_id: i64) -> Result<i64> {
        match self
            .client
            .lease_grant(ttl, Some(LeaseGrantOptions::new().with_id(lease_id)))
            .await
        {
            Ok(response) => {
                let hex = format!("{:#x}", response.id());
                info!(lease_id = %hex, "allocated lease");
                Ok(response.id())
            }
            Err(_) => {
                // A stale incarnation still holds the id: take it over.
                self.client.lease_revoke(lease_id).await?;
                let response = self
                    .client
                    .lease_grant(ttl, Some(LeaseGrantOptions::new().with_id(lease_id)))
                    .await?;
                let hex = format!("{:#x}", response.id());
                info!(lease_id = %hex, "supplanted stale lease");
                Ok(response.id())
            }
        }
    }

    /// Refreshes a lease, surfacing server-side expiry as
    /// [`DirectoryError::LeaseExpired`].
    pub async fn lease_refresh(&mut self, lease_id: i64) -> Result<()> {
        let (mut keeper, mut stream) = self.client.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(response) if response.ttl() > 0 => Ok(()),
            _ => Err(DirectoryError::LeaseExpired { lease_id }),
        }
    }

    /// Writes one key, optionally bound to a lease.
    pub async fn put(&mut self, key: &str, value: &str, lease_id: Option<i64>) -> Result<()> {
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        self.client.put(key, value, options).await?;
        Ok(())
    }

    /// Deletes one key.
    pub async fn delete(&mut self, key: &str) -> Result<()> {
        self.client.delete(key, None).await?;
        Ok(())
    }

    /// Deletes every key under a prefix, returning how many went away.
    pub async fn delete_prefix(&mut self, prefix: &str) -> Result<i64> {
        let response = self
            .client
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(response.deleted())
    }
}
