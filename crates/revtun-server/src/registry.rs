//! Pool of live tunnel connections with round-robin selection

use rand::Rng;
use revtun_transport::TransportConnection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no connections available")]
    NoConnectionsAvailable,
}

/// Registry of tunnel connections currently usable by the server
///
/// Connections are evicted automatically when they terminate: [`add`]
/// spawns a watcher that waits on the connection's liveness signal and then
/// removes it. Selection only takes the shared lock; the rotation cursor is
/// atomic so concurrent [`next`] calls never serialize on each other.
///
/// Cloning yields another handle to the same registry.
///
/// [`add`]: ConnectionRegistry::add
/// [`next`]: ConnectionRegistry::next
#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    inner: Arc<Inner<C>>,
}

#[derive(Debug)]
struct Inner<C> {
    connections: RwLock<Vec<Arc<C>>>,
    // Always < connections.len(), or 0 when empty. Only reset under the write lock.
    cursor: AtomicUsize,
}

impl<C> Clone for ConnectionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: TransportConnection> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: TransportConnection> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: RwLock::new(Vec::new()),
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// Register a live connection and start watching it for termination
    ///
    /// Must be called from within a tokio runtime.
    pub fn add(&self, connection: C) -> Arc<C> {
        let connection = Arc::new(connection);

        let total = {
            let mut connections = self
                .inner
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            connections.push(connection.clone());
            connections.len()
        };

        info!(
            connection_id = %connection.connection_id(),
            remote = %connection.remote_address(),
            total,
            "Registered tunnel connection"
        );

        let registry = self.clone();
        let watched = connection.clone();
        tokio::spawn(async move {
            watched.closed().await;
            registry.remove(&watched);
        });

        connection
    }

    /// Remove a connection by identity
    ///
    /// The last element takes its slot, so order is not preserved. The cursor
    /// is reseeded to a random valid index, or 0 when the registry is empty.
    /// Returns `false` if the connection was not registered.
    pub fn remove(&self, connection: &C) -> bool {
        let id = connection.connection_id();
        let mut connections = self
            .inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(index) = connections.iter().position(|c| c.connection_id() == id) else {
            debug!(connection_id = %id, "Connection not registered, nothing to remove");
            return false;
        };

        connections.swap_remove(index);

        let cursor = if connections.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..connections.len())
        };
        self.inner.cursor.store(cursor, Ordering::Release);

        info!(
            connection_id = %id,
            remaining = connections.len(),
            "Removed tunnel connection"
        );
        true
    }

    /// Select the connection at the cursor and advance the cursor by one
    pub fn next(&self) -> Result<Arc<C>, RegistryError> {
        let connections = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let len = connections.len();
        if len == 0 {
            return Err(RegistryError::NoConnectionsAvailable);
        }

        let previous = self
            .inner
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                Some((cursor + 1) % len)
            })
            .unwrap_or_else(|cursor| cursor);

        Ok(connections[previous % len].clone())
    }

    pub fn len(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revtun_transport::memory::{self, MemoryConnection};
    use std::collections::HashSet;
    use std::time::Duration;

    fn connections(n: usize) -> Vec<(MemoryConnection, MemoryConnection)> {
        (0..n).map(|_| memory::pair()).collect()
    }

    async fn wait_for_len<C: TransportConnection>(registry: &ConnectionRegistry<C>, len: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.len() != len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry never reached expected size");
    }

    #[tokio::test]
    async fn test_empty_registry_has_no_connections() {
        let registry = ConnectionRegistry::<MemoryConnection>::new();

        assert!(registry.is_empty());
        assert_eq!(
            registry.next().unwrap_err(),
            RegistryError::NoConnectionsAvailable
        );
        assert_eq!(
            registry.next().unwrap_err().to_string(),
            "no connections available"
        );
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_once() {
        let registry = ConnectionRegistry::new();
        let pairs = connections(3);
        let ids: Vec<String> = pairs.iter().map(|(_, s)| s.connection_id()).collect();
        for (_, server) in &pairs {
            registry.add(server.clone());
        }

        let picked: Vec<String> = (0..3)
            .map(|_| registry.next().unwrap().connection_id())
            .collect();
        assert_eq!(picked, ids);

        // Wraps around
        assert_eq!(registry.next().unwrap().connection_id(), ids[0]);
    }

    #[tokio::test]
    async fn test_remove_non_current_keeps_others() {
        let registry = ConnectionRegistry::new();
        let pairs = connections(3);
        for (_, server) in &pairs {
            registry.add(server.clone());
        }

        assert!(registry.remove(&pairs[1].1));
        assert_eq!(registry.len(), 2);

        let seen: HashSet<String> = (0..2)
            .map(|_| registry.next().unwrap().connection_id())
            .collect();
        let expected: HashSet<String> = [&pairs[0].1, &pairs[2].1]
            .iter()
            .map(|c| c.connection_id())
            .collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_remove_only_connection_empties_registry() {
        let registry = ConnectionRegistry::new();
        let (_client, server) = memory::pair();
        registry.add(server.clone());

        assert!(registry.remove(&server));
        assert!(registry.is_empty());
        assert!(registry.next().is_err());
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        let (_client, registered) = memory::pair();
        let (_other_client, stranger) = memory::pair();
        registry.add(registered);

        assert!(!registry.remove(&stranger));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_connection_is_evicted() {
        let registry = ConnectionRegistry::new();
        let (client, server) = memory::pair();
        let (_client2, server2) = memory::pair();
        registry.add(server);
        registry.add(server2.clone());

        client.close(100, "die").await;
        wait_for_len(&registry, 1).await;

        for _ in 0..3 {
            assert_eq!(
                registry.next().unwrap().connection_id(),
                server2.connection_id()
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_selection() {
        let registry = ConnectionRegistry::new();
        let pairs = connections(4);
        for (_, server) in &pairs {
            registry.add(server.clone());
        }

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        assert!(registry.next().is_ok());
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        // 800 selections over 4 connections lands back on the first
        assert_eq!(
            registry.next().unwrap().connection_id(),
            pairs[0].1.connection_id()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_selection_during_add_remove_and_eviction() {
        let registry = ConnectionRegistry::new();

        let stable = connections(2);
        let churn = connections(6);
        let doomed = connections(3);

        let known: HashSet<String> = stable
            .iter()
            .chain(&churn)
            .chain(&doomed)
            .map(|(_, s)| s.connection_id())
            .collect();
        let known = Arc::new(known);

        for (_, server) in stable.iter().chain(&doomed) {
            registry.add(server.clone());
        }

        let selectors: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let known = known.clone();
                tokio::spawn(async move {
                    for i in 0..500 {
                        let picked = registry
                            .next()
                            .expect("stable connections are always present");
                        assert!(known.contains(&picked.connection_id()));
                        if i % 16 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();

        let churners: Vec<_> = churn
            .chunks(3)
            .map(|chunk| {
                let registry = registry.clone();
                let servers: Vec<MemoryConnection> =
                    chunk.iter().map(|(_, s)| s.clone()).collect();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        for server in &servers {
                            registry.add(server.clone());
                        }
                        tokio::task::yield_now().await;
                        for server in &servers {
                            assert!(registry.remove(server));
                        }
                    }
                })
            })
            .collect();

        for (client, _) in &doomed {
            client.close(100, "die").await;
            tokio::task::yield_now().await;
        }

        for task in selectors.into_iter().chain(churners) {
            task.await.unwrap();
        }

        wait_for_len(&registry, stable.len()).await;
        let stable_ids: HashSet<String> = stable.iter().map(|(_, s)| s.connection_id()).collect();
        for _ in 0..10 {
            assert!(stable_ids.contains(&registry.next().unwrap().connection_id()));
        }
    }
}
