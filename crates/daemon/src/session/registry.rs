//! Registry of tabs per client connection.
//!
//! Maps `connection → tab → slot`. A slot is either a reservation for a
//! session that is still opening, or the live session itself. Each slot
//! carries the [`SessionKey`] of its session so events from a session that
//! no longer owns the slot can be recognised and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures_util::future::join_all;
use thiserror::Error;

use super::lifecycle::{ConnectionId, Session, SessionKey, TabId};

/// Default limit on tabs per connection.
pub const DEFAULT_MAX_TABS: usize = 10;

/// Errors returned by registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection is not (or no longer) registered.
    #[error("Connection not registered: {0}")]
    UnknownConnection(ConnectionId),

    /// The tab already has a session or a pending open.
    #[error("Tab already active: {0}")]
    TabActive(TabId),

    /// The connection reached its tab limit.
    #[error("Too many tabs open (limit {0})")]
    TooManyTabs(usize),

    /// The tab is not reserved for the session being promoted.
    #[error("Tab not reserved: {0}")]
    NotReserved(TabId),
}

/// What a tab currently holds.
#[derive(Debug, Clone)]
pub enum TabSlot {
    /// A session with this key is being opened.
    Opening { key: SessionKey },
    /// A live session.
    Live(Session),
}

impl TabSlot {
    /// Key of the session owning the slot.
    pub fn key(&self) -> SessionKey {
        match self {
            TabSlot::Opening { key } => *key,
            TabSlot::Live(session) => session.key(),
        }
    }

    /// Returns the live session, if any.
    pub fn session(&self) -> Option<&Session> {
        match self {
            TabSlot::Opening { .. } => None,
            TabSlot::Live(session) => Some(session),
        }
    }
}

/// Concurrent `connection → tab → slot` map.
///
/// No lock is held across an await; sessions are cloned out before any
/// asynchronous work.
pub struct ClientRegistry {
    connections: DashMap<ConnectionId, HashMap<TabId, TabSlot>>,
    next_key: AtomicU64,
    max_tabs: usize,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TABS)
    }
}

impl ClientRegistry {
    /// Creates an empty registry allowing `max_tabs` tabs per connection.
    pub fn new(max_tabs: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_key: AtomicU64::new(1),
            max_tabs,
        }
    }

    /// Returns a key no other session has or will have.
    pub fn allocate_key(&self) -> SessionKey {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a connection with no tabs. Registering twice is a no-op.
    pub fn register(&self, connection_id: &str) {
        self.connections
            .entry(connection_id.to_string())
            .or_default();
        tracing::debug!(connection_id, "Registered connection");
    }

    /// Removes a connection and closes all its live sessions, suppressing
    /// their notifications.
    ///
    /// Sessions are closed concurrently; a failure releasing one does not
    /// stop the others. Pending opens are simply forgotten. Returns the
    /// number of sessions closed.
    pub async fn unregister_all(&self, connection_id: &str) -> usize {
        let Some((_, tabs)) = self.connections.remove(connection_id) else {
            return 0;
        };

        let sessions: Vec<Session> = tabs
            .into_values()
            .filter_map(|slot| match slot {
                TabSlot::Live(session) => Some(session),
                TabSlot::Opening { .. } => None,
            })
            .collect();

        let count = sessions.len();
        join_all(sessions.iter().map(|session| session.close(true))).await;

        tracing::info!(connection_id, sessions = count, "Unregistered connection");
        count
    }

    /// Reserves `tab_id` for a session that is about to open.
    pub fn reserve(
        &self,
        connection_id: &str,
        tab_id: &str,
        key: SessionKey,
    ) -> Result<(), RegistryError> {
        let mut tabs = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.to_string()))?;

        if tabs.contains_key(tab_id) {
            return Err(RegistryError::TabActive(tab_id.to_string()));
        }
        if tabs.len() >= self.max_tabs {
            return Err(RegistryError::TooManyTabs(self.max_tabs));
        }

        tabs.insert(tab_id.to_string(), TabSlot::Opening { key });
        Ok(())
    }

    /// Installs a live session.
    ///
    /// Succeeds when the tab is free or reserved for this very session;
    /// anything else is rejected and the registry is left unchanged.
    pub fn put(
        &self,
        connection_id: &str,
        tab_id: &str,
        session: Session,
    ) -> Result<(), RegistryError> {
        let mut tabs = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.to_string()))?;

        match tabs.get(tab_id) {
            Some(TabSlot::Opening { key }) if *key == session.key() => {}
            Some(_) => return Err(RegistryError::TabActive(tab_id.to_string())),
            None if tabs.len() >= self.max_tabs => {
                return Err(RegistryError::TooManyTabs(self.max_tabs))
            }
            None => {}
        }

        tabs.insert(tab_id.to_string(), TabSlot::Live(session));
        Ok(())
    }

    /// Turns the reservation held by `session` into a live slot.
    ///
    /// Fails if the tab was released or reserved again in the meantime.
    pub fn promote(&self, connection_id: &str, session: Session) -> Result<(), RegistryError> {
        let mut tabs = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.to_string()))?;

        match tabs.get_mut(session.tab_id()) {
            Some(slot)
                if matches!(slot, TabSlot::Opening { .. }) && slot.key() == session.key() =>
            {
                *slot = TabSlot::Live(session);
                Ok(())
            }
            _ => Err(RegistryError::NotReserved(session.tab_id().to_string())),
        }
    }

    /// Removes a tab's slot. Removing an absent tab is a no-op.
    pub fn remove(&self, connection_id: &str, tab_id: &str) -> Option<TabSlot> {
        self.connections
            .get_mut(connection_id)
            .and_then(|mut tabs| tabs.remove(tab_id))
    }

    /// Removes a tab's slot only if it still belongs to the session `key`.
    pub fn remove_if(&self, connection_id: &str, tab_id: &str, key: SessionKey) -> Option<TabSlot> {
        let mut tabs = self.connections.get_mut(connection_id)?;
        if tabs.get(tab_id).map(TabSlot::key) == Some(key) {
            tabs.remove(tab_id)
        } else {
            None
        }
    }

    /// Returns the live session for a tab.
    pub fn get(&self, connection_id: &str, tab_id: &str) -> Option<Session> {
        self.connections
            .get(connection_id)
            .and_then(|tabs| tabs.get(tab_id).and_then(TabSlot::session).cloned())
    }

    /// Returns whether session `key` currently owns the tab (opening or live).
    pub fn is_current(&self, connection_id: &str, tab_id: &str, key: SessionKey) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|tabs| tabs.get(tab_id).map(TabSlot::key) == Some(key))
    }

    /// Returns whether the connection is registered.
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Number of occupied tabs on a connection.
    pub fn tab_count(&self, connection_id: &str) -> usize {
        self.connections
            .get(connection_id)
            .map(|tabs| tabs.len())
            .unwrap_or(0)
    }

    /// Sorted tab ids of a connection.
    pub fn tab_ids(&self, connection_id: &str) -> Vec<TabId> {
        let mut ids: Vec<TabId> = self
            .connections
            .get(connection_id)
            .map(|tabs| tabs.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live sessions across all connections.
    pub fn session_count(&self) -> usize {
        self.connections
            .iter()
            .map(|entry| {
                entry
                    .value()
                    .values()
                    .filter(|slot| matches!(slot, TabSlot::Live(_)))
                    .count()
            })
            .sum()
    }

    /// Tab limit per connection.
    pub fn max_tabs(&self) -> usize {
        self.max_tabs
    }
}
