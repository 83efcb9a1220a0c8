//! Manager channel table and the multiplexer that shares it between client sessions.
//!
//! Each manager has one request channel (gateway -> hub) and one response channel
//! (hub -> gateway), fixed at startup. Sessions lease a slot from a bounded pool, get a
//! fresh client id, and send routing-tagged requests on their manager's channel. One
//! dispatcher task per manager untags responses and hands them to the owning session.

use crate::routing::{self, RoutingError};
use crate::session::{error_body, TransportKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("manager index {index} out of range (table has {len})")]
    UnknownManager { index: usize, len: usize },
    #[error("{kind} session pool exhausted ({capacity} sessions)")]
    PoolExhausted { kind: TransportKind, capacity: usize },
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("manager {0} request channel closed")]
    ManagerClosed(usize),
    #[error("response channel for client {0} closed")]
    ResponseClosed(u64),
}

/// Hub side of one manager: tagged requests arrive on `requests`, tagged responses go out on `responses`.
pub struct ManagerEndpoint {
    pub id: usize,
    pub requests: mpsc::Receiver<String>,
    pub responses: mpsc::Sender<String>,
}

struct ManagerLink {
    requests: mpsc::Sender<String>,
    responses: mpsc::Receiver<String>,
}

/// Gateway side of the manager channels, indexed by manager id.
pub struct ManagerTable {
    links: Vec<ManagerLink>,
    buffer: usize,
}

impl ManagerTable {
    /// Create `count` managers with channels of depth `buffer`; returns the hub-side endpoints alongside.
    pub fn new(count: usize, buffer: usize) -> (Self, Vec<ManagerEndpoint>) {
        let buffer = buffer.max(1);
        let mut links = Vec::with_capacity(count);
        let mut endpoints = Vec::with_capacity(count);
        for id in 0..count {
            let (req_tx, req_rx) = mpsc::channel(buffer);
            let (res_tx, res_rx) = mpsc::channel(buffer);
            links.push(ManagerLink {
                requests: req_tx,
                responses: res_rx,
            });
            endpoints.push(ManagerEndpoint {
                id,
                requests: req_rx,
                responses: res_tx,
            });
        }
        (Self { links, buffer }, endpoints)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

type ClientRegistry = Arc<RwLock<HashMap<u64, mpsc::Sender<String>>>>;

/// Shares the manager channels between sessions and routes responses back by client id.
pub struct Multiplexer {
    managers: Vec<mpsc::Sender<String>>,
    clients: ClientRegistry,
    next_client_id: AtomicU64,
    buffer: usize,
    dispatchers: Vec<JoinHandle<()>>,
}

impl Multiplexer {
    /// Take over the manager table and start one response dispatcher per manager.
    pub fn new(table: ManagerTable) -> Arc<Self> {
        let clients: ClientRegistry = Arc::new(RwLock::new(HashMap::new()));
        let mut managers = Vec::with_capacity(table.links.len());
        let mut dispatchers = Vec::with_capacity(table.links.len());
        for (id, link) in table.links.into_iter().enumerate() {
            managers.push(link.requests);
            dispatchers.push(tokio::spawn(dispatch_responses(id, link.responses, clients.clone())));
        }
        Arc::new(Self {
            managers,
            clients,
            next_client_id: AtomicU64::new(0),
            buffer: table.buffer,
            dispatchers,
        })
    }

    pub fn manager_count(&self) -> usize {
        self.managers.len()
    }

    /// Sessions currently registered for responses.
    pub fn active_sessions(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Fixed-size session pool routed to `manager_id`. Fails when the manager does not exist.
    pub fn pool(
        self: &Arc<Self>,
        kind: TransportKind,
        manager_id: usize,
        capacity: usize,
    ) -> Result<SessionPool, HubError> {
        if manager_id >= self.managers.len() {
            return Err(HubError::UnknownManager {
                index: manager_id,
                len: self.managers.len(),
            });
        }
        Ok(SessionPool {
            kind,
            manager_id,
            mux: self.clone(),
            slots: Arc::new(Mutex::new(vec![None; capacity])),
        })
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        for d in &self.dispatchers {
            d.abort();
        }
    }
}

/// Hand `message` to the session registered under `client_id`.
fn deliver(clients: &ClientRegistry, client_id: u64, message: String) {
    let tx = clients
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&client_id)
        .cloned();
    let Some(tx) = tx else {
        log::debug!("no session for client {}; response dropped", client_id);
        return;
    };
    // A session that stopped reading must not stall the shared channel.
    match tx.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            log::warn!("client {} response queue full; response dropped", client_id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::debug!("client {} closed before its response arrived", client_id);
        }
    }
}

async fn dispatch_responses(
    manager_id: usize,
    mut responses: mpsc::Receiver<String>,
    clients: ClientRegistry,
) {
    while let Some(response) = responses.recv().await {
        let (cleaned, tag) = match routing::untag_response(&response) {
            Ok(v) => v,
            Err(e) => {
                match e.client_id() {
                    Some(client_id) => {
                        log::error!("manager {}: client {}: {}", manager_id, client_id, e);
                        deliver(&clients, client_id, error_body("400", "Bad request", &e.to_string()));
                    }
                    None => log::error!("manager {}: dropping response: {}", manager_id, e),
                }
                continue;
            }
        };
        if tag.manager_id != manager_id {
            log::warn!(
                "manager {}: response tagged for manager {} (client {})",
                manager_id,
                tag.manager_id,
                tag.client_id
            );
        }
        deliver(&clients, tag.client_id, cleaned);
    }
    log::info!("manager {} response channel closed", manager_id);
}

/// Bounded arena of session slots for one transport. Allocation is serialized by a mutex.
pub struct SessionPool {
    kind: TransportKind,
    manager_id: usize,
    mux: Arc<Multiplexer>,
    slots: Arc<Mutex<Vec<Option<u64>>>>,
}

impl SessionPool {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn manager_id(&self) -> usize {
        self.manager_id
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn in_use(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Lease the first free slot and register a new client id for responses.
    pub fn open_session(&self) -> Result<SessionLink, HubError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = slots.iter().position(|s| s.is_none()) else {
            return Err(HubError::PoolExhausted {
                kind: self.kind,
                capacity: slots.len(),
            });
        };
        let client_id = self.mux.next_client_id.fetch_add(1, Ordering::Relaxed);
        slots[slot] = Some(client_id);
        drop(slots);

        let (tx, rx) = mpsc::channel(self.mux.buffer);
        self.mux
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id, tx);
        log::debug!("{} session {} opened in slot {}", self.kind, client_id, slot);
        Ok(SessionLink {
            client_id,
            manager_id: self.manager_id,
            kind: self.kind,
            slot,
            to_manager: self.mux.managers[self.manager_id].clone(),
            responses: rx,
            slots: self.slots.clone(),
            clients: self.mux.clients.clone(),
        })
    }
}

/// A session's channel pair to its manager. Dropping it frees the slot.
pub struct SessionLink {
    client_id: u64,
    manager_id: usize,
    kind: TransportKind,
    slot: usize,
    to_manager: mpsc::Sender<String>,
    responses: mpsc::Receiver<String>,
    slots: Arc<Mutex<Vec<Option<u64>>>>,
    clients: ClientRegistry,
}

impl SessionLink {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn manager_id(&self) -> usize {
        self.manager_id
    }

    /// Tag and forward one request, then wait for its response. One request in flight per session.
    pub async fn round_trip(&mut self, request: &str) -> Result<String, HubError> {
        let tagged = routing::tag_request(
            request,
            routing::RoutingTag {
                manager_id: self.manager_id,
                client_id: self.client_id,
            },
        )?;
        // Anything still queued answers an earlier request (a duplicate from the hub).
        while let Ok(stale) = self.responses.try_recv() {
            log::warn!("client {} discarding unexpected response: {}", self.client_id, stale);
        }
        self.to_manager
            .send(tagged)
            .await
            .map_err(|_| HubError::ManagerClosed(self.manager_id))?;
        self.responses
            .recv()
            .await
            .ok_or(HubError::ResponseClosed(self.client_id))
    }
}

impl Drop for SessionLink {
    fn drop(&mut self) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.client_id);
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(self.slot).copied().flatten() == Some(self.client_id) {
            slots[self.slot] = None;
        }
        log::debug!("{} session {} closed", self.kind, self.client_id);
    }
}

/// Development hub: answers every request with the request envelope itself (routing tag included).
pub fn spawn_echo_hub(mut endpoint: ManagerEndpoint) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = endpoint.requests.recv().await {
            if endpoint.responses.send(request).await.is_err() {
                break;
            }
        }
        log::debug!("echo hub for manager {} stopped", endpoint.id);
    })
}
