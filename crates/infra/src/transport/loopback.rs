//! Scriptable in-process transport for tests/dev.
//!
//! Peers, posts and failures are configured up front; every send and
//! profile update is recorded for inspection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fleet_core::{Worker, WorkerId};

use super::{ChatClient, ChatTransport, PostRecord, ProfileSnapshot, TransportError};

/// One recorded send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub worker: WorkerId,
    pub peer: String,
    pub text: String,
    pub reply_to: Option<i64>,
}

#[derive(Debug, Default)]
struct Peer {
    profile: ProfileSnapshot,
    /// Newest last.
    posts: Vec<PostRecord>,
}

#[derive(Debug, Default)]
struct Shared {
    peers: HashMap<String, Peer>,
    sent: Vec<SentMessage>,
    profiles: HashMap<WorkerId, ProfileSnapshot>,
    scripted: HashMap<(WorkerId, String), VecDeque<TransportError>>,
    sticky: HashMap<WorkerId, TransportError>,
    refuse_connect: HashSet<WorkerId>,
    links: HashMap<WorkerId, Vec<Arc<AtomicBool>>>,
    next_message_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    shared: Arc<Mutex<Shared>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable peer with posts given oldest first.
    pub fn add_peer(&self, handle: &str, title: &str, about: Option<&str>, post_ids: &[i64]) {
        let mut shared = self.shared.lock().unwrap();
        shared.peers.insert(
            handle.to_string(),
            Peer {
                profile: ProfileSnapshot {
                    title: title.to_string(),
                    about: about.map(str::to_string),
                },
                posts: post_ids
                    .iter()
                    .map(|&id| PostRecord { id, text: None })
                    .collect(),
            },
        );
    }

    /// Fail the next send from `worker` to `peer` with `err`.
    pub fn fail_next_send(&self, worker: WorkerId, peer: &str, err: TransportError) {
        self.shared
            .lock()
            .unwrap()
            .scripted
            .entry((worker, peer.to_string()))
            .or_default()
            .push_back(err);
    }

    /// Fail every send from `worker` with `err` until cleared.
    pub fn fail_all_sends(&self, worker: WorkerId, err: TransportError) {
        self.shared.lock().unwrap().sticky.insert(worker, err);
    }

    pub fn clear_failures(&self, worker: WorkerId) {
        let mut shared = self.shared.lock().unwrap();
        shared.sticky.remove(&worker);
        shared.scripted.retain(|(w, _), _| *w != worker);
    }

    pub fn refuse_connect(&self, worker: WorkerId) {
        self.shared.lock().unwrap().refuse_connect.insert(worker);
    }

    /// Drop every live client of `worker`, as a network loss would.
    pub fn sever(&self, worker: WorkerId) {
        if let Some(links) = self.shared.lock().unwrap().links.get(&worker) {
            for link in links {
                link.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.shared.lock().unwrap().sent.clone()
    }

    pub fn sent_by(&self, worker: WorkerId) -> Vec<SentMessage> {
        self.sent().into_iter().filter(|m| m.worker == worker).collect()
    }

    pub fn profile_of(&self, worker: WorkerId) -> Option<ProfileSnapshot> {
        self.shared.lock().unwrap().profiles.get(&worker).cloned()
    }

    pub fn connections(&self, worker: WorkerId) -> usize {
        self.shared
            .lock()
            .unwrap()
            .links
            .get(&worker)
            .map_or(0, Vec::len)
    }
}

#[async_trait::async_trait]
impl ChatTransport for LoopbackTransport {
    async fn connect(&self, worker: &Worker, session: &[u8]) -> Result<Arc<dyn ChatClient>, TransportError> {
        let mut shared = self.shared.lock().unwrap();
        if session.is_empty() {
            return Err(TransportError::Other("empty session".into()));
        }
        if shared.refuse_connect.contains(&worker.id) {
            return Err(TransportError::AccessDenied("session rejected".into()));
        }
        let link = Arc::new(AtomicBool::new(true));
        shared.links.entry(worker.id).or_default().push(link.clone());
        Ok(Arc::new(LoopbackClient {
            worker: worker.id,
            shared: self.shared.clone(),
            connected: link,
        }))
    }
}

#[derive(Debug)]
pub struct LoopbackClient {
    worker: WorkerId,
    shared: Arc<Mutex<Shared>>,
    connected: Arc<AtomicBool>,
}

impl LoopbackClient {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

#[async_trait::async_trait]
impl ChatClient for LoopbackClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_message(
        &self,
        peer: &str,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, TransportError> {
        self.ensure_connected()?;
        let mut shared = self.shared.lock().unwrap();
        if let Some(err) = shared.sticky.get(&self.worker) {
            return Err(err.clone());
        }
        if let Some(err) = shared
            .scripted
            .get_mut(&(self.worker, peer.to_string()))
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if !shared.peers.contains_key(peer) {
            return Err(TransportError::AccessDenied(format!("unknown peer {peer}")));
        }
        shared.next_message_id += 1;
        let id = shared.next_message_id;
        shared.sent.push(SentMessage {
            worker: self.worker,
            peer: peer.to_string(),
            text: text.to_string(),
            reply_to,
        });
        Ok(id)
    }

    async fn fetch_recent(&self, peer: &str, limit: usize) -> Result<Vec<PostRecord>, TransportError> {
        self.ensure_connected()?;
        let shared = self.shared.lock().unwrap();
        let p = shared
            .peers
            .get(peer)
            .ok_or_else(|| TransportError::AccessDenied(format!("unknown peer {peer}")))?;
        Ok(p.posts.iter().rev().take(limit).cloned().collect())
    }

    async fn fetch_profile(&self, peer: &str) -> Result<ProfileSnapshot, TransportError> {
        self.ensure_connected()?;
        let shared = self.shared.lock().unwrap();
        shared
            .peers
            .get(peer)
            .map(|p| p.profile.clone())
            .ok_or_else(|| TransportError::AccessDenied(format!("unknown peer {peer}")))
    }

    async fn update_profile(&self, profile: &ProfileSnapshot) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.shared
            .lock()
            .unwrap()
            .profiles
            .insert(self.worker, profile.clone());
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut shared = self.shared.lock().unwrap();
        if let Some(links) = shared.links.get_mut(&self.worker) {
            links.retain(|l| !Arc::ptr_eq(l, &self.connected));
        }
    }
}
