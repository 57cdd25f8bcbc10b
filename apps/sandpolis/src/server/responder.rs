use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use state_tree::codec as record_codec;
use state_tree::{Oid, StateTree, SubscriptionError, UpdateRecord};
use tokio::task::JoinHandle;

use crate::auth::CredentialTable;
use crate::metrics;
use crate::protocol::{
    LoginRequest, Message, Outcome, Payload, SnapshotResponse, StreamData, StreamKind,
    StreamStart, StreamStop, UNCORRELATED,
};
use crate::session::{RequestHandler, Session};

type StreamKey = (i32, i32);

/// Serves one shared [`StateTree`] to every session of a server.
///
/// With an empty credential table every request is allowed and login is
/// refused. Otherwise a session must log in before it may read, write or
/// subscribe.
pub struct TreeResponder {
    tree: Arc<StateTree>,
    credentials: CredentialTable,
    authenticated: Mutex<HashSet<i32>>,
    forwarders: Mutex<HashMap<StreamKey, JoinHandle<()>>>,
}

impl TreeResponder {
    pub fn new(tree: Arc<StateTree>, credentials: CredentialTable) -> Self {
        Self {
            tree,
            credentials,
            authenticated: Mutex::new(HashSet::new()),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    pub fn tree(&self) -> &Arc<StateTree> {
        &self.tree
    }

    /// Number of state sync streams currently forwarding.
    pub fn active_streams(&self) -> usize {
        self.forwarders.lock().len()
    }

    fn authorized(&self, peer: i32) -> bool {
        self.credentials.is_empty() || self.authenticated.lock().contains(&peer)
    }

    fn login(&self, peer: i32, login: &LoginRequest) -> Outcome {
        if self.credentials.is_empty() {
            return Outcome::failure("no accounts are configured");
        }
        if self.credentials.verify(&login.username, &login.password_digest) {
            self.authenticated.lock().insert(peer);
            tracing::info!(
                target = "sandpolis::server",
                peer_cvid = peer,
                username = %login.username,
                "login accepted"
            );
            Outcome::success()
        } else {
            tracing::warn!(
                target = "sandpolis::server",
                peer_cvid = peer,
                username = %login.username,
                "login rejected"
            );
            Outcome::failure("invalid username or password")
        }
    }

    fn snapshot(&self, oid: &Oid) -> Payload {
        match self.tree.snapshot(oid) {
            Ok(record) => Payload::SnapshotResponse(SnapshotResponse { record }),
            Err(err) => Payload::Outcome(Outcome::failure(err.to_string())),
        }
    }

    fn update(&self, record: &UpdateRecord) -> Outcome {
        match self.tree.merge(record) {
            Ok(applied) => {
                tracing::debug!(
                    target = "sandpolis::server",
                    entries = record.len(),
                    applied,
                    "update merged"
                );
                Outcome::success()
            }
            Err(err) => Outcome::failure(err.to_string()),
        }
    }

    fn start_stream(&self, session: &Session, peer: i32, start: &StreamStart) -> Outcome {
        if start.kind != StreamKind::StateSync {
            return Outcome::failure(format!("unsupported stream kind {}", start.kind.label()));
        }
        let Some(oid) = start.oid.clone() else {
            return Outcome::failure("state sync needs an oid");
        };
        let key = (peer, start.stream_id);
        let mut forwarders = self.forwarders.lock();
        if forwarders.contains_key(&key) {
            return Outcome::failure(format!("stream {} is already open", start.stream_id));
        }

        // subscribe before the snapshot so no change falls between them
        let mut changes = self.tree.subscribe_to(&oid);
        let initial = match self.tree.snapshot(&oid) {
            Ok(record) => record,
            Err(err) => return Outcome::failure(err.to_string()),
        };
        let session = session.clone();
        let tree = self.tree.clone();
        let prefix = oid.clone();
        let stream_id = start.stream_id;
        let task = tokio::spawn(async move {
            if !initial.is_empty() && !forward(&session, stream_id, &initial) {
                return;
            }
            loop {
                tokio::select! {
                    _ = session.closed() => break,
                    change = changes.recv() => {
                        let record = match change {
                            Ok(change) => change.to_record(),
                            Err(SubscriptionError::Lagged { skipped }) => {
                                match resync(&tree, &prefix, stream_id, skipped) {
                                    Some(record) => record,
                                    None => break,
                                }
                            }
                            Err(SubscriptionError::Closed) => break,
                        };
                        if !forward(&session, stream_id, &record) {
                            break;
                        }
                    }
                }
            }
        });
        forwarders.insert(key, task);
        tracing::debug!(
            target = "sandpolis::server",
            peer_cvid = peer,
            stream_id,
            oid = %oid,
            "state sync started"
        );
        Outcome::success()
    }

    fn stop_stream(&self, peer: i32, stop: &StreamStop) -> Outcome {
        match self.forwarders.lock().remove(&(peer, stop.stream_id)) {
            Some(task) => {
                task.abort();
                Outcome::success()
            }
            None => Outcome::failure(format!("stream {} is not open", stop.stream_id)),
        }
    }
}

/// Full subtree to replace whatever a lagging forwarder missed.
fn resync(tree: &StateTree, oid: &Oid, stream_id: i32, skipped: u64) -> Option<UpdateRecord> {
    metrics::record_stream_resync();
    match tree.snapshot(oid) {
        Ok(record) => {
            tracing::info!(
                target = "sandpolis::server",
                stream_id,
                skipped,
                entries = record.len(),
                "state sync fell behind; resending snapshot"
            );
            Some(record)
        }
        Err(err) => {
            tracing::warn!(
                target = "sandpolis::server",
                stream_id,
                error = %err,
                "state sync resync failed"
            );
            None
        }
    }
}

fn forward(session: &Session, stream_id: i32, record: &UpdateRecord) -> bool {
    let data = StreamData {
        stream_id,
        data: Bytes::from(record_codec::encode(record)),
    };
    match session.send_event(Payload::StreamData(data)) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(
                target = "sandpolis::server",
                stream_id,
                error = %err,
                "state sync stopped"
            );
            false
        }
    }
}

#[async_trait]
impl RequestHandler for TreeResponder {
    async fn handle(&self, session: &Session, request: &Message) -> Option<Payload> {
        let peer = session.peer_cvid().unwrap_or(UNCORRELATED);
        if let Payload::Login(login) = &request.payload {
            return Some(Payload::Outcome(self.login(peer, login)));
        }
        if !self.authorized(peer) {
            return Some(Payload::Outcome(Outcome::failure("login required")));
        }

        let outcome = match &request.payload {
            Payload::SnapshotRequest(snapshot) => return Some(self.snapshot(&snapshot.oid)),
            Payload::UpdatePush(push) => self.update(&push.record),
            Payload::StreamStart(start) => self.start_stream(session, peer, start),
            Payload::StreamStop(stop) => self.stop_stream(peer, stop),
            Payload::Plugin(plugin) => {
                Outcome::failure(format!("no plugin handles '{}'", plugin.type_tag))
            }
            other => Outcome::failure(format!("{} is not supported", other.name())),
        };
        Some(Payload::Outcome(outcome))
    }

    async fn closed(&self, session: &Session) {
        let Some(peer) = session.peer_cvid() else {
            return;
        };
        self.authenticated.lock().remove(&peer);
        let mut forwarders = self.forwarders.lock();
        let keys: Vec<StreamKey> = forwarders
            .keys()
            .filter(|(owner, _)| *owner == peer)
            .copied()
            .collect();
        for key in keys {
            if let Some(task) = forwarders.remove(&key) {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password_digest;

    #[test_timeout::timeout]
    fn login_checks_the_credential_table() {
        let responder = TreeResponder::new(
            Arc::new(StateTree::new("")),
            CredentialTable::new().with_user("admin", "hunter2"),
        );
        let good = LoginRequest {
            username: "admin".into(),
            password_digest: password_digest("hunter2"),
        };
        let bad = LoginRequest {
            username: "admin".into(),
            password_digest: password_digest("wrong"),
        };
        assert!(!responder.authorized(2));
        assert!(!responder.login(2, &bad).ok);
        assert!(responder.login(2, &good).ok);
        assert!(responder.authorized(2));
        assert!(!responder.authorized(3));
    }

    #[test_timeout::timeout]
    fn empty_table_allows_everything_but_login() {
        let responder = TreeResponder::new(Arc::new(StateTree::new("")), CredentialTable::new());
        assert!(responder.authorized(5));
        let login = LoginRequest {
            username: "anyone".into(),
            password_digest: password_digest(""),
        };
        assert!(!responder.login(5, &login).ok);
    }

    #[test_timeout::timeout]
    fn snapshot_outside_the_namespace_is_refused() {
        let responder = TreeResponder::new(Arc::new(StateTree::new("")), CredentialTable::new());
        let payload = responder.snapshot(&Oid::parse("other:/profile").unwrap());
        assert!(matches!(payload, Payload::Outcome(Outcome { ok: false, .. })));
    }
}
