//! Registry and router for the bidirectional RPC fabric.
//!
//! One agent and any number of clients attach per sandbox. Client frames are
//! forwarded to the agent after recording `(request id → client)`; the first
//! agent reply with a matching id is routed back and the entry dropped.
//! Frames are never inspected beyond `id` and `type`.
//!
//! Each sandbox has its own critical section. Sessions hold an unbounded
//! sender into the socket's writer task, so no lock is held across a socket
//! send and traffic for different sandboxes never contends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use shared_types::{error_frame, FrameHead, CLOSE_POLICY_VIOLATION};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

pub type FrameSender = mpsc::UnboundedSender<Message>;

const AGENT_WAIT_POLL: Duration = Duration::from_millis(500);

/// Who a client session is, as established at connect time.
#[derive(Debug, Clone)]
pub enum ClientSubject {
    ApiKey { user_id: Uuid, credential_id: Uuid },
    Bearer { user_id: Uuid },
    /// Admitted only when the sandbox carries `allow_unauthenticated`.
    Unauthenticated,
}

struct AgentSession {
    session_id: Uuid,
    tx: FrameSender,
}

struct ClientSession {
    tx: FrameSender,
    #[allow(dead_code)]
    subject: ClientSubject,
}

#[derive(Default)]
struct Peers {
    agent: Option<AgentSession>,
    clients: HashMap<Uuid, ClientSession>,
    /// request id → client session awaiting the reply
    pending: HashMap<String, Uuid>,
}

fn close_message(reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CLOSE_POLICY_VIOLATION,
        reason: reason.to_string().into(),
    }))
}

/// Best-effort id extraction from a frame that failed head validation.
fn raw_frame_id(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
        .unwrap_or_default()
}

pub struct RpcHub {
    peers: DashMap<Uuid, Arc<Mutex<Peers>>>,
}

impl RpcHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: DashMap::new(),
        })
    }

    fn entry(&self, sandbox_id: Uuid) -> Arc<Mutex<Peers>> {
        self.peers
            .entry(sandbox_id)
            .or_default()
            .clone()
    }

    /// Attach an agent. A previous agent for the same sandbox is replaced
    /// and its socket closed with policy-violation — the reattach path after
    /// port-exposure recreation.
    pub async fn register_agent(&self, sandbox_id: Uuid, tx: FrameSender) -> Uuid {
        let session_id = Uuid::new_v4();
        let entry = self.entry(sandbox_id);
        let replaced = {
            let mut peers = entry.lock().await;
            peers.agent.replace(AgentSession { session_id, tx })
        };
        if let Some(old) = replaced {
            debug!(sandbox_id = %sandbox_id, "agent replaced");
            old.tx.send(close_message("replaced by newer agent connection")).ok();
        }
        session_id
    }

    /// Detach an agent, but only if it is still the registered one; a
    /// replaced agent's late disconnect must not evict its successor.
    /// Pending calls stay until their clients disconnect.
    pub async fn unregister_agent(&self, sandbox_id: Uuid, session_id: Uuid) {
        if let Some(entry) = self.peers.get(&sandbox_id).map(|e| e.clone()) {
            let mut peers = entry.lock().await;
            if peers.agent.as_ref().is_some_and(|a| a.session_id == session_id) {
                peers.agent = None;
            }
        }
    }

    pub async fn register_client(
        &self,
        sandbox_id: Uuid,
        subject: ClientSubject,
        tx: FrameSender,
    ) -> Uuid {
        let session_id = Uuid::new_v4();
        let entry = self.entry(sandbox_id);
        let mut peers = entry.lock().await;
        peers.clients.insert(session_id, ClientSession { tx, subject });
        session_id
    }

    /// Detach a client and drop every pending call waiting on it.
    pub async fn unregister_client(&self, sandbox_id: Uuid, session_id: Uuid) {
        if let Some(entry) = self.peers.get(&sandbox_id).map(|e| e.clone()) {
            let mut peers = entry.lock().await;
            peers.clients.remove(&session_id);
            peers.pending.retain(|_, client| *client != session_id);
        }
    }

    /// Route a client frame to the agent, recording the pending call.
    /// Malformed frames and agent-absent sandboxes answer the sender with an
    /// error envelope instead.
    pub async fn client_frame(&self, sandbox_id: Uuid, session_id: Uuid, raw: &str) {
        let entry = self.entry(sandbox_id);

        let Some(head) = FrameHead::parse(raw) else {
            let peers = entry.lock().await;
            if let Some(client) = peers.clients.get(&session_id) {
                let id = raw_frame_id(raw);
                client
                    .tx
                    .send(Message::Text(
                        error_frame(&id, "message must carry id and type").into(),
                    ))
                    .ok();
            }
            return;
        };

        let agent_tx = {
            let mut peers = entry.lock().await;
            match peers.agent.as_ref() {
                Some(agent) => {
                    let tx = agent.tx.clone();
                    peers.pending.insert(head.id.clone(), session_id);
                    tx
                }
                None => {
                    if let Some(client) = peers.clients.get(&session_id) {
                        client
                            .tx
                            .send(Message::Text(
                                error_frame(&head.id, "agent not connected").into(),
                            ))
                            .ok();
                    }
                    return;
                }
            }
        };

        if agent_tx.send(Message::Text(raw.to_string().into())).is_err() {
            // Agent socket died between lookup and send: report back.
            let mut peers = entry.lock().await;
            peers.pending.remove(&head.id);
            if let Some(client) = peers.clients.get(&session_id) {
                client
                    .tx
                    .send(Message::Text(
                        error_frame(&head.id, "agent not connected").into(),
                    ))
                    .ok();
            }
        }
    }

    /// Route an agent frame to the client that sent the matching request.
    /// Unknown or duplicate ids are dropped silently.
    pub async fn agent_frame(&self, sandbox_id: Uuid, raw: &str) {
        let Some(head) = FrameHead::parse(raw) else {
            warn!(sandbox_id = %sandbox_id, "agent frame without id/type dropped");
            return;
        };

        let Some(entry) = self.peers.get(&sandbox_id).map(|e| e.clone()) else {
            return;
        };

        let client_tx = {
            let mut peers = entry.lock().await;
            peers
                .pending
                .remove(&head.id)
                .and_then(|client_id| peers.clients.get(&client_id).map(|c| c.tx.clone()))
        };

        match client_tx {
            Some(tx) => {
                tx.send(Message::Text(raw.to_string().into())).ok();
            }
            None => debug!(sandbox_id = %sandbox_id, id = %head.id, "agent reply without pending call dropped"),
        }
    }

    pub async fn agent_connected(&self, sandbox_id: Uuid) -> bool {
        match self.peers.get(&sandbox_id).map(|e| e.clone()) {
            Some(entry) => entry.lock().await.agent.is_some(),
            None => false,
        }
    }

    /// Poll until an agent attaches or the deadline passes. The outcome is
    /// an observable, not a failure.
    pub async fn wait_for_agent(&self, sandbox_id: Uuid, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.agent_connected(sandbox_id).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            sleep(AGENT_WAIT_POLL).await;
        }
    }

    /// Close every session on every sandbox (graceful shutdown).
    pub async fn shutdown(&self) {
        let sandbox_ids: Vec<Uuid> = self.peers.iter().map(|e| *e.key()).collect();
        for sandbox_id in sandbox_ids {
            self.close_sandbox(sandbox_id).await;
        }
    }

    /// Close every session of a sandbox and clear its state (destroy path).
    pub async fn close_sandbox(&self, sandbox_id: Uuid) {
        if let Some((_, entry)) = self.peers.remove(&sandbox_id) {
            let mut peers = entry.lock().await;
            if let Some(agent) = peers.agent.take() {
                agent.tx.send(close_message("sandbox destroyed")).ok();
            }
            for (_, client) in peers.clients.drain() {
                client.tx.send(close_message("sandbox destroyed")).ok();
            }
            peers.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (FrameSender, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    fn text(msg: &Message) -> &str {
        match msg {
            Message::Text(t) => t.as_str(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_agent_replaces_and_closes_the_first() {
        let hub = RpcHub::new();
        let sandbox = Uuid::new_v4();

        let (tx1, mut rx1) = channel();
        hub.register_agent(sandbox, tx1).await;
        let (tx2, _rx2) = channel();
        hub.register_agent(sandbox, tx2).await;

        match rx1.recv().await.unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_POLICY_VIOLATION),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(hub.agent_connected(sandbox).await);
    }

    #[tokio::test]
    async fn stale_agent_disconnect_does_not_evict_successor() {
        let hub = RpcHub::new();
        let sandbox = Uuid::new_v4();

        let (tx1, _rx1) = channel();
        let first = hub.register_agent(sandbox, tx1).await;
        let (tx2, _rx2) = channel();
        hub.register_agent(sandbox, tx2).await;

        hub.unregister_agent(sandbox, first).await;
        assert!(hub.agent_connected(sandbox).await);
    }

    #[tokio::test]
    async fn frames_route_to_the_originating_client() {
        let hub = RpcHub::new();
        let sandbox = Uuid::new_v4();

        let (agent_tx, mut agent_rx) = channel();
        hub.register_agent(sandbox, agent_tx).await;

        let (a_tx, mut a_rx) = channel();
        let client_a = hub
            .register_client(sandbox, ClientSubject::Unauthenticated, a_tx)
            .await;
        let (b_tx, mut b_rx) = channel();
        let _client_b = hub
            .register_client(sandbox, ClientSubject::Unauthenticated, b_tx)
            .await;

        hub.client_frame(sandbox, client_a, r#"{"id":"1","type":"exec","cmd":"ls"}"#)
            .await;
        assert_eq!(
            text(&agent_rx.recv().await.unwrap()),
            r#"{"id":"1","type":"exec","cmd":"ls"}"#
        );

        hub.agent_frame(sandbox, r#"{"id":"1","type":"execResponse","exitCode":0}"#)
            .await;
        assert_eq!(
            text(&a_rx.recv().await.unwrap()),
            r#"{"id":"1","type":"execResponse","exitCode":0}"#
        );
        assert!(b_rx.try_recv().is_err());

        // The pending call is consumed: a duplicate reply is dropped.
        hub.agent_frame(sandbox, r#"{"id":"1","type":"execResponse","exitCode":0}"#)
            .await;
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_agent_answers_with_error_envelope() {
        let hub = RpcHub::new();
        let sandbox = Uuid::new_v4();

        let (tx, mut rx) = channel();
        let client = hub
            .register_client(sandbox, ClientSubject::Unauthenticated, tx)
            .await;

        hub.client_frame(sandbox, client, r#"{"id":"7","type":"exec"}"#)
            .await;
        let reply: serde_json::Value = serde_json::from_str(text(&rx.recv().await.unwrap())).unwrap();
        assert_eq!(reply["id"], "7");
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn malformed_frames_answer_with_error_envelope() {
        let hub = RpcHub::new();
        let sandbox = Uuid::new_v4();

        let (tx, mut rx) = channel();
        let client = hub
            .register_client(sandbox, ClientSubject::Unauthenticated, tx)
            .await;

        hub.client_frame(sandbox, client, r#"{"id":"3"}"#).await;
        let reply: serde_json::Value = serde_json::from_str(text(&rx.recv().await.unwrap())).unwrap();
        assert_eq!(reply["id"], "3");
        assert_eq!(reply["type"], "error");

        hub.client_frame(sandbox, client, "not json").await;
        let reply: serde_json::Value = serde_json::from_str(text(&rx.recv().await.unwrap())).unwrap();
        assert_eq!(reply["id"], "");
    }

    #[tokio::test]
    async fn client_disconnect_drops_its_pending_calls() {
        let hub = RpcHub::new();
        let sandbox = Uuid::new_v4();

        let (agent_tx, _agent_rx) = channel();
        hub.register_agent(sandbox, agent_tx).await;

        let (tx, _rx) = channel();
        let client = hub
            .register_client(sandbox, ClientSubject::Unauthenticated, tx)
            .await;
        hub.client_frame(sandbox, client, r#"{"id":"9","type":"read"}"#)
            .await;
        hub.unregister_client(sandbox, client).await;

        // The reply has nowhere to go; routing drops it without panicking.
        hub.agent_frame(sandbox, r#"{"id":"9","type":"readResponse"}"#)
            .await;
    }

    #[tokio::test]
    async fn close_sandbox_closes_every_session() {
        let hub = RpcHub::new();
        let sandbox = Uuid::new_v4();

        let (agent_tx, mut agent_rx) = channel();
        hub.register_agent(sandbox, agent_tx).await;
        let (client_tx, mut client_rx) = channel();
        hub.register_client(sandbox, ClientSubject::Unauthenticated, client_tx)
            .await;

        hub.close_sandbox(sandbox).await;

        assert!(matches!(agent_rx.recv().await.unwrap(), Message::Close(_)));
        assert!(matches!(client_rx.recv().await.unwrap(), Message::Close(_)));
        assert!(!hub.agent_connected(sandbox).await);
    }

    #[tokio::test]
    async fn wait_for_agent_times_out_and_succeeds() {
        let hub = RpcHub::new();
        let sandbox = Uuid::new_v4();

        assert!(!hub.wait_for_agent(sandbox, Duration::from_millis(10)).await);

        let hub2 = hub.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            let (tx, _rx) = channel();
            hub2.register_agent(sandbox, tx).await;
        });
        assert!(hub.wait_for_agent(sandbox, Duration::from_secs(5)).await);
    }
}
