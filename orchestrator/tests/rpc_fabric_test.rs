//! End-to-end routing behavior of the RPC hub, driven through the same
//! channel handles the WebSocket tasks use.

use axum::extract::ws::Message;
use orchestrator::rpc::{ClientSubject, RpcHub};
use tokio::sync::mpsc;
use uuid::Uuid;

fn text(message: &Message) -> &str {
    match message {
        Message::Text(t) => t.as_str(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

fn frame(id: &str, kind: &str) -> String {
    serde_json::json!({ "id": id, "type": kind }).to_string()
}

#[tokio::test]
async fn sandboxes_route_independently() {
    let hub = RpcHub::new();
    let sandbox_a = Uuid::new_v4();
    let sandbox_b = Uuid::new_v4();

    let (agent_a_tx, mut agent_a_rx) = mpsc::unbounded_channel();
    hub.register_agent(sandbox_a, agent_a_tx).await;
    let (agent_b_tx, mut agent_b_rx) = mpsc::unbounded_channel();
    hub.register_agent(sandbox_b, agent_b_tx).await;

    let (client_a_tx, mut client_a_rx) = mpsc::unbounded_channel();
    let client_a = hub
        .register_client(sandbox_a, ClientSubject::Unauthenticated, client_a_tx)
        .await;
    let (client_b_tx, mut client_b_rx) = mpsc::unbounded_channel();
    let client_b = hub
        .register_client(sandbox_b, ClientSubject::Unauthenticated, client_b_tx)
        .await;

    // Same request id on both sandboxes: correlation is per sandbox.
    hub.client_frame(sandbox_a, client_a, &frame("1", "exec")).await;
    hub.client_frame(sandbox_b, client_b, &frame("1", "read")).await;

    assert!(text(&agent_a_rx.recv().await.unwrap()).contains("exec"));
    assert!(text(&agent_b_rx.recv().await.unwrap()).contains("read"));

    hub.agent_frame(sandbox_b, &frame("1", "readResponse")).await;
    hub.agent_frame(sandbox_a, &frame("1", "execResponse")).await;

    assert!(text(&client_a_rx.recv().await.unwrap()).contains("execResponse"));
    assert!(text(&client_b_rx.recv().await.unwrap()).contains("readResponse"));
}

#[tokio::test]
async fn replies_match_by_id_not_order() {
    let hub = RpcHub::new();
    let sandbox = Uuid::new_v4();

    let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
    hub.register_agent(sandbox, agent_tx).await;
    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let client = hub
        .register_client(sandbox, ClientSubject::Unauthenticated, client_tx)
        .await;

    for id in ["1", "2", "3"] {
        hub.client_frame(sandbox, client, &frame(id, "exec")).await;
        agent_rx.recv().await.unwrap();
    }

    // Agent answers out of order; each reply still reaches the client and
    // carries its own id.
    for id in ["3", "1", "2"] {
        hub.agent_frame(sandbox, &frame(id, "execResponse")).await;
    }
    let mut seen = Vec::new();
    for _ in 0..3 {
        let reply: serde_json::Value =
            serde_json::from_str(text(&client_rx.recv().await.unwrap())).unwrap();
        seen.push(reply["id"].as_str().unwrap().to_string());
    }
    assert_eq!(seen, vec!["3", "1", "2"]);
}

#[tokio::test]
async fn pending_calls_survive_agent_replacement() {
    let hub = RpcHub::new();
    let sandbox = Uuid::new_v4();

    let (old_agent_tx, mut old_agent_rx) = mpsc::unbounded_channel();
    hub.register_agent(sandbox, old_agent_tx).await;
    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let client = hub
        .register_client(sandbox, ClientSubject::Unauthenticated, client_tx)
        .await;

    hub.client_frame(sandbox, client, &frame("42", "exec")).await;
    old_agent_rx.recv().await.unwrap();

    // Exposure recreates the container; the new agent attaches and the old
    // socket is closed with policy-violation.
    let (new_agent_tx, _new_agent_rx) = mpsc::unbounded_channel();
    hub.register_agent(sandbox, new_agent_tx).await;
    assert!(matches!(
        old_agent_rx.recv().await.unwrap(),
        Message::Close(_)
    ));

    // The reply to the pre-replacement call still routes home.
    hub.agent_frame(sandbox, &frame("42", "execResponse")).await;
    let reply: serde_json::Value =
        serde_json::from_str(text(&client_rx.recv().await.unwrap())).unwrap();
    assert_eq!(reply["id"], "42");
}

#[tokio::test]
async fn concurrent_clients_each_get_their_reply() {
    let hub = RpcHub::new();
    let sandbox = Uuid::new_v4();

    let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
    hub.register_agent(sandbox, agent_tx).await;

    let mut clients = Vec::new();
    for i in 0..8 {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = hub
            .register_client(sandbox, ClientSubject::Unauthenticated, tx)
            .await;
        clients.push((i, id, rx));
        hub.client_frame(sandbox, id, &frame(&i.to_string(), "exec"))
            .await;
    }

    // Echo every forwarded request back as a response.
    for _ in 0..8 {
        let request: serde_json::Value =
            serde_json::from_str(text(&agent_rx.recv().await.unwrap())).unwrap();
        let id = request["id"].as_str().unwrap();
        hub.agent_frame(sandbox, &frame(id, "execResponse")).await;
    }

    for (i, _, mut rx) in clients {
        let reply: serde_json::Value =
            serde_json::from_str(text(&rx.recv().await.unwrap())).unwrap();
        assert_eq!(reply["id"], i.to_string());
        assert!(rx.try_recv().is_err(), "client {i} received extra frames");
    }
}

#[tokio::test]
async fn error_envelope_matches_the_wire_contract() {
    let hub = RpcHub::new();
    let sandbox = Uuid::new_v4();

    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let client = hub
        .register_client(sandbox, ClientSubject::Unauthenticated, client_tx)
        .await;

    hub.client_frame(sandbox, client, &frame("9", "exec")).await;

    let reply: serde_json::Value =
        serde_json::from_str(text(&client_rx.recv().await.unwrap())).unwrap();
    assert_eq!(reply["id"], "9");
    assert_eq!(reply["type"], "error");
    assert!(reply["error"].as_str().unwrap().contains("agent"));
}
