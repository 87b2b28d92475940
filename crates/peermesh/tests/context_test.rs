//! Context membership driving session lifecycle

mod harness;

use harness::{connected_pair, manual_config, wait_until, MeshTestHarness};
use peermesh::events::MeshEvent;
use peermesh::session::NegotiationState;
use peermesh::{ContextState, Error, IceServerConfig};
use std::time::Duration;

#[tokio::test]
async fn test_three_peers_full_mesh() {
    let mut harness = MeshTestHarness::new();
    let a = harness.node("a").await;
    let b = harness.node("b").await;
    let c = harness.node("c").await;

    for node in [&a, &b, &c] {
        node.join("room").await;
    }

    for (node, others) in [(&a, ["b", "c"]), (&b, ["a", "c"]), (&c, ["a", "b"])] {
        for peer in others {
            node.wait_state(peer, NegotiationState::Connected).await;
        }
    }

    let peers: Vec<String> = c
        .mesh
        .list_peers()
        .await
        .into_iter()
        .map(|p| p.peer_id)
        .collect();
    assert_eq!(peers, vec!["a", "b"]);
    assert_eq!(harness.hub.members("room"), vec!["a", "b", "c"]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_change_context_tears_down_sessions() {
    let mut harness = MeshTestHarness::new();
    let (a, b) = connected_pair(&mut harness).await;
    let handle = a.engine.handle("b").unwrap();

    a.join("elsewhere").await;
    a.wait_event("PeerClosed(b)", |e| {
        matches!(e, MeshEvent::PeerClosed { peer_id } if peer_id == "b")
    })
    .await;

    assert!(a.mesh.session("b").await.is_none());
    assert!(handle.is_closed());
    b.wait_removed("a").await;
    wait_until("b to release its handle", || {
        let b = b.clone();
        async move { b.engine.handle("a").unwrap().is_closed() }
    })
    .await;

    assert!(matches!(
        a.mesh.context_state(),
        ContextState::Ready { context } if context == "elsewhere"
    ));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_manual_connect_context() {
    let mut harness = MeshTestHarness::new();
    let a = harness.node_with("a", manual_config()).await;
    let b = harness.node_with("b", manual_config()).await;
    a.join("room").await;
    b.join("room").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.mesh.list_peers().await.is_empty());
    assert!(b.mesh.list_peers().await.is_empty());

    a.mesh.connect_context().await.unwrap();
    a.wait_state("b", NegotiationState::Connected).await;
    b.wait_state("a", NegotiationState::Connected).await;

    // an explicit request for a connected peer is a no-op
    let requested = a.mesh.connect_all(&["b".to_string()]).await.unwrap();
    assert_eq!(requested, 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_connect_single_peer() {
    let mut harness = MeshTestHarness::new();
    let a = harness.node_with("a", manual_config()).await;
    let b = harness.node_with("b", manual_config()).await;
    a.join("room").await;
    b.join("room").await;

    b.mesh.connect("a").await.unwrap();
    a.wait_state("b", NegotiationState::Connected).await;
    b.wait_state("a", NegotiationState::Connected).await;

    assert!(matches!(
        a.mesh.connect("a").await,
        Err(Error::InvalidState(_))
    ));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_leaves_room() {
    let mut harness = MeshTestHarness::new();
    let (a, b) = connected_pair(&mut harness).await;

    a.mesh.disconnect().await.unwrap();
    b.wait_removed("a").await;
    assert!(a.mesh.list_peers().await.is_empty());

    let context = a.mesh.wait_until_ready(harness::WAIT).await.unwrap();
    assert_ne!(context, "room");
    assert_eq!(harness.hub.members("room"), vec!["b"]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_single_peer() {
    let mut harness = MeshTestHarness::new();
    let (a, _b) = connected_pair(&mut harness).await;

    assert!(a.mesh.disconnect_peer("b").await);
    assert!(!a.mesh.disconnect_peer("b").await);
    assert!(a.mesh.session("b").await.is_none());
    assert_eq!(a.mesh.context().as_deref(), Some("room"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_peer_leaving_closes_its_session() {
    let mut harness = MeshTestHarness::new();
    let (a, _b) = connected_pair(&mut harness).await;

    harness.hub.disconnect("b");
    a.wait_removed("b").await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_ice_servers_apply_to_new_sessions() {
    let mut harness = MeshTestHarness::new();
    let a = harness.node("a").await;
    let b = harness.node("b").await;

    let turn = IceServerConfig::turn("turn:turn.example.com:3478", "user", "secret");
    a.mesh.add_ice_server(turn.clone()).unwrap();
    assert!(matches!(
        a.mesh.add_ice_server(IceServerConfig::stun("http://example.com")),
        Err(Error::InvalidConfig(_))
    ));
    assert!(a
        .mesh
        .add_ice_server(IceServerConfig::stun("turn:no-credentials.example.com"))
        .is_err());

    a.join("room").await;
    b.join("room").await;
    a.wait_state("b", NegotiationState::Connected).await;

    let servers = a.engine.handle("b").unwrap().ice_servers().to_vec();
    assert_eq!(servers.len(), a.mesh.config().ice_servers.len() + 1);
    assert_eq!(servers.last(), Some(&turn));

    harness.shutdown().await;
}
