use async_trait::async_trait;
use egtp::strategy::{CommStrategy, TcpStrategy};
use egtp::{
    AddressRecord, ClientError, CommHints, ConversationFailure, Directory, EgtpConfig, HandlerOutcome,
    IncomingRequest, Lookup, LookupError, Node, NodeIdentity, PeerId, SendOptions,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn local_config() -> EgtpConfig {
    EgtpConfig {
        listen_host: "127.0.0.1".into(),
        listen_port: Some(0),
        // Loopback addresses are not routable, but they are all these tests have
        allow_nonroutable_ip: true,
        ..Default::default()
    }
}

async fn start_node(name: &str, directory: &Directory) -> Node {
    let identity = NodeIdentity::random_with_nickname(name, 1024).expect("identity");
    let node = Node::with_directory(local_config(), identity, directory.clone()).await.expect("node starts");
    published(node, directory).await
}

/// Wait until the node has published its address.
async fn published(node: Node, directory: &Directory) -> Node {
    for _ in 0..100 {
        if directory.get(&node.peer_id()).is_some() {
            return node;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never published its address", node.peer_id());
}

/// A directory that counts the lookups made through it.
struct CountingLookup {
    directory: Directory,
    lookups: AtomicUsize,
}

#[async_trait]
impl Lookup for CountingLookup {
    async fn publish(&self, id: PeerId, record: AddressRecord) -> Result<(), LookupError> {
        self.directory.publish(id, record).await
    }

    async fn lookup(&self, id: PeerId) -> Result<AddressRecord, LookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.directory.lookup(id).await
    }
}

fn echo(request: &IncomingRequest) -> HandlerOutcome {
    HandlerOutcome::Respond(Some(json!({"echo": request.body, "from": request.counterparty})), CommHints::NO_HINT)
}

#[tokio::test]
async fn ping_pong() {
    env_logger::try_init().ok();
    let directory = Directory::new();
    let alice = start_node("alice", &directory).await;
    let bob = start_node("bob", &directory).await;
    let mut bob_client = bob.client();
    bob_client.register_handler("ping", echo).await.expect("register");

    let mut client = alice.client();
    for n in 0..3 {
        let response = client.send(bob.peer_id(), "ping", Some(json!(n))).await.expect("pong");
        assert_eq!(response.message_type(), "ping response");
        let body = response.body.expect("body");
        assert_eq!(body["echo"], json!(n));
        assert_eq!(body["from"], json!(alice.peer_id()));
    }
    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.connections, 1, "all three pings share one connection");
    assert_eq!(stats.conversations, 0);

    alice.shutdown().await.expect("alice shuts down");
    bob.shutdown().await.expect("bob shuts down");
}

#[tokio::test]
async fn failures_reach_the_caller() {
    env_logger::try_init().ok();
    let directory = Directory::new();
    let alice = start_node("alice", &directory).await;
    let bob = start_node("bob", &directory).await;
    let mut bob_client = bob.client();
    bob_client
        .register_handler("grumpy", |_: &IncomingRequest| HandlerOutcome::Fail("not today".into()))
        .await
        .expect("register");

    let mut client = alice.client();
    let result = client.send(bob.peer_id(), "grumpy", None).await;
    match result {
        Err(ClientError::Conversation(ConversationFailure::Remote(reason))) => assert_eq!(reason, "not today"),
        other => panic!("expected a remote failure, got {other:?}"),
    }

    // Nobody handles this type, so it is never answered
    let options = SendOptions::with_timeout(Duration::from_millis(300));
    let result = client.send_with(bob.peer_id(), "nobody home", None, options).await;
    assert!(matches!(result, Err(ClientError::Conversation(ConversationFailure::Timeout))));

    let stranger = PeerId::digest(b"nobody knows this node");
    let result = client.send(stranger, "ping", None).await;
    assert!(matches!(result, Err(ClientError::Conversation(ConversationFailure::NoAddress))));

    alice.shutdown().await.expect("alice shuts down");
    bob.shutdown().await.expect("bob shuts down");
}

#[tokio::test]
async fn requests_answered_later() {
    env_logger::try_init().ok();
    let directory = Directory::new();
    let alice = start_node("alice", &directory).await;
    let bob = start_node("bob", &directory).await;
    let mut bob_client = bob.client();
    let mut requests = bob_client.inbound_requests("add", 4).await.expect("register");
    let worker = tokio::spawn(async move {
        while let Some(request) = requests.next().await {
            let body = request.body.unwrap_or_default();
            let sum = body["a"].as_i64().unwrap_or(0) + body["b"].as_i64().unwrap_or(0);
            bob_client.respond(request.responder, Some(json!(sum))).await.expect("respond");
            let again = bob_client.respond(request.responder, Some(json!(0))).await;
            assert!(matches!(again, Err(ClientError::UnknownResponder)));
        }
    });

    let mut client = alice.client();
    let response = client.send(bob.peer_id(), "add", Some(json!({"a": 2, "b": 40}))).await.expect("sum");
    assert_eq!(response.body, Some(json!(42)));

    alice.shutdown().await.expect("alice shuts down");
    bob.shutdown().await.expect("bob shuts down");
    worker.abort();
}

#[tokio::test]
async fn messages_to_self() {
    env_logger::try_init().ok();
    let directory = Directory::new();
    let alice = start_node("alice", &directory).await;
    let mut client = alice.client();
    client.register_handler("ping", echo).await.expect("register");
    let response = client.send(alice.peer_id(), "ping", Some(json!("me"))).await.expect("pong");
    assert_eq!(response.body.expect("body")["from"], json!(alice.peer_id()));
    let own = client.own_address().await.expect("own address").expect("a record");
    assert_eq!(own.peer_id(), Some(alice.peer_id()));
    alice.shutdown().await.expect("alice shuts down");
}

#[tokio::test]
async fn shutdown_fails_outstanding_conversations() {
    env_logger::try_init().ok();
    let directory = Directory::new();
    let alice = start_node("alice", &directory).await;
    let bob = start_node("bob", &directory).await;
    // Bob takes the requests but never answers
    let _requests = bob.client().inbound_requests("slow", 4).await.expect("register");

    let mut client = alice.client();
    let mut pending =
        client.start_conversation(bob.peer_id(), "slow", None, SendOptions::default()).await.expect("sent");
    alice.shutdown().await.expect("alice shuts down");
    let result = pending.response().await;
    assert!(matches!(result, Err(ClientError::Conversation(ConversationFailure::Shutdown))));
    assert!(pending.late_response().await.is_none());
    assert!(matches!(client.stats().await, Err(ClientError::EventLoopGone)));
    bob.shutdown().await.expect("bob shuts down");
}

#[tokio::test]
async fn unreachable_peer_is_retried_once() {
    env_logger::try_init().ok();
    let directory = Directory::new();
    // Nobody listens on this port once the listener is dropped
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("local address").port()
    };
    let ghost = NodeIdentity::random_with_nickname("ghost", 1024).expect("identity");
    let ghost_id = ghost.peer_id();
    let tcp = CommStrategy::Tcp(TcpStrategy::to_address("127.0.0.1", port, Some(ghost_id), Some(1)));
    directory.insert(ghost_id, AddressRecord::new(&CommStrategy::crypto(ghost.public_key(), tcp)));

    let lookup = Arc::new(CountingLookup { directory: directory.clone(), lookups: AtomicUsize::new(0) });
    let identity = NodeIdentity::random_with_nickname("alice", 1024).expect("identity");
    let alice = Node::start(local_config(), identity, lookup.clone(), Arc::new(directory.clone()))
        .await
        .expect("node starts");
    let alice = published(alice, &directory).await;

    let mut client = alice.client();
    let result = client.send(ghost_id, "ping", None).await;
    assert!(
        matches!(result, Err(ClientError::Conversation(ConversationFailure::Transport(_)))),
        "expected a transport failure, got {result:?}"
    );
    assert_eq!(lookup.lookups.load(Ordering::SeqCst), 2, "one lookup for the first try and one for the retry");
    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.conversations, 0);

    alice.shutdown().await.expect("alice shuts down");
}
