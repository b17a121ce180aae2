use async_trait::async_trait;
use courier_core::{
    ConnectionDescriptor, DeliveryConfig, DuplexConnection, Gateway, GatewayError, MemoryStore,
    Message, TransportError, presence, queue,
    store::keys,
    test_utils::{MockConnection, MockForwarder},
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

const NODE: &str = "127.0.0.1:7001";
const PEER: &str = "10.0.0.2:10186";

fn fast_config() -> DeliveryConfig {
    DeliveryConfig {
        heartbeat_interval: Duration::from_millis(20),
        queue_backoff: Duration::from_millis(10),
        retry_delay: Duration::from_millis(150),
        ..DeliveryConfig::default()
    }
}

async fn setup(config: DeliveryConfig) -> (Gateway, Arc<MemoryStore>, Arc<MockForwarder>) {
    let store = Arc::new(MemoryStore::new());
    let forwarder = Arc::new(MockForwarder::new());
    let gateway = Gateway::start(store.clone(), forwarder.clone(), NODE, config)
        .await
        .expect("gateway start");
    (gateway, store, forwarder)
}

/// Poll `check` until it holds, failing the test after five seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Socket teardown runs in its own task; wait for it to land.
async fn wait_closed(conn: &MockConnection) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !conn.is_closed() {
        assert!(Instant::now() < deadline, "socket never closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A socket whose peer never completes the close handshake.
struct HungConnection {
    id: String,
    alive: bool,
}

#[async_trait]
impl DuplexConnection for HungConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, _payload: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        std::future::pending().await
    }

    async fn is_connected(&self) -> bool {
        self.alive
    }

    async fn close(&self) -> Result<(), TransportError> {
        std::future::pending().await
    }
}

async fn seed_remote(store: &MemoryStore, conn_id: &str, uid: i64) {
    let descriptor = ConnectionDescriptor::open(conn_id, uid, PEER);
    presence::save_descriptor(store, &descriptor).await.unwrap();
    presence::add_user_connection(store, uid, conn_id, descriptor.connect_time)
        .await
        .unwrap();
}

#[tokio::test]
async fn unacknowledged_message_is_retried_until_exhausted() {
    let (gateway, store, _) = setup(fast_config()).await;
    let conn = Arc::new(MockConnection::new("c1"));
    gateway.connect(42, conn.clone()).await.unwrap();

    let message = Message {
        id: "1700000000-abc".to_string(),
        uid: 42,
        content: json!("hello"),
        retries: 2,
        conn_id: String::new(),
    };
    gateway.enqueue(&message).await.unwrap();

    eventually("first delivery", || async { !conn.sent_frames().is_empty() }).await;
    assert_eq!(
        String::from_utf8(conn.sent_frames()[0].clone()).unwrap(),
        r#"{"id":"1700000000-abc","uid":42,"content":"hello","retries":2,"conn_id":"c1"}"#
    );

    eventually("retry scheduled", || async {
        !store.sorted_entries(&keys::delay_queue(42)).is_empty()
            || conn.sent_frames().len() > 1
    })
    .await;

    eventually("three attempts", || async { conn.sent_frames().len() == 3 }).await;
    let retries: Vec<u32> = conn.sent_messages().iter().map(|m| m.retries).collect();
    assert_eq!(retries, vec![2, 1, 0]);

    let store_ref = store.as_ref();
    eventually("ack record cleared", move || async move {
        !queue::is_unacked(store_ref, 42, "c1", "1700000000-abc")
            .await
            .unwrap()
    })
    .await;
    eventually("delay queue drained", || async {
        store.sorted_entries(&keys::delay_queue(42)).is_empty()
    })
    .await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(conn.sent_frames().len(), 3);
}

#[tokio::test]
async fn acknowledged_message_is_not_retried() {
    let config = DeliveryConfig {
        retry_delay: Duration::from_millis(500),
        ..fast_config()
    };
    let (gateway, store, _) = setup(config).await;
    let conn = Arc::new(MockConnection::new("c1"));
    gateway.connect(5, conn.clone()).await.unwrap();

    let sent = gateway.enqueue_message(5, json!({"k": "v"}), 3).await.unwrap();
    eventually("delivery", || async { conn.sent_frames().len() == 1 }).await;

    conn.ack(&sent.id);
    conn.ack(&sent.id);
    let store_ref = store.as_ref();
    let msg_id = sent.id.clone();
    eventually("ack recorded", move || {
        let msg_id = msg_id.clone();
        async move { !queue::is_unacked(store_ref, 5, "c1", &msg_id).await.unwrap() }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(conn.sent_frames().len(), 1);
    assert_eq!(gateway.local_connection_count().await.unwrap(), 1);
}

#[tokio::test]
async fn malformed_client_frames_are_ignored() {
    let (gateway, _, _) = setup(fast_config()).await;
    let conn = Arc::new(MockConnection::new("c1"));
    gateway.connect(5, conn.clone()).await.unwrap();

    conn.push_inbound("not json at all");
    conn.push_inbound(r#"{"content":"typing"}"#);
    gateway.enqueue_message(5, json!("after"), 0).await.unwrap();

    eventually("delivery after garbage", || async { conn.sent_frames().len() == 1 }).await;
    assert_eq!(gateway.local_connection_count().await.unwrap(), 1);
}

#[tokio::test]
async fn failed_heartbeat_removes_and_persists_connection() {
    let (gateway, store, _) = setup(fast_config()).await;
    let conn = Arc::new(MockConnection::new("c1"));
    gateway.connect(9, conn.clone()).await.unwrap();
    assert_eq!(gateway.local_connection_count().await.unwrap(), 1);

    conn.set_alive(false);

    let g = gateway.clone();
    eventually("registry emptied", move || {
        let g = g.clone();
        async move { g.local_connection_count().await.unwrap() == 0 }
    })
    .await;

    let persisted = presence::load_descriptor(store.as_ref(), "c1")
        .await
        .unwrap()
        .expect("descriptor kept for retention period");
    assert!(persisted.closed);
    assert!(persisted.disconnect_time > 0);
    wait_closed(&conn).await;

    eventually("retention applied", || async {
        store.ttl(&keys::descriptor("c1")).is_some()
    })
    .await;
}

#[tokio::test]
async fn fan_out_reaches_local_and_remote_connections_once() {
    let (gateway, store, forwarder) = setup(fast_config()).await;
    let local = Arc::new(MockConnection::new("local"));
    gateway.connect(7, local.clone()).await.unwrap();
    seed_remote(&store, "remote", 7).await;

    // Claims this node but was never registered here.
    let ghost = ConnectionDescriptor::open("ghost", 7, NODE);
    presence::save_descriptor(store.as_ref(), &ghost).await.unwrap();
    presence::add_user_connection(store.as_ref(), 7, "ghost", ghost.connect_time)
        .await
        .unwrap();

    let sent = gateway.enqueue_message(7, json!("hi"), 0).await.unwrap();

    eventually("both deliveries", || async {
        local.sent_frames().len() == 1 && forwarder.push_calls().len() == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(local.sent_frames().len(), 1);
    let pushes = forwarder.push_calls();
    assert_eq!(pushes.len(), 1);
    let (node, conn_id, forwarded) = &pushes[0];
    assert_eq!(node, PEER);
    assert_eq!(conn_id, "remote");
    assert_eq!(forwarded.id, sent.id);
    assert_eq!(forwarded.conn_id, "remote");
}

#[tokio::test]
async fn remote_retries_are_forwarded_to_owner() {
    let (gateway, store, forwarder) = setup(fast_config()).await;
    let local = Arc::new(MockConnection::new("local"));
    gateway.connect(8, local.clone()).await.unwrap();
    seed_remote(&store, "remote", 8).await;

    gateway.enqueue_message(8, json!("x"), 1).await.unwrap();

    eventually("remote retry", || async { forwarder.push_calls().len() == 2 }).await;
    let retries: Vec<u32> = forwarder.push_calls().iter().map(|(_, _, m)| m.retries).collect();
    assert_eq!(retries, vec![1, 0]);
}

#[tokio::test]
async fn closing_remote_connection_forwards_once() {
    let (gateway, store, forwarder) = setup(fast_config()).await;
    seed_remote(&store, "r1", 3).await;

    gateway.close_connection("r1").await.unwrap();

    assert_eq!(
        forwarder.close_calls(),
        vec![(PEER.to_string(), "r1".to_string())]
    );
    assert_eq!(gateway.local_connection_count().await.unwrap(), 0);
    let descriptor = presence::load_descriptor(store.as_ref(), "r1")
        .await
        .unwrap()
        .unwrap();
    assert!(!descriptor.closed);
}

#[tokio::test]
async fn forward_failure_is_surfaced() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Gateway::start(
        store.clone(),
        Arc::new(MockForwarder::failing()),
        NODE,
        fast_config(),
    )
    .await
    .unwrap();
    seed_remote(&store, "r1", 3).await;

    match gateway.close_connection("r1").await {
        Err(GatewayError::Forward { node, .. }) => assert_eq!(node, PEER),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn closing_local_connection_is_idempotent() {
    let (gateway, store, forwarder) = setup(fast_config()).await;
    let conn = Arc::new(MockConnection::new("c1"));
    gateway.connect(4, conn.clone()).await.unwrap();

    gateway.close_connection("c1").await.unwrap();
    gateway.close_connection("c1").await.unwrap();

    wait_closed(&conn).await;
    assert_eq!(conn.close_count(), 1);
    assert_eq!(gateway.local_connection_count().await.unwrap(), 0);
    assert!(forwarder.close_calls().is_empty());
    let descriptor = presence::load_descriptor(store.as_ref(), "c1")
        .await
        .unwrap()
        .unwrap();
    assert!(descriptor.closed);

    assert!(matches!(
        gateway.close_connection("never-existed").await,
        Err(GatewayError::ConnectionNotFound(_))
    ));
}

#[tokio::test]
async fn close_all_covers_local_and_remote() {
    let (gateway, store, forwarder) = setup(fast_config()).await;
    let conn = Arc::new(MockConnection::new("c1"));
    gateway.connect(6, conn.clone()).await.unwrap();
    seed_remote(&store, "r1", 6).await;

    let summary = gateway.close_all_connections(6).await.unwrap();
    assert_eq!(summary.closed, 2);
    assert_eq!(summary.failed, 0);
    wait_closed(&conn).await;
    assert_eq!(forwarder.close_calls().len(), 1);
}

#[tokio::test]
async fn pushed_message_reaches_local_connection_only() {
    let (gateway, _, _) = setup(fast_config()).await;
    let conn = Arc::new(MockConnection::new("c1"));
    gateway.connect(2, conn.clone()).await.unwrap();

    let message = Message::new(2, json!("direct"), 0);
    gateway.deliver_to_connection("c1", &message).await.unwrap();
    assert_eq!(conn.sent_messages()[0].conn_id, "c1");

    assert!(matches!(
        gateway.deliver_to_connection("elsewhere", &message).await,
        Err(GatewayError::ConnectionNotFound(_))
    ));
}

#[tokio::test]
async fn invalid_user_is_rejected() {
    let (gateway, _, _) = setup(fast_config()).await;
    let conn = Arc::new(MockConnection::new("c1"));
    assert!(matches!(
        gateway.connect(0, conn).await,
        Err(GatewayError::InvalidUser(0))
    ));
    assert!(matches!(
        gateway.enqueue_message(0, json!("x"), 0).await,
        Err(GatewayError::InvalidUser(0))
    ));
}

#[tokio::test]
async fn negative_user_ids_are_valid() {
    let (gateway, store, _) = setup(fast_config()).await;
    let conn = Arc::new(MockConnection::new("c1"));
    gateway.connect(-7, conn.clone()).await.unwrap();

    let message = gateway.enqueue_message(-7, json!("hi"), 0).await.unwrap();
    let c = conn.clone();
    eventually("delivered", move || {
        let c = c.clone();
        async move { c.sent_messages().len() == 1 }
    })
    .await;
    assert_eq!(conn.sent_messages()[0].id, message.id);

    let descriptor = presence::load_descriptor(store.as_ref(), "c1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(descriptor.uid, -7);
}

#[tokio::test]
async fn startup_sweep_closes_connections_left_by_previous_run() {
    let store = Arc::new(MemoryStore::new());
    let orphan = ConnectionDescriptor::open("orphan", 11, NODE);
    presence::save_descriptor(store.as_ref(), &orphan).await.unwrap();
    presence::add_online_user(store.as_ref(), 11).await.unwrap();
    presence::add_user_connection(store.as_ref(), 11, "orphan", orphan.connect_time)
        .await
        .unwrap();

    let gateway = Gateway::start(
        store.clone(),
        Arc::new(MockForwarder::new()),
        NODE,
        fast_config(),
    )
    .await
    .unwrap();

    assert_eq!(gateway.startup_sweep().closed, 1);
    let swept = presence::load_descriptor(store.as_ref(), "orphan")
        .await
        .unwrap()
        .unwrap();
    assert!(swept.closed);
}

#[tokio::test]
async fn hung_close_after_heartbeat_failure_does_not_block_coordinator() {
    let (gateway, store, _) = setup(fast_config()).await;
    let hung = Arc::new(HungConnection {
        id: "stuck".to_string(),
        alive: false,
    });
    gateway.connect(1, hung).await.unwrap();

    let g = gateway.clone();
    eventually("hung connection removed", move || {
        let g = g.clone();
        async move { g.local_connection_count().await.unwrap() == 0 }
    })
    .await;

    let healthy = Arc::new(MockConnection::new("healthy"));
    tokio::time::timeout(Duration::from_secs(3), gateway.connect(2, healthy))
        .await
        .expect("coordinator still serving events")
        .unwrap();
    assert_eq!(gateway.local_connection_count().await.unwrap(), 1);

    let descriptor = presence::load_descriptor(store.as_ref(), "stuck")
        .await
        .unwrap()
        .unwrap();
    assert!(descriptor.closed);
}

#[tokio::test]
async fn explicit_close_of_hung_socket_returns_promptly() {
    let (gateway, _, _) = setup(fast_config()).await;
    let hung = Arc::new(HungConnection {
        id: "stuck".to_string(),
        alive: true,
    });
    gateway.connect(1, hung).await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), gateway.close_connection("stuck"))
        .await
        .expect("close returned")
        .unwrap();

    let healthy = Arc::new(MockConnection::new("healthy"));
    tokio::time::timeout(Duration::from_secs(3), gateway.connect(2, healthy))
        .await
        .expect("coordinator still serving events")
        .unwrap();
    assert_eq!(gateway.local_connection_count().await.unwrap(), 1);
}

#[tokio::test]
async fn dead_socket_stops_claiming_queued_messages() {
    let config = DeliveryConfig {
        heartbeat_interval: Duration::from_secs(30),
        ..fast_config()
    };
    let (gateway, store, _) = setup(config).await;
    let conn = Arc::new(MockConnection::new("c1"));
    gateway.connect(5, conn.clone()).await.unwrap();

    conn.set_alive(false);
    tokio::time::sleep(Duration::from_millis(100)).await;

    gateway.enqueue_message(5, json!("later"), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(conn.sent_frames().is_empty());
    assert_eq!(store.list_len(&keys::message_queue(5)), 1);
    assert_eq!(gateway.local_connection_count().await.unwrap(), 1);
}
