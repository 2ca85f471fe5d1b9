//! Integration tests: several hosts talking over the in-memory network.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use hostmesh::HostAddress;
use hostmesh::HostBuilder;
use hostmesh::HostManager;
use hostmesh::IncomingOperationStatus;
use hostmesh::Session;
use hostmesh::error::Error;
use hostmesh::log::Level;
use hostmesh::log::MemoryLog;
use hostmesh::memory::MemoryNetwork;
use hostmesh::outgoing::OutgoingChannel;
use hostmesh::outgoing::RemoteEndpoints;
use hostmesh::transport;
use hostmesh::transport::BaseContract;
use hostmesh::transport::Connector;
use hostmesh::transport::EndpointAddress;
use hostmesh::transport::EndpointKind;
use hostmesh::transport::HeaderName;
use hostmesh::transport::MessageHeaders;
use hostmesh::transport::TransportError;

const SERVICE: &str = "EchoService";

#[async_trait::async_trait]
trait Echo: Send + Sync {
    async fn echo(&self, message: String) -> transport::Result<String>;
}

/// Answers with the message and the caller it was bound to.
struct EchoService {
    caller: HostAddress,
}

#[async_trait::async_trait]
impl Echo for EchoService {
    async fn echo(&self, message: String) -> transport::Result<String> {
        Ok(format!("{} <- {}", message, self.caller))
    }
}

type Host = HostManager<dyn Echo, String>;

/// Helper to start a host on `port` with an echo service.
async fn start_host(net: &MemoryNetwork<dyn Echo>, port: &str, log: &MemoryLog) -> Arc<Host> {
    let config = HostBuilder::new(port)
        .service_name(SERVICE)
        .log(Arc::new(log.clone()))
        .build();
    let factory = |session: Session<dyn Echo, String>| -> anyhow::Result<Arc<dyn Echo>> {
        Ok(Arc::new(EchoService {
            caller: session.address().clone(),
        }))
    };
    Host::start(config, net.transport("localhost"), factory)
        .await
        .expect("Failed to start host")
}

fn endpoint(port: &str, kind: EndpointKind) -> EndpointAddress {
    EndpointAddress::new(HostAddress::localhost(port), SERVICE, kind)
}

fn allow_and_connect_back(host: &Host) {
    host.on_incoming_connection(|args| {
        args.create_connection_to_remote_host = true;
        args.incoming_status = IncomingOperationStatus::Allow;
        args.set_data(format!("peer {}", args.connection.address));
    });
}

// --- Test 1: Mutual connection with Allow ---

#[tokio::test(start_paused = true)]
async fn test_allowed_peer_calls_through() {
    let net = MemoryNetwork::new();
    let (log_a, log_b) = (MemoryLog::new(), MemoryLog::new());
    let a = start_host(&net, "8241", &log_a).await;
    let b = start_host(&net, "8242", &log_b).await;
    allow_and_connect_back(&b);

    let (tx, mut connected) = mpsc::unbounded_channel();
    a.on_connected(move |info| {
        let _ = tx.send(info.address);
    });

    let ch = a
        .create_or_update_outgoing(HostAddress::localhost("8242"), IncomingOperationStatus::Allow, Some("b".into()))
        .unwrap();
    let result = ch.call(|svc| async move { svc.echo("hello".into()).await }).await;

    assert!(result.ok());
    assert_eq!(result.into_value().as_deref(), Some("hello <- localhost:8241"));
    assert!(log_b.matching(Level::Warn, "NotAllow").is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connected.recv().await, Some(HostAddress::localhost("8242")));

    // B holds exactly one entry for A, with the handler's decision applied.
    assert_eq!(b.len(), 1);
    let seen_by_b = b.registry().get(&HostAddress::localhost("8241")).unwrap();
    assert_eq!(seen_by_b.status, IncomingOperationStatus::Allow);
    assert!(seen_by_b.has_incoming);
    assert!(seen_by_b.has_outgoing);
    assert_eq!(seen_by_b.data.as_deref().map(String::as_str), Some("peer localhost:8241"));

    // B's return channel reached A and attached to A's existing entry.
    assert_eq!(a.len(), 1);
    let seen_by_a = a.registry().get(&HostAddress::localhost("8242")).unwrap();
    assert!(seen_by_a.has_incoming);
    assert_eq!(seen_by_a.data.as_deref().map(String::as_str), Some("b"));

    // And B can call A back.
    let back = b.registry().outgoing(&HostAddress::localhost("8241")).unwrap();
    let reply = back.call(|svc| async move { svc.echo("pong".into()).await }).await;
    assert_eq!(reply.into_value().as_deref(), Some("pong <- localhost:8242"));
}

// --- Test 2: Client session without base registration ---

#[tokio::test(start_paused = true)]
async fn test_unregistered_client_rejected_after_poll_budget() {
    let net = MemoryNetwork::new();
    let log = MemoryLog::new();
    let b = start_host(&net, "8242", &log).await;

    let stranger = net.transport("10.0.0.9");
    let headers = MessageHeaders::new().with(HeaderName::ClientServicePort, "9999");

    let started = Instant::now();
    let err = match stranger.open_service(&endpoint("8242", EndpointKind::Client), &headers).await {
        Ok(_) => panic!("Expected rejection"),
        Err(e) => e,
    };
    let waited = started.elapsed();

    assert!(err.is_rejection(), "got {:?}", err);
    assert!(waited >= Duration::from_millis(1500), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(1600), "waited {:?}", waited);
    assert_eq!(log.matching(Level::Warn, "FromIp: 10.0.0.9").len(), 1);
    assert!(b.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_call_is_not_retried() {
    let net = MemoryNetwork::new();
    let _b = start_host(&net, "8242", &MemoryLog::new()).await;

    let target = HostAddress::localhost("8242");
    let connector: Arc<dyn Connector<dyn Echo>> = net.transport("10.0.0.9");
    let ch = OutgoingChannel::new(
        target.clone(),
        RemoteEndpoints::new(&target, SERVICE, "9999"),
        connector,
        Default::default(),
        Arc::new(MemoryLog::new()),
    );

    // No monitor, so no base session ever registers us.
    let started = Instant::now();
    let result = ch.call(|svc| async move { svc.echo("x".into()).await }).await;

    assert!(!result.ok());
    assert!(started.elapsed() < Duration::from_secs(2));
}

// --- Test 3: Base session for a new peer ---

#[tokio::test(start_paused = true)]
async fn test_base_session_registers_without_waiting() {
    let net = MemoryNetwork::new();
    let b = start_host(&net, "8242", &MemoryLog::new()).await;
    let (tx, mut incoming) = mpsc::unbounded_channel();
    b.on_incoming_connection(move |args| {
        let _ = tx.send(args.connection.address.clone());
    });

    let stranger = net.transport("10.0.0.8");
    let headers = MessageHeaders::new().with(HeaderName::BaseServicePort, "9999");
    let started = Instant::now();
    let ping = stranger
        .open_base(&endpoint("8242", EndpointKind::Base), &headers)
        .await
        .unwrap();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(ping.ping().await, Ok(true));
    assert_eq!(incoming.recv().await, Some(HostAddress::new("10.0.0.8", "9999")));

    let info = b.registry().get(&HostAddress::new("10.0.0.8", "9999")).unwrap();
    assert_eq!(info.status, IncomingOperationStatus::Deny);
    assert!(!info.has_outgoing);
}

// --- Test 4: Registry bookkeeping ---

#[tokio::test(start_paused = true)]
async fn test_create_or_update_is_idempotent() {
    let net = MemoryNetwork::new();
    let a = start_host(&net, "8241", &MemoryLog::new()).await;
    let target = HostAddress::localhost("8250");

    let first = a
        .create_or_update_outgoing(target.clone(), IncomingOperationStatus::Deny, None)
        .unwrap();
    let second = a
        .create_or_update_outgoing(target.clone(), IncomingOperationStatus::Allow, Some("tagged".into()))
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.is_monitoring());
    assert_eq!(a.len(), 1);

    let info = a.registry().get(&target).unwrap();
    assert_eq!(info.status, IncomingOperationStatus::Allow);
    assert_eq!(info.data.as_deref().map(String::as_str), Some("tagged"));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_address_refused() {
    let net = MemoryNetwork::new();
    let a = start_host(&net, "8241", &MemoryLog::new()).await;
    let res = a.create_or_update_outgoing(HostAddress::new("localhost", ""), IncomingOperationStatus::Allow, None);
    assert!(matches!(res, Err(Error::InvalidAddress(_))));
    assert!(a.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remove_disposes_connection() {
    let net = MemoryNetwork::new();
    let a = start_host(&net, "8241", &MemoryLog::new()).await;
    let target = HostAddress::localhost("8250");
    let ch = a
        .create_or_update_outgoing(target.clone(), IncomingOperationStatus::Allow, None)
        .unwrap();

    assert!(a.remove(|c| c.address == target));
    assert!(ch.is_disposed());
    assert!(a.is_empty());
    assert!(!a.remove(|c| c.address == target));
}

#[tokio::test(start_paused = true)]
async fn test_remove_aborts_inbound_session_and_releases_data() {
    let net = MemoryNetwork::new();
    let b = start_host(&net, "8242", &MemoryLog::new()).await;
    b.on_incoming_connection(|args| args.set_data("stranger".into()));

    let stranger = HostAddress::new("10.0.0.8", "9999");
    let headers = MessageHeaders::new().with(HeaderName::BaseServicePort, "9999");
    let ping = net
        .transport("10.0.0.8")
        .open_base(&endpoint("8242", EndpointKind::Base), &headers)
        .await
        .unwrap();
    assert_eq!(ping.ping().await, Ok(true));

    // Let the incoming handler attach its data.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let snapshot = b.registry().get(&stranger).unwrap();
    let data = Arc::downgrade(snapshot.data.as_ref().unwrap());

    assert!(b.remove(|c| c.address == stranger));
    assert_eq!(ping.ping().await, Err(TransportError::Aborted));
    assert!(b.is_empty());

    // Snapshots share the data; it goes away with the last of them.
    assert!(data.upgrade().is_some());
    drop(snapshot);
    assert!(data.upgrade().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_skips_inbound_only_connections() {
    let net = MemoryNetwork::new();
    let a = start_host(&net, "8241", &MemoryLog::new()).await;
    let _b = start_host(&net, "8242", &MemoryLog::new()).await;
    let _c = start_host(&net, "8243", &MemoryLog::new()).await;

    // Outgoing to B and C, plus an inbound-only entry from a stranger.
    a.create_or_update_outgoing(HostAddress::localhost("8242"), IncomingOperationStatus::Allow, None)
        .unwrap();
    a.create_or_update_outgoing(HostAddress::localhost("8243"), IncomingOperationStatus::Allow, None)
        .unwrap();
    let headers = MessageHeaders::new().with(HeaderName::BaseServicePort, "9999");
    net.transport("10.0.0.8")
        .open_base(&endpoint("8241", EndpointKind::Base), &headers)
        .await
        .unwrap();
    assert_eq!(a.len(), 3);

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.broadcast_call(
        |info| info.address.port() != "8243",
        move |peer| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(peer.address().clone());
            }
        },
    );

    assert_eq!(rx.recv().await, Some(HostAddress::localhost("8242")));
    // The action closure (and with it every sender) is gone once all tasks ran.
    assert_eq!(rx.recv().await, None);
}

// --- Test 5: Protocol violations ---

#[tokio::test(start_paused = true)]
async fn test_missing_port_header_aborts() {
    let net = MemoryNetwork::new();
    let log = MemoryLog::new();
    let b = start_host(&net, "8242", &log).await;

    let res = net
        .transport("10.0.0.7")
        .open_service(&endpoint("8242", EndpointKind::Client), &MessageHeaders::new())
        .await;

    assert!(matches!(res, Err(TransportError::Aborted)));
    assert_eq!(log.matching(Level::Error, "No service port header from 10.0.0.7").len(), 1);
    assert!(b.is_empty());
}

// --- Test 6: Lifecycle ---

#[tokio::test(start_paused = true)]
async fn test_port_in_use_fails_to_start() {
    let net = MemoryNetwork::new();
    let _a = start_host(&net, "8241", &MemoryLog::new()).await;
    let config = HostBuilder::new("8241").service_name(SERVICE).build();
    let factory = |_: Session<dyn Echo, String>| -> anyhow::Result<Arc<dyn Echo>> { anyhow::bail!("unused") };

    let res = Host::start(config, net.transport("localhost"), factory).await;
    assert!(matches!(res, Err(Error::Listen(_))));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_refuses_new_connections() {
    let net = MemoryNetwork::new();
    let a = start_host(&net, "8241", &MemoryLog::new()).await;
    let ch = a
        .create_or_update_outgoing(HostAddress::localhost("8250"), IncomingOperationStatus::Allow, None)
        .unwrap();

    a.shutdown();
    a.shutdown();

    assert!(!a.is_running());
    assert!(ch.is_disposed());
    assert!(!net.is_listening(&HostAddress::localhost("8241")));
    let res = a.create_or_update_outgoing(HostAddress::localhost("8251"), IncomingOperationStatus::Allow, None);
    assert!(matches!(res, Err(Error::NotRunning)));
}

#[tokio::test(start_paused = true)]
async fn test_outage_fires_lost_then_connected() {
    let net = MemoryNetwork::new();
    let a = start_host(&net, "8241", &MemoryLog::new()).await;
    let _b = start_host(&net, "8242", &MemoryLog::new()).await;
    let target = HostAddress::localhost("8242");

    let (tx, mut events) = mpsc::unbounded_channel();
    let lost_tx = tx.clone();
    a.on_connected(move |_| {
        let _ = tx.send("connected");
    });
    a.on_lost_connection(move |_| {
        let _ = lost_tx.send("lost");
    });

    a.create_or_update_outgoing(target.clone(), IncomingOperationStatus::Allow, None)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    net.set_reachable(&target, false);
    tokio::time::sleep(Duration::from_secs(2)).await;
    net.set_reachable(&target, true);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen, vec!["connected", "lost", "connected"]);
}
