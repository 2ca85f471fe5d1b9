//! Two hosts on the in-memory network.
//!
//! Host A opens a channel to host B. B's incoming-connection handler allows A
//! and opens a channel back, after which both sides call each other.
//!
//! Usage:
//!   RUST_LOG=info cargo run -p hostmesh-demo

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hostmesh::HostAddress;
use hostmesh::HostBuilder;
use hostmesh::HostManager;
use hostmesh::IncomingOperationStatus;
use hostmesh::Session;
use hostmesh::memory::MemoryNetwork;
use hostmesh::transport;

const SERVICE: &str = "ExchangerService";

#[async_trait::async_trait]
trait Exchanger: Send + Sync {
    async fn greet(&self, name: String) -> transport::Result<String>;
}

struct Greeter {
    me: String,
    caller: HostAddress,
}

#[async_trait::async_trait]
impl Exchanger for Greeter {
    async fn greet(&self, name: String) -> transport::Result<String> {
        Ok(format!("{} greets {} (via {})", self.me, name, self.caller))
    }
}

type Host = HostManager<dyn Exchanger, String>;

async fn start(net: &MemoryNetwork<dyn Exchanger>, port: &str) -> anyhow::Result<Arc<Host>> {
    let me = format!("host:{}", port);
    let config = HostBuilder::new(port).service_name(SERVICE).build();
    let factory = move |session: Session<dyn Exchanger, String>| -> anyhow::Result<Arc<dyn Exchanger>> {
        Ok(Arc::new(Greeter {
            me: me.clone(),
            caller: session.address().clone(),
        }))
    };
    Ok(Host::start(config, net.transport("localhost"), factory).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let net = MemoryNetwork::new();
    let a = start(&net, "8241").await?;
    let b = start(&net, "8242").await?;

    b.on_incoming_connection(|args| {
        tracing::info!(peer = %args.connection.address, "allowing new peer");
        args.incoming_status = IncomingOperationStatus::Allow;
        args.create_connection_to_remote_host = true;
        args.set_data(format!("met at {}", args.connection.address));
    });
    a.on_connected(|info| tracing::info!(peer = %info.address, "connected"));
    a.on_lost_connection(|info| tracing::warn!(peer = %info.address, "lost connection"));

    let to_b = a.create_or_update_outgoing(HostAddress::localhost("8242"), IncomingOperationStatus::Allow, None)?;
    let reply = to_b.call(|svc| async move { svc.greet("A".into()).await }).await;
    tracing::info!(ok = reply.ok(), reply = ?reply.value(), "A -> B");

    // Let B's return channel come up before broadcasting from it.
    tokio::time::sleep(Duration::from_secs(1)).await;
    b.broadcast_call(
        |_| true,
        |peer| async move {
            let reply = peer.outgoing.call(|svc| async move { svc.greet("B".into()).await }).await;
            tracing::info!(peer = %peer.address(), ok = reply.ok(), reply = ?reply.value(), "B -> peer");
        },
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    for info in b.connections() {
        tracing::info!(?info, "B connection");
    }

    a.shutdown();
    b.shutdown();
    Ok(())
}
