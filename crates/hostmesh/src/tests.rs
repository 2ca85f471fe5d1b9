//! Tests for the outgoing channel against scripted transports.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::address::HostAddress;
use crate::config::ChannelSettings;
use crate::log::Level;
use crate::log::Log;
use crate::log::MemoryLog;
use crate::outgoing::ChannelState;
use crate::outgoing::OutgoingChannel;
use crate::outgoing::RemoteEndpoints;
use crate::transport;
use crate::transport::BaseContract;
use crate::transport::Connector;
use crate::transport::EndpointAddress;
use crate::transport::MessageHeaders;
use crate::transport::TransportError;

#[async_trait::async_trait]
trait Counter: Send + Sync {
    async fn next(&self) -> transport::Result<u32>;
}

#[derive(Default)]
struct Sequence {
    value: AtomicU32,
}

#[async_trait::async_trait]
impl Counter for Sequence {
    async fn next(&self) -> transport::Result<u32> {
        Ok(self.value.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

type PingScript = Arc<Mutex<VecDeque<transport::Result<bool>>>>;

/// Connector whose opens and pings follow a script.
///
/// Service opens fail with `always_fail` if set, then with queued failures,
/// then succeed. Pings pop from `pings` and answer `Ok(true)` once it is empty.
#[derive(Default)]
struct Script {
    service_opens: AtomicUsize,
    base_opens: AtomicUsize,
    always_fail: Mutex<Option<TransportError>>,
    open_failures: Mutex<VecDeque<TransportError>>,
    pings: PingScript,
}

impl Script {
    fn failing(error: TransportError) -> Arc<Self> {
        let script = Self::default();
        *script.always_fail.lock() = Some(error);
        Arc::new(script)
    }

    fn with_open_failures(errors: Vec<TransportError>) -> Arc<Self> {
        let script = Self::default();
        script.open_failures.lock().extend(errors);
        Arc::new(script)
    }

    fn with_pings(pings: Vec<transport::Result<bool>>) -> Arc<Self> {
        let script = Self::default();
        script.pings.lock().extend(pings);
        Arc::new(script)
    }

    fn service_opens(&self) -> usize {
        self.service_opens.load(Ordering::SeqCst)
    }
}

struct ScriptedPing {
    pings: PingScript,
}

#[async_trait::async_trait]
impl BaseContract for ScriptedPing {
    async fn ping(&self) -> transport::Result<bool> {
        let next = self.pings.lock().pop_front();
        next.unwrap_or(Ok(true))
    }
}

#[async_trait::async_trait]
impl Connector<dyn Counter> for Script {
    async fn open_service(&self, _: &EndpointAddress, _: &MessageHeaders) -> transport::Result<Arc<dyn Counter>> {
        self.service_opens.fetch_add(1, Ordering::SeqCst);
        let always = self.always_fail.lock().clone();
        if let Some(e) = always {
            return Err(e);
        }
        let queued = self.open_failures.lock().pop_front();
        if let Some(e) = queued {
            return Err(e);
        }
        Ok(Arc::new(Sequence::default()))
    }

    async fn open_base(&self, _: &EndpointAddress, _: &MessageHeaders) -> transport::Result<Arc<dyn BaseContract>> {
        self.base_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedPing {
            pings: self.pings.clone(),
        }))
    }
}

fn channel(script: &Arc<Script>, log: Arc<dyn Log>) -> Arc<OutgoingChannel<dyn Counter>> {
    let target = HostAddress::localhost("9100");
    OutgoingChannel::new(
        target.clone(),
        RemoteEndpoints::new(&target, "CounterService", "9000"),
        script.clone(),
        ChannelSettings::default(),
        log,
    )
}

#[tokio::test(start_paused = true)]
async fn test_call_exhausts_max_tries_when_unreachable() {
    let script = Script::failing(TransportError::Unreachable("net.tcp://localhost:9100".into()));
    let log = MemoryLog::new();
    let ch = channel(&script, Arc::new(log.clone()));

    let started = Instant::now();
    let result = ch.call(|svc| async move { svc.next().await }).await;
    let elapsed = started.elapsed();

    assert!(!result.ok());
    assert_eq!(result.value_or_default(), 0);
    assert_eq!(script.service_opens(), 4);
    assert!(!ch.is_healthy());

    // Three waits of 15s + 2 x 500ms; none after the last try.
    assert!(elapsed >= Duration::from_secs(48), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(49), "elapsed {:?}", elapsed);

    let tries = log.matching(Level::Warn, "Try: ");
    assert_eq!(tries.len(), 4);
    assert!(tries[3].contains("Try: 4/4, To: localhost:9100"));
}

#[tokio::test(start_paused = true)]
async fn test_call_recovers_after_transient_failure() {
    let script = Script::with_open_failures(vec![TransportError::Timeout]);
    let ch = channel(&script, Arc::new(MemoryLog::new()));

    let result = ch.call(|svc| async move { svc.next().await }).await;

    assert!(result.ok());
    assert_eq!(result.value(), Some(&1));
    assert_eq!(script.service_opens(), 2);
    assert!(ch.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_rejection_is_terminal() {
    let script = Script::failing(TransportError::Rejected("IncomingOperation is NotAllow".into()));
    let ch = channel(&script, Arc::new(MemoryLog::new()));

    let started = Instant::now();
    let result = ch.call(|svc| async move { svc.next().await }).await;

    assert!(!result.ok());
    assert_eq!(script.service_opens(), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_failed_action_discards_proxy() {
    let script = Arc::new(Script::default());
    let ch = channel(&script, Arc::new(MemoryLog::new()));

    let failures = Arc::new(AtomicUsize::new(1));
    let result = ch
        .call(|svc| {
            let failures = failures.clone();
            async move {
                if failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                    return Err(TransportError::ConnectionLost("reset".into()));
                }
                svc.next().await
            }
        })
        .await;

    // Fresh proxy after the failure, so its sequence starts over.
    assert_eq!(result.into_value(), Some(1));
    assert_eq!(script.service_opens(), 2);

    // The proxy is kept between successful calls.
    let again = ch.call(|svc| async move { svc.next().await }).await;
    assert_eq!(again.into_value(), Some(2));
    assert_eq!(script.service_opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_calls_are_serialized() {
    let script = Arc::new(Script::default());
    let ch = channel(&script, Arc::new(MemoryLog::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let ch = ch.clone();
        let active = active.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            ch.call(move |svc| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    svc.next().await
                }
            })
            .await
        }));
    }

    let mut values = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.ok());
        values.extend(result.into_value());
    }
    values.sort();

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(values, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_fires_once_per_transition() {
    let script = Script::with_pings(vec![
        Ok(true),
        Ok(false),
        Err(TransportError::Timeout),
        Ok(true),
    ]);
    let ch = channel(&script, Arc::new(MemoryLog::new()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    ch.subscribe(move |event| {
        let _ = tx.send(event.state);
    });
    let lost = Arc::new(AtomicUsize::new(0));
    let counter = lost.clone();
    ch.on_lost_connection(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    ch.connect();
    ch.connect();
    assert!(ch.is_monitoring());

    tokio::time::sleep(Duration::from_secs(3)).await;

    let mut seen = Vec::new();
    while let Ok(state) = rx.try_recv() {
        seen.push(state);
    }
    assert_eq!(
        seen,
        vec![
            ChannelState::Connected,
            ChannelState::Disconnected,
            ChannelState::Connected
        ]
    );
    assert_eq!(lost.load(Ordering::SeqCst), 1);
    assert_eq!(ch.state(), ChannelState::Connected);
    // One open per failed probe, a single monitor despite two connects.
    assert_eq!(script.base_opens.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_stops_calls_and_monitor() {
    let script = Arc::new(Script::default());
    let ch = channel(&script, Arc::new(MemoryLog::new()));
    ch.connect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(script.base_opens.load(Ordering::SeqCst), 1);

    ch.dispose();
    assert!(ch.is_disposed());

    let result = ch.call(|svc| async move { svc.next().await }).await;
    assert!(!result.ok());
    assert_eq!(script.service_opens(), 0);

    // Monitor exits at its next wake; no further probes or opens.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(script.base_opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_cuts_retry_delay_short() {
    let script = Script::failing(TransportError::Unreachable("net.tcp://localhost:9100".into()));
    let ch = channel(&script, Arc::new(MemoryLog::new()));

    let started = Instant::now();
    let pending = {
        let ch = ch.clone();
        tokio::spawn(async move { ch.call(|svc| async move { svc.next().await }).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    ch.dispose();
    let result = pending.await.unwrap();

    assert!(!result.ok());
    assert!(started.elapsed() < Duration::from_secs(2), "elapsed {:?}", started.elapsed());
    assert_eq!(script.service_opens(), 1);
}
