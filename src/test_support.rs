//! Shared fixtures for unit tests: the shipped schema, an in-memory daemon,
//! and helpers for pumping the main loop.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::{broadcast, Semaphore};

use crate::dbus_client::{BusClient, DaemonCall, DaemonTransport, NEXT_FILE_SIGNAL};
use crate::error::BusError;
use crate::event_loop::{LoopEvent, MainLoop};
use crate::store::ConfigStore;

pub const SCHEMA_ID: &str = "org.gnome.shell.extensions.desk-changer";

const SHIPPED_SCHEMA: &str =
    include_str!("../schemas/org.gnome.shell.extensions.desk-changer.json");

/// Writes the shipped schema into `dir`.
pub fn write_schema(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(format!("{SCHEMA_ID}.json")), SHIPPED_SCHEMA).unwrap();
}

/// Hands one loop event to whichever collaborator owns it.
pub fn route(event: LoopEvent, store: Option<&ConfigStore>, bus: Option<&BusClient>) {
    match event {
        LoopEvent::StoreChanged { key, value } => {
            if let Some(store) = store {
                store.handle_changed(&key, &value);
            }
        }
        LoopEvent::StoreFileChanged => {
            if let Some(store) = store {
                store.reload();
            }
        }
        LoopEvent::Signal {
            subscription,
            payload,
        } => {
            if let Some(bus) = bus {
                bus.handle_signal(subscription, &payload);
            }
        }
        LoopEvent::CallComplete { call, result } => {
            if let Some(bus) = bus {
                bus.handle_call_complete(call, result);
            }
        }
    }
}

/// Drains everything already queued.
pub fn pump_store(main_loop: &MainLoop, store: &ConfigStore) {
    while let Some(event) = main_loop.try_next() {
        route(event, Some(store), None);
    }
}

/// Routes events until `done()` holds. Panics after two seconds.
pub fn pump_until(
    main_loop: &MainLoop,
    store: Option<&ConfigStore>,
    bus: Option<&BusClient>,
    mut done: impl FnMut() -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting on the main loop");
        if let Some(event) = main_loop.next_timeout(Duration::from_millis(20)) {
            route(event, store, bus);
        }
    }
}

/// In-memory stand-in for the rotation daemon.
pub struct FakeDaemon {
    signals: broadcast::Sender<String>,
    replies: Mutex<BTreeMap<&'static str, Result<String, BusError>>>,
    calls: Mutex<Vec<DaemonCall>>,
    gate: Arc<Semaphore>,
    gated: std::sync::atomic::AtomicBool,
    replies_sent: Arc<AtomicUsize>,
    subscribe_delay: Mutex<Option<Duration>>,
}

impl FakeDaemon {
    pub fn new() -> Arc<Self> {
        let (signals, _) = broadcast::channel(64);
        Arc::new(Self {
            signals,
            replies: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: Arc::new(Semaphore::new(0)),
            gated: std::sync::atomic::AtomicBool::new(false),
            replies_sent: Arc::new(AtomicUsize::new(0)),
            subscribe_delay: Mutex::new(None),
        })
    }

    /// What the daemon answers to `call`. Unset methods fail like an absent
    /// service.
    pub fn set_reply(&self, call: DaemonCall, reply: Result<String, BusError>) {
        self.replies.lock().unwrap().insert(call.method(), reply);
    }

    /// Holds every reply until [`release_replies`](Self::release_replies).
    pub fn hold_replies(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release_replies(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn replies_sent(&self) -> usize {
        self.replies_sent.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<DaemonCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Makes signal setup take `delay`, like a bus round trip for the
    /// match rule. The receiver is only attached once the delay has passed.
    pub fn delay_subscribe(&self, delay: Duration) {
        *self.subscribe_delay.lock().unwrap() = Some(delay);
    }

    pub fn emit(&self, uri: &str) {
        let _ = self.signals.send(uri.to_string());
    }
}

impl DaemonTransport for FakeDaemon {
    fn call(&self, call: DaemonCall) -> BoxFuture<'static, Result<String, BusError>> {
        self.calls.lock().unwrap().push(call);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(call.method())
            .cloned()
            .unwrap_or_else(|| {
                Err(BusError::remote(
                    call.method(),
                    "org.freedesktop.DBus.Error.ServiceUnknown",
                ))
            });
        let gate = self
            .gated
            .load(Ordering::SeqCst)
            .then(|| self.gate.clone());
        let sent = self.replies_sent.clone();
        async move {
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            sent.fetch_add(1, Ordering::SeqCst);
            reply
        }
        .boxed()
    }

    fn signal_stream(
        &self,
        signal: &str,
    ) -> BoxFuture<'static, Result<BoxStream<'static, String>, BusError>> {
        if signal != NEXT_FILE_SIGNAL {
            return futures::future::ready(Ok(futures::stream::empty().boxed())).boxed();
        }

        let signals = self.signals.clone();
        let delay = *self.subscribe_delay.lock().unwrap();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let rx = signals.subscribe();
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(stream.boxed())
        }
        .boxed()
    }

    fn name_has_owner(&self) -> BoxFuture<'static, Result<bool, BusError>> {
        futures::future::ready(Ok(true)).boxed()
    }
}
