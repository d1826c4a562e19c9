//! # D-Bus Client Module
//!
//! Client side of the DeskChanger daemon's bus interface.
//!
//! ## Interface
//!
//! Service / interface: `org.gnome.shell.extensions.desk_changer`
//! Object path: `/org/gnome/shell/extensions/desk_changer`
//!
//! - `next(history: b) -> next_file: s` - advance rotation
//! - `prev() -> next_file: s` - rewind by one
//! - `up_next() -> next_file: s` - peek without changing state
//! - signal `next_file(file: s)` - the daemon's wallpaper changed
//!
//! ## Threading
//!
//! [`BusClient`] lives on the session's loop thread. Actual bus I/O runs on a
//! small tokio runtime the client owns; results come back as
//! [`LoopEvent`]s and completion callbacks / signal handlers are invoked only
//! when the loop routes those events back here. Nothing here blocks the loop
//! except [`BusClient::connect`] (once, at session start) and
//! [`BusClient::daemon_running`] (CLI only).
//!
//! ## Usage
//!
//! ```ignore
//! let bus = BusClient::connect(&BusAddress::Session, SERVICE_NAME, OBJECT_PATH, INTERFACE_NAME, sender)?;
//! bus.call_peek_next(|result| println!("up next: {result:?}"));
//! let sub = bus.subscribe(NEXT_FILE_SIGNAL, |uri| println!("changed: {uri}"));
//! registry.register(sub);
//! ```

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::{proxy, Connection};

use crate::error::BusError;
use crate::event_loop::{LoopEvent, LoopSender};
use crate::registry::{Subscription, SubscriptionId, SubscriptionKind};

/// Well-known bus name of the daemon.
pub const SERVICE_NAME: &str = "org.gnome.shell.extensions.desk_changer";

/// Object path the daemon serves its interface at.
pub const OBJECT_PATH: &str = "/org/gnome/shell/extensions/desk_changer";

/// Interface name.
pub const INTERFACE_NAME: &str = "org.gnome.shell.extensions.desk_changer";

/// The one signal the daemon emits.
pub const NEXT_FILE_SIGNAL: &str = "next_file";

/// D-Bus proxy for the rotation daemon. Member names are lower-case on the
/// wire, so each one is spelled out.
#[proxy(
    interface = "org.gnome.shell.extensions.desk_changer",
    default_service = "org.gnome.shell.extensions.desk_changer",
    default_path = "/org/gnome/shell/extensions/desk_changer"
)]
trait DeskChanger {
    /// Advance to the next wallpaper
    #[zbus(name = "next")]
    async fn next(&self, history: bool) -> zbus::Result<String>;

    /// Go back one wallpaper
    #[zbus(name = "prev")]
    async fn prev(&self) -> zbus::Result<String>;

    /// Peek at the wallpaper `next` would pick
    #[zbus(name = "up_next")]
    async fn up_next(&self) -> zbus::Result<String>;

    /// Emitted whenever the active wallpaper changes
    #[zbus(signal, name = "next_file")]
    async fn next_file(&self, file: String) -> zbus::Result<()>;
}

/// Which bus to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BusAddress {
    Session,
    System,
    /// A literal D-Bus address, e.g. `unix:path=/run/user/1000/bus`.
    Address(String),
}

impl FromStr for BusAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("empty bus address".to_string()),
            "session" => Ok(BusAddress::Session),
            "system" => Ok(BusAddress::System),
            other => Ok(BusAddress::Address(other.to_string())),
        }
    }
}

impl TryFrom<String> for BusAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BusAddress> for String {
    fn from(value: BusAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Session => write!(f, "session"),
            BusAddress::System => write!(f, "system"),
            BusAddress::Address(a) => write!(f, "{a}"),
        }
    }
}

/// A remote method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCall {
    Next { history: bool },
    Prev,
    UpNext,
}

impl DaemonCall {
    /// Member name on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            DaemonCall::Next { .. } => "next",
            DaemonCall::Prev => "prev",
            DaemonCall::UpNext => "up_next",
        }
    }
}

/// How [`BusClient`] reaches the daemon.
///
/// Called on the loop thread. `call` and `name_has_owner` futures run on the
/// client's runtime. The `signal_stream` future must not resolve until the
/// bus is routing the signal to the stream: [`BusClient::subscribe`] waits
/// for it, so nothing emitted after `subscribe` returns is missed.
pub trait DaemonTransport: Send + Sync + 'static {
    fn call(&self, call: DaemonCall) -> BoxFuture<'static, Result<String, BusError>>;

    /// A stream of string payloads for one signal, in emission order.
    fn signal_stream(
        &self,
        signal: &str,
    ) -> BoxFuture<'static, Result<BoxStream<'static, String>, BusError>>;

    /// Whether the daemon currently owns its bus name.
    fn name_has_owner(&self) -> BoxFuture<'static, Result<bool, BusError>>;
}

/// [`DaemonTransport`] over a real zbus connection.
pub struct ZbusTransport {
    connection: Connection,
    proxy: DeskChangerProxy<'static>,
    service: String,
}

impl ZbusTransport {
    /// Opens the connection and builds the proxy. Property caching is off,
    /// so no message is sent to the daemon here.
    pub async fn connect(
        address: &BusAddress,
        service: &str,
        path: &str,
        interface: &str,
    ) -> Result<Self, BusError> {
        let refused = |e: zbus::Error| BusError::ConnectionRefused(e.to_string());

        let builder = match address {
            BusAddress::Session => zbus::connection::Builder::session(),
            BusAddress::System => zbus::connection::Builder::system(),
            BusAddress::Address(a) => zbus::connection::Builder::address(a.as_str()),
        }
        .map_err(refused)?;
        let connection = builder.build().await.map_err(refused)?;

        let proxy = DeskChangerProxy::builder(&connection)
            .destination(service.to_string())
            .map_err(refused)?
            .path(path.to_string())
            .map_err(refused)?
            .interface(interface.to_string())
            .map_err(refused)?
            .cache_properties(zbus::proxy::CacheProperties::No)
            .build()
            .await
            .map_err(refused)?;

        Ok(Self {
            connection,
            proxy,
            service: service.to_string(),
        })
    }
}

impl DaemonTransport for ZbusTransport {
    fn call(&self, call: DaemonCall) -> BoxFuture<'static, Result<String, BusError>> {
        let proxy = self.proxy.clone();
        async move {
            let result = match call {
                DaemonCall::Next { history } => proxy.next(history).await,
                DaemonCall::Prev => proxy.prev().await,
                DaemonCall::UpNext => proxy.up_next().await,
            };
            result.map_err(|e| BusError::remote(call.method(), e))
        }
        .boxed()
    }

    fn signal_stream(
        &self,
        signal: &str,
    ) -> BoxFuture<'static, Result<BoxStream<'static, String>, BusError>> {
        let proxy = self.proxy.clone();
        let signal = signal.to_string();
        async move {
            let stream = proxy
                .inner()
                .receive_signal(signal.clone())
                .await
                .map_err(|e| BusError::remote(&signal, e))?;
            let payloads = stream.filter_map(|message| {
                let payload = message.body().deserialize::<String>().ok();
                futures::future::ready(payload)
            });
            Ok(payloads.boxed())
        }
        .boxed()
    }

    fn name_has_owner(&self) -> BoxFuture<'static, Result<bool, BusError>> {
        let connection = self.connection.clone();
        let service = self.service.clone();
        async move {
            connection
                .call_method(
                    Some("org.freedesktop.DBus"),
                    "/org/freedesktop/DBus",
                    Some("org.freedesktop.DBus"),
                    "NameHasOwner",
                    &service,
                )
                .await
                .and_then(|reply| reply.body().deserialize::<bool>())
                .map_err(|e| BusError::remote("NameHasOwner", e))
        }
        .boxed()
    }
}

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Generation number of one remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    fn next() -> Self {
        Self(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type Completion = Box<dyn FnOnce(Result<String, BusError>)>;
type SignalCallback = Rc<RefCell<Box<dyn FnMut(&str)>>>;

struct SignalHandler {
    signal: String,
    callback: SignalCallback,
    task: JoinHandle<()>,
}

struct BusInner {
    transport: Arc<dyn DaemonTransport>,
    runtime: RefCell<Option<Runtime>>,
    handle: Handle,
    sender: LoopSender,
    handlers: RefCell<BTreeMap<SubscriptionId, SignalHandler>>,
    pending: RefCell<BTreeMap<CallId, Completion>>,
    closed: Cell<bool>,
}

impl BusInner {
    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.handlers.borrow_mut().remove(&id);
        match removed {
            Some(handler) => {
                handler.task.abort();
                debug!("Unsubscribed {id} from {}", handler.signal);
                true
            }
            None => false,
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/// High-level client for the rotation daemon. Cheap to clone.
#[derive(Clone)]
pub struct BusClient {
    inner: Rc<BusInner>,
}

impl BusClient {
    /// Connects to the bus and builds the daemon proxy.
    ///
    /// Succeeds even if the daemon is not running; that shows up later as
    /// `RemoteError` on individual calls.
    pub fn connect(
        address: &BusAddress,
        service: &str,
        path: &str,
        interface: &str,
        sender: LoopSender,
    ) -> Result<Self, BusError> {
        let runtime = build_runtime()?;
        let transport = runtime.block_on(ZbusTransport::connect(address, service, path, interface))?;
        info!("Connected to {address} bus for {service} at {path}");
        Ok(Self::from_parts(Arc::new(transport), runtime, sender))
    }

    /// A client over any transport.
    pub fn with_transport(
        transport: Arc<dyn DaemonTransport>,
        sender: LoopSender,
    ) -> Result<Self, BusError> {
        Ok(Self::from_parts(transport, build_runtime()?, sender))
    }

    fn from_parts(transport: Arc<dyn DaemonTransport>, runtime: Runtime, sender: LoopSender) -> Self {
        let handle = runtime.handle().clone();
        Self {
            inner: Rc::new(BusInner {
                transport,
                runtime: RefCell::new(Some(runtime)),
                handle,
                sender,
                handlers: RefCell::new(BTreeMap::new()),
                pending: RefCell::new(BTreeMap::new()),
                closed: Cell::new(false),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Asks the daemon to advance. `with_history` lets it reuse recently shown
    /// entries.
    pub fn call_next(
        &self,
        with_history: bool,
        completion: impl FnOnce(Result<String, BusError>) + 'static,
    ) -> CallId {
        self.start_call(DaemonCall::Next { history: with_history }, completion)
    }

    pub fn call_prev(
        &self,
        completion: impl FnOnce(Result<String, BusError>) + 'static,
    ) -> CallId {
        self.start_call(DaemonCall::Prev, completion)
    }

    /// Asks what `next` would pick, without advancing.
    pub fn call_peek_next(
        &self,
        completion: impl FnOnce(Result<String, BusError>) + 'static,
    ) -> CallId {
        self.start_call(DaemonCall::UpNext, completion)
    }

    /// Makes a pending call's completion a no-op. Returns false if it already
    /// completed or was cancelled.
    pub fn cancel(&self, call: CallId) -> bool {
        self.inner.pending.borrow_mut().remove(&call).is_some()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    fn start_call(
        &self,
        call: DaemonCall,
        completion: impl FnOnce(Result<String, BusError>) + 'static,
    ) -> CallId {
        let id = CallId::next();
        if self.is_closed() {
            warn!("{}() on a closed bus client ignored", call.method());
            return id;
        }

        self.inner
            .pending
            .borrow_mut()
            .insert(id, Box::new(completion));

        let future = self.inner.transport.call(call);
        let sender = self.inner.sender.clone();
        self.inner.handle.spawn(async move {
            let result = future.await;
            sender.post(LoopEvent::CallComplete { call: id, result });
        });
        debug!("Issued {}() as call {}", call.method(), id.0);
        id
    }

    /// Routes a `CallComplete` event from the loop.
    pub(crate) fn handle_call_complete(&self, call: CallId, result: Result<String, BusError>) {
        let completion = self.inner.pending.borrow_mut().remove(&call);
        match completion {
            Some(completion) => {
                if let Err(e) = &result {
                    warn!("{e}");
                }
                completion(result);
            }
            None => debug!("Dropping stale completion for call {}", call.0),
        }
    }

    /// Calls `handler` with each payload of `signal_name`, in emission order.
    pub fn subscribe(
        &self,
        signal_name: &str,
        handler: impl FnMut(&str) + 'static,
    ) -> Subscription {
        if self.is_closed() {
            warn!("subscribe({signal_name}) on a closed bus client");
            return Subscription::inert(SubscriptionKind::BusSignal, signal_name);
        }

        // The match rule is in place before this returns.
        let setup = self.inner.transport.signal_stream(signal_name);
        let mut stream = match self.inner.handle.block_on(setup) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot receive {signal_name}: {e}");
                return Subscription::inert(SubscriptionKind::BusSignal, signal_name);
            }
        };

        let id = SubscriptionId::next();
        let sender = self.inner.sender.clone();
        let task = self.inner.handle.spawn(async move {
            while let Some(payload) = stream.next().await {
                if !sender.post(LoopEvent::Signal {
                    subscription: id,
                    payload,
                }) {
                    break;
                }
            }
        });

        self.inner.handlers.borrow_mut().insert(
            id,
            SignalHandler {
                signal: signal_name.to_string(),
                callback: Rc::new(RefCell::new(Box::new(handler))),
                task,
            },
        );
        debug!("Subscribed {id} to {signal_name}");

        let weak: Weak<BusInner> = Rc::downgrade(&self.inner);
        Subscription::new(id, SubscriptionKind::BusSignal, signal_name, move || {
            if let Some(inner) = weak.upgrade() {
                inner.unsubscribe(id);
            }
        })
    }

    /// Stops delivery for one subscription. Unknown or already released ids
    /// are ignored. Sessions should release through their registry instead.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.inner.unsubscribe(subscription)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.handlers.borrow().len()
    }

    /// Routes a `Signal` event from the loop.
    pub(crate) fn handle_signal(&self, subscription: SubscriptionId, payload: &str) {
        let callback = match self.inner.handlers.borrow().get(&subscription) {
            Some(handler) => handler.callback.clone(),
            None => return,
        };
        match callback.try_borrow_mut() {
            Ok(mut cb) => {
                let f: &mut dyn FnMut(&str) = &mut **cb;
                f(payload);
            }
            Err(_) => warn!("Signal handler {subscription} re-entered"),
        };
    }

    /// Asks the bus whether the daemon owns its name. Blocks; for one-shot
    /// command-line use only.
    pub fn daemon_running(&self) -> Result<bool, BusError> {
        if self.is_closed() {
            return Err(BusError::remote("NameHasOwner", "client closed"));
        }
        let future = self.inner.transport.name_has_owner();
        self.inner.handle.block_on(future)
    }

    /// Tears the proxy down. Outstanding subscriptions go permanently quiet
    /// and pending completions are dropped. A second call does nothing.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }

        let handlers = std::mem::take(&mut *self.inner.handlers.borrow_mut());
        for handler in handlers.values() {
            handler.task.abort();
        }
        let pending = std::mem::take(&mut *self.inner.pending.borrow_mut());
        info!(
            "Closed bus client ({} subscriptions, {} pending calls dropped)",
            handlers.len(),
            pending.len()
        );
        drop(handlers);
        drop(pending);

        if let Some(runtime) = self.inner.runtime.borrow_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for BusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusClient")
            .field("subscriptions", &self.subscription_count())
            .field("pending_calls", &self.pending_calls())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn build_runtime() -> Result<Runtime, BusError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("desk-changer-bus")
        .enable_all()
        .build()
        .map_err(|e| BusError::ConnectionRefused(format!("failed to start bus runtime: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::MainLoop;
    use crate::registry::SubscriptionRegistry;
    use crate::test_support::{pump_until, FakeDaemon};

    fn client(daemon: &Arc<FakeDaemon>, main_loop: &MainLoop) -> BusClient {
        BusClient::with_transport(daemon.clone(), main_loop.sender()).unwrap()
    }

    #[test]
    fn test_bus_address_parse() {
        assert_eq!("session".parse::<BusAddress>(), Ok(BusAddress::Session));
        assert_eq!("system".parse::<BusAddress>(), Ok(BusAddress::System));
        assert_eq!(
            "unix:path=/tmp/bus".parse::<BusAddress>(),
            Ok(BusAddress::Address("unix:path=/tmp/bus".into()))
        );
        assert!("".parse::<BusAddress>().is_err());
    }

    #[test]
    fn test_call_next_completes_on_loop() {
        let daemon = FakeDaemon::new();
        daemon.set_reply(DaemonCall::Next { history: false }, Ok("file:///b.jpg".into()));
        let main_loop = MainLoop::new();
        let bus = client(&daemon, &main_loop);

        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        bus.call_next(false, move |r| *sink.borrow_mut() = Some(r));
        assert!(result.borrow().is_none());

        pump_until(&main_loop, None, Some(&bus), || result.borrow().is_some());
        assert_eq!(
            result.borrow().as_ref().unwrap().as_deref().ok(),
            Some("file:///b.jpg")
        );
        assert_eq!(daemon.calls(), vec![DaemonCall::Next { history: false }]);
        bus.close();
    }

    #[test]
    fn test_remote_error_reported_to_caller() {
        let daemon = FakeDaemon::new();
        daemon.set_reply(
            DaemonCall::Prev,
            Err(BusError::remote("prev", "org.freedesktop.DBus.Error.ServiceUnknown")),
        );
        let main_loop = MainLoop::new();
        let bus = client(&daemon, &main_loop);

        let result = Rc::new(RefCell::new(None));
        let sink = result.clone();
        bus.call_prev(move |r| *sink.borrow_mut() = Some(r));

        pump_until(&main_loop, None, Some(&bus), || result.borrow().is_some());
        assert!(matches!(
            result.borrow().as_ref().unwrap(),
            Err(BusError::RemoteError { .. })
        ));
        bus.close();
    }

    #[test]
    fn test_cancelled_call_completion_ignored() {
        let daemon = FakeDaemon::new();
        daemon.hold_replies();
        let main_loop = MainLoop::new();
        let bus = client(&daemon, &main_loop);

        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let call = bus.call_peek_next(move |_| flag.set(true));
        assert!(bus.cancel(call));
        assert!(!bus.cancel(call));

        daemon.release_replies();
        pump_until(&main_loop, None, Some(&bus), || daemon.replies_sent() == 1);
        // Drain whatever the reply produced.
        while let Some(event) = main_loop.next_timeout(std::time::Duration::from_millis(50)) {
            crate::test_support::route(event, None, Some(&bus));
        }
        assert!(!fired.get());
        bus.close();
    }

    #[test]
    fn test_signal_order_preserved() {
        let daemon = FakeDaemon::new();
        let main_loop = MainLoop::new();
        let bus = client(&daemon, &main_loop);
        let registry = SubscriptionRegistry::new();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        registry.register(bus.subscribe(NEXT_FILE_SIGNAL, move |uri| {
            sink.borrow_mut().push(uri.to_string())
        }));

        for uri in ["file:///a.jpg", "file:///b.jpg", "file:///c.jpg"] {
            daemon.emit(uri);
        }
        pump_until(&main_loop, None, Some(&bus), || seen.borrow().len() == 3);
        assert_eq!(
            *seen.borrow(),
            vec!["file:///a.jpg", "file:///b.jpg", "file:///c.jpg"]
        );

        registry.release_all();
        bus.close();
    }

    #[test]
    fn test_signal_right_after_subscribe_not_lost() {
        let daemon = FakeDaemon::new();
        daemon.delay_subscribe(std::time::Duration::from_millis(100));
        let main_loop = MainLoop::new();
        let bus = client(&daemon, &main_loop);
        let registry = SubscriptionRegistry::new();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        registry.register(bus.subscribe(NEXT_FILE_SIGNAL, move |uri| {
            sink.borrow_mut().push(uri.to_string())
        }));
        daemon.emit("file:///first.jpg");

        pump_until(&main_loop, None, Some(&bus), || !seen.borrow().is_empty());
        assert_eq!(*seen.borrow(), vec!["file:///first.jpg"]);

        registry.release_all();
        bus.close();
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_silences_handler() {
        let daemon = FakeDaemon::new();
        let main_loop = MainLoop::new();
        let bus = client(&daemon, &main_loop);
        let registry = SubscriptionRegistry::new();

        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let id = registry.register(bus.subscribe(NEXT_FILE_SIGNAL, move |_| {
            counter.set(counter.get() + 1)
        }));

        daemon.emit("file:///a.jpg");
        pump_until(&main_loop, None, Some(&bus), || count.get() == 1);

        // A payload already queued must not reach the handler after release.
        daemon.emit("file:///b.jpg");
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(registry.release(id));
        assert!(!bus.unsubscribe(id));
        while let Some(event) = main_loop.try_next() {
            crate::test_support::route(event, None, Some(&bus));
        }
        assert_eq!(count.get(), 1);
        assert_eq!(bus.subscription_count(), 0);
        bus.close();
    }

    #[test]
    fn test_close_makes_subscriptions_inert() {
        let daemon = FakeDaemon::new();
        let main_loop = MainLoop::new();
        let bus = client(&daemon, &main_loop);
        let registry = SubscriptionRegistry::new();

        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        registry.register(bus.subscribe(NEXT_FILE_SIGNAL, move |_| {
            counter.set(counter.get() + 1)
        }));

        bus.close();
        bus.close();
        daemon.emit("file:///late.jpg");
        while let Some(event) = main_loop.next_timeout(std::time::Duration::from_millis(50)) {
            crate::test_support::route(event, None, Some(&bus));
        }
        assert_eq!(count.get(), 0);

        // Releasing after close is a no-op, not an error.
        assert_eq!(registry.release_all(), 1);

        let late = bus.subscribe(NEXT_FILE_SIGNAL, |_| {});
        registry.register(late);
        registry.release_all();
    }
}
