//! # Session
//!
//! One enable/disable cycle of the panel client. [`Session::open`] builds the
//! settings store, connects the bus client, and hands both out together with
//! the [`SubscriptionRegistry`] that every binding made during the session
//! registers with. [`Session::close`] releases everything in that registry
//! before either collaborator is shut down.
//!
//! A session is owned by the thread that runs its loop. Nothing in it is
//! `Send`; the applet keeps it on a dedicated thread and talks to it over
//! channels.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info};

use crate::binder::{PreviewBinder, PreviewSurface, ToggleBinder, Toggleable};
use crate::config::PanelConfig;
use crate::dbus_client::BusClient;
use crate::error::{SessionError, StoreError};
use crate::event_loop::{LoopEvent, MainLoop};
use crate::registry::SubscriptionRegistry;
use crate::store::ConfigStore;

pub struct Session {
    main_loop: MainLoop,
    store: ConfigStore,
    bus: BusClient,
    registry: Rc<SubscriptionRegistry>,
    closed: Cell<bool>,
}

impl Session {
    /// Opens the store, then the bus. If the bus cannot be reached the store
    /// is closed again and nothing is returned.
    pub fn open(config: &PanelConfig) -> Result<Self, SessionError> {
        let main_loop = MainLoop::new();
        let store = ConfigStore::open(
            &config.schema_id,
            &config.schema_search_path(),
            main_loop.sender(),
        )?;

        let bus = match BusClient::connect(
            &config.bus,
            &config.service_name,
            &config.object_path,
            &config.interface_name,
            main_loop.sender(),
        ) {
            Ok(bus) => bus,
            Err(e) => {
                store.close();
                return Err(e.into());
            }
        };

        Ok(Self::from_parts(main_loop, store, bus))
    }

    /// Assembles a session from collaborators already wired to `main_loop`.
    pub(crate) fn from_parts(main_loop: MainLoop, store: ConfigStore, bus: BusClient) -> Self {
        info!("Session opened");
        Self {
            main_loop,
            store,
            bus,
            registry: Rc::new(SubscriptionRegistry::new()),
            closed: Cell::new(false),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn bus(&self) -> &BusClient {
        &self.bus
    }

    pub fn registry(&self) -> &Rc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn bind_toggle(
        &self,
        key: &str,
        widget: Rc<RefCell<dyn Toggleable>>,
    ) -> Result<ToggleBinder, StoreError> {
        ToggleBinder::bind(&self.store, &self.registry, key, widget)
    }

    pub fn bind_preview(&self, widget: Rc<RefCell<dyn PreviewSurface>>) -> PreviewBinder {
        PreviewBinder::bind(&self.bus, &self.registry, widget)
    }

    /// Routes everything already queued. Returns how many events were handled.
    pub fn dispatch_pending(&self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.main_loop.try_next() {
            self.route(event);
            handled += 1;
        }
        handled
    }

    /// Waits up to `timeout` for one event, then drains the queue.
    pub fn iterate(&self, timeout: Duration) -> usize {
        match self.main_loop.next_timeout(timeout) {
            Some(event) => {
                self.route(event);
                1 + self.dispatch_pending()
            }
            None => 0,
        }
    }

    fn route(&self, event: LoopEvent) {
        match event {
            LoopEvent::StoreChanged { key, value } => self.store.handle_changed(&key, &value),
            LoopEvent::StoreFileChanged => self.store.reload(),
            LoopEvent::Signal {
                subscription,
                payload,
            } => self.bus.handle_signal(subscription, &payload),
            LoopEvent::CallComplete { call, result } => self.bus.handle_call_complete(call, result),
        }
    }

    /// Releases every registered subscription, newest first, then closes the
    /// store and the bus client. A second call does nothing.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }

        let released = self.registry.release_all();
        debug!("Released {released} subscriptions");
        self.store.close();
        self.bus.close();

        let dropped = self.main_loop.drain();
        info!("Session closed ({released} subscriptions released, {dropped} events dropped)");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
