//! # State Binders
//!
//! A binder keeps one piece of UI-facing state in step with one store key or
//! one bus signal. Widgets are reached only through the capability traits
//! [`Toggleable`] and [`PreviewSurface`], so the same binders drive the panel
//! applet, the headless `--watch` mode and the tests.
//!
//! ## Two-way toggles
//!
//! The store does not filter a handle's own writes out of its watches, so a
//! click would come straight back as a change notification. [`ToggleBinder`]
//! remembers the value it just wrote ([`BinderPhase::LocalWriteInFlight`]) and
//! swallows the matching echo. If something else arrives first, that value
//! wins and is rendered.
//!
//! ## One-way preview
//!
//! [`PreviewBinder`] subscribes to `next_file` and then asks the daemon for
//! its current `up_next`. Whichever signal arrives is applied as-is; the
//! initial peek only counts if no signal beat it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, error, warn};

use crate::dbus_client::{BusClient, CallId, NEXT_FILE_SIGNAL};
use crate::error::{BusError, StoreError};
use crate::registry::{SubscriptionId, SubscriptionRegistry};
use crate::schema::{KeyType, Value};
use crate::store::ConfigStore;

/// A widget with an on/off state.
pub trait Toggleable {
    fn set_toggle_state(&mut self, value: bool);
}

/// A widget that shows the upcoming wallpaper.
pub trait PreviewSurface {
    fn show_preview(&mut self, state: &PreviewState);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleState {
    pub value: bool,
    pub bound_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinderPhase {
    Idle,
    /// A write from this binder has not come back through the watch yet.
    LocalWriteInFlight { expected: bool },
}

struct ToggleInner {
    state: ToggleState,
    phase: BinderPhase,
    widget: Rc<RefCell<dyn Toggleable>>,
}

/// Two-way binding between a bool key and a [`Toggleable`].
pub struct ToggleBinder {
    inner: Rc<RefCell<ToggleInner>>,
    store: ConfigStore,
    registry: Rc<SubscriptionRegistry>,
    subscription: Cell<Option<SubscriptionId>>,
}

impl ToggleBinder {
    /// Reads the key, renders it, and starts watching it.
    pub fn bind(
        store: &ConfigStore,
        registry: &Rc<SubscriptionRegistry>,
        key: &str,
        widget: Rc<RefCell<dyn Toggleable>>,
    ) -> Result<Self, StoreError> {
        let initial = store.get_bool(key)?;
        widget.borrow_mut().set_toggle_state(initial);

        let inner = Rc::new(RefCell::new(ToggleInner {
            state: ToggleState {
                value: initial,
                bound_key: key.to_string(),
            },
            phase: BinderPhase::Idle,
            widget,
        }));

        let weak: Weak<RefCell<ToggleInner>> = Rc::downgrade(&inner);
        let subscription = store.watch(key, move |key, value| {
            if let Some(inner) = weak.upgrade() {
                on_store_change(&inner, key, value);
            }
        });
        let id = registry.register(subscription);

        Ok(Self {
            inner,
            store: store.clone(),
            registry: registry.clone(),
            subscription: Cell::new(Some(id)),
        })
    }

    /// The user flipped the widget to `value`.
    pub fn user_toggled(&self, value: bool) {
        let (key, previous) = {
            let mut inner = self.inner.borrow_mut();
            if inner.phase == BinderPhase::Idle && inner.state.value == value {
                return;
            }
            let previous = inner.state.value;
            inner.phase = BinderPhase::LocalWriteInFlight { expected: value };
            inner.state.value = value;
            (inner.state.bound_key.clone(), previous)
        };

        if let Err(e) = self.store.set(&key, value) {
            error!("Failed to write {key}: {e}");
            let widget = {
                let mut inner = self.inner.borrow_mut();
                inner.phase = BinderPhase::Idle;
                inner.state.value = previous;
                inner.widget.clone()
            };
            widget.borrow_mut().set_toggle_state(previous);
        }
    }

    pub fn value(&self) -> bool {
        self.inner.borrow().state.value
    }

    pub fn state(&self) -> ToggleState {
        self.inner.borrow().state.clone()
    }

    pub fn phase(&self) -> BinderPhase {
        self.inner.borrow().phase
    }

    pub fn key(&self) -> String {
        self.inner.borrow().state.bound_key.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.subscription.get().is_some()
    }

    /// Stops watching. Safe to call more than once.
    pub fn unbind(&self) {
        if let Some(id) = self.subscription.take() {
            self.registry.release(id);
        }
    }
}

impl Drop for ToggleBinder {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl fmt::Debug for ToggleBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ToggleBinder")
            .field("state", &inner.state)
            .field("phase", &inner.phase)
            .field("bound", &self.is_bound())
            .finish()
    }
}

fn on_store_change(inner: &Rc<RefCell<ToggleInner>>, key: &str, value: &Value) {
    let Some(value) = value.as_bool() else {
        error!(
            "{}",
            StoreError::TypeMismatch {
                key: key.to_string(),
                expected: KeyType::Bool,
                actual: value.key_type(),
            }
        );
        return;
    };

    let widget = {
        let mut inner = inner.borrow_mut();
        match inner.phase {
            BinderPhase::LocalWriteInFlight { expected } if expected == value => {
                inner.phase = BinderPhase::Idle;
                return;
            }
            BinderPhase::LocalWriteInFlight { expected } => {
                debug!("{key}: expected echo {expected}, got {value}; taking {value}");
                inner.phase = BinderPhase::Idle;
            }
            BinderPhase::Idle => {}
        }
        inner.state.value = value;
        inner.widget.clone()
    };

    widget.borrow_mut().set_toggle_state(value);
}

/// What the preview widget shows. Replaced wholesale on every update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewState {
    /// As announced by the daemon.
    pub uri: Option<String>,
    /// `uri` with any `file://` scheme removed.
    pub next_file: Option<String>,
}

impl PreviewState {
    pub fn from_uri(uri: &str) -> Self {
        let next_file = uri.strip_prefix("file://").unwrap_or(uri).to_string();
        Self {
            uri: Some(uri.to_string()),
            next_file: Some(next_file),
        }
    }
}

struct PreviewInner {
    state: PreviewState,
    /// Set once any signal has been applied; the startup peek then loses.
    signal_seen: bool,
    widget: Rc<RefCell<dyn PreviewSurface>>,
}

/// One-way binding from the `next_file` signal to a [`PreviewSurface`].
pub struct PreviewBinder {
    inner: Rc<RefCell<PreviewInner>>,
    bus: BusClient,
    registry: Rc<SubscriptionRegistry>,
    subscription: Cell<Option<SubscriptionId>>,
    seed_call: Cell<Option<CallId>>,
}

impl PreviewBinder {
    pub fn bind(
        bus: &BusClient,
        registry: &Rc<SubscriptionRegistry>,
        widget: Rc<RefCell<dyn PreviewSurface>>,
    ) -> Self {
        widget.borrow_mut().show_preview(&PreviewState::default());

        let inner = Rc::new(RefCell::new(PreviewInner {
            state: PreviewState::default(),
            signal_seen: false,
            widget,
        }));

        let weak = Rc::downgrade(&inner);
        let subscription = bus.subscribe(NEXT_FILE_SIGNAL, move |uri| {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().signal_seen = true;
                apply_preview(&inner, PreviewState::from_uri(uri));
            }
        });
        let id = registry.register(subscription);

        let weak = Rc::downgrade(&inner);
        let seed = bus.call_peek_next(move |result: Result<String, BusError>| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(uri) => {
                    if inner.borrow().signal_seen {
                        debug!("Ignoring up_next result {uri}: a signal arrived first");
                    } else {
                        apply_preview(&inner, PreviewState::from_uri(&uri));
                    }
                }
                Err(e) => debug!("No initial preview: {e}"),
            }
        });

        Self {
            inner,
            bus: bus.clone(),
            registry: registry.clone(),
            subscription: Cell::new(Some(id)),
            seed_call: Cell::new(Some(seed)),
        }
    }

    pub fn state(&self) -> PreviewState {
        self.inner.borrow().state.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.subscription.get().is_some()
    }

    /// Opens the previewed file with the desktop's default handler. Returns
    /// the URI handed to the handler.
    pub fn activate(&self) -> Option<String> {
        let uri = self.inner.borrow().state.uri.clone();
        match uri {
            Some(uri) => {
                debug!("Opening {uri}");
                if let Err(e) = open::that_detached(&uri) {
                    warn!("Failed to open {uri}: {e}");
                }
                Some(uri)
            }
            None => {
                error!("No preview currently set");
                None
            }
        }
    }

    /// Stops listening. Safe to call more than once.
    pub fn unbind(&self) {
        if let Some(call) = self.seed_call.take() {
            self.bus.cancel(call);
        }
        if let Some(id) = self.subscription.take() {
            self.registry.release(id);
        }
    }
}

impl Drop for PreviewBinder {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl fmt::Debug for PreviewBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewBinder")
            .field("state", &self.inner.borrow().state)
            .field("bound", &self.is_bound())
            .finish()
    }
}

fn apply_preview(inner: &Rc<RefCell<PreviewInner>>, state: PreviewState) {
    debug!("Preview now {:?}", state.next_file);
    let widget = {
        let mut inner = inner.borrow_mut();
        inner.state = state.clone();
        inner.widget.clone()
    };
    widget.borrow_mut().show_preview(&state);
}
