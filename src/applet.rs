//! COSMIC Panel Applet Module
//!
//! Puts DeskChanger's controls in the COSMIC panel: the two rotation toggles,
//! a preview of the wallpaper the daemon will show next, Previous / Next
//! buttons, and a shortcut that opens the wallpaper on screen now.
//!
//! ## Architecture
//!
//! The applet process:
//! - Shows a panel icon with a popup for quick controls
//! - Runs one [`Session`] on a dedicated thread (the session's loop thread)
//! - Talks to that thread over `std::sync::mpsc` channels, in both directions
//!
//! The session thread owns the binders. Its widget adapters implement
//! [`Toggleable`] and [`PreviewSurface`] by sending [`PanelEvent`]s, so the UI
//! only ever sees plain values.

// --- COSMIC toolkit imports ---
use cosmic::app::{Core, Task};
use cosmic::iced::window::Id;
use cosmic::iced::{Length, Rectangle};
use cosmic::iced_runtime::core::window;
use cosmic::surface::action::{app_popup, destroy_popup};
use cosmic::widget::{self, text};
use cosmic::Element;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::background;
use crate::binder::{PreviewBinder, PreviewState, PreviewSurface, ToggleBinder, Toggleable};
use crate::config::PanelConfig;
use crate::error::BusError;
use crate::session::Session;
use crate::store::keys;

/// Application ID (must match desktop entry)
const APP_ID: &str = "io.github.desk_changer.Applet";

/// How often the UI drains events from the session thread.
const UI_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long the session thread waits on its loop before checking commands.
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Commands sent from the applet UI thread to the session thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelCommand {
    /// The user flipped the toggle bound to `key`
    SetToggle { key: &'static str, value: bool },
    /// Advance the rotation (history allowed)
    Next,
    /// Rewind the rotation by one
    Prev,
    /// Open the previewed file with the default handler
    OpenPreview,
    /// Close the session and end the thread
    Shutdown,
}

/// Events sent from the session thread back to the applet UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelEvent {
    /// A bound toggle's value, initial or changed
    Toggle { key: &'static str, value: bool },
    /// The upcoming wallpaper
    Preview(PreviewState),
    /// One-line outcome of the last Previous / Next
    Status(String),
    /// The session could not be opened; controls stay inert
    Degraded(String),
}

/// A toggle widget living on the UI thread, reached through the event channel.
struct ToggleAdapter {
    key: &'static str,
    events: Sender<PanelEvent>,
}

impl Toggleable for ToggleAdapter {
    fn set_toggle_state(&mut self, value: bool) {
        let _ = self.events.send(PanelEvent::Toggle {
            key: self.key,
            value,
        });
    }
}

struct PreviewAdapter {
    events: Sender<PanelEvent>,
}

impl PreviewSurface for PreviewAdapter {
    fn show_preview(&mut self, state: &PreviewState) {
        let _ = self.events.send(PanelEvent::Preview(state.clone()));
    }
}

/// All possible user interactions and system events in the applet.
#[derive(Debug, Clone)]
pub enum Message {
    /// Timer tick: drain events from the session thread.
    PollEvents,
    /// The compositor closed our popup window.
    PopupClosed(Id),
    /// Internal message for creating/destroying popup surfaces.
    Surface(cosmic::surface::Action),
    /// User flipped the "Auto Rotate" switch.
    ToggleAutoRotate(bool),
    /// User flipped the "Notifications" switch.
    ToggleNotifications(bool),
    /// User clicked "Next".
    Next,
    /// User clicked "Previous".
    Prev,
    /// User clicked the preview.
    OpenPreview,
    /// User clicked "Open Current Wallpaper".
    OpenCurrent,
}

/// The DeskChanger panel applet.
///
/// Everything shown here is a copy of state owned by the session thread,
/// refreshed by `PollEvents`.
pub struct DeskChangerApplet {
    /// Core COSMIC framework state
    core: Core,
    /// The ID of the currently open popup, or None if no popup is shown.
    popup: Option<Id>,

    // --- State synced from the session thread ---
    auto_rotate: bool,
    notifications: bool,
    /// Local path (or URI) of the wallpaper up next
    preview: Option<String>,
    /// Status text shown in the popup
    status: String,
    /// Why the session could not be opened, if it could not
    degraded: Option<String>,

    // --- Communication channels with the session thread ---
    cmd_tx: Sender<PanelCommand>,
    event_rx: Receiver<PanelEvent>,
}

impl cosmic::Application for DeskChangerApplet {
    type Executor = cosmic::SingleThreadExecutor;
    type Flags = ();
    type Message = Message;

    /// Must match the .desktop file name for COSMIC to find this applet
    const APP_ID: &'static str = APP_ID;

    fn core(&self) -> &Core {
        &self.core
    }

    fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    /// Creates the channels and starts the session thread.
    ///
    /// The session is not `Send`, so it is opened on the thread that will
    /// run it. A failure to open shows up as a `Degraded` event on the first
    /// poll.
    fn init(core: Core, _flags: Self::Flags) -> (Self, Task<Self::Message>) {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let (event_tx, event_rx) = std::sync::mpsc::channel();

        let config = PanelConfig::load();
        let thread_events = event_tx.clone();
        let spawned = std::thread::Builder::new()
            .name("desk-changer-session".into())
            .spawn(move || match Session::open(&config) {
                Ok(session) => run_session(session, cmd_rx, thread_events),
                Err(e) => {
                    error!("Failed to open session: {e}");
                    let _ = thread_events.send(PanelEvent::Degraded(e.to_string()));
                }
            });
        if let Err(e) = spawned {
            error!("Failed to start session thread: {e}");
            let _ = event_tx.send(PanelEvent::Degraded(e.to_string()));
        }

        let applet = Self {
            core,
            popup: None,
            auto_rotate: false,
            notifications: false,
            preview: None,
            status: "Ready".to_string(),
            degraded: None,
            cmd_tx,
            event_rx,
        };

        (applet, Task::none())
    }

    fn on_close_requested(&self, id: window::Id) -> Option<Message> {
        Some(Message::PopupClosed(id))
    }

    fn update(&mut self, message: Self::Message) -> Task<Self::Message> {
        match message {
            Message::PollEvents => {
                while let Ok(event) = self.event_rx.try_recv() {
                    self.apply_event(event);
                }
            }

            Message::PopupClosed(id) => {
                if self.popup == Some(id) {
                    self.popup = None;
                }
            }

            Message::Surface(action) => {
                return cosmic::task::message(cosmic::Action::Cosmic(
                    cosmic::app::Action::Surface(action),
                ));
            }

            Message::ToggleAutoRotate(value) => {
                // Shown immediately; the binder swallows the echo.
                self.auto_rotate = value;
                self.send(PanelCommand::SetToggle {
                    key: keys::AUTO_ROTATE,
                    value,
                });
            }

            Message::ToggleNotifications(value) => {
                self.notifications = value;
                self.send(PanelCommand::SetToggle {
                    key: keys::NOTIFICATIONS,
                    value,
                });
            }

            Message::Next => self.send(PanelCommand::Next),
            Message::Prev => self.send(PanelCommand::Prev),
            Message::OpenPreview => self.send(PanelCommand::OpenPreview),

            // Needs only the desktop's config, so it works without a session.
            Message::OpenCurrent => {
                self.status = match background::open_current_wallpaper() {
                    Ok(path) => format!("Opened {path}"),
                    Err(e) => {
                        warn!("{e}");
                        e
                    }
                };
            }
        }

        Task::none()
    }

    fn subscription(&self) -> cosmic::iced::Subscription<Self::Message> {
        cosmic::iced::time::every(UI_POLL_INTERVAL).map(|_| Message::PollEvents)
    }

    /// The panel icon; clicking it toggles the popup.
    fn view(&self) -> Element<'_, Message> {
        let icon: Element<Message> = widget::icon::from_name("preferences-desktop-wallpaper-symbolic")
            .symbolic(true)
            .into();

        let have_popup = self.popup;
        let btn = self
            .core
            .applet
            .button_from_element(icon, true)
            .on_press_with_rectangle(move |offset, bounds| {
                if let Some(id) = have_popup {
                    Message::Surface(destroy_popup(id))
                } else {
                    Message::Surface(app_popup::<DeskChangerApplet>(
                        move |state: &mut DeskChangerApplet| {
                            let new_id = Id::unique();
                            state.popup = Some(new_id);

                            let popup_width = 320u32;
                            let popup_height = 340u32;

                            let mut popup_settings = state.core.applet.get_popup_settings(
                                state.core.main_window_id().unwrap(),
                                new_id,
                                Some((popup_width, popup_height)),
                                None,
                                None,
                            );
                            popup_settings.positioner.anchor_rect = Rectangle {
                                x: (bounds.x - offset.x) as i32,
                                y: (bounds.y - offset.y) as i32,
                                width: bounds.width as i32,
                                height: bounds.height as i32,
                            };
                            popup_settings
                        },
                        Some(Box::new(|state: &DeskChangerApplet| {
                            Element::from(state.core.applet.popup_container(
                                state.popup_content(),
                            ))
                            .map(cosmic::Action::App)
                        })),
                    ))
                }
            });

        let tooltip = if self.degraded.is_some() {
            "DeskChanger (unavailable)".to_string()
        } else if self.auto_rotate {
            "DeskChanger (rotating)".to_string()
        } else {
            "DeskChanger (paused)".to_string()
        };

        Element::from(self.core.applet.applet_tooltip::<Message>(
            btn,
            tooltip,
            self.popup.is_some(),
            |a| Message::Surface(a),
            None,
        ))
    }

    /// Popups are rendered through the `app_popup()` closure instead.
    fn view_window(&self, _id: Id) -> Element<'_, Message> {
        "".into()
    }

    fn style(&self) -> Option<cosmic::iced_runtime::Appearance> {
        Some(cosmic::applet::style())
    }
}

impl Drop for DeskChangerApplet {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(PanelCommand::Shutdown);
    }
}

impl DeskChangerApplet {
    fn send(&self, command: PanelCommand) {
        if self.degraded.is_some() {
            return;
        }
        if self.cmd_tx.send(command).is_err() {
            warn!("Session thread is gone; command dropped");
        }
    }

    fn apply_event(&mut self, event: PanelEvent) {
        match event {
            PanelEvent::Toggle { key, value } => match key {
                keys::AUTO_ROTATE => self.auto_rotate = value,
                keys::NOTIFICATIONS => self.notifications = value,
                other => warn!("Event for unbound toggle {other}"),
            },
            PanelEvent::Preview(state) => self.preview = state.next_file,
            PanelEvent::Status(status) => self.status = status,
            PanelEvent::Degraded(reason) => {
                self.status = format!("Unavailable: {reason}");
                self.degraded = Some(reason);
            }
        }
    }

    /// Builds the popup flyout content.
    ///
    /// ```text
    /// ┌──────────────────────────────┐
    /// │ DeskChanger                  │
    /// │ ──────────────────────────── │
    /// │ Next Wallpaper               │
    /// │ [/path/to/next.jpg]          │  ← opens the file
    /// │ [Previous]            [Next] │
    /// │ status line                  │
    /// │ [Open Current Wallpaper]     │
    /// │ ──────────────────────────── │
    /// │ Auto Rotate        [toggle]  │
    /// │ Notifications      [toggle]  │
    /// └──────────────────────────────┘
    /// ```
    fn popup_content(&self) -> widget::Column<'_, Message> {
        use cosmic::iced::widget::{column, container, horizontal_space, row, Space};
        use cosmic::iced::{Alignment, Color};

        let live = self.degraded.is_none();

        let title_row = row![text::body("DeskChanger"), horizontal_space()]
            .spacing(8)
            .align_y(Alignment::Center);

        let preview_label = self.preview.as_deref().unwrap_or("(nothing queued)");
        let preview_btn: Element<Message> = if live && self.preview.is_some() {
            widget::button::standard(preview_label)
                .on_press(Message::OpenPreview)
                .into()
        } else {
            widget::button::standard(preview_label).into()
        };
        let preview_section = column![text::caption("Next Wallpaper"), preview_btn].spacing(4);

        let (prev_btn, next_btn): (Element<Message>, Element<Message>) = if live {
            (
                widget::button::standard("Previous")
                    .on_press(Message::Prev)
                    .into(),
                widget::button::suggested("Next").on_press(Message::Next).into(),
            )
        } else {
            (
                widget::button::standard("Previous").into(),
                widget::button::suggested("Next").into(),
            )
        };
        let nav_row = row![prev_btn, horizontal_space(), next_btn]
            .spacing(8)
            .align_y(Alignment::Center);

        let status_text = text::caption(&self.status);

        let open_current = widget::button::standard("Open Current Wallpaper")
            .on_press(Message::OpenCurrent);

        let mut auto_rotate = widget::toggler(self.auto_rotate);
        let mut notifications = widget::toggler(self.notifications);
        if live {
            auto_rotate = auto_rotate.on_toggle(Message::ToggleAutoRotate);
            notifications = notifications.on_toggle(Message::ToggleNotifications);
        }

        let auto_rotate_row = row![text::body("Auto Rotate"), horizontal_space(), auto_rotate]
            .spacing(8)
            .align_y(Alignment::Center);
        let notifications_row = row![
            text::body("Notifications"),
            horizontal_space(),
            notifications,
        ]
        .spacing(8)
        .align_y(Alignment::Center);

        let divider = || {
            container(Space::new(Length::Fill, Length::Fixed(1.0))).style(
                |theme: &cosmic::Theme| {
                    let cosmic = theme.cosmic();
                    container::Style {
                        background: Some(cosmic::iced::Background::Color(Color::from(
                            cosmic.palette.neutral_5,
                        ))),
                        ..Default::default()
                    }
                },
            )
        };

        column![
            title_row,
            divider(),
            preview_section,
            nav_row,
            status_text,
            open_current,
            divider(),
            auto_rotate_row,
            notifications_row,
        ]
        .spacing(8)
        .padding(12)
    }
}

/// Runs `session` until `Shutdown` arrives or the UI goes away.
///
/// Binds the two toggles and the preview to adapters that forward every
/// render to `event_tx`, then alternates between routing loop events and
/// handling commands from the UI.
fn run_session(session: Session, cmd_rx: Receiver<PanelCommand>, event_tx: Sender<PanelEvent>) {
    let mut toggles: Vec<ToggleBinder> = Vec::new();
    for key in [keys::AUTO_ROTATE, keys::NOTIFICATIONS] {
        let adapter = Rc::new(RefCell::new(ToggleAdapter {
            key,
            events: event_tx.clone(),
        }));
        match session.bind_toggle(key, adapter) {
            Ok(binder) => toggles.push(binder),
            Err(e) => error!("Cannot bind {key}: {e}"),
        }
    }
    let preview = session.bind_preview(Rc::new(RefCell::new(PreviewAdapter {
        events: event_tx.clone(),
    })));
    info!("Panel session running");

    'session: loop {
        loop {
            match cmd_rx.try_recv() {
                Ok(PanelCommand::Shutdown) | Err(TryRecvError::Disconnected) => break 'session,
                Ok(command) => handle_command(&session, &toggles, &preview, &event_tx, command),
                Err(TryRecvError::Empty) => break,
            }
        }
        session.iterate(SESSION_POLL_INTERVAL);
    }

    preview.unbind();
    for toggle in &toggles {
        toggle.unbind();
    }
    session.close();
}

fn handle_command(
    session: &Session,
    toggles: &[ToggleBinder],
    preview: &PreviewBinder,
    event_tx: &Sender<PanelEvent>,
    command: PanelCommand,
) {
    match command {
        PanelCommand::SetToggle { key, value } => {
            match toggles.iter().find(|t| t.key() == key) {
                Some(toggle) => toggle.user_toggled(value),
                None => warn!("No toggle bound to {key}"),
            }
        }
        PanelCommand::Next => {
            let events = event_tx.clone();
            session.bus().call_next(true, move |result| {
                let _ = events.send(PanelEvent::Status(describe_result("Next", result)));
            });
        }
        PanelCommand::Prev => {
            let events = event_tx.clone();
            session.bus().call_prev(move |result| {
                let _ = events.send(PanelEvent::Status(describe_result("Previous", result)));
            });
        }
        PanelCommand::OpenPreview => {
            preview.activate();
        }
        PanelCommand::Shutdown => {}
    }
}

/// Status line for a finished Previous / Next.
fn describe_result(action: &str, result: Result<String, BusError>) -> String {
    match result {
        Ok(uri) => {
            let shown = PreviewState::from_uri(&uri).next_file.unwrap_or(uri);
            format!("{action}: {shown}")
        }
        Err(e) => format!("{action} failed: {e}"),
    }
}

/// Entry point for running the panel applet.
///
/// Called from main.rs when no command-line arguments are provided.
pub fn run_applet() -> cosmic::iced::Result {
    cosmic::applet::run::<DeskChangerApplet>(())
}
