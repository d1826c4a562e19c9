//! # DeskChanger Applet
//!
//! A COSMIC panel applet for the DeskChanger wallpaper-rotation daemon. It
//! shows what the daemon will display next, lets the user step the rotation
//! back and forth, and keeps the "Auto Rotate" / "Notifications" switches in
//! sync with the settings file the daemon reads.
//!
//! ## Architecture
//! - `applet.rs` - COSMIC panel applet with popup controls
//! - `session.rs` - one enable/disable cycle: store + bus client + registry
//! - `binder.rs` - keeps a toggle or the preview in sync with a key or signal
//! - `store.rs` - typed, watched access to the shared settings file
//! - `schema.rs` - settings schema (key names, types, defaults)
//! - `dbus_client.rs` - client for the daemon's D-Bus interface
//! - `registry.rs` - owns every subscription, releases each exactly once
//! - `event_loop.rs` - the session thread's event queue
//! - `config.rs` - the applet's own configuration
//! - `background.rs` - the wallpaper currently on the desktop
//!
//! ## CLI Usage
//! - No arguments: Run as COSMIC panel applet
//! - `--next`, `--prev`, `--up-next`: one-shot calls to the daemon
//! - `--get KEY`, `--set KEY VALUE`, `--profiles`: read/write settings
//! - `--add-path PROFILE URI`: add a wallpaper location to a profile
//! - `--watch`: log settings changes and `next_file` signals
//! - `--status`: is the daemon on the bus
//! - `--current`: print the wallpaper the desktop is showing
//! - `--help`, `-h`: Show help message

mod applet;      // COSMIC panel applet (lives in the panel bar, shows popup on click)
mod background;  // Reads the wallpaper COSMIC is showing now
mod binder;      // Toggle and preview binders, the widgets' view of the session
mod config;      // Applet configuration (bus, daemon names, schema search path)
mod dbus_client; // D-Bus client for the rotation daemon
mod error;       // Error types for the store, the bus and sessions
mod event_loop;  // Event queue drained by the session thread
mod registry;    // Subscription registry
mod schema;      // Settings schema and typed values
mod session;     // Session open/close
mod store;       // Settings store shared with the daemon

#[cfg(test)]
mod test_support;

use std::cell::RefCell;
use std::error::Error;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::dbus_client::{BusClient, DaemonCall, NEXT_FILE_SIGNAL};
use crate::error::BusError;
use crate::event_loop::{LoopEvent, MainLoop};
use crate::schema::Value;
use crate::session::Session;
use crate::store::{ConfigStore, Profile};

/// How long a one-shot CLI call waits for the daemon.
const CLI_CALL_TIMEOUT: Duration = Duration::from_secs(10);

type CliResult = Result<(), Box<dyn Error>>;

/// Application entry point. Dispatches on the first argument; with none,
/// runs the panel applet.
fn main() -> cosmic::iced::Result {
    let config = config::PanelConfig::load_or_init();
    init_logging(&config);

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        let result = match args[1].as_str() {
            "--next" | "-n" => remote_call(&config, DaemonCall::Next { history: true }),
            "--prev" | "-p" => remote_call(&config, DaemonCall::Prev),
            "--up-next" | "-u" => remote_call(&config, DaemonCall::UpNext),
            "--get" => match args.get(2) {
                Some(key) => get_key(&config, key),
                None => Err("--get needs a KEY".into()),
            },
            "--set" => match (args.get(2), args.get(3)) {
                (Some(key), Some(value)) => set_key(&config, key, value),
                _ => Err("--set needs a KEY and a VALUE".into()),
            },
            "--profiles" => list_profiles(&config),
            "--add-path" => match (args.get(2), args.get(3)) {
                (Some(profile), Some(uri)) => add_path(&config, profile, uri),
                _ => Err("--add-path needs a PROFILE and a URI".into()),
            },
            "--watch" | "-w" => watch(&config),
            "--status" => status(&config),
            "--current" => current_wallpaper(),
            "--help" | "-h" => {
                print_help(&args[0]);
                Ok(())
            }
            "--version" | "-v" => {
                println!("desk-changer-applet {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
            _ => {
                eprintln!("Unknown argument: {}", args[1]);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        };

        if let Err(e) = result {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        Ok(())
    } else {
        applet::run_applet()
    }
}

/// Installs the global `tracing` subscriber. `LOG_LEVEL` overrides the
/// configured level.
fn init_logging(config: &config::PanelConfig) {
    let log_level = match std::env::var("LOG_LEVEL") {
        Ok(level) => level.parse().unwrap_or(Level::INFO),
        Err(_) => config.log_level(),
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {e}");
    }
}

/// Prints help message
fn print_help(program: &str) {
    println!("DeskChanger panel applet\n");
    println!("Usage: {} [OPTIONS]\n", program);
    println!("Options:");
    println!("  (none)              Run as COSMIC panel applet");
    println!("  --next, -n          Advance to the next wallpaper");
    println!("  --prev, -p          Go back one wallpaper");
    println!("  --up-next, -u       Show which wallpaper is up next");
    println!("  --get KEY           Print a setting");
    println!("  --set KEY VALUE     Change a setting");
    println!("  --profiles          List profiles (* marks the active one)");
    println!("  --add-path P URI    Add a wallpaper location to profile P");
    println!("  --watch, -w         Log setting changes and wallpaper changes");
    println!("  --status            Check whether the daemon is running");
    println!("  --current           Print the wallpaper on the desktop now");
    println!("  --version, -v       Show version information");
    println!("  --help, -h          Show this help message");
    println!();
    println!("Configuration: ~/.config/desk-changer-applet/config.json");
    println!("Set LOG_LEVEL=debug for more output.");
}

fn connect_bus(config: &config::PanelConfig, main_loop: &MainLoop) -> Result<BusClient, Box<dyn Error>> {
    Ok(BusClient::connect(
        &config.bus,
        &config.service_name,
        &config.object_path,
        &config.interface_name,
        main_loop.sender(),
    )?)
}

fn open_store(config: &config::PanelConfig, main_loop: &MainLoop) -> Result<ConfigStore, Box<dyn Error>> {
    Ok(ConfigStore::open(
        &config.schema_id,
        &config.schema_search_path(),
        main_loop.sender(),
    )?)
}

/// Makes one call to the daemon and prints the URI it returns.
fn remote_call(config: &config::PanelConfig, call: DaemonCall) -> CliResult {
    let main_loop = MainLoop::new();
    let bus = connect_bus(config, &main_loop)?;

    let outcome = Rc::new(RefCell::new(None));
    let sink = outcome.clone();
    let done = move |result: Result<String, BusError>| *sink.borrow_mut() = Some(result);
    let id = match call {
        DaemonCall::Next { history } => bus.call_next(history, done),
        DaemonCall::Prev => bus.call_prev(done),
        DaemonCall::UpNext => bus.call_peek_next(done),
    };

    let deadline = Instant::now() + CLI_CALL_TIMEOUT;
    while outcome.borrow().is_none() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            bus.cancel(id);
            bus.close();
            return Err(format!("{}() timed out", call.method()).into());
        }
        if let Some(LoopEvent::CallComplete { call, result }) = main_loop.next_timeout(left) {
            bus.handle_call_complete(call, result);
        }
    }

    let result = outcome.borrow_mut().take();
    bus.close();
    match result {
        Some(Ok(uri)) => {
            println!("{uri}");
            Ok(())
        }
        Some(Err(e)) => Err(e.into()),
        None => Ok(()),
    }
}

fn get_key(config: &config::PanelConfig, key: &str) -> CliResult {
    let main_loop = MainLoop::new();
    let store = open_store(config, &main_loop)?;
    println!("{}", store.get_value(key)?);
    store.close();
    Ok(())
}

/// Parses `raw` as the key's declared type and writes it.
fn set_key(config: &config::PanelConfig, key: &str, raw: &str) -> CliResult {
    let main_loop = MainLoop::new();
    let store = open_store(config, &main_loop)?;
    let key_type = store.schema().key(key)?.key_type;
    let value = Value::parse_as(key_type, raw)
        .ok_or_else(|| format!("cannot parse '{raw}' as {key_type} for '{key}'"))?;
    store.set(key, value)?;
    store.close();
    Ok(())
}

fn list_profiles(config: &config::PanelConfig) -> CliResult {
    let main_loop = MainLoop::new();
    let store = open_store(config, &main_loop)?;
    let record = store.record()?;
    store.close();

    let active = record.active_profile().map(|p| p.name.as_str());
    for profile in &record.profiles {
        let marker = if active == Some(profile.name.as_str()) { "*" } else { " " };
        println!("{marker} {}", profile.name);
        for path in &profile.paths {
            println!("      {path}");
        }
    }
    println!();
    println!(
        "interval {}s, auto-rotate {}, random {}",
        record.interval, record.auto_rotate, record.random
    );
    Ok(())
}

/// Adds `uri` to the profile named `name`, creating the profile if needed.
fn add_path(config: &config::PanelConfig, name: &str, uri: &str) -> CliResult {
    let main_loop = MainLoop::new();
    let store = open_store(config, &main_loop)?;
    let mut profiles = store.profiles()?;
    match profiles.iter_mut().find(|p| p.name == name) {
        Some(profile) => {
            profile.paths.insert(uri.to_string());
        }
        None => profiles.push(Profile {
            name: name.to_string(),
            paths: [uri.to_string()].into_iter().collect(),
        }),
    }
    store.set_profiles(&profiles)?;
    store.close();
    Ok(())
}

/// Runs a headless session that logs every change until interrupted.
fn watch(config: &config::PanelConfig) -> CliResult {
    let session = Session::open(config)?;

    session.registry().register(session.store().watch("*", |key, value| {
        info!("{key} = {value}");
    }));
    session
        .registry()
        .register(session.bus().subscribe(NEXT_FILE_SIGNAL, |uri| {
            info!("next_file {uri}");
        }));
    session.bus().call_peek_next(|result| match result {
        Ok(uri) => info!("up next: {uri}"),
        Err(e) => info!("up next unknown: {e}"),
    });

    match session.store().active_profile() {
        Some(profile) => info!("Active profile {} ({} locations)", profile.name, profile.paths.len()),
        None => info!("No active profile"),
    }
    info!("Watching {}; Ctrl+C to stop", session.store().values_path().display());
    loop {
        session.iterate(Duration::from_secs(1));
    }
}

fn current_wallpaper() -> CliResult {
    println!("{}", background::current_wallpaper()?);
    Ok(())
}

/// Reports whether the daemon currently owns its bus name.
fn status(config: &config::PanelConfig) -> CliResult {
    let main_loop = MainLoop::new();
    let bus = connect_bus(config, &main_loop)?;
    let running = bus.daemon_running()?;
    bus.close();

    if running {
        println!("{} is running on the {} bus", config.service_name, config.bus);
    } else {
        println!("{} is not running", config.service_name);
    }
    Ok(())
}
