//! # Desktop Background
//!
//! Finds the image the COSMIC desktop is showing right now, which is not
//! necessarily the one DeskChanger last picked (the user may have set one by
//! hand). COSMIC keeps its background configuration as RON at
//! `~/.config/cosmic/com.system76.CosmicBackground/v1/all`:
//!
//! ```text
//! (
//!     output: "all",
//!     source: Path("/home/me/Pictures/beach.jpg"),
//!     ...
//! )
//! ```

use std::path::{Path, PathBuf};

/// COSMIC's background config for all outputs.
///
/// Uses `home_dir()` rather than `config_dir()`: inside Flatpak the latter
/// points into the sandbox, but cosmic-bg reads the host's `~/.config`.
pub fn background_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config/cosmic/com.system76.CosmicBackground/v1/all"))
}

/// The image file the desktop currently shows.
pub fn current_wallpaper() -> Result<String, String> {
    let path = background_config_path().ok_or("Could not find home directory")?;
    current_wallpaper_at(&path)
}

fn current_wallpaper_at(path: &Path) -> Result<String, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    source_path(&content).ok_or_else(|| "Desktop background is not an image".to_string())
}

/// Opens the current wallpaper with the default handler. Returns its path.
pub fn open_current_wallpaper() -> Result<String, String> {
    let path = current_wallpaper()?;
    open::that_detached(&path).map_err(|e| format!("Failed to open {path}: {e}"))?;
    Ok(path)
}

/// The file named by `source: Path("...")`. Color and gradient sources have
/// no file.
fn source_path(content: &str) -> Option<String> {
    let start = content.find("source:")? + "source:".len();
    let rest = content[start..]
        .trim_start()
        .strip_prefix("Path(")?
        .trim_start()
        .strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}
