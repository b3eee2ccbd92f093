// Keyfile helpers

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reads a keyfile's raw contents; swappable so tests can observe reads
pub type KeyfileReader = Arc<dyn Fn(&Path) -> std::io::Result<String> + Send + Sync>;

pub fn default_reader() -> KeyfileReader {
    Arc::new(|path: &Path| std::fs::read_to_string(path))
}

/// Run `reader` on the blocking pool and wait for it
pub async fn read_blocking(reader: &KeyfileReader, path: &Path) -> std::io::Result<String> {
    let reader = Arc::clone(reader);
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || reader(&path))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(trimmed));
    }
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(trimmed)
}

/// First non-empty line of a keyfile, trimmed
pub fn parse_key(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
