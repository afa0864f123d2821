use std::path::PathBuf;

use directories::ProjectDirs;

const STORE_FILE: &str = "auth_records.json";

/// `<config dir>/usemcp/auth_records.json`, e.g. `~/.config/usemcp/auth_records.json`
/// on Linux. `None` when no home directory can be determined.
#[must_use]
pub fn default_store_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "usemcp").map(|dirs| dirs.config_dir().join(STORE_FILE))
}
