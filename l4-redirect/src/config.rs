use std::{
    env,
    path::{Path, PathBuf},
};

pub const DEFAULT_STATE_DIR: &str = "~/.l4-redirect";
pub const ROUTES_FILE: &str = "routes.json";

/// Expands a leading `~` to `$HOME`. Paths without one are returned as is.
pub fn expand_path(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Routes file to use: `explicit` when given, else `<state_dir>/routes.json`.
pub fn routes_path(state_dir: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => expand_path(path),
        None => expand_path(state_dir).join(ROUTES_FILE),
    }
}
