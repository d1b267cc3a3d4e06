//! Configuration directory resolution.
//!
//! On POSIX systems this follows the XDG base-directory rules: the user dir
//! is `$XDG_CONFIG_HOME` when set and absolute, else `$HOME/.config`; the
//! system dirs come from `$XDG_CONFIG_DIRS` (colon-separated, absolute
//! entries only), defaulting to `/etc/xdg`. Relative candidates are
//! discarded everywhere. On Windows the per-user local app-data directory
//! takes the user slot.

use std::path::{Path, PathBuf};

use crate::errors::{labels, Error, ErrorKind, Result};
use crate::util::{get_environment_variable, get_optional_environment_variable};

/// The per-user configuration directory.
#[cfg(not(windows))]
pub fn user_config_dir() -> Result<PathBuf> {
    if let Some(dir) = get_optional_environment_variable("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.is_absolute() {
            return Ok(dir);
        }
    }
    Ok(PathBuf::from(get_environment_variable("HOME")?).join(".config"))
}

/// The per-user configuration directory.
#[cfg(windows)]
pub fn user_config_dir() -> Result<PathBuf> {
    Ok(PathBuf::from(get_environment_variable("LOCALAPPDATA")?))
}

/// System-wide configuration directories, highest priority first.
pub fn system_config_dirs() -> Vec<PathBuf> {
    let Some(dirs) = get_optional_environment_variable("XDG_CONFIG_DIRS") else {
        return vec![PathBuf::from("/etc/xdg")];
    };
    dirs.split(':')
        .map(PathBuf::from)
        .filter(|path| path.is_absolute())
        .collect()
}

/// Finds an existing config item by its path relative to the config dirs,
/// searching the user directory first, then the system directories.
pub fn find_config_item(relative_path: &Path) -> Option<PathBuf> {
    if let Ok(user_dir) = user_config_dir() {
        let candidate = user_dir.join(relative_path);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    for dir in system_config_dirs() {
        let candidate = dir.join(relative_path);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Creates a directory (and its parents) if it does not exist yet.
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        Error::new(ErrorKind::DirectoryCreation)
            .with_info(labels::PATH, path.display())
            .with_info(labels::SYSTEM_ERROR, e)
    })
}

#[cfg(all(test, not(windows)))]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::util::{environment_lock, set_environment_variable};

    #[test]
    fn xdg_user_config_dir() {
        let _guard = environment_lock().lock();

        set_environment_variable("HOME", "");
        set_environment_variable("XDG_CONFIG_HOME", "");
        assert_eq!(
            user_config_dir().unwrap_err().kind(),
            ErrorKind::MissingEnvironmentVariable
        );

        set_environment_variable("HOME", "/home");
        assert_eq!(user_config_dir().unwrap(), PathBuf::from("/home/.config"));

        // Relative XDG_CONFIG_HOME entries are discarded.
        set_environment_variable("XDG_CONFIG_HOME", "abc/def");
        assert_eq!(user_config_dir().unwrap(), PathBuf::from("/home/.config"));

        set_environment_variable("XDG_CONFIG_HOME", "/config");
        assert_eq!(user_config_dir().unwrap(), PathBuf::from("/config"));

        set_environment_variable("XDG_CONFIG_HOME", "");
        set_environment_variable("HOME", "");
    }

    #[test]
    fn xdg_system_config_dirs() {
        let _guard = environment_lock().lock();

        set_environment_variable("XDG_CONFIG_DIRS", "");
        assert_eq!(system_config_dirs(), vec![PathBuf::from("/etc/xdg")]);

        set_environment_variable("XDG_CONFIG_DIRS", "/etc/abc");
        assert_eq!(system_config_dirs(), vec![PathBuf::from("/etc/abc")]);

        set_environment_variable("XDG_CONFIG_DIRS", "/etc/abc:/def");
        assert_eq!(
            system_config_dirs(),
            vec![PathBuf::from("/etc/abc"), PathBuf::from("/def")]
        );

        // Relative entries are discarded.
        set_environment_variable("XDG_CONFIG_DIRS", "/etc/abc:de/f");
        assert_eq!(system_config_dirs(), vec![PathBuf::from("/etc/abc")]);

        set_environment_variable("XDG_CONFIG_DIRS", "");
    }

    #[test]
    fn config_item_search_prefers_the_user_dir() {
        let _guard = environment_lock().lock();

        let user = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        set_environment_variable("XDG_CONFIG_HOME", user.path().to_str().unwrap());
        set_environment_variable("XDG_CONFIG_DIRS", system.path().to_str().unwrap());

        let relative = Path::new("gantry/config.json");
        assert_eq!(find_config_item(relative), None);

        std::fs::create_dir_all(system.path().join("gantry")).unwrap();
        std::fs::write(system.path().join(relative), b"{}").unwrap();
        assert_eq!(
            find_config_item(relative),
            Some(system.path().join(relative))
        );

        std::fs::create_dir_all(user.path().join("gantry")).unwrap();
        std::fs::write(user.path().join(relative), b"{}").unwrap();
        assert_eq!(find_config_item(relative), Some(user.path().join(relative)));

        set_environment_variable("XDG_CONFIG_HOME", "");
        set_environment_variable("XDG_CONFIG_DIRS", "");
    }
}
