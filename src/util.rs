//! Small shared utilities: environment access, structural checks, file IO.
//!
//! Everything here fails through the crate's structured [`Error`] type with
//! the attachment labels boundary layers expect (the variable name, the
//! index and its bound, the path and mode of a failed open).

use std::fs::File;
use std::path::Path;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::errors::{labels, Error, ErrorKind, Result};

/// Reads an environment variable, failing if it is unset or empty.
pub fn get_environment_variable(name: &str) -> Result<String> {
    get_optional_environment_variable(name).ok_or_else(|| {
        Error::new(ErrorKind::MissingEnvironmentVariable).with_info(labels::VARIABLE_NAME, name)
    })
}

/// Reads an environment variable; an unset or empty variable is `None`.
pub fn get_optional_environment_variable(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

/// Sets (or, with an empty value, removes) an environment variable.
///
/// The process environment is global state; callers that run concurrently
/// must serialize through [`environment_lock`].
pub fn set_environment_variable(name: &str, value: &str) {
    unsafe {
        if value.is_empty() {
            std::env::remove_var(name);
        } else {
            std::env::set_var(name, value);
        }
    }
}

static ENVIRONMENT_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes mutations of the process environment (used by tests).
pub fn environment_lock() -> &'static Mutex<()> {
    &ENVIRONMENT_LOCK
}

/// Checks that `index` is strictly below `upper_bound`.
pub fn check_index_bounds(label: &str, index: usize, upper_bound: usize) -> Result<()> {
    if index < upper_bound {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::IndexOutOfBounds)
            .with_info(labels::INDEX_LABEL, label)
            .with_info(labels::INDEX_VALUE, index)
            .with_info(labels::INDEX_UPPER_BOUND, upper_bound))
    }
}

/// Checks that an actual array size matches the expected one.
pub fn check_array_size(expected_size: usize, actual_size: usize) -> Result<()> {
    if expected_size == actual_size {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::ArraySizeMismatch)
            .with_info(labels::EXPECTED_SIZE, expected_size)
            .with_info(labels::ACTUAL_SIZE, actual_size))
    }
}

/// Opens a file for reading, attaching the path and the system error on
/// failure.
pub fn open_file_for_reading(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| open_error(path, "read", &e))
}

/// Creates (or truncates) a file for writing.
pub fn open_file_for_writing(path: &Path) -> Result<File> {
    File::create(path).map_err(|e| open_error(path, "write", &e))
}

/// Reads a whole text file.
pub fn read_text_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| open_error(path, "read", &e))
}

fn open_error(path: &Path, mode: &'static str, error: &std::io::Error) -> Error {
    Error::new(ErrorKind::OpenFile)
        .with_info(labels::PATH, path.display())
        .with_info(labels::MODE, mode)
        .with_info(labels::SYSTEM_ERROR, error)
}
