///
/// tether Runtime Static Library
///
/// Everything compiled programs link against: the `extern "C"` surface of
/// the threading primitives, status codes, and the runtime entry points.
///
/// Contains:
/// - `tether_runtime_init` / `tether_runtime_shutdown`
/// - Mutex, semaphore, safepoint and foreign-thread functions via
///   tether-std-threads
/// - Status code functions via tether-std-core
///
/// Startup reads `tether.toml` (or the defaults), installs logging, and
/// initializes the thread registry. Threads cannot be created before that.
///

use std::ffi::{c_char, CStr};
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use tether_std_core::*;
pub use tether_std_threads::*;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Invalid runtime configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration path is not valid UTF-8")]
    InvalidPath,
}

impl RuntimeError {
    pub fn status_code(&self) -> i64 {
        match self {
            RuntimeError::Config(_) | RuntimeError::InvalidPath => STATUS_INVALID_ARGUMENT,
        }
    }
}

/// Configuration at `path`; without a path, `tether.toml` in the working
/// directory if there is one, else the defaults.
pub fn resolve_config(path: Option<&Path>) -> Result<RuntimeConfig, RuntimeError> {
    if let Some(path) = path {
        return Ok(load_config(path)?);
    }
    let local = Path::new(CONFIG_FILE_NAME);
    if local.is_file() {
        return Ok(load_config(local)?);
    }
    Ok(RuntimeConfig::default())
}

/// Install logging and initialize the thread registry. Returns false when
/// the runtime was already initialized.
pub fn init_runtime(config: &RuntimeConfig) -> Result<bool, RuntimeError> {
    config.validate()?;
    let logging = init_logging(&config.logging);
    let fresh = registry::init(config);
    tracing::debug!(logging, fresh, "runtime initialized");
    Ok(fresh)
}

/// Tear down the thread registry. Returns how many live records it held.
pub fn shutdown_runtime() -> usize {
    registry::teardown()
}

/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn config_path(ptr: *const c_char) -> Result<Option<PathBuf>, RuntimeError> {
    if ptr.is_null() {
        return Ok(None);
    }
    let path = unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| RuntimeError::InvalidPath)?;
    Ok(Some(PathBuf::from(path)))
}

/// Initialize the runtime. `config_path` may be null. Returns 1 on success,
/// 0 on a configuration error.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_runtime_init(config_path_ptr: *const c_char) -> i64 {
    let result = unsafe { config_path(config_path_ptr) }
        .and_then(|path| resolve_config(path.as_deref()))
        .and_then(|config| init_runtime(&config));

    match result {
        Ok(_) => {
            set_status(STATUS_OK);
            1
        }
        Err(err) => {
            eprintln!("tether: {}", err);
            set_status(err.status_code());
            0
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_runtime_shutdown() -> i64 {
    shutdown_runtime() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_config_from_path() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[mutex]\nspin_limit = 7\n").expect("Failed to write config");

        let config = resolve_config(Some(&path)).unwrap();
        assert_eq!(config.mutex.spin_limit, 7);
        assert_eq!(config.threads, ThreadsConfig::default());
    }

    #[test]
    fn test_resolve_config_errors() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let missing = temp_dir.path().join("missing.toml");
        assert!(matches!(
            resolve_config(Some(&missing)),
            Err(RuntimeError::Config(ConfigError::Read { .. }))
        ));

        let invalid = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&invalid, "[threads]\nstack_size = 1\n").expect("Failed to write config");
        let err = resolve_config(Some(&invalid)).unwrap_err();
        assert_eq!(err.status_code(), STATUS_INVALID_ARGUMENT);
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let mut config = RuntimeConfig::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(init_runtime(&config), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_config_path_from_c_string() {
        unsafe {
            assert_eq!(config_path(std::ptr::null()).unwrap(), None);
            assert_eq!(
                config_path(c"/etc/tether.toml".as_ptr()).unwrap(),
                Some(PathBuf::from("/etc/tether.toml"))
            );
            let bad = [0xffu8, 0];
            assert!(matches!(
                config_path(bad.as_ptr() as *const c_char),
                Err(RuntimeError::InvalidPath)
            ));
        }
    }
}
