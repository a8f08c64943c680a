use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};

fn app_root_override_lock() -> &'static RwLock<Option<PathBuf>> {
    static OVERRIDE: OnceLock<RwLock<Option<PathBuf>>> = OnceLock::new();
    OVERRIDE.get_or_init(|| RwLock::new(None))
}

fn app_root_override() -> Option<PathBuf> {
    let lock = app_root_override_lock();
    match lock.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub fn set_app_root_override(path: Option<PathBuf>) {
    let lock = app_root_override_lock();
    match lock.write() {
        Ok(mut guard) => *guard = path,
        Err(poisoned) => {
            let mut guard = poisoned.into_inner();
            *guard = path;
        }
    }
}

fn platform_app_root() -> PathBuf {
    if let Some(project_dirs) = ProjectDirs::from("", "", "vesper") {
        return project_dirs.data_dir().to_path_buf();
    }

    if let Some(base_dirs) = BaseDirs::new() {
        return base_dirs.data_local_dir().join("vesper");
    }

    std::env::temp_dir().join("vesper")
}

pub fn app_root() -> PathBuf {
    app_root_override().unwrap_or_else(platform_app_root)
}

pub fn default_db_path() -> String {
    app_root()
        .join("data")
        .join("assistant.db")
        .to_string_lossy()
        .to_string()
}

pub fn default_config_path() -> PathBuf {
    app_root().join("config.json")
}
