use std::path::PathBuf;

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;

pub use config::{SyncOptions, SyncSettings, ToolPaths};
pub use core::{SlotId, SyncEvent, SyncSessionManager};
pub use error::{Result, SyncError};

/// 应用配置目录：`<系统配置目录>/ditsync`，不可用时为 `./.ditsync`
pub fn app_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("ditsync"))
        .unwrap_or_else(|| PathBuf::from(".ditsync"))
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
