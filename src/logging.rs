//! 日志模块 - 诊断日志文件和大小轮转
//!
//! 与同步传输记录（`rsync_log*.txt`）无关：这里只记录程序自身的 tracing 输出。

use crate::config::read_config_json;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// 诊断日志文件名
pub const LOG_FILE_NAME: &str = "ditsync.log";

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// 日志配置，对应 config.json 的 `log` 字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件上限（MB），超过后轮转为 `.old`
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// "error" / "warn" / "info" / "debug" / "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn load(config_dir: &Path) -> Self {
        let mut config = read_config_json(config_dir)
            .and_then(|value| value.get("log").cloned())
            .and_then(|log| serde_json::from_value::<LogConfig>(log).ok())
            .unwrap_or_default();
        config.max_size_mb = config.max_size_mb.clamp(1, 100);
        config
    }

    /// 写回 `log` 字段，保留 config.json 中的其他字段
    pub fn save(&self, config_dir: &Path) -> crate::error::Result<()> {
        fs::create_dir_all(config_dir)?;
        let mut config = read_config_json(config_dir).unwrap_or_else(|| serde_json::json!({}));
        config["log"] = serde_json::to_value(self)?;
        fs::write(
            config_dir.join("config.json"),
            serde_json::to_string_pretty(&config)?,
        )?;
        Ok(())
    }

    /// 修改部分字段；级别无效时不做任何修改
    pub fn update(
        &mut self,
        enabled: Option<bool>,
        max_size_mb: Option<u32>,
        level: Option<&str>,
    ) -> crate::error::Result<()> {
        let level = match level {
            Some(l) => {
                let l = l.to_lowercase();
                if !VALID_LEVELS.contains(&l.as_str()) {
                    return Err(crate::error::SyncError::Settings(format!(
                        "无效的日志级别: {}",
                        l
                    )));
                }
                Some(l)
            }
            None => None,
        };

        if let Some(e) = enabled {
            self.enabled = e;
        }
        if let Some(size) = max_size_mb {
            self.max_size_mb = size.clamp(1, 100);
        }
        if let Some(l) = level {
            self.level = l;
        }
        Ok(())
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    pub fn max_size_bytes(&self) -> u64 {
        u64::from(self.max_size_mb.clamp(1, 100)) * 1024 * 1024
    }
}

/// 按大小轮转的日志文件
///
/// 由 `tracing_appender::non_blocking` 的后台线程独占，因此不需要加锁。
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    written: u64,
    file: File,
}

impl RotatingFile {
    pub fn open(log_dir: &Path, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(LOG_FILE_NAME);

        let existing = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if existing > max_size {
            rotate(&path)?;
        }

        let file = open_append(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            written,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotate_now(&mut self) -> io::Result<()> {
        self.file.flush()?;
        rotate(&self.path)?;
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// `ditsync.log` -> `ditsync.log.old`，旧备份被覆盖
fn rotate(path: &Path) -> io::Result<()> {
    let backup = path.with_extension("log.old");
    if backup.exists() {
        fs::remove_file(&backup)?;
    }
    fs::rename(path, &backup)
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        if self.written > self.max_size {
            self.rotate_now()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// 诊断日志目录：`<config_dir>/logs`
pub fn get_log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults_and_clamp() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(LogConfig::load(dir.path()), LogConfig::default());

        fs::write(
            dir.path().join("config.json"),
            r#"{"log": {"maxSizeMb": 500, "level": "DEBUG"}, "sync": {}}"#,
        )
        .unwrap();
        let config = LogConfig::load(dir.path());
        assert_eq!(config.max_size_mb, 100);
        assert!(config.enabled);
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_update_validates_level() {
        let mut config = LogConfig::default();
        assert!(config.update(Some(false), Some(0), Some("verbose")).is_err());
        assert_eq!(config, LogConfig::default());

        config.update(None, Some(0), Some("Trace")).unwrap();
        assert_eq!(config.max_size_mb, 1);
        assert_eq!(config.level, "trace");
    }

    #[test]
    fn test_save_keeps_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), r#"{"sync": {"use_native_cp": true}}"#).unwrap();

        let config = LogConfig {
            level: "warn".to_string(),
            ..LogConfig::default()
        };
        config.save(dir.path()).unwrap();

        let value = read_config_json(dir.path()).unwrap();
        assert_eq!(value["sync"]["use_native_cp"], true);
        assert_eq!(value["log"]["level"], "warn");
        assert_eq!(LogConfig::load(dir.path()), config);
    }

    #[test]
    fn test_rotates_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = RotatingFile::open(dir.path(), 64).unwrap();

        file.write_all(&[b'a'; 50]).unwrap();
        assert!(!dir.path().join("ditsync.log.old").exists());
        file.write_all(&[b'b'; 50]).unwrap();
        file.flush().unwrap();

        assert_eq!(fs::read(dir.path().join("ditsync.log.old")).unwrap().len(), 100);
        assert_eq!(fs::metadata(file.path()).unwrap().len(), 0);

        file.write_all(b"after rotation\n").unwrap();
        assert_eq!(
            fs::read_to_string(file.path()).unwrap(),
            "after rotation\n"
        );
    }

    #[test]
    fn test_oversized_file_rotated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE_NAME), vec![b'x'; 200]).unwrap();

        let file = RotatingFile::open(dir.path(), 100).unwrap();
        assert_eq!(fs::metadata(file.path()).unwrap().len(), 0);
        assert!(dir.path().join("ditsync.log.old").exists());
    }
}
