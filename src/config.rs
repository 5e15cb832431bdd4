//! 应用配置模块
//!
//! `SyncOptions` 是每次同步派发时使用的选项快照；`SyncSettings` 是可导入/导出的
//! 设置文件（包含两个槽位的源和目标目录）。

use crate::core::{SlotId, DESTINATION_SLOTS};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 设置文件中的模块标识
pub const SETTINGS_MODULE: &str = "sync";

/// 同步选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// 多个目标同时同步（否则按顺序逐个同步）
    #[serde(rename = "simultaneous_sync_enabled", default = "default_true")]
    pub simultaneous_sync: bool,
    /// 快速模式：跳过校验和/时间戳比较，整文件传输
    #[serde(rename = "fast_sync_enabled", default = "default_true")]
    pub fast_sync: bool,
    /// 尝试提升进程优先级
    #[serde(rename = "use_higher_process_priority", default = "default_true")]
    pub higher_priority: bool,
    /// 使用系统 cp 代替 rsync
    #[serde(rename = "use_native_cp", default)]
    pub native_copy: bool,
    /// 校验和验证（rsync 3.2.0+ 使用 xxh64）
    #[serde(rename = "use_xxh64_checksum", default)]
    pub checksum_verification: bool,
    #[serde(default)]
    pub global_logging_enabled: bool,
    #[serde(rename = "logging_dest_enabled", default)]
    pub destination_logging_enabled: bool,
    /// 全局日志目录，空字符串表示当前工作目录
    #[serde(default)]
    pub global_log_dir: String,
    /// 取消时等待进程退出的宽限期（毫秒）
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// 状态刷新最小间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// cp 模式下轮询目标目录大小的间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// cp 模式下进程结束前显示的最大百分比
    #[serde(default = "default_polling_cap_percent")]
    pub polling_cap_percent: u8,
}

fn default_true() -> bool {
    true
}

fn default_terminate_grace_ms() -> u64 {
    5000
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_polling_cap_percent() -> u8 {
    99
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            simultaneous_sync: true,
            fast_sync: true,
            higher_priority: true,
            native_copy: false,
            checksum_verification: false,
            global_logging_enabled: false,
            destination_logging_enabled: false,
            global_log_dir: String::new(),
            terminate_grace_ms: default_terminate_grace_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            polling_cap_percent: default_polling_cap_percent(),
        }
    }
}

impl SyncOptions {
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// 轮询结果受状态刷新间隔限制，比它更频繁的 du 没有意义
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(self.progress_interval_ms).max(10))
    }

    /// 检查数值选项，返回所有错误描述
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.polling_cap_percent == 0 || self.polling_cap_percent > 100 {
            errors.push(format!(
                "polling_cap_percent must be between 1 and 100 (got {})",
                self.polling_cap_percent
            ));
        }
        if self.terminate_grace_ms == 0 {
            errors.push("terminate_grace_ms must be greater than 0".to_string());
        }
        errors
    }

    /// 从 config.json 的 `sync` 字段加载
    pub fn load(config_dir: &Path) -> Self {
        read_config_json(config_dir)
            .and_then(|config| config.get("sync").cloned())
            .and_then(|value| serde_json::from_value::<SyncOptions>(value).ok())
            .unwrap_or_default()
    }

    /// 写回 config.json 的 `sync` 字段，保留其他字段
    pub fn save(&self, config_dir: &Path) -> Result<()> {
        let mut config = read_config_json(config_dir).unwrap_or_else(|| serde_json::json!({}));
        config["sync"] = serde_json::to_value(self)?;
        fs::write(
            config_dir.join("config.json"),
            serde_json::to_string_pretty(&config)?,
        )?;
        Ok(())
    }
}

pub(crate) fn read_config_json(config_dir: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(config_dir.join("config.json")).ok()?;
    serde_json::from_str(&content).ok()
}

/// 外部程序路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    #[serde(default = "default_rsync")]
    pub rsync: String,
    #[serde(default = "default_cp")]
    pub cp: String,
    #[serde(default = "default_du")]
    pub du: String,
    #[serde(default = "default_nice")]
    pub nice: String,
}

fn default_rsync() -> String {
    "rsync".to_string()
}

fn default_cp() -> String {
    "cp".to_string()
}

fn default_du() -> String {
    "du".to_string()
}

fn default_nice() -> String {
    "nice".to_string()
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            rsync: default_rsync(),
            cp: default_cp(),
            du: default_du(),
            nice: default_nice(),
        }
    }
}

/// 可导入/导出的设置文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub module: String,
    #[serde(flatten)]
    pub options: SyncOptions,
    #[serde(default)]
    pub sync1_source: String,
    #[serde(default)]
    pub sync1_destinations: Vec<String>,
    #[serde(default)]
    pub sync2_source: String,
    #[serde(default)]
    pub sync2_destinations: Vec<String>,
    #[serde(default)]
    pub tools: ToolPaths,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            module: SETTINGS_MODULE.to_string(),
            options: SyncOptions::default(),
            sync1_source: String::new(),
            sync1_destinations: vec![String::new(); DESTINATION_SLOTS],
            sync2_source: String::new(),
            sync2_destinations: vec![String::new(); DESTINATION_SLOTS],
            tools: ToolPaths::default(),
        }
    }
}

impl SyncSettings {
    /// 读取设置文件，拒绝非 sync 模块的文件
    pub fn import(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| SyncError::Settings(format!("Could not read settings file: {}", e)))?;
        let mut settings: SyncSettings = serde_json::from_str(&content)
            .map_err(|e| SyncError::Settings(format!("Could not read settings file: {}", e)))?;

        if settings.module != SETTINGS_MODULE {
            return Err(SyncError::Settings(
                "The selected file is not a valid sync settings file.".to_string(),
            ));
        }

        let errors = settings.options.validate();
        if !errors.is_empty() {
            return Err(SyncError::Settings(format!(
                "The following errors were found:\n{}",
                errors.join("\n")
            )));
        }

        settings.normalize();
        tracing::info!("已导入设置文件: {}", path.display());
        Ok(settings)
    }

    /// 保存设置，文件名自动补上 `_sync` 后缀；返回实际写入的路径
    pub fn save(&self, path: &Path) -> Result<PathBuf> {
        let errors = self.options.validate();
        if !errors.is_empty() {
            return Err(SyncError::Settings(format!(
                "Cannot save due to the following errors:\n{}",
                errors.join("\n")
            )));
        }

        let mut settings = self.clone();
        settings.module = SETTINGS_MODULE.to_string();
        settings.normalize();

        let target = settings_file_name(path);
        fs::write(&target, serde_json::to_string_pretty(&settings)?)?;
        tracing::info!("已保存设置文件: {}", target.display());
        Ok(target)
    }

    /// 示例设置
    pub fn template() -> Self {
        Self {
            module: SETTINGS_MODULE.to_string(),
            options: SyncOptions {
                global_logging_enabled: true,
                destination_logging_enabled: true,
                global_log_dir: "/path/to/global/log/dir".to_string(),
                ..SyncOptions::default()
            },
            sync1_source: "/path/to/sync1/source".to_string(),
            sync1_destinations: vec![
                "/path/to/sync1/dest1".to_string(),
                "/path/to/sync1/dest2".to_string(),
                String::new(),
                String::new(),
            ],
            sync2_source: "/path/to/sync2/source".to_string(),
            sync2_destinations: vec![
                "/path/to/sync2/dest1".to_string(),
                "/path/to/sync2/dest2".to_string(),
                String::new(),
                String::new(),
            ],
            tools: ToolPaths::default(),
        }
    }

    /// 某个槽位的源目录和目标目录
    pub fn slot(&self, slot: SlotId) -> (&str, &[String]) {
        match slot {
            SlotId::One => (&self.sync1_source, &self.sync1_destinations),
            SlotId::Two => (&self.sync2_source, &self.sync2_destinations),
        }
    }

    pub fn set_slot(&mut self, slot: SlotId, source: String, destinations: Vec<String>) {
        let (src, dests) = match slot {
            SlotId::One => (&mut self.sync1_source, &mut self.sync1_destinations),
            SlotId::Two => (&mut self.sync2_source, &mut self.sync2_destinations),
        };
        *src = source;
        *dests = destinations;
        self.normalize();
    }

    /// 去除首尾空白，目标列表补齐/截断到固定槽位数
    fn normalize(&mut self) {
        for source in [&mut self.sync1_source, &mut self.sync2_source] {
            *source = source.trim().to_string();
        }
        for dests in [&mut self.sync1_destinations, &mut self.sync2_destinations] {
            dests.resize(DESTINATION_SLOTS, String::new());
            for dest in dests.iter_mut() {
                *dest = dest.trim().to_string();
            }
        }
    }
}

/// `foo.json` -> `foo_sync.json`，`foo` -> `foo_sync`
pub fn settings_file_name(path: &Path) -> PathBuf {
    let suffix = format!("_{}", SETTINGS_MODULE);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let renamed = match file_name.strip_suffix(".json") {
        Some(base) if base.ends_with(&suffix) => file_name.clone(),
        Some(base) => format!("{}{}.json", base, suffix),
        None if file_name.ends_with(&suffix) => file_name.clone(),
        None => format!("{}{}", file_name, suffix),
    };

    path.with_file_name(renamed)
}
