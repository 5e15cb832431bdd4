//! 错误类型
//!
//! 只有调用方必须同步处理的错误才会出现在这里。单个传输任务的失败不是错误，
//! 它们以 `Failed` 状态和输出流消息的形式呈现。

use crate::core::SlotId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// 源目录为空
    #[error("Source directory must be selected.")]
    EmptySource,

    /// 没有任何非空目标目录
    #[error("At least one destination directory must be selected.")]
    NoDestinations,

    /// 槽位上一次同步尚未结束
    #[error("Sync Option {0} is already running")]
    SlotBusy(SlotId),

    /// 槽位编号不是 1 或 2
    #[error("Invalid sync slot: {0}")]
    InvalidSlot(u8),

    /// 设置文件内容不合法
    #[error("Settings error: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
