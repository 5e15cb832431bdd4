//! 槽位状态与事件通道
//!
//! 工作任务从不直接修改显示层：状态写入 `StatusBoard`，同时通过一个有序的
//! 无界通道把 `SyncEvent` 交给消费者（CLI 轮询器或其他前端）。

use crate::error::SyncError;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// 每个槽位的目标目录数
pub const DESTINATION_SLOTS: usize = 4;

pub const STATUS_PENDING: &str = "Pending";
pub const STATUS_IN_PROGRESS: &str = "In Progress";
pub const STATUS_COMPLETED: &str = "Completed";
pub const STATUS_CANCELLED: &str = "Cancelled";
pub const STATUS_SKIPPED: &str = "Skipped";
pub const STATUS_FAILED: &str = "Failed";
pub const STATUS_FAILED_ERROR: &str = "Failed (Error)";

/// 终止状态：Completed / Cancelled / Skipped / Failed（含 `Failed (code N)`）
pub fn is_terminal(status: &str) -> bool {
    status == STATUS_COMPLETED
        || status == STATUS_CANCELLED
        || status == STATUS_SKIPPED
        || status.starts_with(STATUS_FAILED)
}

/// 同步槽位编号（1 或 2）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SlotId {
    One,
    Two,
}

impl SlotId {
    pub const ALL: [SlotId; 2] = [SlotId::One, SlotId::Two];

    pub fn index(self) -> usize {
        match self {
            SlotId::One => 0,
            SlotId::Two => 1,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::One => write!(f, "1"),
            SlotId::Two => write!(f, "2"),
        }
    }
}

impl TryFrom<u8> for SlotId {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SlotId::One),
            2 => Ok(SlotId::Two),
            other => Err(SyncError::InvalidSlot(other)),
        }
    }
}

/// 发往显示层的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SyncEvent {
    /// 输出流中的一行（不含换行符）
    Output { slot: SlotId, line: String },
    /// 某个目标的状态变化
    Status {
        slot: SlotId,
        index: usize,
        status: String,
    },
    /// 槽位本次派发的所有任务均已结束
    Finished { slot: SlotId },
}

/// 一个槽位的状态表，长度固定为 `DESTINATION_SLOTS`
#[derive(Debug, Clone)]
pub struct StatusBoard {
    inner: Arc<Mutex<Vec<String>>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![String::new(); DESTINATION_SLOTS])),
        }
    }
}

impl StatusBoard {
    pub fn snapshot(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with_statuses<R>(&self, f: impl FnOnce(&mut Vec<String>) -> R) -> R {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// 槽位的唯一状态更新入口：写状态表并按序发送事件
#[derive(Debug, Clone)]
pub struct SlotReporter {
    slot: SlotId,
    board: StatusBoard,
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SlotReporter {
    pub fn new(slot: SlotId, board: StatusBoard, tx: mpsc::UnboundedSender<SyncEvent>) -> Self {
        Self { slot, board, tx }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// 追加一行到输出流
    pub fn output(&self, line: impl Into<String>) {
        // 消费者已退出时丢弃即可
        let _ = self.tx.send(SyncEvent::Output {
            slot: self.slot,
            line: line.into(),
        });
    }

    /// 更新某个目标的状态；终止状态不会被覆盖
    pub fn set_status(&self, index: usize, status: impl Into<String>) {
        let status = status.into();
        let changed = self.board.with_statuses(|statuses| match statuses.get_mut(index) {
            Some(current) if !is_terminal(current) => {
                *current = status.clone();
                true
            }
            _ => false,
        });
        if changed {
            let _ = self.tx.send(SyncEvent::Status {
                slot: self.slot,
                index,
                status,
            });
        }
    }

    /// 新一轮派发：活动目标置为 Pending，未使用的置空
    pub fn reset(&self, active: &[bool]) {
        let statuses: Vec<String> = (0..DESTINATION_SLOTS)
            .map(|i| {
                if active.get(i).copied().unwrap_or(false) {
                    STATUS_PENDING.to_string()
                } else {
                    String::new()
                }
            })
            .collect();

        self.board.with_statuses(|current| *current = statuses.clone());
        for (index, status) in statuses.into_iter().enumerate() {
            let _ = self.tx.send(SyncEvent::Status {
                slot: self.slot,
                index,
                status,
            });
        }
    }

    pub fn finished(&self) {
        let _ = self.tx.send(SyncEvent::Finished { slot: self.slot });
    }
}

/// 状态面板文本：`Dir N <status>`，跳过空状态
pub fn render_status_lines(statuses: &[String]) -> Vec<String> {
    statuses
        .iter()
        .enumerate()
        .filter(|(_, status)| !status.is_empty())
        .map(|(i, status)| format!("Dir {} {}", i + 1, status))
        .collect()
}
