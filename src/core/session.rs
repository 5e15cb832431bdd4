//! 同步会话管理
//!
//! 两个互相独立的槽位，各自有状态表、取消令牌和运行标记。所有事件通过
//! 同一个有序通道交给显示层。

use crate::config::{SyncOptions, ToolPaths};
use crate::core::orchestrator::{BatchSummary, Orchestrator};
use crate::core::runner::{CommandRunner, ProcessRunner};
use crate::core::status::{SlotId, SlotReporter, StatusBoard, SyncEvent};
use crate::core::strategy::Platform;
use crate::error::SyncError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 单个槽位的运行时状态
#[derive(Debug, Default)]
struct Slot {
    board: StatusBoard,
    busy: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Slot {
    fn current_token(&self) -> Option<CancellationToken> {
        match self.cancel.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace_token(&self, token: CancellationToken) {
        match self.cancel.lock() {
            Ok(mut guard) => *guard = Some(token),
            Err(poisoned) => *poisoned.into_inner() = Some(token),
        }
    }
}

/// 同步会话管理器
pub struct SyncSessionManager {
    orchestrator: Orchestrator,
    options: Arc<RwLock<SyncOptions>>,
    slots: [Slot; 2],
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncSessionManager {
    /// 使用系统进程和当前平台
    pub fn new(options: SyncOptions, tools: ToolPaths) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        Self::with_runner(options, tools, Arc::new(ProcessRunner), Platform::current())
    }

    pub fn with_runner(
        options: SyncOptions,
        tools: ToolPaths,
        runner: Arc<dyn CommandRunner>,
        platform: Platform,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            orchestrator: Orchestrator::new(runner, tools, platform),
            options: Arc::new(RwLock::new(options)),
            slots: Default::default(),
            tx,
        };
        (manager, rx)
    }

    fn slot(&self, slot: SlotId) -> &Slot {
        &self.slots[slot.index()]
    }

    pub async fn options(&self) -> SyncOptions {
        self.options.read().await.clone()
    }

    /// 之后的派发使用新选项，正在运行的派发不受影响
    pub async fn set_options(&self, options: SyncOptions) {
        *self.options.write().await = options;
    }

    pub fn is_running(&self, slot: SlotId) -> bool {
        self.slot(slot).busy.load(Ordering::SeqCst)
    }

    pub fn statuses(&self, slot: SlotId) -> Vec<String> {
        self.slot(slot).board.snapshot()
    }

    /// 派发一次同步；校验失败或槽位忙时立即返回错误，不修改任何状态
    pub async fn start(
        &self,
        slot: SlotId,
        source: &str,
        destinations: &[String],
    ) -> Result<JoinHandle<BatchSummary>, SyncError> {
        let state = self.slot(slot);
        if state
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SlotBusy(slot));
        }

        let options = self.options().await;
        let token = CancellationToken::new();
        let reporter = SlotReporter::new(slot, state.board.clone(), self.tx.clone());
        let batch = match self.orchestrator.prepare(
            reporter.clone(),
            source,
            destinations,
            options,
            token.clone(),
        ) {
            Ok(batch) => batch,
            Err(e) => {
                state.busy.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        // 每次派发使用新令牌，上一轮的取消不会带入
        state.replace_token(token);
        info!("槽位 {} 开始同步，run_id={}", slot, batch.run_id());

        let busy = state.busy.clone();
        Ok(tokio::spawn(async move {
            // 即使批次异常退出也要释放槽位并发送 Finished
            scopeguard::defer! {
                busy.store(false, Ordering::SeqCst);
                reporter.finished();
            }
            batch.run().await
        }))
    }

    /// 请求取消槽位当前的同步；无运行中的同步时不做任何事
    pub fn cancel(&self, slot: SlotId) {
        if !self.is_running(slot) {
            return;
        }
        match self.slot(slot).current_token() {
            Some(token) => {
                let _ = self.tx.send(SyncEvent::Output {
                    slot,
                    line: format!("Sync Option {} cancellation requested.", slot),
                });
                token.cancel();
            }
            None => warn!("槽位 {} 没有取消令牌", slot),
        }
    }

    pub fn cancel_all(&self) {
        for slot in SlotId::ALL {
            self.cancel(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runner::testing::{PanickingRunner, ScriptedRunner};

    fn manager() -> (SyncSessionManager, mpsc::UnboundedReceiver<SyncEvent>) {
        let tools = ToolPaths {
            rsync: "/nonexistent/bin/rsync".to_string(),
            ..ToolPaths::default()
        };
        SyncSessionManager::with_runner(
            SyncOptions::default(),
            tools,
            Arc::new(ScriptedRunner::default()),
            Platform::Posix,
        )
    }

    #[tokio::test]
    async fn test_validation_error_releases_slot() {
        let (manager, _rx) = manager();
        let err = manager
            .start(SlotId::One, "/src", &["".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoDestinations));
        assert!(!manager.is_running(SlotId::One));
        assert_eq!(manager.statuses(SlotId::One), vec![""; 4]);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let (manager, mut rx) = manager();
        manager.cancel(SlotId::Two);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_finished_event_after_batch() {
        let (manager, mut rx) = manager();
        let handle = manager
            .start(SlotId::Two, "/src", &["/nonexistent-dest".to_string()])
            .await
            .unwrap();
        let summary = handle.await.unwrap();
        assert_eq!(summary.results.len(), 1);
        assert!(!manager.is_running(SlotId::Two));

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(SyncEvent::Finished { slot: SlotId::Two }));
    }

    #[tokio::test]
    async fn test_worker_panic_still_finishes_slot() {
        let options = SyncOptions {
            simultaneous_sync: false,
            ..SyncOptions::default()
        };
        let (manager, mut rx) = SyncSessionManager::with_runner(
            options,
            ToolPaths::default(),
            Arc::new(PanickingRunner),
            Platform::Posix,
        );
        let handle = manager
            .start(SlotId::One, "/src", &["/a".to_string(), "/b".to_string()])
            .await
            .unwrap();
        let summary = handle.await.unwrap();

        assert!(!summary.all_completed());
        assert!(!manager.is_running(SlotId::One));
        assert_eq!(
            manager.statuses(SlotId::One),
            vec!["Failed (Error)", "Failed (Error)", "", ""]
        );

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(SyncEvent::Finished { slot: SlotId::One }));
    }
}
