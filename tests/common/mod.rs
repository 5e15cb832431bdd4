//! 集成测试辅助：在临时目录里生成假的 rsync / du / cp 脚本

#![allow(dead_code)]

use ditsync_lib::config::{SyncOptions, ToolPaths};
use ditsync_lib::core::Platform;
use ditsync_lib::{SlotId, SyncEvent, SyncSessionManager};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// 取出源和目标（最后两个参数）
const ARGS_PRELUDE: &str = r#"prev=""
last=""
for a in "$@"; do prev="$last"; last="$a"; done
src="$prev"
dest="$last"
"#;

/// 一次成功的 rsync 传输输出
pub const RSYNC_OK: &str = r#"echo "sending incremental file list"
echo "A001/clip.mov"
printf '      1,024  50%%  1.00MB/s    0:00:01\r'
printf '      2,048 100%%  2.00MB/s    0:00:00 (xfr#1, to-chk=0/1)\n'
echo "sent 2,048 bytes  received 35 bytes  4,166.00 bytes/sec"
"#;

/// 开始后一直运行，直到被终止
pub const RSYNC_HANG: &str = r#"echo "sending incremental file list"
exec sleep 30
"#;

pub const RSYNC_VERSION: &str = "rsync  version 3.2.7  protocol version 31";

pub struct FakeTools {
    pub dir: TempDir,
    pub paths: ToolPaths,
}

impl FakeTools {
    /// `transfer` 是 rsync 真正传输时执行的脚本片段
    pub fn new(transfer: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let rsync = format!(
            "#!/bin/sh\ncase \"$1\" in\n  --version) echo \"{}\"; exit 0;;\n  --stats) echo \"Number of files: 1\"; echo \"Total file size: 2,048 bytes\"; exit 0;;\nesac\n{}{}",
            RSYNC_VERSION, ARGS_PRELUDE, transfer
        );
        let paths = ToolPaths {
            rsync: write_script(dir.path(), "rsync", &rsync),
            cp: write_script(
                dir.path(),
                "cp",
                &format!("#!/bin/sh\n{}sleep 1\nexit 0\n", ARGS_PRELUDE),
            ),
            du: write_script(dir.path(), "du", "#!/bin/sh\nprintf '2\\t%s\\n' \"$2\"\n"),
            nice: write_script(dir.path(), "nice", "#!/bin/sh\nexit 1\n"),
        };
        Self { dir, paths }
    }

    /// 让大小估算的两条路径都失败
    pub fn without_estimates(mut self) -> Self {
        self.paths.du = write_script(self.dir.path(), "du-broken", "#!/bin/sh\nexit 1\n");
        let rsync = fs::read_to_string(&self.paths.rsync)
            .unwrap()
            .replace("Total file size: 2,048 bytes", "garbage");
        self.paths.rsync = write_script(self.dir.path(), "rsync-nostats", &rsync);
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().to_string()
}

pub fn options() -> SyncOptions {
    SyncOptions {
        higher_priority: false,
        progress_interval_ms: 10,
        poll_interval_ms: 50,
        terminate_grace_ms: 2000,
        ..SyncOptions::default()
    }
}

pub fn manager(
    options: SyncOptions,
    tools: &FakeTools,
) -> (SyncSessionManager, mpsc::UnboundedReceiver<SyncEvent>) {
    SyncSessionManager::with_runner(
        options,
        tools.paths.clone(),
        Arc::new(ditsync_lib::core::ProcessRunner),
        Platform::Posix,
    )
}

/// 创建 n 个目标目录
pub fn destinations(root: &Path, n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            let dir = root.join(format!("dest{}", i + 1));
            fs::create_dir_all(&dir).unwrap();
            dir.to_string_lossy().to_string()
        })
        .collect()
}

pub fn source(root: &Path) -> PathBuf {
    let dir = root.join("A001");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("clip.mov"), vec![0u8; 2048]).unwrap();
    dir
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn output_lines(events: &[SyncEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Output { line, .. } => Some(line.clone()),
            _ => None,
        })
        .collect()
}

pub fn statuses_for(events: &[SyncEvent], slot: SlotId) -> Vec<(usize, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Status {
                slot: s,
                index,
                status,
            } if *s == slot => Some((*index, status.clone())),
            _ => None,
        })
        .collect()
}

/// 等到某个目标的状态满足条件
pub async fn wait_for_status(
    manager: &SyncSessionManager,
    slot: SlotId,
    index: usize,
    predicate: impl Fn(&str) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if predicate(&manager.statuses(slot)[index]) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "status for slot {} dir {} never matched: {:?}",
        slot,
        index + 1,
        manager.statuses(slot)
    );
}
