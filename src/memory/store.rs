//! 会话持久化：按身份划分的追加式磁盘存储
//!
//! 每个身份一个目录：history.jsonl（逐行 JSON 的持久化对话）+ activity.log（人读日志）。
//! 追加操作即发即忘：失败只记日志，不影响进行中的对话。clear 走「临时文件 + rename」，
//! 中途崩溃不会留下半截文件。身份在用作路径前先净化（仅字母数字 . - _，去穿越序列，限长）。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::memory::{ContentBlock, Role, Turn};

/// 身份净化后的最大长度
const MAX_IDENTITY_LEN: usize = 64;

/// history.jsonl 中的一行：role + content 块 + 时间戳
#[derive(Serialize, Deserialize)]
struct StoredTurn {
    role: Role,
    content: Vec<ContentBlock>,
    timestamp: String,
}

/// 将外部身份净化为可安全用作路径组件的字符串
///
/// 仅保留字母数字与 . - _，去除穿越序列（..），截断到 64 字符；
/// 清空后回落到 "anonymous"。
pub fn sanitize_identity(raw: &str) -> String {
    let mut cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", ".");
    }
    let cleaned = cleaned.trim_matches('.').to_string();
    let mut cleaned: String = cleaned.chars().take(MAX_IDENTITY_LEN).collect();
    if cleaned.is_empty() {
        cleaned = "anonymous".to_string();
    }
    cleaned
}

/// 单个身份的磁盘会话：追加式 history.jsonl + activity.log
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// 打开（必要时创建）该身份的会话目录；目录为符号链接时拒绝
    pub fn open(root: &Path, identity: &str) -> std::io::Result<Self> {
        let dir = root.join(sanitize_identity(identity));
        if let Ok(meta) = std::fs::symlink_metadata(&dir) {
            if meta.file_type().is_symlink() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("session dir is a symlink: {}", dir.display()),
                ));
            }
        }
        std::fs::create_dir_all(&dir)?;
        restrict_dir(&dir);
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join("history.jsonl")
    }

    fn activity_path(&self) -> PathBuf {
        self.dir.join("activity.log")
    }

    /// 从 history.jsonl 读取全部 Turn；文件缺失返回空，坏行跳过不致命
    pub fn load_turns(&self) -> Vec<Turn> {
        let data = match std::fs::read_to_string(self.history_path()) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), "failed to read history: {e}");
                return Vec::new();
            }
        };
        let mut turns = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredTurn>(line) {
                Ok(stored) => turns.push(Turn {
                    role: stored.role,
                    blocks: stored.content,
                }),
                Err(e) => {
                    tracing::warn!(
                        dir = %self.dir.display(),
                        line = lineno + 1,
                        "skipping malformed history line: {e}"
                    );
                }
            }
        }
        turns
    }

    /// 追加一个 Turn 到 history.jsonl；失败记日志后吞掉
    pub fn append_turn(&self, turn: &Turn) {
        let stored = StoredTurn {
            role: turn.role,
            content: turn.blocks.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let line = match serde_json::to_string(&stored) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("failed to serialize turn: {e}");
                return;
            }
        };
        if let Err(e) = self.append_line(&self.history_path(), &line) {
            tracing::warn!(dir = %self.dir.display(), "failed to append history: {e}");
        }
    }

    /// 追加一行人读活动日志；失败记日志后吞掉
    pub fn append_activity(&self, role: Role, text: &str) {
        let line = format!(
            "{} {}: {}",
            chrono::Utc::now().to_rfc3339(),
            role.as_str(),
            text.replace('\n', " ")
        );
        if let Err(e) = self.append_line(&self.activity_path(), &line) {
            tracing::warn!(dir = %self.dir.display(), "failed to append activity log: {e}");
        }
    }

    fn append_line(&self, path: &Path, line: &str) -> std::io::Result<()> {
        let existed = path.exists();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        if !existed {
            restrict_file(path);
        }
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// 原子清空：同目录写临时文件再 rename 覆盖，崩溃不会产生半截日志
    pub fn clear(&self) -> std::io::Result<()> {
        for target in [self.history_path(), self.activity_path()] {
            let tmp = self
                .dir
                .join(format!(".{}.tmp-{}", target.file_name().and_then(|n| n.to_str()).unwrap_or("log"), uuid::Uuid::new_v4()));
            std::fs::write(&tmp, b"")?;
            restrict_file(&tmp);
            std::fs::rename(&tmp, &target)?;
        }
        Ok(())
    }

    /// history.jsonl 当前字节数（不存在视为 0）
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(self.history_path())
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

/// 维护清扫：删除 root 下「最近未修改且历史为空」的会话目录，返回删除个数
pub fn sweep_sessions(root: &Path, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(_) => return 0,
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let history = dir.join("history.jsonl");
        let empty = std::fs::metadata(&history).map(|m| m.len() == 0).unwrap_or(true);
        if !empty {
            continue;
        }
        let old = std::fs::metadata(&dir)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| now.duration_since(t).ok())
            .map(|age| age >= max_age)
            .unwrap_or(false);
        if old {
            if std::fs::remove_dir_all(&dir).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

#[cfg(unix)]
fn restrict_dir(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) {}

#[cfg(unix)]
fn restrict_file(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) {}
