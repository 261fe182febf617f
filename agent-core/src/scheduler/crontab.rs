use crate::constants::cron::TASK_ID_FLAG;
use crate::task::TaskId;
use crate::{AgentError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const CRONTAB_BIN: &str = "crontab";

/// 系统级调度表的整体读写
#[async_trait]
pub trait SystemCrontab: Send + Sync {
    async fn read(&self) -> Result<String>;

    /// 以整段文本替换调度表
    async fn write(&self, content: &str) -> Result<()>;
}

/// 当前用户的 crontab
#[derive(Debug, Clone, Default)]
pub struct CommandCrontab;

impl CommandCrontab {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SystemCrontab for CommandCrontab {
    async fn read(&self) -> Result<String> {
        if which::which(CRONTAB_BIN).is_err() {
            return Err(AgentError::schedule("crontab 未安装或不在 PATH 中"));
        }

        let output = Command::new(CRONTAB_BIN).arg("-l").output().await?;
        // 用户尚无 crontab 时 `crontab -l` 返回非零
        if !output.status.success() {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "读取 crontab 失败，按空表处理"
            );
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn write(&self, content: &str) -> Result<()> {
        let mut child = Command::new(CRONTAB_BIN)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(AgentError::schedule(format!(
                "写入 crontab 失败: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// 标识某个任务所属行的标记
pub fn task_marker(task_id: TaskId) -> String {
    format!("{TASK_ID_FLAG} {task_id}")
}

/// 生成一条调度行
pub fn render_line(cron_fields: &str, exec_path: &str, task_id: TaskId) -> String {
    format!("{cron_fields} {exec_path} {}", task_marker(task_id))
}

/// 行中是否带有该任务的标记，`--task-id 1` 不匹配 `--task-id 12`
fn has_marker(line: &str, task_id: TaskId) -> bool {
    let id = task_id.to_string();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    tokens
        .windows(2)
        .any(|pair| pair[0] == TASK_ID_FLAG && pair[1] == id)
}

/// 去掉属于该任务的所有行，其余行原样保留
pub fn strip_task_lines(content: &str, task_id: TaskId) -> String {
    content
        .lines()
        .filter(|line| !has_marker(line, task_id))
        .map(|line| format!("{line}\n"))
        .collect()
}
