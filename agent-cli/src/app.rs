use agent_core::BackupAgent;
use agent_core::backup::BackupRun;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{error, info};

/// 命令行入口持有的代理实例
pub struct AgentApp {
    agent: BackupAgent,
}

impl AgentApp {
    /// 加载配置并初始化代理，失败视为启动致命错误
    pub fn new(config_path: &Path) -> Result<Self> {
        let agent = BackupAgent::from_config_file(config_path)
            .with_context(|| format!("加载配置文件 {} 失败", config_path.display()))?;
        Ok(Self { agent })
    }

    /// 执行一次指定任务
    ///
    /// 任务不存在时返回错误；备份本身失败时返回 `success == false` 的结果。
    pub async fn run_task_once(&self, task_id: u32) -> Result<BackupRun> {
        let task = self
            .agent
            .task(task_id)
            .await
            .with_context(|| format!("配置文件 {} 中没有该任务", self.agent.config_path().display()))?;

        info!(task_id, source = %task.source_path, "开始执行单次备份");
        let run = match self.agent.execute_once(&task).await {
            Ok(run) => {
                info!(task_id, "✅ 备份完成");
                run
            }
            Err(e) => {
                error!(task_id, error = %e, "❌ 备份失败");
                BackupRun::failed(&e)
            }
        };
        Ok(run)
    }

    /// 启动调度器并等待退出信号
    pub async fn run_daemon(&self) -> Result<()> {
        let config = self.agent.config().await;
        let loaded = self.agent.start().await;
        info!(
            host = %config.host_identifier(),
            hostname = %config.server_hostname,
            port = config.port,
            tasks = config.tasks.len(),
            scheduled = loaded,
            "🚀 备份代理已启动"
        );

        wait_for_shutdown().await?;

        info!("收到退出信号，停止调度器");
        self.agent.shutdown().await;
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("注册 SIGTERM 处理失败")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("等待 Ctrl+C 失败")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await.context("等待 Ctrl+C 失败")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::config::AgentConfig;
    use agent_core::task::BackupTask;
    use tempfile::tempdir;

    fn write_config(dir: &Path, source: &Path) -> std::path::PathBuf {
        let task: BackupTask = serde_json::from_value(serde_json::json!({
            "task_id": 1,
            "source_path": source.to_string_lossy(),
            "create_archive": false,
        }))
        .unwrap();
        let config = AgentConfig {
            tasks: vec![task],
            ..Default::default()
        };
        let path = dir.join("config.toml");
        config.save_to_file(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_task_is_fatal() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("data");
        std::fs::create_dir_all(&source).unwrap();
        let app = AgentApp::new(&write_config(dir.path(), &source)).unwrap();

        assert!(app.run_task_once(42).await.is_err());
    }

    #[tokio::test]
    async fn test_run_without_archive_or_storage() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("data");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.txt"), b"a").unwrap();
        let app = AgentApp::new(&write_config(dir.path(), &source)).unwrap();

        let run = app.run_task_once(1).await.unwrap();
        assert!(run.success);
        assert_eq!(run.files_count, 1);
        assert!(run.archive_path.is_none());
    }

    #[test]
    fn test_missing_config_is_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc/config.toml");
        assert!(AgentApp::new(&path).is_ok());
        assert!(path.exists());
    }
}
