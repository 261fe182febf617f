use crate::backup::{BackupExecutor, BackupRun};
use crate::config::AgentConfig;
use crate::ledger::BackupRecord;
use crate::scheduler::{CommandCrontab, SystemCrontab, TaskScheduler, parse_schedule};
use crate::task::{BackupTask, TaskId};
use crate::{AgentError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// 备份代理：配置、执行器与调度器的组合入口
pub struct BackupAgent {
    config: RwLock<AgentConfig>,
    config_path: PathBuf,
    executor: Arc<BackupExecutor>,
    scheduler: TaskScheduler,
}

impl BackupAgent {
    pub fn new(
        config: AgentConfig,
        config_path: impl Into<PathBuf>,
        executor: Arc<BackupExecutor>,
        crontab: Arc<dyn SystemCrontab>,
    ) -> Self {
        let scheduler = TaskScheduler::new(executor.clone(), config.host_identifier(), crontab);
        Self {
            config: RwLock::new(config),
            config_path: config_path.into(),
            executor,
            scheduler,
        }
    }

    /// 加载配置文件（不存在时初始化），使用默认执行器与系统 crontab
    pub fn from_config_file(config_path: &Path) -> Result<Self> {
        let config = AgentConfig::load_or_init(config_path)?;
        let executor = Arc::new(BackupExecutor::with_defaults()?);
        Ok(Self::new(
            config,
            config_path,
            executor,
            Arc::new(CommandCrontab::new()),
        ))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub async fn host_identifier(&self) -> String {
        self.config.read().await.host_identifier()
    }

    pub async fn config(&self) -> AgentConfig {
        self.config.read().await.clone()
    }

    /// 按标识查找任务
    pub async fn task(&self, task_id: TaskId) -> Result<BackupTask> {
        self.config
            .read()
            .await
            .get_task(task_id)
            .cloned()
            .ok_or(AgentError::TaskNotFound(task_id))
    }

    /// 立即执行一次备份，不经过调度器
    pub async fn execute_once(&self, task: &BackupTask) -> Result<BackupRun> {
        let host = self.host_identifier().await;
        self.executor.execute(task, &host).await
    }

    /// 按标识执行一次已配置的任务
    pub async fn run_task(&self, task_id: TaskId) -> Result<BackupRun> {
        let task = self.task(task_id).await?;
        self.execute_once(&task).await
    }

    /// 校验并保存任务，然后安装或替换其触发器
    pub async fn add_or_update_schedule(&self, task: BackupTask) -> Result<()> {
        task.validate()?;
        if task.is_scheduled() {
            parse_schedule(&task.schedule_cron)?;
        }

        let mut config = self.config.write().await;
        config.upsert_task(task.clone());
        config.save_to_file(&self.config_path)?;
        info!(task_id = task.task_id, "任务配置已保存");

        self.scheduler.add_task(task).await
    }

    pub async fn list_ledger(&self) -> Result<Vec<BackupRecord>> {
        self.executor.ledger().list().await
    }

    /// 删除任务配置与触发器，返回任务是否存在
    pub async fn remove_task(&self, task_id: TaskId) -> Result<bool> {
        let mut config = self.config.write().await;
        let existed = config.remove_task(task_id);
        if existed {
            config.save_to_file(&self.config_path)?;
        }
        self.scheduler.remove_task(task_id).await;
        Ok(existed)
    }

    /// 为配置中的定时任务安装触发器
    pub async fn start(&self) -> usize {
        let tasks = self.config.read().await.tasks.clone();
        self.scheduler.load_tasks(&tasks).await
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }
}
