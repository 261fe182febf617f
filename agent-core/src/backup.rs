use crate::{
    AgentError, Result,
    archive::{ArchiveBuilder, archive_name, count_files},
    compose::{ComposeRunner, DockerComposeRunner, ServiceGuard},
    ledger::{BackupLedger, BackupRecord},
    storage::{ObjectUploader, S3Connector, StorageConnector},
    task::{BackupTask, TaskId},
};
use chrono::{Local, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// 单次备份执行结果
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BackupRun {
    pub success: bool,
    /// 未生成归档时为空
    pub archive_path: Option<PathBuf>,
    pub archive_size: u64,
    pub files_count: usize,
    pub s3_path: Option<String>,
    pub error: Option<String>,
}

impl BackupRun {
    /// 硬失败时返回给调用方的结果
    pub fn failed(error: &AgentError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// 备份执行器：停服务 -> 归档 -> 记账 -> 上传 -> 清理
#[derive(Clone)]
pub struct BackupExecutor {
    archive_builder: ArchiveBuilder,
    ledger: BackupLedger,
    connector: Arc<dyn StorageConnector>,
    compose_runner: Arc<dyn ComposeRunner>,
    running: Arc<DashMap<TaskId, ()>>,
}

/// 任务执行占位，丢弃时释放
struct RunSlot {
    running: Arc<DashMap<TaskId, ()>>,
    task_id: TaskId,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.running.remove(&self.task_id);
    }
}

impl BackupExecutor {
    pub fn new(
        archive_builder: ArchiveBuilder,
        ledger: BackupLedger,
        connector: Arc<dyn StorageConnector>,
        compose_runner: Arc<dyn ComposeRunner>,
    ) -> Self {
        Self {
            archive_builder,
            ledger,
            connector,
            compose_runner,
            running: Arc::new(DashMap::new()),
        }
    }

    /// 使用默认路径、S3 客户端和 docker compose 命令
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::new(
            ArchiveBuilder::default(),
            BackupLedger::default(),
            Arc::new(S3Connector::new()?),
            Arc::new(DockerComposeRunner::new()),
        ))
    }

    pub fn ledger(&self) -> &BackupLedger {
        &self.ledger
    }

    /// 同一任务同时只允许一次执行
    fn claim(&self, task_id: TaskId) -> Result<RunSlot> {
        match self.running.entry(task_id) {
            Entry::Occupied(_) => Err(AgentError::TaskBusy(task_id)),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(RunSlot {
                    running: self.running.clone(),
                    task_id,
                })
            }
        }
    }

    /// 执行一次完整备份
    ///
    /// 归档与上传失败直接返回错误；记账、删除本地归档、清理和服务启停失败只记录警告。
    #[instrument(skip(self, task), fields(task_id = task.task_id, source = %task.source_path))]
    pub async fn execute(&self, task: &BackupTask, host: &str) -> Result<BackupRun> {
        let _slot = self.claim(task.task_id)?;
        let mut run = BackupRun::default();

        let guard = match task.compose_file() {
            Some(compose_file) => {
                Some(ServiceGuard::acquire(self.compose_runner.clone(), compose_file).await)
            }
            None => None,
        };
        let staged = self.archive_stage(task, host, &mut run).await;
        if let Some(guard) = guard {
            guard.release().await;
        }
        let archive_name = staged?;

        let uploader = match task.storage_target() {
            Some(target) => Some(ObjectUploader::new(self.connector.connect(&target)?)),
            None => None,
        };

        if let Some(uploader) = &uploader {
            match (&run.archive_path, &archive_name) {
                (Some(archive_path), Some(archive_name)) => {
                    let s3_path = uploader.upload_file(archive_path).await.inspect_err(|e| {
                        error!(error = %e, "上传归档失败，保留本地归档");
                    })?;
                    run.s3_path = Some(s3_path.clone());

                    if let Err(e) = self
                        .ledger
                        .mark_uploaded(archive_name, &s3_path, Utc::now())
                        .await
                    {
                        warn!(error = %e, "更新备份记录失败");
                    }

                    match tokio::fs::remove_file(archive_path).await {
                        Ok(()) => info!(archive = %archive_path.display(), "上传成功，已删除本地归档"),
                        Err(e) => warn!(error = %e, "删除本地归档失败"),
                    }
                }
                _ => {
                    let s3_path = uploader
                        .upload_directory(Path::new(&task.source_path))
                        .await
                        .inspect_err(|e| error!(error = %e, "直接上传目录失败"))?;
                    run.s3_path = Some(s3_path);
                }
            }
        }

        if task.cleanup_enabled {
            match &uploader {
                Some(uploader) => {
                    if let Err(e) = uploader.cleanup_expired(task.cleanup_days).await {
                        warn!(error = %e, "清理过期备份失败");
                    }
                }
                None => warn!("未配置目标存储，跳过过期备份清理"),
            }
        }

        run.success = true;
        info!(
            archive_size = run.archive_size,
            files_count = run.files_count,
            s3_path = run.s3_path.as_deref().unwrap_or(""),
            "备份执行完成"
        );
        Ok(run)
    }

    /// 归档阶段，在服务守卫内执行；返回归档名
    ///
    /// 归档失败时尽量删除部分写入的文件。
    async fn archive_stage(
        &self,
        task: &BackupTask,
        host: &str,
        run: &mut BackupRun,
    ) -> Result<Option<String>> {
        if !task.create_archive {
            run.files_count = count_source_files(&task.source_path).await;
            return Ok(None);
        }

        let format = task.archive_format()?;
        let name = archive_name(host, &task.source_path, format, &Local::now());
        let partial = self.archive_builder.archive_path(&name);
        let built = match self
            .archive_builder
            .build_as(&task.source_path, format, name)
            .await
        {
            Ok(built) => built,
            Err(e) => {
                error!(error = %e, "创建归档失败");
                match tokio::fs::remove_file(&partial).await {
                    Err(remove_err) if remove_err.kind() != std::io::ErrorKind::NotFound => {
                        warn!(error = %remove_err, "删除未完成的归档失败")
                    }
                    _ => {}
                }
                return Err(e);
            }
        };
        run.archive_path = Some(built.path.clone());

        if let Err(e) = self
            .ledger
            .append(BackupRecord::creating(&task.source_path, &built.name))
            .await
        {
            warn!(error = %e, "保存备份记录失败");
        }

        match tokio::fs::metadata(&built.path).await {
            Ok(metadata) => {
                run.archive_size = metadata.len();
                if let Err(e) = self.ledger.record_size(&built.name, metadata.len()).await {
                    warn!(error = %e, "回填归档大小失败");
                }
            }
            Err(e) => warn!(error = %e, "获取归档大小失败"),
        }

        // 与直接上传一致，文件数量以独立遍历源目录为准
        run.files_count = count_source_files(&task.source_path).await;
        Ok(Some(built.name))
    }
}

async fn count_source_files(source_path: &str) -> usize {
    let source = PathBuf::from(source_path);
    tokio::task::spawn_blocking(move || count_files(&source))
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "统计文件数量失败");
            0
        })
}
