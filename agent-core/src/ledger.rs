use crate::constants::backup;
use crate::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// 备份状态
///
/// 没有显式的失败状态，停留在 `Creating` 的记录表示该次执行未完成。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Creating,
    Success,
}

/// 备份记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub source_path: String,
    pub archive_name: String,
    pub backup_date: DateTime<Utc>,
    #[serde(default)]
    pub s3_upload_date: Option<DateTime<Utc>>,
    pub archive_size_mb: f64,
    #[serde(default)]
    pub s3_path: Option<String>,
    pub status: BackupStatus,
}

impl BackupRecord {
    /// 归档刚创建时的记录
    pub fn creating(source_path: impl Into<String>, archive_name: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            archive_name: archive_name.into(),
            backup_date: Utc::now(),
            s3_upload_date: None,
            archive_size_mb: 0.0,
            s3_path: None,
            status: BackupStatus::Creating,
        }
    }
}

/// 备份记录账本，JSON 数组文件，每次修改整体重写
#[derive(Debug, Clone)]
pub struct BackupLedger {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl Default for BackupLedger {
    fn default() -> Self {
        Self::new(backup::get_ledger_path())
    }
}

impl BackupLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 获取所有备份记录，文件不存在时返回空列表
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        let _guard = self.write_lock.lock().await;
        self.read_records().await
    }

    /// 追加一条记录
    pub async fn append(&self, record: BackupRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_records_for_write().await;
        records.push(record);
        self.write_records(&records).await
    }

    /// 回填归档大小
    pub async fn record_size(&self, archive_name: &str, size_bytes: u64) -> Result<()> {
        self.update(archive_name, |record| {
            record.archive_size_mb = size_bytes as f64 / (1024.0 * 1024.0);
        })
        .await
    }

    /// 上传成功后记录目标路径与上传时间
    pub async fn mark_uploaded(
        &self,
        archive_name: &str,
        s3_path: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(archive_name, |record| {
            record.s3_path = Some(s3_path.to_string());
            record.s3_upload_date = Some(uploaded_at);
            record.status = BackupStatus::Success;
        })
        .await
    }

    async fn update<F>(&self, archive_name: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut BackupRecord),
    {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_records().await?;

        let record = records
            .iter_mut()
            .find(|r| r.archive_name == archive_name)
            .ok_or_else(|| AgentError::ledger(format!("备份记录不存在: {archive_name}")))?;
        apply(record);

        self.write_records(&records).await
    }

    async fn read_records(&self) -> Result<Vec<BackupRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// 写入路径上读取失败时从空列表重新开始
    async fn read_records_for_write(&self) -> Vec<BackupRecord> {
        match self.read_records().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    ledger = %self.path.display(),
                    error = %e,
                    "备份记录文件无法解析，将重新写入"
                );
                Vec::new()
            }
        }
    }

    async fn write_records(&self, records: &[BackupRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }
}
