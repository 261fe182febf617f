// 模块声明
mod s3;
pub mod sigv4;

// 重新导出公共API
pub use s3::{S3Connector, S3Storage, normalize_endpoint};

use crate::constants::{backup, storage};
use crate::task::StorageTarget;
use crate::{AgentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, Utc};
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

/// 存储桶中的对象
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// 对象存储操作接口
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    fn bucket(&self) -> &str;

    async fn bucket_exists(&self) -> Result<bool>;

    /// 创建存储桶，桶已存在时视为成功
    async fn create_bucket(&self) -> Result<()>;

    /// 上传本地文件，同名对象直接覆盖
    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;

    /// 递归列出桶内全部对象
    async fn list_objects(&self) -> Result<Vec<ObjectInfo>>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}

/// 根据目标存储参数创建客户端
pub trait StorageConnector: Send + Sync {
    fn connect(&self, target: &StorageTarget) -> Result<Arc<dyn ObjectStorage>>;
}

/// 对象存储上传器
#[derive(Clone)]
pub struct ObjectUploader {
    storage: Arc<dyn ObjectStorage>,
}

impl ObjectUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    /// 存储桶不存在时创建
    pub async fn ensure_bucket(&self) -> Result<()> {
        let bucket = self.storage.bucket();
        let exists = self
            .storage
            .bucket_exists()
            .await
            .map_err(|e| AgentError::storage(format!("检查存储桶 {bucket} 失败: {e}")))?;
        if !exists {
            tracing::info!(bucket, "存储桶不存在，开始创建");
            self.storage
                .create_bucket()
                .await
                .map_err(|e| AgentError::storage(format!("创建存储桶 {bucket} 失败: {e}")))?;
        }
        Ok(())
    }

    /// 上传单个归档文件，对象名为文件名
    pub async fn upload_file(&self, archive_path: &Path) -> Result<String> {
        let bucket = self.storage.bucket();
        tracing::info!(bucket, archive = %archive_path.display(), "开始上传归档");

        self.ensure_bucket().await?;

        let object_name = archive_path
            .file_name()
            .ok_or_else(|| AgentError::storage("无法获取归档文件名"))?
            .to_string_lossy()
            .to_string();
        self.storage
            .put_file(&object_name, archive_path)
            .await
            .map_err(|e| AgentError::storage(format!("上传文件失败: {e}")))?;

        let s3_path = format!("{}{bucket}/{object_name}", storage::S3_SCHEME);
        tracing::info!(s3_path = %s3_path, "归档上传成功");
        Ok(s3_path)
    }

    /// 逐个上传目录下的普通文件，对象键为 {目录名}_{时间戳}/{相对路径}
    ///
    /// 中途失败时停止遍历并返回首个错误，已上传的对象不回滚。
    pub async fn upload_directory(&self, source_path: &Path) -> Result<String> {
        let bucket = self.storage.bucket();
        tracing::info!(bucket, source = %source_path.display(), "开始直接上传目录");

        self.ensure_bucket().await?;

        let timestamp = Local::now().format(backup::TIMESTAMP_FORMAT);
        let base_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        let prefix = format!("{base_name}_{timestamp}");

        let mut uploaded = 0usize;
        for entry in WalkDir::new(source_path) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative_path = entry.path().strip_prefix(source_path)?;
            let relative = relative_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let object_name = format!("{prefix}/{relative}");

            self.storage
                .put_file(&object_name, entry.path())
                .await
                .map_err(|e| {
                    AgentError::storage(format!("上传 {} 失败: {e}", entry.path().display()))
                })?;
            uploaded += 1;
        }

        let s3_path = format!("{}{bucket}/{prefix}/", storage::S3_SCHEME);
        tracing::info!(s3_path = %s3_path, uploaded, "目录上传成功");
        Ok(s3_path)
    }

    /// 删除修改时间早于 (现在 - 保留天数) 的对象，返回删除数量
    ///
    /// 单个对象删除失败只记录警告，继续处理其余对象。
    pub async fn cleanup_expired(&self, retention_days: u32) -> Result<usize> {
        tracing::info!(retention_days, "开始清理过期备份");

        self.ensure_bucket().await?;

        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let objects = self.storage.list_objects().await?;

        let mut deleted = 0;
        for object in objects.iter().filter(|o| o.last_modified < cutoff) {
            tracing::info!(key = %object.key, "删除过期备份");
            match self.storage.delete_object(&object.key).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(key = %object.key, error = %e, "删除过期备份失败"),
            }
        }

        tracing::info!(deleted, "过期备份清理完成");
        Ok(deleted)
    }
}
