use crate::constants::backup;
use crate::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// 任务标识
pub type TaskId = u32;

/// 备份任务定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupTask {
    pub task_id: TaskId,
    pub source_path: String,
    #[serde(default)]
    pub create_archive: bool,
    #[serde(default = "default_archive_format")]
    pub archive_format: String,
    #[serde(default)]
    pub s3_endpoint: String,
    #[serde(default)]
    pub s3_access_key: String,
    #[serde(default)]
    pub s3_secret_key: String,
    #[serde(default)]
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_region: String,
    #[serde(default)]
    pub cleanup_enabled: bool,
    #[serde(default)]
    pub cleanup_days: u32,
    #[serde(default)]
    pub is_docker_compose: bool,
    #[serde(default)]
    pub docker_compose_path: String,
    /// 为空时任务不参与调度，但仍可单次执行
    #[serde(default)]
    pub schedule_cron: String,
}

fn default_archive_format() -> String {
    backup::DEFAULT_ARCHIVE_FORMAT.to_string()
}

/// 归档格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
}

impl ArchiveFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tar" => Some(Self::Tar),
            "tar.gz" => Some(Self::TarGz),
            _ => None,
        }
    }

    /// 文件扩展名，同时也是配置中的格式标记
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::TarGz)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// 目标对象存储参数
#[derive(Debug, Clone, PartialEq)]
pub struct StorageTarget {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

impl BackupTask {
    /// 仅当 endpoint 与 bucket 都已配置时才认为存在目标存储
    pub fn storage_target(&self) -> Option<StorageTarget> {
        if self.s3_endpoint.is_empty() || self.s3_bucket.is_empty() {
            return None;
        }
        Some(StorageTarget {
            endpoint: self.s3_endpoint.clone(),
            access_key: self.s3_access_key.clone(),
            secret_key: self.s3_secret_key.clone(),
            bucket: self.s3_bucket.clone(),
            region: self.s3_region.clone(),
        })
    }

    /// 需要在归档期间停止的 compose 文件
    pub fn compose_file(&self) -> Option<PathBuf> {
        if self.is_docker_compose && !self.docker_compose_path.is_empty() {
            Some(PathBuf::from(&self.docker_compose_path))
        } else {
            None
        }
    }

    pub fn archive_format(&self) -> Result<ArchiveFormat> {
        ArchiveFormat::parse(&self.archive_format).ok_or_else(|| {
            AgentError::config(format!("不支持的归档格式: {}", self.archive_format))
        })
    }

    pub fn is_scheduled(&self) -> bool {
        !self.schedule_cron.trim().is_empty()
    }

    /// 校验任务定义，在写入配置前调用
    pub fn validate(&self) -> Result<()> {
        if self.source_path.trim().is_empty() {
            return Err(AgentError::config(format!(
                "任务 {} 未指定源路径",
                self.task_id
            )));
        }
        if self.create_archive {
            self.archive_format()?;
        }
        Ok(())
    }
}
