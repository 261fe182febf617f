// 模块声明
mod command;
mod guard;

// 重新导出公共API
pub use command::DockerComposeRunner;
pub use guard::ServiceGuard;

use crate::Result;
use async_trait::async_trait;
use std::path::Path;

/// compose 项目的停止与启动
#[async_trait]
pub trait ComposeRunner: Send + Sync {
    /// `compose down`
    async fn down(&self, compose_file: &Path) -> Result<()>;

    /// `compose up -d`
    async fn up(&self, compose_file: &Path) -> Result<()>;
}
