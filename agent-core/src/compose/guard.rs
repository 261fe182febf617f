use super::ComposeRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 归档期间停止 compose 服务，离开作用域时重启
///
/// 正常路径上调用 [`ServiceGuard::release`] 等待重启完成；若守卫未经释放即被丢弃
/// （future 被取消或发生 panic），在当前运行时上补发重启。重启至多执行一次。
pub struct ServiceGuard {
    runner: Arc<dyn ComposeRunner>,
    compose_file: PathBuf,
    released: bool,
}

impl ServiceGuard {
    /// 停止服务，失败只记录警告，备份继续
    pub async fn acquire(runner: Arc<dyn ComposeRunner>, compose_file: PathBuf) -> Self {
        tracing::info!(compose = %compose_file.display(), "停止 Docker Compose 项目");
        if let Err(e) = runner.down(&compose_file).await {
            tracing::warn!(compose = %compose_file.display(), error = %e, "停止 Docker Compose 项目失败");
        }

        Self {
            runner,
            compose_file,
            released: false,
        }
    }

    /// 重启服务并等待命令完成
    pub async fn release(mut self) {
        self.released = true;
        restart(self.runner.as_ref(), &self.compose_file).await;
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let runner = self.runner.clone();
        let compose_file = self.compose_file.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    restart(runner.as_ref(), &compose_file).await;
                });
            }
            Err(_) => tracing::error!(
                compose = %compose_file.display(),
                "没有可用的异步运行时，无法重启 Docker Compose 项目"
            ),
        }
    }
}

/// 重启失败只记录错误，不影响备份结果
async fn restart(runner: &dyn ComposeRunner, compose_file: &Path) {
    tracing::info!(compose = %compose_file.display(), "启动 Docker Compose 项目");
    if let Err(e) = runner.up(compose_file).await {
        tracing::error!(compose = %compose_file.display(), error = %e, "启动 Docker Compose 项目失败");
    }
}
