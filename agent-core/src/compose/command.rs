use super::ComposeRunner;
use crate::constants::docker;
use crate::{AgentError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// 通过 docker compose 命令行管理服务
#[derive(Debug, Clone, Default)]
pub struct DockerComposeRunner;

impl DockerComposeRunner {
    pub fn new() -> Self {
        Self
    }

    /// 执行 compose 命令，新语法失败时回退到旧版 docker-compose
    async fn run_compose_command(&self, compose_file: &Path, args: &[&str]) -> Result<()> {
        match self.run_docker_compose_subcommand(compose_file, args).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "docker compose 执行失败，回退到 docker-compose");
                self.run_docker_compose_standalone(compose_file, args).await
            }
        }
    }

    /// 使用 docker compose 子命令
    async fn run_docker_compose_subcommand(&self, compose_file: &Path, args: &[&str]) -> Result<()> {
        let compose_path = compose_file.to_string_lossy().to_string();
        let mut cmd_args = vec!["compose", "-f", compose_path.as_str()];
        cmd_args.extend(args);

        run_command(docker::DOCKER_BIN, &cmd_args, compose_file).await
    }

    /// 使用独立的 docker-compose 命令
    async fn run_docker_compose_standalone(&self, compose_file: &Path, args: &[&str]) -> Result<()> {
        let compose_path = compose_file.to_string_lossy().to_string();
        let mut cmd_args = vec!["-f", compose_path.as_str()];
        cmd_args.extend(args);

        run_command(docker::LEGACY_COMPOSE_BIN, &cmd_args, compose_file).await
    }
}

/// 在 compose 文件所在目录执行命令，非零退出码视为失败
async fn run_command(program: &str, args: &[&str], compose_file: &Path) -> Result<()> {
    if which::which(program).is_err() {
        return Err(AgentError::docker(format!("{program} 未安装或不在 PATH 中")));
    }

    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = compose_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        command.current_dir(dir);
    }

    let output = command.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AgentError::docker(format!(
            "{program} {} 失败: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

#[async_trait]
impl ComposeRunner for DockerComposeRunner {
    async fn down(&self, compose_file: &Path) -> Result<()> {
        self.run_compose_command(compose_file, &["down"]).await
    }

    async fn up(&self, compose_file: &Path) -> Result<()> {
        self.run_compose_command(compose_file, &["up", "-d"]).await
    }
}
