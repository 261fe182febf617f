use agent_core::constants::config::get_default_config_path;
use clap::Parser;
use std::path::PathBuf;

/// 主机备份代理
///
/// 不带 `--task-id` 时以守护进程方式运行调度器；带 `--task-id` 时立即执行一次该任务后退出。
#[derive(Parser, Debug)]
#[command(name = "backup-server-agent")]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
pub struct Cli {
    /// 配置文件路径
    #[arg(short, long, env = "BACKUP_AGENT_CONFIG", default_value_os_t = get_default_config_path())]
    pub config: PathBuf,

    /// 详细输出
    #[arg(short, long)]
    pub verbose: bool,

    /// 立即执行指定任务一次（系统 crontab 通过此参数调用）
    #[arg(long = "task-id", value_name = "TASK_ID")]
    pub task_id: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_defaults() {
        let cli = Cli::try_parse_from(["backup-server-agent"]).unwrap();
        assert_eq!(cli.config, get_default_config_path());
        assert!(!cli.verbose);
        assert_eq!(cli.task_id, None);
    }

    #[test]
    fn test_one_shot_arguments() {
        let cli = Cli::try_parse_from([
            "backup-server-agent",
            "-c",
            "/tmp/agent.toml",
            "-v",
            "--task-id",
            "12",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/agent.toml"));
        assert!(cli.verbose);
        assert_eq!(cli.task_id, Some(12));
    }

    #[test]
    fn test_invalid_task_id() {
        assert!(Cli::try_parse_from(["backup-server-agent", "--task-id", "abc"]).is_err());
    }
}
