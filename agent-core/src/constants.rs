/// 配置文件相关常量
pub mod config {
    use std::path::{Path, PathBuf};

    /// 配置目录
    pub const CONFIG_DIR: &str = "/etc/backupserveragent";

    /// 配置文件名
    pub const CONFIG_FILE_NAME: &str = "config.toml";

    /// 默认监听端口
    pub const DEFAULT_PORT: u16 = 11540;

    /// 未配置服务器IP时使用的主机标识
    pub const UNKNOWN_HOST: &str = "unknown";

    /// 获取默认配置文件路径
    pub fn get_default_config_path() -> PathBuf {
        Path::new(CONFIG_DIR).join(CONFIG_FILE_NAME)
    }
}

/// 备份相关常量
pub mod backup {
    use std::path::{Path, PathBuf};

    /// 备份记录文件路径
    pub const LEDGER_FILE: &str = "/var/lib/backup-server-agent/backups.json";

    /// 归档与目录上传使用的时间戳格式（秒级）
    pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

    /// 默认归档格式
    pub const DEFAULT_ARCHIVE_FORMAT: &str = "tar.gz";

    /// 获取默认备份记录文件路径
    pub fn get_ledger_path() -> PathBuf {
        Path::new(LEDGER_FILE).to_path_buf()
    }

    /// 获取归档输出目录
    pub fn get_archive_dir() -> PathBuf {
        std::env::temp_dir()
    }
}

/// 对象存储相关常量
pub mod storage {
    /// 对象存储路径前缀
    pub const S3_SCHEME: &str = "s3://";

    /// 签名服务名
    pub const SIGNING_SERVICE: &str = "s3";

    /// 未配置区域时的默认签名区域
    pub const DEFAULT_REGION: &str = "us-east-1";

    /// 单次列举返回的最大对象数
    pub const LIST_PAGE_SIZE: u32 = 1000;

    /// HTTP 连接超时（秒）
    pub const CONNECT_TIMEOUT: u64 = 30;
}

/// 定时任务相关常量
pub mod cron {
    /// 系统 crontab 中调用的代理可执行文件路径
    pub const AGENT_EXEC_PATH: &str = "/usr/bin/backup-server-agent";

    /// 单次执行任务的命令行参数
    pub const TASK_ID_FLAG: &str = "--task-id";

    /// 系统 crontab 字段数量（分 时 日 月 周）
    pub const SYSTEM_CRON_FIELDS: usize = 5;

    /// 带秒字段的表达式字段数量
    pub const SECONDS_CRON_FIELDS: usize = 6;
}

/// Docker Compose 相关常量
pub mod docker {
    /// 新版 compose 子命令所在的可执行文件
    pub const DOCKER_BIN: &str = "docker";

    /// 旧版独立 compose 可执行文件
    pub const LEGACY_COMPOSE_BIN: &str = "docker-compose";
}
