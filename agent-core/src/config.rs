use crate::constants::config;
use crate::error::Result;
use crate::task::{BackupTask, TaskId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 代理配置结构
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub server_ip: String,
    #[serde(default)]
    pub server_hostname: String,
    #[serde(default)]
    pub tasks: Vec<BackupTask>,
}

fn default_port() -> u16 {
    config::DEFAULT_PORT
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: config::DEFAULT_PORT,
            server_ip: String::new(),
            server_hostname: String::new(),
            tasks: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// 加载配置文件，不存在时写入并返回默认配置
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("未找到配置文件，创建默认配置: {}", path.display());
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        tracing::info!("找到配置文件: {}", path.display());
        Self::load_from_file(path)
    }

    /// 从指定文件加载配置
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config: AgentConfig = toml::from_str(&content)?;

        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 按任务标识插入或替换任务
    pub fn upsert_task(&mut self, task: BackupTask) {
        match self.tasks.iter_mut().find(|t| t.task_id == task.task_id) {
            Some(existing) => *existing = task,
            None => self.tasks.push(task),
        }
    }

    /// 删除任务，返回是否存在
    pub fn remove_task(&mut self, task_id: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.task_id != task_id);
        self.tasks.len() != before
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<&BackupTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// 归档命名使用的主机标识
    pub fn host_identifier(&self) -> String {
        if self.server_ip.is_empty() {
            config::UNKNOWN_HOST.to_string()
        } else {
            self.server_ip.clone()
        }
    }
}
