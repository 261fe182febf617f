mod cron_expr;
mod crontab;

pub use cron_expr::{parse_schedule, system_cron_fields};
pub use crontab::{CommandCrontab, SystemCrontab, render_line, strip_task_lines, task_marker};

#[cfg(test)]
pub(crate) use crontab::testing as crontab_testing;

use crate::backup::BackupExecutor;
use crate::constants::cron::AGENT_EXEC_PATH;
use crate::Result;
use crate::task::{BackupTask, TaskId};
use chrono::Local;
use cron::Schedule;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

/// 已安装的触发器
struct Trigger {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Trigger {
    fn retire(self) {
        self.token.cancel();
    }
}

/// 定时任务调度器
///
/// 每个任务至多一个触发器；进程内触发器与系统 crontab 同步维护。
pub struct TaskScheduler {
    executor: Arc<BackupExecutor>,
    host: String,
    crontab: Arc<dyn SystemCrontab>,
    exec_path: String,
    root: CancellationToken,
    jobs: Mutex<HashMap<TaskId, Trigger>>,
    runs: TaskTracker,
}

impl TaskScheduler {
    pub fn new(
        executor: Arc<BackupExecutor>,
        host: impl Into<String>,
        crontab: Arc<dyn SystemCrontab>,
    ) -> Self {
        Self {
            executor,
            host: host.into(),
            crontab,
            exec_path: AGENT_EXEC_PATH.to_string(),
            root: CancellationToken::new(),
            jobs: Mutex::new(HashMap::new()),
            runs: TaskTracker::new(),
        }
    }

    /// 写入系统 crontab 时使用的可执行文件路径
    pub fn with_exec_path(mut self, exec_path: impl Into<String>) -> Self {
        self.exec_path = exec_path.into();
        self
    }

    /// 为所有配置了调度表达式的任务安装触发器，单个任务失败不影响其他任务
    pub async fn load_tasks(&self, tasks: &[BackupTask]) -> usize {
        let mut loaded = 0;
        for task in tasks.iter().filter(|t| t.is_scheduled()) {
            match self.add_task(task.clone()).await {
                Ok(()) => loaded += 1,
                Err(e) => error!(task_id = task.task_id, error = %e, "加载定时任务失败"),
            }
        }
        info!(loaded, "定时任务加载完成");
        loaded
    }

    /// 安装或替换任务的触发器
    ///
    /// 表达式无效时返回错误，已有触发器与系统 crontab 保持不变。
    /// 表达式为空时等同于移除。
    #[instrument(skip(self, task), fields(task_id = task.task_id))]
    pub async fn add_task(&self, task: BackupTask) -> Result<()> {
        if !task.is_scheduled() {
            self.remove_task(task.task_id).await;
            return Ok(());
        }

        let schedule = parse_schedule(&task.schedule_cron).inspect_err(|e| {
            error!(task_id = task.task_id, cron = %task.schedule_cron, error = %e, "调度表达式无效");
        })?;

        let task_id = task.task_id;
        let expr = task.schedule_cron.clone();

        let mut jobs = self.jobs.lock().await;
        if let Some(previous) = jobs.remove(&task_id) {
            info!(task_id, "替换已有触发器");
            previous.retire();
        }

        let token = self.root.child_token();
        let handle = tokio::spawn(run_trigger(
            schedule,
            token.clone(),
            self.runs.clone(),
            self.executor.clone(),
            task,
            self.host.clone(),
        ));
        jobs.insert(task_id, Trigger { token, handle });
        info!(task_id, cron = %expr, "触发器已安装");

        self.sync_install(task_id, &expr).await;
        Ok(())
    }

    /// 移除任务的触发器并删除对应的 crontab 行，返回触发器是否存在
    #[instrument(skip(self))]
    pub async fn remove_task(&self, task_id: TaskId) -> bool {
        let mut jobs = self.jobs.lock().await;
        let existed = match jobs.remove(&task_id) {
            Some(trigger) => {
                trigger.retire();
                info!(task_id, "触发器已移除");
                true
            }
            None => false,
        };

        self.sync_remove(task_id).await;
        existed
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn has_job(&self, task_id: TaskId) -> bool {
        self.jobs.lock().await.contains_key(&task_id)
    }

    /// 停止所有触发器，并等待正在执行的备份完成
    ///
    /// 备份本身不会被中断，服务守卫得以在返回前重启 compose 项目。
    pub async fn shutdown(&self) {
        self.root.cancel();
        let jobs = std::mem::take(&mut *self.jobs.lock().await);
        for (task_id, trigger) in jobs {
            if let Err(e) = trigger.handle.await {
                warn!(task_id, error = %e, "触发器退出异常");
            }
        }

        self.runs.close();
        if !self.runs.is_empty() {
            info!(running = self.runs.len(), "等待正在执行的备份完成");
        }
        self.runs.wait().await;
        info!("调度器已停止");
    }

    async fn sync_install(&self, task_id: TaskId, expr: &str) {
        let fields = match system_cron_fields(expr) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(task_id, error = %e, "无法写入系统 crontab");
                return;
            }
        };
        let line = render_line(&fields, &self.exec_path, task_id);
        self.rewrite_crontab(task_id, Some(line)).await;
    }

    async fn sync_remove(&self, task_id: TaskId) {
        self.rewrite_crontab(task_id, None).await;
    }

    /// 读取整表、过滤该任务的行、追加新行后整体写回
    ///
    /// 读写之间的外部修改会被覆盖。失败只记录警告。
    async fn rewrite_crontab(&self, task_id: TaskId, line: Option<String>) {
        let current = match self.crontab.read().await {
            Ok(content) => content,
            Err(e) => {
                warn!(task_id, error = %e, "读取系统 crontab 失败");
                return;
            }
        };

        let mut content = strip_task_lines(&current, task_id);
        if let Some(line) = line {
            content.push_str(&line);
            content.push('\n');
        }

        match self.crontab.write(&content).await {
            Ok(()) => info!(task_id, "系统 crontab 已同步"),
            Err(e) => warn!(task_id, error = %e, "写入系统 crontab 失败"),
        }
    }
}

/// 触发循环：等待下一触发时间，派生一次备份，直到被取消
async fn run_trigger(
    schedule: Schedule,
    token: CancellationToken,
    runs: TaskTracker,
    executor: Arc<BackupExecutor>,
    task: BackupTask,
    host: String,
) {
    loop {
        let Some(next) = schedule.upcoming(Local).next() else {
            info!(task_id = task.task_id, "调度表达式没有后续触发时间");
            return;
        };
        let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        info!(task_id = task.task_id, "定时备份触发");
        let executor = executor.clone();
        let task = task.clone();
        let host = host.clone();
        runs.spawn(async move {
            match executor.execute(&task, &host).await {
                Ok(run) => info!(
                    task_id = task.task_id,
                    files_count = run.files_count,
                    s3_path = run.s3_path.as_deref().unwrap_or(""),
                    "定时备份成功"
                ),
                Err(e) => error!(task_id = task.task_id, error = %e, "定时备份失败"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::crontab_testing::MemoryCrontab;
    use super::*;
    use crate::archive::ArchiveBuilder;
    use crate::compose::testing::RecordingRunner;
    use crate::ledger::BackupLedger;
    use crate::storage::testing::{MemoryConnector, MemoryStorage};
    use crate::task::tests::sample_task;
    use tempfile::{TempDir, tempdir};

    const EXEC: &str = "/usr/bin/backup-server-agent";

    fn executor(root: &TempDir) -> Arc<BackupExecutor> {
        executor_with(root, Arc::new(RecordingRunner::default()))
    }

    fn executor_with(root: &TempDir, runner: Arc<RecordingRunner>) -> Arc<BackupExecutor> {
        let storage = Arc::new(MemoryStorage::new("backups"));
        Arc::new(BackupExecutor::new(
            ArchiveBuilder::new(root.path().join("out")),
            BackupLedger::new(root.path().join("backups.json")),
            Arc::new(MemoryConnector::new(storage)),
            runner,
        ))
    }

    fn scheduler(root: &TempDir, crontab: Arc<MemoryCrontab>) -> TaskScheduler {
        TaskScheduler::new(executor(root), "host", crontab).with_exec_path(EXEC)
    }

    fn scheduled(task_id: TaskId, cron: &str) -> BackupTask {
        let mut task = sample_task(task_id, "/data");
        task.schedule_cron = cron.to_string();
        task
    }

    #[tokio::test]
    async fn test_add_twice_keeps_one_line_and_one_job() {
        let root = tempdir().unwrap();
        let crontab = Arc::new(MemoryCrontab::default());
        let scheduler = scheduler(&root, crontab.clone());

        scheduler.add_task(scheduled(1, "0 2 * * *")).await.unwrap();
        scheduler.add_task(scheduled(1, "0 0 3 * * *")).await.unwrap();

        assert_eq!(scheduler.job_count().await, 1);
        assert_eq!(crontab.lines_for(1), 1);
        assert_eq!(
            crontab.content(),
            format!("0 3 * * * {EXEC} --task-id 1\n")
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unrelated_lines_preserved() {
        let root = tempdir().unwrap();
        let crontab = Arc::new(MemoryCrontab::with_content(
            "*/10 * * * * /usr/local/bin/rotate-logs\n",
        ));
        let scheduler = scheduler(&root, crontab.clone());

        scheduler.add_task(scheduled(2, "0 2 * * *")).await.unwrap();

        assert_eq!(
            crontab.content(),
            format!("*/10 * * * * /usr/local/bin/rotate-logs\n0 2 * * * {EXEC} --task-id 2\n")
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_task() {
        let root = tempdir().unwrap();
        let crontab = Arc::new(MemoryCrontab::default());
        let scheduler = scheduler(&root, crontab.clone());

        scheduler.add_task(scheduled(1, "0 2 * * *")).await.unwrap();
        scheduler.add_task(scheduled(2, "0 3 * * *")).await.unwrap();

        assert!(scheduler.remove_task(1).await);
        assert!(!scheduler.has_job(1).await);
        assert!(scheduler.has_job(2).await);
        assert_eq!(crontab.lines_for(1), 0);
        assert_eq!(crontab.lines_for(2), 1);

        assert!(!scheduler.remove_task(1).await);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_expression_not_installed() {
        let root = tempdir().unwrap();
        let crontab = Arc::new(MemoryCrontab::default());
        let scheduler = scheduler(&root, crontab.clone());

        scheduler.add_task(scheduled(1, "0 2 * * *")).await.unwrap();
        let result = scheduler.add_task(scheduled(1, "not a cron")).await;

        assert!(result.is_err());
        assert!(scheduler.has_job(1).await);
        assert_eq!(crontab.content(), format!("0 2 * * * {EXEC} --task-id 1\n"));
        assert_eq!(*crontab.writes.lock().unwrap(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_crontab_failure_is_not_fatal() {
        let root = tempdir().unwrap();
        let crontab = Arc::new(MemoryCrontab {
            fail_write: true,
            ..Default::default()
        });
        let scheduler = scheduler(&root, crontab);

        scheduler.add_task(scheduled(1, "0 2 * * *")).await.unwrap();
        assert!(scheduler.has_job(1).await);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_skips_unscheduled_and_invalid() {
        let root = tempdir().unwrap();
        let crontab = Arc::new(MemoryCrontab::default());
        let scheduler = scheduler(&root, crontab.clone());

        let tasks = vec![
            scheduled(1, "0 2 * * *"),
            sample_task(2, "/data"),
            scheduled(3, "bogus"),
        ];
        assert_eq!(scheduler.load_tasks(&tasks).await, 1);
        assert!(scheduler.has_job(1).await);
        assert_eq!(scheduler.job_count().await, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_runs_backup() {
        let root = tempdir().unwrap();
        let source = root.path().join("data");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.txt"), b"a").unwrap();

        let executor = executor(&root);
        let scheduler = TaskScheduler::new(
            executor.clone(),
            "host",
            Arc::new(MemoryCrontab::default()),
        );
        let mut task = sample_task(1, &source.to_string_lossy());
        task.schedule_cron = "* * * * * *".to_string();
        scheduler.add_task(task).await.unwrap();

        let mut records = Vec::new();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            records = executor.ledger().list().await.unwrap();
            if !records.is_empty() {
                break;
            }
        }
        scheduler.shutdown().await;
        assert!(!records.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_backup() {
        let root = tempdir().unwrap();
        let source = root.path().join("data");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.txt"), b"a").unwrap();

        let runner = Arc::new(RecordingRunner {
            delay: Some(Duration::from_millis(300)),
            ..Default::default()
        });
        let scheduler = TaskScheduler::new(
            executor_with(&root, runner.clone()),
            "host",
            Arc::new(MemoryCrontab::default()),
        );
        let mut task = sample_task(1, &source.to_string_lossy());
        task.schedule_cron = "* * * * * *".to_string();
        task.is_docker_compose = true;
        task.docker_compose_path = "/srv/app/docker-compose.yml".to_string();
        scheduler.add_task(task).await.unwrap();

        for _ in 0..40 {
            if runner.count("down") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(runner.count("down") > 0);

        scheduler.shutdown().await;
        assert_eq!(runner.count("up"), runner.count("down"));
    }

    #[tokio::test]
    async fn test_shutdown_retires_all_triggers() {
        let root = tempdir().unwrap();
        let scheduler = scheduler(&root, Arc::new(MemoryCrontab::default()));
        scheduler.add_task(scheduled(1, "0 2 * * *")).await.unwrap();
        scheduler.add_task(scheduled(2, "0 3 * * *")).await.unwrap();

        scheduler.shutdown().await;
        assert_eq!(scheduler.job_count().await, 0);
    }
}
