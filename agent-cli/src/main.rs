use agent_cli::{AgentApp, Cli, setup_logging};
use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_guard = setup_logging(cli.verbose);

    let code = run(cli).await;

    // 退出前刷新文件日志
    drop(log_guard);
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let app = match AgentApp::new(&cli.config) {
        Ok(app) => app,
        Err(e) => {
            error!("❌ 初始化失败: {e:#}");
            return 1;
        }
    };

    match cli.task_id {
        Some(task_id) => match app.run_task_once(task_id).await {
            Ok(run) => {
                match serde_json::to_string_pretty(&run) {
                    Ok(report) => println!("{report}"),
                    Err(e) => error!("输出执行结果失败: {e}"),
                }
                if run.success { 0 } else { 1 }
            }
            Err(e) => {
                error!("❌ 任务 {task_id} 执行失败: {e:#}");
                1
            }
        },
        None => match app.run_daemon().await {
            Ok(()) => 0,
            Err(e) => {
                error!("❌ 运行失败: {e:#}");
                1
            }
        },
    }
}
