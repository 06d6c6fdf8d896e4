use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use tablefix::app::{audit_file, Application};
use tablefix::shutdown::ShutdownManager;
use tablefix_core::config::SeverityFilter;
use tablefix_core::AppConfig;
use tablefix_dispatcher::IntakeRequest;
use tablefix_domain::{LogLevel, Strategy};
use tablefix_infrastructure::LocalFileStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn cli() -> Command {
    let batch_id = || {
        Arg::new("batch-id")
            .value_name("BATCH_ID")
            .help("批次ID")
            .required(true)
    };
    let all = || {
        Arg::new("all")
            .long("all")
            .action(ArgAction::SetTrue)
            .help("包含WARN级别的问题")
    };

    Command::new("tablefix")
        .version(env!("CARGO_PKG_VERSION"))
        .about("试题文档中HTML表格的审计与AI修复")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("配置文件路径，缺省时查找 config/tablefix.toml 和 tablefix.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .global(true)
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .subcommand(
            Command::new("audit")
                .about("审计文件并输出报告，不创建批次")
                .arg(Arg::new("file").value_name("FILE").required(true))
                .arg(all()),
        )
        .subcommand(
            Command::new("run")
                .about("审计并修复文件，处理到批次结束")
                .arg(Arg::new("file").value_name("FILE").required(true))
                .arg(
                    Arg::new("strategy")
                        .long("strategy")
                        .value_name("STRATEGY")
                        .help("模型策略，缺省使用配置中的 repair.default_strategy")
                        .value_parser(["hybrid", "pool"]),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("只审计并写出报告"),
                )
                .arg(all().help("WARN级别的问题也生成修复任务")),
        )
        .subcommand(
            Command::new("status")
                .about("查看批次状态和进度")
                .arg(batch_id()),
        )
        .subcommand(Command::new("list").about("列出所有批次"))
        .subcommand(
            Command::new("logs")
                .about("查看批次的处理日志")
                .arg(batch_id())
                .arg(
                    Arg::new("level")
                        .long("level")
                        .value_name("LEVEL")
                        .help("只显示该级别的日志")
                        .value_parser(["debug", "info", "warn", "error"]),
                ),
        )
        .subcommand(Command::new("cancel").about("取消批次").arg(batch_id()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;

    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.observability.log_level);
    let log_format = matches
        .get_one::<String>("log-format")
        .unwrap_or(&config.observability.log_format);
    init_logging(log_level, log_format)?;

    match matches.subcommand() {
        Some(("audit", args)) => {
            let file = required(args, "file")?;
            let report = audit_file(&LocalFileStore::new(), file, args.get_flag("all")).await?;
            print_json(&report)
        }
        Some((name, args)) => {
            let app = Application::new(config).await?;
            let result = dispatch(&app, name, args).await;
            app.close().await;
            result
        }
        None => Err(anyhow::anyhow!("缺少子命令")),
    }
}

async fn dispatch(app: &Application, name: &str, args: &ArgMatches) -> Result<()> {
    match name {
        "run" => {
            let file = required(args, "file")?;
            let strategy = match args.get_one::<String>("strategy") {
                Some(s) => s.as_str(),
                None => app.config().repair.default_strategy.as_str(),
            }
            .parse::<Strategy>()
            .map_err(anyhow::Error::msg)?;
            let mut request = IntakeRequest::new(file, strategy).dry_run(args.get_flag("dry-run"));
            if args.get_flag("all") {
                request = request.with_severity_filter(SeverityFilter::All);
            }

            let shutdown = ShutdownManager::new();
            let signals = shutdown.watch_signals();
            info!("处理文件 {file}，策略 {strategy}");
            let summary = app.run(request, shutdown.subscribe().await).await;
            signals.abort();
            print_json(&summary?)
        }
        "status" => print_json(&app.status(required(args, "batch-id")?).await?),
        "list" => print_json(&app.list().await?),
        "logs" => {
            let level = args
                .get_one::<String>("level")
                .map(|l| l.parse::<LogLevel>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            print_json(&app.logs(required(args, "batch-id")?, level).await?)
        }
        "cancel" => print_json(&app.cancel(required(args, "batch-id")?).await?),
        other => Err(anyhow::anyhow!("不支持的子命令: {other}")),
    }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("缺少参数: {name}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("序列化输出失败")?;
    println!("{text}");
    Ok(())
}

/// 初始化日志系统，日志写到标准错误，标准输出只留给命令结果
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}
