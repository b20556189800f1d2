//! DevHub daemon and command-line client.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use devhub::config::Config;
use devhub::ipc::IpcClient;
use devhub::orchestrator::DevHub;
use protocol::messages::{
    AppInfo, ConsoleInfo, ConsoleRequest, ManagementResponse,
};

/// DevHub - supervises app consoles and streams lifecycle events.
#[derive(Parser, Debug)]
#[command(name = "devhub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Start,

    /// Ask the running daemon to stop
    Stop {
        /// Seconds to wait for the socket to disappear
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Inspect and reset applications
    #[command(subcommand)]
    Apps(AppsCommands),

    /// Manage console programs
    #[command(subcommand)]
    Console(ConsoleCommands),

    /// Publish a JSON event to connected observers
    Publish {
        /// Event object, e.g. `{"event":"deployed","app":"blog"}`
        event: String,

        /// Extra routing tag (repeatable)
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum AppsCommands {
    /// List known applications
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve one application by key
    Get {
        /// Application key, e.g. `blog`, `blog.test` or `blog-a1b2c3`
        id: String,

        /// Only match applications the daemon already knows
        #[arg(long)]
        no_create: bool,
    },

    /// Change pool settings on the running daemon
    Update {
        /// Default console idle timeout in seconds (at least 60)
        #[arg(long, value_name = "SECS")]
        idle_timeout: Option<u64>,
    },

    /// Kill every console, forget every app and drop every observer
    Purge,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConsoleCommands {
    /// Start a console program for an application
    Start {
        /// Application key
        app: String,

        /// Console key (defaults to the command's base name)
        #[arg(long, short)]
        key: Option<String>,

        /// Kill the console after this many idle seconds
        #[arg(long, value_name = "SECS")]
        idle_timeout: Option<u64>,

        /// Run through a login + interactive shell
        #[arg(long, short)]
        interactive: bool,

        /// Shell to run the command with
        #[arg(long)]
        shell: Option<String>,

        /// Command to run (a plain shell when omitted)
        #[arg(last = true)]
        argv: Vec<String>,
    },

    /// Kill a console program
    Kill {
        /// Application key
        app: String,

        /// Console key
        key: String,

        /// Reason reported to observers
        #[arg(long, short)]
        reason: Option<String>,
    },

    /// List console programs
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;

    match cli.command {
        Commands::Start => run_daemon(config).await,
        Commands::Stop { timeout } => stop_daemon(&config, timeout).await,
        Commands::Status => {
            match connect(&config).await?.status().await? {
                ManagementResponse::Status {
                    running,
                    uptime_secs,
                    app_count,
                    console_count,
                    observer_count,
                } => {
                    println!(
                        "Daemon Status: {}",
                        if running { "running" } else { "stopping" }
                    );
                    println!("  Uptime:    {}", format_duration(uptime_secs));
                    println!("  Apps:      {}", app_count);
                    println!("  Consoles:  {}", console_count);
                    println!("  Observers: {}", observer_count);
                    Ok(())
                }
                other => unexpected(other),
            }
        }
        Commands::Apps(cmd) => {
            let mut client = connect(&config).await?;
            match cmd {
                AppsCommands::List { json } => match client.list_apps().await? {
                    ManagementResponse::Apps { apps } if json => print_json(&apps),
                    ManagementResponse::Apps { apps } => {
                        print_apps_table(&apps);
                        Ok(())
                    }
                    other => unexpected(other),
                },
                AppsCommands::Get { id, no_create } => {
                    match client.get_app(id, no_create).await? {
                        ManagementResponse::App(app) => print_json(&app),
                        other => unexpected(other),
                    }
                }
                AppsCommands::Update { idle_timeout } => {
                    match client.update_pool(idle_timeout).await? {
                        ManagementResponse::PoolUpdated { idle_timeout_secs } => {
                            println!(
                                "Idle timeout: {}",
                                idle_timeout_secs.map_or("none".to_string(), format_duration)
                            );
                            Ok(())
                        }
                        other => unexpected(other),
                    }
                }
                AppsCommands::Purge => match client.purge_apps().await? {
                    ManagementResponse::Purged {
                        apps,
                        consoles,
                        observers,
                    } => {
                        println!(
                            "Purged {} app(s), {} console(s), {} observer(s)",
                            apps, consoles, observers
                        );
                        Ok(())
                    }
                    other => unexpected(other),
                },
            }
        }
        Commands::Console(cmd) => {
            let mut client = connect(&config).await?;
            match cmd {
                ConsoleCommands::Start {
                    app,
                    key,
                    idle_timeout,
                    interactive,
                    shell,
                    argv,
                } => {
                    let request = ConsoleRequest {
                        app,
                        key,
                        argv: shell_command(&argv),
                        shell,
                        interactive: interactive.then_some(true),
                        idle_timeout_secs: idle_timeout,
                        ..Default::default()
                    };
                    match client.start_console(request).await? {
                        ManagementResponse::ConsoleStarted(info) => {
                            println!(
                                "Started {} (pid {})",
                                info.label,
                                info.pid.map_or("-".to_string(), |p| p.to_string())
                            );
                            Ok(())
                        }
                        other => unexpected(other),
                    }
                }
                ConsoleCommands::Kill { app, key, reason } => {
                    match client.kill_console(app, key, reason).await? {
                        ManagementResponse::ConsoleKilled { label } => {
                            println!("Killed {}", label);
                            Ok(())
                        }
                        other => unexpected(other),
                    }
                }
                ConsoleCommands::List { json } => match client.list_consoles().await? {
                    ManagementResponse::Consoles { consoles } if json => print_json(&consoles),
                    ManagementResponse::Consoles { consoles } => {
                        print_consoles_table(&consoles);
                        Ok(())
                    }
                    other => unexpected(other),
                },
            }
        }
        Commands::Publish { event, tags } => {
            let mut client = connect(&config).await?;
            match client.publish_event(event, tags).await? {
                ManagementResponse::Published => Ok(()),
                other => unexpected(other),
            }
        }
    }
}

/// Run the daemon until SIGTERM, SIGINT or a stop request.
async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let mut devhub = DevHub::new(config)?;

    if IpcClient::connect_with_timeout(devhub.socket_path(), Duration::from_millis(500))
        .await
        .is_ok()
    {
        anyhow::bail!(
            "Daemon already running on {}; stop it with `devhub stop`",
            devhub.socket_path().display()
        );
    }

    devhub.start().await?;

    let shutdown = devhub.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = shutdown.cancelled() => tracing::info!("Stop requested"),
    }

    devhub.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

async fn stop_daemon(config: &Config, timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = config.socket_path();
    match connect(config).await?.stop().await? {
        ManagementResponse::Stopping => {}
        other => return unexpected(other),
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while socket_path.exists() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("Daemon did not stop within {}s", timeout_secs);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!("Daemon stopped");
    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<IpcClient> {
    let socket_path = config.socket_path();
    IpcClient::connect_with_timeout(&socket_path, Duration::from_secs(5))
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Daemon is not running (cannot connect to {})",
                socket_path.display()
            )
        })
}

fn unexpected(response: ManagementResponse) -> anyhow::Result<()> {
    match response {
        ManagementResponse::Error { kind, message } => {
            anyhow::bail!("{} ({})", message, kind.status_code())
        }
        other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_apps_table(apps: &[AppInfo]) {
    if apps.is_empty() {
        println!("No apps.");
        return;
    }

    let name_width = apps.iter().map(|a| a.name.len()).max().unwrap_or(4).max(4);
    println!("{:<name_width$}  {:<8}  {:>8}  DIR", "NAME", "STATUS", "CONSOLES");
    for app in apps {
        println!(
            "{:<name_width$}  {:<8}  {:>8}  {}",
            app.name,
            format!("{:?}", app.status).to_lowercase(),
            app.consoles.len(),
            app.dir
        );
    }
}

fn print_consoles_table(consoles: &[ConsoleInfo]) {
    if consoles.is_empty() {
        println!("No consoles.");
        return;
    }

    let label_width = consoles
        .iter()
        .map(|c| c.label.len())
        .max()
        .unwrap_or(5)
        .max(5);
    println!("{:<label_width$}  {:>7}  {:<8}  COMMAND", "LABEL", "PID", "STATE");
    for console in consoles {
        println!(
            "{:<label_width$}  {:>7}  {:<8}  {}",
            console.label,
            console.pid.map_or("-".to_string(), |p| p.to_string()),
            format!("{:?}", console.state).to_lowercase(),
            truncate_str(&console.command_line, 60)
        );
    }
    println!();
    println!("Total: {} console(s)", consoles.len());
}

/// Join the words after `--` into the single command string given to the
/// shell's `-c`. Empty when no command was given.
fn shell_command(argv: &[String]) -> Vec<String> {
    if argv.is_empty() {
        Vec::new()
    } else {
        vec![shell_words::join(argv)]
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["devhub", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
    }

    #[test]
    fn test_stop_default_timeout() {
        let cli = Cli::try_parse_from(["devhub", "stop"]).unwrap();
        assert!(matches!(cli.command, Commands::Stop { timeout: 10 }));
    }

    #[test]
    fn test_apps_get_no_create() {
        let cli = Cli::try_parse_from(["devhub", "apps", "get", "blog.test", "--no-create"]).unwrap();
        match cli.command {
            Commands::Apps(AppsCommands::Get { id, no_create }) => {
                assert_eq!(id, "blog.test");
                assert!(no_create);
            }
            other => panic!("Expected apps get, got {other:?}"),
        }
    }

    #[test]
    fn test_apps_update_idle_timeout() {
        let cli =
            Cli::try_parse_from(["devhub", "apps", "update", "--idle-timeout", "900"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Apps(AppsCommands::Update {
                idle_timeout: Some(900)
            })
        ));
    }

    #[test]
    fn test_publish_repeated_tags() {
        let cli = Cli::try_parse_from([
            "devhub",
            "publish",
            r#"{"event":"deployed"}"#,
            "--tag",
            "deploys",
            "--tag",
            "ci",
        ])
        .unwrap();
        match cli.command {
            Commands::Publish { event, tags } => {
                assert_eq!(event, r#"{"event":"deployed"}"#);
                assert_eq!(tags, vec!["deploys", "ci"]);
            }
            other => panic!("Expected publish, got {other:?}"),
        }
    }

    #[test]
    fn test_console_start_trailing_argv() {
        let cli = Cli::try_parse_from([
            "devhub",
            "console",
            "start",
            "blog",
            "--key",
            "rails",
            "--idle-timeout",
            "600",
            "--",
            "bin/rails",
            "console",
        ])
        .unwrap();
        match cli.command {
            Commands::Console(ConsoleCommands::Start {
                app,
                key,
                idle_timeout,
                interactive,
                argv,
                ..
            }) => {
                assert_eq!(app, "blog");
                assert_eq!(key.as_deref(), Some("rails"));
                assert_eq!(idle_timeout, Some(600));
                assert!(!interactive);
                assert_eq!(argv, vec!["bin/rails", "console"]);
            }
            other => panic!("Expected console start, got {other:?}"),
        }
    }

    #[test]
    fn test_console_start_without_command() {
        let cli = Cli::try_parse_from(["devhub", "console", "start", "blog", "-i"]).unwrap();
        match cli.command {
            Commands::Console(ConsoleCommands::Start {
                interactive, argv, ..
            }) => {
                assert!(interactive);
                assert!(argv.is_empty());
                assert!(shell_command(&argv).is_empty());
            }
            other => panic!("Expected console start, got {other:?}"),
        }
    }

    #[test]
    fn test_shell_command_keeps_every_word() {
        let argv = vec!["bin/rails".to_string(), "console".to_string()];
        assert_eq!(shell_command(&argv), vec!["bin/rails console"]);

        let quoted = vec!["echo".to_string(), "hello world".to_string()];
        assert_eq!(shell_command(&quoted), vec!["echo 'hello world'"]);
    }

    #[test]
    fn test_console_start_requires_argv() {
        assert!(Cli::try_parse_from(["devhub", "console", "start", "blog"]).is_err());
    }

    #[test]
    fn test_console_kill_with_reason() {
        let cli =
            Cli::try_parse_from(["devhub", "console", "kill", "blog", "rails", "-r", "done"]).unwrap();
        match cli.command {
            Commands::Console(ConsoleCommands::Kill { app, key, reason }) => {
                assert_eq!(app, "blog");
                assert_eq!(key, "rails");
                assert_eq!(reason.as_deref(), Some("done"));
            }
            other => panic!("Expected console kill, got {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli = Cli::try_parse_from(["devhub", "status", "-v", "-c", "/tmp/devhub.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/devhub.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["devhub"]).is_err());
        assert!(Cli::try_parse_from(["devhub", "apps"]).is_err());
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a long command line", 10), "a long ...");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }
}
