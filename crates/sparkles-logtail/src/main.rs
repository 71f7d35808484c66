use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sparkles_logtail::config::{
    APP_NAME, AppConfig, discover_config_file, load_config, write_default_config,
};
use sparkles_logtail::poller::PollState;
use sparkles_logtail::sink::TerminalSink;
use sparkles_logtail::tail::{TailRequest, tail_task};

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err:?}");
            ExitCode::FAILURE
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Tail(cmd) => async_tail(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd).map(|_| ExitCode::SUCCESS),
        Command::Config { command } => handle_config(&ctx, command).map(|_| ExitCode::SUCCESS),
        Command::Completions { shell } => {
            handle_completions(shell);
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tail the output of a task running on a sparkles worker.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream a task's output until the task finishes
    Tail(TailCommand),
    /// Create the config directory and default file
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct TailCommand {
    /// Worker address (host:port) serving the Monitor endpoint
    #[arg(long, value_name = "HOST:PORT")]
    node: String,
    /// Task whose output to read
    #[arg(long, value_name = "TASK_ID")]
    task: String,
    /// Google Cloud project holding the cluster credentials
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    project: Option<String>,
    /// Maximum bytes requested per call
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<u32>,
    /// Pause between polls that returned no new output
    #[arg(long, value_name = "MS")]
    idle_delay_ms: Option<u64>,
    /// Consecutive failed calls before giving up (0 retries forever, with no time limit)
    #[arg(long, value_name = "N")]
    max_attempts: Option<u32>,
    /// TLS server name expected in the worker certificate
    #[arg(long, value_name = "NAME")]
    server_name: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = discover_config_file(common.config.clone())?;
        if !config_file.exists() && !common.dry_run {
            write_default_config(&config_file)?;
        }
        let config = load_config(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            return;
        }

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "sparkles_logtail={level},sparkles_protocol={level}"
            ))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(self.use_color(io::stderr().is_terminal()))
                        .with_target(false),
                )
                .try_init()
                .ok();
        }
    }

    fn effective_log_level(&self) -> &str {
        if self.common.trace {
            "trace"
        } else if self.common.debug {
            "debug"
        } else {
            match self.common.verbose {
                0 => self.config.logging.level.as_str(),
                1 => "debug",
                _ => "trace",
            }
        }
    }

    fn use_color(&self, is_terminal: bool) -> bool {
        let force_color = matches!(self.common.color, ColorOption::Always)
            || env::var_os("FORCE_COLOR").is_some();
        let disable_color = self.common.no_color
            || matches!(self.common.color, ColorOption::Never)
            || env::var_os("NO_COLOR").is_some()
            || (!force_color && !is_terminal);
        !disable_color
    }
}

#[tokio::main]
async fn async_tail(ctx: RuntimeContext, cmd: TailCommand) -> Result<ExitCode> {
    handle_tail(&ctx, cmd).await
}

async fn handle_tail(ctx: &RuntimeContext, cmd: TailCommand) -> Result<ExitCode> {
    let mut config = ctx.config.clone();
    apply_tail_overrides(&mut config, &cmd);

    let request = TailRequest {
        record_key: config.record_key(),
        channel: config.channel_settings(&cmd.node)?,
        task_id: cmd.task.clone(),
        options: config.poll_options()?,
        retry: config.retry_policy()?,
    };
    let store = config
        .credential_store()
        .context("configuring credential store")?;
    let sink = TerminalSink::stdout(ctx.use_color(io::stdout().is_terminal()));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let summary = tail_task(&store, request, sink, &cancel)
        .await
        .with_context(|| format!("tailing task {} on {}", cmd.task, cmd.node))?;

    match summary.state {
        PollState::Finished => Ok(ExitCode::SUCCESS),
        PollState::Cancelled => {
            info!(offset = summary.offset, "interrupted");
            Ok(ExitCode::from(130))
        }
        PollState::Polling => Err(anyhow!("poller stopped while still polling")),
    }
}

/// Layer `tail` flags over the loaded configuration.
fn apply_tail_overrides(config: &mut AppConfig, cmd: &TailCommand) {
    if let Some(project) = &cmd.project {
        config.datastore.project_id = Some(project.clone());
    }
    if let Some(chunk_size) = cmd.chunk_size {
        config.poll.chunk_size = chunk_size;
    }
    if let Some(idle_delay_ms) = cmd.idle_delay_ms {
        config.poll.idle_delay_ms = idle_delay_ms;
    }
    if let Some(max_attempts) = cmd.max_attempts {
        config.retry.max_attempts = max_attempts;
        if max_attempts == 0 {
            config.retry.max_elapsed_secs = 0;
        }
    }
    if let Some(server_name) = &cmd.server_name {
        config.channel.server_name = server_name.clone();
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping");
    token.cancel();
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    // RuntimeContext::new already wrote a default file if none existed.
    if ctx.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        info!("config present at {}", ctx.config_file.display());
        return Ok(());
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.config_file)
        }
    }
}

fn handle_completions(shell: Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
}
