use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info};
use serde::Serialize;

use sbx::backend;
use sbx::config::{APP_NAME, default_config_path};
use sbx::{
    BackendVariant, ExecutionRequest, ExecutionResult, Language, RuntimeType, SandboxSession,
    SessionConfig, SessionError,
};

fn main() {
    match try_main() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err:?}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn async_run(ctx: RuntimeContext, cmd: RunCommand) -> Result<i32> {
    handle_run(&ctx, cmd).await
}

#[tokio::main]
async fn async_doctor(ctx: RuntimeContext) -> Result<i32> {
    handle_doctor(&ctx).await
}

fn try_main() -> Result<i32> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {:?}", ctx.config_file);

    match cli.command {
        Command::Run(cmd) => async_run(ctx, cmd),
        Command::Doctor => async_doctor(ctx),
        Command::Config { command } => handle_config(&ctx, command).map(|_| 0),
        Command::Completions { shell } => handle_completions(shell).map(|_| 0),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "sbx - run code in ephemeral Docker, Podman or Kubernetes sandboxes.",
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
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Provision a sandbox, run a command or source file in it, tear it down
    Run(RunCommand),
    /// Check that the configured backend is reachable
    Doctor,
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
struct RunCommand {
    /// Language runtime (python, javascript, go, ruby, r, cpp, java)
    #[arg(short, long, value_name = "LANG")]
    language: Option<Language>,
    /// Image to provision instead of the language default
    #[arg(long, value_name = "IMAGE")]
    image: Option<String>,
    /// Backend (docker, podman, kubernetes)
    #[arg(short, long, value_name = "BACKEND")]
    backend: Option<String>,
    /// Library to install before running (repeatable)
    #[arg(short = 'L', long = "lib", value_name = "REQ")]
    libraries: Vec<String>,
    /// Copy a host path into the sandbox before running, LOCAL:REMOTE
    #[arg(short, long = "input", value_name = "LOCAL:REMOTE")]
    inputs: Vec<String>,
    /// Copy a sandbox path to the host afterwards, REMOTE:LOCAL
    #[arg(short, long = "output", value_name = "REMOTE:LOCAL")]
    outputs: Vec<String>,
    /// Run this source file with the language's interpreter
    #[arg(short, long, value_name = "PATH", conflicts_with = "command")]
    file: Option<PathBuf>,
    /// Working directory inside the sandbox
    #[arg(short = 'w', long, value_name = "DIR")]
    workdir: Option<String>,
    /// Seconds before the command is cancelled
    #[arg(short, long, value_name = "SECONDS")]
    timeout: Option<u64>,
    /// Fold stderr into stdout
    #[arg(long)]
    merge_output: bool,
    /// Command to run; a single argument is interpreted by `sh -c`
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: Option<PathBuf>,
    config: SessionConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match common.config.clone() {
            Some(path) => Some(path),
            None => default_config_path(),
        };
        let config = SessionConfig::load(common.config.as_deref())
            .context("loading configuration")?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Drivers log through the log crate.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
        builder.filter_module(APP_NAME, self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Split `a:b` at the first colon.
fn split_mapping(value: &str, what: &str) -> Result<(String, String)> {
    match value.split_once(':') {
        Some((a, b)) if !a.is_empty() && !b.is_empty() => Ok((a.to_string(), b.to_string())),
        _ => bail!("{what} must look like A:B, got '{value}'"),
    }
}

enum Work {
    Source(String),
    Command(ExecutionRequest),
}

fn session_config(ctx: &RuntimeContext, cmd: &RunCommand) -> Result<SessionConfig> {
    let mut config = ctx.config.clone();
    if let Some(language) = cmd.language {
        config.language = language;
    }
    if let Some(ref image) = cmd.image {
        config.image = Some(image.clone());
    }
    if let Some(ref backend) = cmd.backend {
        config.backend = backend
            .parse::<BackendVariant>()
            .map_err(|e| anyhow!(e))?;
        if let Ok(engine) = backend.parse::<RuntimeType>() {
            config.engine = Some(engine);
        }
    }
    if ctx.common.verbose > 0 {
        config.verbose = true;
    }
    let config = config
        .with_libraries(&cmd.libraries)
        .context("parsing --lib")?;
    config.validate().context("invalid session configuration")?;
    Ok(config)
}

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<i32> {
    if cmd.command.is_empty() && cmd.file.is_none() {
        bail!("nothing to run: pass a command after `--` or --file");
    }

    let config = session_config(ctx, &cmd)?;
    let inputs = cmd
        .inputs
        .iter()
        .map(|m| split_mapping(m, "--input"))
        .collect::<Result<Vec<_>>>()?;
    let outputs = cmd
        .outputs
        .iter()
        .map(|m| split_mapping(m, "--output"))
        .collect::<Result<Vec<_>>>()?;
    let work = match cmd.file {
        Some(ref path) => Work::Source(
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
        ),
        None => {
            let mut request = if cmd.command.len() == 1 {
                ExecutionRequest::shell(cmd.command[0].clone())
            } else {
                ExecutionRequest::argv(cmd.command.clone())
            };
            if let Some(secs) = cmd.timeout {
                request = request.timeout(Duration::from_secs(secs));
            }
            if let Some(ref workdir) = cmd.workdir {
                request = request.workdir(workdir.clone());
            }
            Work::Command(request.merge_output(cmd.merge_output))
        }
    };

    // Source files run under the session-wide timeout.
    let config = match (cmd.timeout, &work) {
        (Some(secs), Work::Source(_)) => config.with_default_timeout(Duration::from_secs(secs)),
        _ => config,
    };

    info!("starting {} sandbox on {}", config.language, config.backend);

    let result = SandboxSession::scoped(config, |session| async move {
        for (local, remote) in &inputs {
            session.copy_to_runtime(local, remote).await?;
        }

        let result = match work {
            Work::Source(code) => session.run(&code).await?,
            Work::Command(request) => session.execute(request).await?,
        };

        for (remote, local) in &outputs {
            session.copy_from_runtime(remote, local).await?;
        }
        Ok::<_, SessionError>(result)
    })
    .await?;

    print_result(ctx, &result)?;
    if result.timed_out {
        eprintln!("sbx: command timed out after {:?}", result.elapsed);
    }
    Ok(result.exit_code)
}

fn print_result(ctx: &RuntimeContext, result: &ExecutionResult) -> Result<()> {
    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(result).context("serializing result to JSON")?
        );
    } else if ctx.common.yaml {
        println!(
            "{}",
            serde_yaml::to_string(result).context("serializing result to YAML")?
        );
    } else {
        io::stdout()
            .write_all(result.stdout.as_bytes())
            .context("writing stdout")?;
        io::stderr()
            .write_all(result.stderr.as_bytes())
            .context("writing stderr")?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    backend: String,
    reachable: bool,
    detail: String,
}

async fn handle_doctor(ctx: &RuntimeContext) -> Result<i32> {
    let backend = backend::connect(&ctx.config).context("selecting backend")?;
    let report = match backend.health_check().await {
        Ok(version) => DoctorReport {
            backend: backend.variant().to_string(),
            reachable: true,
            detail: version.trim().to_string(),
        },
        Err(e) => DoctorReport {
            backend: backend.variant().to_string(),
            reachable: false,
            detail: e.to_string(),
        },
    };

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing report to JSON")?
        );
    } else if ctx.common.yaml {
        println!(
            "{}",
            serde_yaml::to_string(&report).context("serializing report to YAML")?
        );
    } else if report.reachable {
        println!("{}: ok", report.backend);
        debug!("{}", report.detail);
    } else {
        println!("{}: unreachable ({})", report.backend, report.detail);
    }

    Ok(if report.reachable { 0 } else { 2 })
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
                print!("{}", ctx.config.to_toml()?);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            let path = ctx
                .config_file
                .as_ref()
                .ok_or_else(|| anyhow!("unable to determine configuration directory"))?;
            println!("{}", path.display());
            Ok(())
        }
        ConfigCommand::Init { force } => {
            let path = ctx
                .config_file
                .as_ref()
                .ok_or_else(|| anyhow!("unable to determine configuration directory"))?;
            if path.exists() && !force {
                bail!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                );
            }
            write_default_config(path)?;
            info!("wrote {}", path.display());
            Ok(())
        }
    }
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = SessionConfig::default()
        .to_toml()
        .context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# Environment variables override these values, e.g. SBX_BACKEND=kubernetes\n\n");
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
