//! fanout CLI
//!
//! Runs a command, or copies a file, on many hosts at once over SSH

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use eyre::{WrapErr, bail};
use tracing::{info, warn};

use fanout_core::{BatchResult, CoreError, ExecutionPolicy, Executor, Job, TracingSink};
use fanout_exec::{HostKeyCheck, HostSpec};

mod config;
mod hostlist;
mod logging;
mod report;
mod ssh_config;
mod transport;

use config::{Config, LogFormat};
use hostlist::HostTarget;
use report::BatchReport;
use transport::RoutingTransport;

/// Exit code for configuration and usage errors
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Run commands on many hosts over SSH", long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalOpts {
    /// Config file (default: $FANOUT_CONFIG, ./fanout.toml, ...)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hosts, comma separated; ranges like web[01-03] are expanded
    #[arg(short = 'H', long = "hosts", global = true)]
    hosts: Vec<String>,

    /// File with one host expression per line
    #[arg(long, global = true)]
    hosts_file: Option<PathBuf>,

    /// Login user for hosts that do not name one
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// SSH port for hosts that do not name one
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Private key to use instead of the usual ~/.ssh identities
    #[arg(short, long, global = true)]
    identity: Option<PathBuf>,

    /// Per-attempt timeout in seconds
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    /// Connect timeout in seconds
    #[arg(long, global = true)]
    connect_timeout: Option<u64>,

    /// Retries after the first attempt
    #[arg(short, long, global = true)]
    retries: Option<u32>,

    /// Hosts processed at the same time
    #[arg(short, long, global = true)]
    concurrency: Option<usize>,

    /// Give up on a host after this many seconds across all attempts
    #[arg(long, global = true)]
    deadline: Option<u64>,

    #[arg(long, value_enum, global = true)]
    host_key_check: Option<KeyCheckArg>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    /// More logging (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shell command on every host
    Run {
        /// Command line, passed to the remote shell
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Copy a local file to every host
    Put {
        local: PathBuf,
        remote: String,
        /// File mode in octal, e.g. 644
        #[arg(long, value_parser = parse_mode)]
        mode: Option<u32>,
    },
    /// Copy a file from every host
    ///
    /// With several hosts the file is saved as `<local>.<host>`.
    Get { remote: String, local: PathBuf },
    /// Print the expanded host list
    Hosts,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KeyCheckArg {
    AcceptAll,
    AcceptNew,
    Strict,
}

impl From<KeyCheckArg> for HostKeyCheck {
    fn from(arg: KeyCheckArg) -> Self {
        match arg {
            KeyCheckArg::AcceptAll => HostKeyCheck::AcceptAll,
            KeyCheckArg::AcceptNew => HostKeyCheck::AcceptNew,
            KeyCheckArg::Strict => HostKeyCheck::Strict,
        }
    }
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| format!("invalid octal mode '{s}'"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match load_config(&cli.opts) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fanout: {e:?}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    let log_format = if cli.opts.log_json {
        LogFormat::Json
    } else {
        config.defaults.log_format
    };
    logging::init(cli.opts.verbose, &config.defaults.log_level, log_format);

    let (hosts, policy) = match prepare(&cli.opts, &config) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("fanout: {e:?}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    let (job, download_to) = match cli.command {
        Commands::Hosts => {
            for host in &hosts {
                println!("{host}");
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Run { command } => (Job::Command(command.join(" ")), None),
        Commands::Put {
            local,
            remote,
            mode,
        } => {
            let data = tokio::fs::read(&local)
                .await
                .wrap_err_with(|| format!("failed to read {}", local.display()))?;
            let job = Job::Upload {
                data,
                remote_path: remote,
                mode,
            };
            (job, None)
        }
        Commands::Get { remote, local } => (Job::Download { remote_path: remote }, Some(local)),
    };

    let executor = Executor::new(RoutingTransport::from_config(&config))
        .with_resolver(config.resolver())
        .with_sink(Arc::new(TracingSink));

    let batch = match run_batch(&executor, hosts, job, &policy).await {
        Ok(batch) => batch,
        Err(CoreError::InvalidPolicy(reason)) => {
            eprintln!("fanout: invalid policy: {reason}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(local) = download_to {
        save_downloads(&batch, &local).await?;
    }

    if cli.opts.json {
        println!("{}", serde_json::to_string_pretty(&BatchReport::from(&batch))?);
    } else {
        print!("{}", report::render_text(&batch));
    }

    Ok(ExitCode::from(report::exit_code(&batch)))
}

fn load_config(opts: &GlobalOpts) -> Result<Config> {
    let mut config = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // CLI flags override the file
    if let Some(user) = &opts.user {
        config.defaults.user = Some(user.clone());
    }
    if let Some(port) = opts.port {
        config.defaults.port = port;
    }
    if let Some(identity) = &opts.identity {
        config.defaults.key_file = Some(identity.clone());
    }
    if let Some(check) = opts.host_key_check {
        config.defaults.host_key_check = check.into();
    }
    config.load_ssh_config()?;
    Ok(config)
}

/// Host list and policy from config plus flags
fn prepare(opts: &GlobalOpts, config: &Config) -> Result<(Vec<HostSpec>, ExecutionPolicy)> {
    let mut expressions = Vec::new();
    for list in &opts.hosts {
        expressions.extend(hostlist::expand_list(list)?);
    }
    if let Some(path) = &opts.hosts_file {
        expressions.extend(hostlist::read_hosts_file(path)?);
    }

    let hosts = if expressions.is_empty() {
        config.configured_hosts()?
    } else {
        expressions
            .iter()
            .map(|expr| HostTarget::parse(expr).map(|t| config.host_spec(&t)))
            .collect::<Result<Vec<_>, _>>()?
    };
    if hosts.is_empty() {
        bail!("no hosts given (use -H, --hosts-file or [[host]] in the config)");
    }

    let mut policy = config.policy.to_policy();
    if let Some(secs) = opts.timeout {
        policy.timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = opts.connect_timeout {
        policy.connect_timeout = Some(Duration::from_secs(secs));
    }
    if let Some(retries) = opts.retries {
        policy.max_retries = retries;
    }
    if let Some(concurrency) = opts.concurrency {
        policy.max_concurrent_hosts = concurrency;
    }
    if let Some(secs) = opts.deadline {
        policy.deadline = Some(Duration::from_secs(secs));
    }

    Ok((hosts, policy))
}

/// Run the batch, cancelling it on Ctrl-C
async fn run_batch(
    executor: &Executor,
    hosts: Vec<HostSpec>,
    job: Job,
    policy: &ExecutionPolicy,
) -> Result<BatchResult, CoreError> {
    info!(hosts = hosts.len(), job = %job.describe(), "starting");
    let running = executor.start(hosts, job, policy)?;

    let cancel = running.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling remaining hosts");
            cancel.cancel();
        }
    });

    let batch = running.wait().await;
    interrupt.abort();
    batch
}

async fn save_downloads(batch: &BatchResult, local: &std::path::Path) -> Result<()> {
    let several = batch.len() > 1;
    for result in &batch.results {
        let Some(output) = result.outcome.output().filter(|o| o.success()) else {
            continue;
        };

        let path = if several {
            let mut name = local.as_os_str().to_owned();
            name.push(format!(".{}", result.host));
            PathBuf::from(name)
        } else {
            local.to_path_buf()
        };
        tokio::fs::write(&path, &output.stdout)
            .await
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
        info!(host = %result.host, path = %path.display(), "saved download");
    }
    Ok(())
}
