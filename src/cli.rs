use crate::client::nprinting::{NPrintingClient, NPrintingConfig, DEFAULT_LOGIN_PATH};
use crate::client::qlik_sense::{QlikSenseClient, QlikSenseConfig};
use crate::client::{Credentials, HttpConfig};
use crate::engine::TaskEngine;
use crate::model::{ConflictAction, EngineConfig, Outcome, PollPolicy};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "qlik-orchestrator",
    version,
    about = "Run Qlik Sense and NPrinting tasks from a scheduler and wait for the result"
)]
pub struct Cli {
    #[command(flatten)]
    pub poll: PollArgs,

    #[command(flatten)]
    pub http: HttpArgs,

    /// Print the outcome as JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Log filter used when RUST_LOG is unset (e.g. "debug", "qlik_orchestrator=trace")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args, Clone)]
pub struct PollArgs {
    /// Wait after the first poll; later waits grow from it [default: 10s, 5s for metadata]
    #[arg(long, global = true)]
    pub poll_interval: Option<humantime::Duration>,

    /// Give up after this long [default depends on the operation]
    #[arg(long, global = true)]
    pub deadline: Option<humantime::Duration>,

    /// Poll n waits base * (1 + n / divisor)
    #[arg(long, global = true, default_value_t = 60)]
    pub growth_divisor: u32,

    /// Pause between stopping a blocking job and re-checking its target
    #[arg(long, global = true, default_value = "5s")]
    pub stop_settle: humantime::Duration,
}

#[derive(Debug, Args, Clone)]
pub struct HttpArgs {
    /// Per-request timeout
    #[arg(long, global = true, default_value = "5s")]
    pub request_timeout: humantime::Duration,

    /// TCP/TLS connect timeout
    #[arg(long, global = true, default_value = "3s")]
    pub connect_timeout: humantime::Duration,

    /// Accept self-signed or otherwise invalid server certificates
    #[arg(long, global = true)]
    pub insecure: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Qlik Sense repository (QRS) operations
    Sense(SenseArgs),
    /// NPrinting operations
    Nprinting(NPrintingArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SenseArgs {
    /// Server base URL, e.g. https://qlik.example.com:4242
    #[arg(long, env = "QS_URL")]
    pub url: String,

    /// Value for the X-Qlik-User header, e.g. "UserDirectory=INTERNAL; UserId=sa_repository"
    #[arg(long, env = "QS_USER_HEADER")]
    pub user_header: Option<String>,

    #[arg(long, env = "QS_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "QS_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub op: SenseOp,
}

#[derive(Debug, Subcommand, Clone)]
pub enum SenseOp {
    /// Reload an app and wait until its last reload time moves
    Reload {
        #[arg(long)]
        app: String,
    },
    /// Start a reload task, resolving conflicts on its app
    Execute(ExecuteArgs),
    /// Check the repository, engine and printing services
    Health,
}

#[derive(Debug, Args, Clone)]
pub struct NPrintingArgs {
    /// Server base URL, e.g. https://nprinting.example.com:4993
    #[arg(long, env = "NP_URL")]
    pub url: String,

    #[arg(long, env = "NP_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "NP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Path of the login endpoint that sets the session cookies
    #[arg(long, default_value = DEFAULT_LOGIN_PATH)]
    pub login_path: String,

    #[command(subcommand)]
    pub op: NPrintingOp,
}

#[derive(Debug, Subcommand, Clone)]
pub enum NPrintingOp {
    /// Regenerate a connection's metadata cache and wait for it
    ReloadMetadata {
        #[arg(long)]
        connection: String,
    },
    /// Start a publish task, resolving conflicts with its running executions
    Execute(ExecuteArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ExecuteArgs {
    #[arg(long)]
    pub task: String,

    /// What to do when the target is busy: proceed, wait, stop, skip or error
    #[arg(long, default_value = "proceed")]
    pub action: String,
}

/// Poll timing used when the command line does not override it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PollDefaults {
    pub interval: Duration,
    pub deadline: Duration,
}

pub(crate) const SENSE_TASK: PollDefaults = PollDefaults {
    interval: Duration::from_secs(10),
    deadline: Duration::from_secs(10 * 3600),
};
pub(crate) const SENSE_APP_RELOAD: PollDefaults = PollDefaults {
    interval: Duration::from_secs(10),
    deadline: Duration::from_secs(6 * 3600),
};
pub(crate) const NPRINTING_TASK: PollDefaults = PollDefaults {
    interval: Duration::from_secs(10),
    deadline: Duration::from_secs(8 * 3600),
};
pub(crate) const NPRINTING_METADATA: PollDefaults = PollDefaults {
    interval: Duration::from_secs(5),
    deadline: Duration::from_secs(5 * 60),
};

pub async fn run(args: Cli) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let outcome = match &args.command {
        Command::Sense(sense) => run_sense(&args, sense, cancel).await?,
        Command::Nprinting(np) => Some(run_nprinting(&args, np, cancel).await?),
    };

    if let Some(outcome) = outcome {
        print_outcome(&outcome, args.json)?;
    }
    Ok(())
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

async fn run_sense(
    args: &Cli,
    sense: &SenseArgs,
    cancel: CancellationToken,
) -> Result<Option<Outcome>> {
    let client = QlikSenseClient::new(QlikSenseConfig {
        http: build_http_config(&sense.url, &args.http),
        user_header: sense.user_header.clone(),
        credentials: credentials(&sense.username, &sense.password)?,
    })
    .context("failed to set up the Qlik Sense client")?;

    match &sense.op {
        SenseOp::Health => {
            client
                .check_health()
                .await
                .context("Qlik Sense health check failed")?;
            if args.json {
                println!("{}", serde_json::json!({ "healthy": true }));
            } else {
                println!("Qlik Sense services are healthy");
            }
            Ok(None)
        }
        SenseOp::Reload { app } => {
            let cfg = build_engine_config(&args.poll, SENSE_APP_RELOAD)?;
            let outcome = TaskEngine::new(client, cfg)
                .with_cancellation(cancel)
                .reload_and_wait(app)
                .await
                .with_context(|| format!("reload of app {app} failed"))?;
            Ok(Some(outcome))
        }
        SenseOp::Execute(exec) => {
            let cfg = build_engine_config(&args.poll, SENSE_TASK)?;
            let outcome = TaskEngine::new(client, cfg)
                .with_cancellation(cancel)
                .execute_with_policy(&exec.task, ConflictAction::from_request(&exec.action))
                .await
                .with_context(|| format!("task {} failed", exec.task))?;
            Ok(Some(outcome))
        }
    }
}

async fn run_nprinting(
    args: &Cli,
    np: &NPrintingArgs,
    cancel: CancellationToken,
) -> Result<Outcome> {
    let client = NPrintingClient::new(NPrintingConfig {
        http: build_http_config(&np.url, &args.http),
        credentials: credentials(&np.username, &np.password)?,
        login_path: np.login_path.clone(),
    })
    .context("failed to set up the NPrinting client")?
    .connect()
    .await
    .context("failed to log in to NPrinting")?;

    match &np.op {
        NPrintingOp::ReloadMetadata { connection } => {
            let cfg = build_engine_config(&args.poll, NPRINTING_METADATA)?;
            TaskEngine::new(client, cfg)
                .with_cancellation(cancel)
                .reload_and_wait(connection)
                .await
                .with_context(|| {
                    format!("metadata reload of connection {connection} failed")
                })
        }
        NPrintingOp::Execute(exec) => {
            let cfg = build_engine_config(&args.poll, NPRINTING_TASK)?;
            TaskEngine::new(client, cfg)
                .with_cancellation(cancel)
                .execute_with_policy(&exec.task, ConflictAction::from_request(&exec.action))
                .await
                .with_context(|| format!("task {} failed", exec.task))
        }
    }
}

fn print_outcome(outcome: &Outcome, json: bool) -> Result<()> {
    if json {
        let out =
            serde_json::to_string_pretty(outcome).context("failed to encode the outcome")?;
        println!("{out}");
    } else {
        for line in crate::text_summary::build_text_summary(outcome).lines {
            println!("{line}");
        }
    }
    Ok(())
}

/// Build an `EngineConfig` from CLI arguments, filling gaps from `defaults`.
pub(crate) fn build_engine_config(poll: &PollArgs, defaults: PollDefaults) -> Result<EngineConfig> {
    let interval = poll.poll_interval.clone().map_or(defaults.interval, Duration::from);
    let deadline = poll.deadline.clone().map_or(defaults.deadline, Duration::from);
    let policy = PollPolicy::new(interval, deadline, poll.growth_divisor)
        .context("invalid polling options")?;
    Ok(EngineConfig {
        policy,
        stop_settle: Duration::from(poll.stop_settle.clone()),
    })
}

pub(crate) fn build_http_config(base_url: &str, http: &HttpArgs) -> HttpConfig {
    HttpConfig {
        base_url: base_url.to_string(),
        request_timeout: Duration::from(http.request_timeout.clone()),
        connect_timeout: Duration::from(http.connect_timeout.clone()),
        accept_invalid_certs: http.insecure,
        user_agent: format!("qlik-orchestrator/{}", env!("CARGO_PKG_VERSION")),
    }
}

fn credentials(
    username: &Option<String>,
    password: &Option<String>,
) -> Result<Option<Credentials>> {
    match (username, password) {
        (Some(username), Some(password)) => Ok(Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        })),
        (None, None) => Ok(None),
        _ => anyhow::bail!("--username and --password must be given together"),
    }
}
