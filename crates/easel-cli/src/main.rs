use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use easel::{
    AssetInliner, CancellationToken, ClientConfig, FileStore, HttpPredictionClient,
    OutputManager, PlacementUpdate, PollOutcome, PollerConfig, poller,
};

const USAGE: &str = "\
Usage: easel [--state-dir <dir>] [--api-url <url>] <command> [args]

Commands:
  token <value>                    Store the API credential
  token --clear                    Forget the stored credential
  create --aspect-ratio <W:H> [--prompt <text>] [--input <json>]
                                   Start a new image prediction
  poll                             Run one poll cycle
  watch [--interval <secs>] [--until-done]
                                   Poll repeatedly until Ctrl-C
  list                             Show tracked outputs
  move <id> <x> <y> <rotation> [--width <w>] [--height <h>]
                                   Update an output's placement
  remove <id>...                   Remove outputs
  cleanup                          Drop outputs without a remote job id

Options:
  --state-dir <dir>   State directory [default: $EASEL_STATE_DIR or .easel]
  --api-url <url>     Prediction proxy [default: $EASEL_API_URL or http://localhost:3000]";

#[derive(Debug, PartialEq)]
enum Command {
    SetToken(Option<String>),
    Create(serde_json::Value),
    Poll,
    Watch {
        interval: Option<Duration>,
        until_done: bool,
    },
    List,
    Move {
        id: String,
        update: PlacementUpdate,
    },
    Remove(Vec<String>),
    Cleanup,
}

#[derive(Debug, PartialEq)]
struct Cli {
    state_dir: Option<PathBuf>,
    api_url: Option<String>,
    command: Command,
}

/// Initialize tracing with EASEL_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("EASEL_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("error") => "error",
            Ok("info") => "info",
            _ => "warn",
        };
        EnvFilter::new(format!("easel={level},easel_cli={level}"))
    };

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn number(raw: &str, what: &str) -> Result<f64, String> {
    raw.parse()
        .map_err(|_| format!("{what} must be a number, got '{raw}'"))
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    let mut state_dir = None;
    let mut api_url = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--state-dir" => state_dir = Some(PathBuf::from(value(args, &mut i, "--state-dir")?)),
            "--api-url" => api_url = Some(value(args, &mut i, "--api-url")?.to_string()),
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            _ => break,
        }
        i += 1;
    }

    let name = args.get(i).ok_or("missing command")?;
    let rest = &args[i..];
    let command = match name.as_str() {
        "token" => parse_token(rest)?,
        "create" => parse_create(rest)?,
        "poll" => Command::Poll,
        "watch" => parse_watch(rest)?,
        "list" => Command::List,
        "move" => parse_move(rest)?,
        "remove" => {
            if rest.len() < 2 {
                return Err("remove requires at least one id".to_string());
            }
            Command::Remove(rest[1..].to_vec())
        }
        "cleanup" => Command::Cleanup,
        other => return Err(format!("unknown command: {other}")),
    };

    Ok(Cli {
        state_dir,
        api_url,
        command,
    })
}

fn parse_token(args: &[String]) -> Result<Command, String> {
    match args.get(1).map(String::as_str) {
        Some("--clear") => Ok(Command::SetToken(None)),
        Some(token) if !token.starts_with('-') => Ok(Command::SetToken(Some(token.to_string()))),
        _ => Err("token requires a value or --clear".to_string()),
    }
}

fn parse_create(args: &[String]) -> Result<Command, String> {
    let mut input = serde_json::Map::new();
    let mut aspect_ratio = None;
    let mut prompt = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--aspect-ratio" => {
                aspect_ratio = Some(value(args, &mut i, "--aspect-ratio")?.to_string());
            }
            "--prompt" => prompt = Some(value(args, &mut i, "--prompt")?.to_string()),
            "--input" => {
                let raw = value(args, &mut i, "--input")?;
                match serde_json::from_str(raw) {
                    Ok(serde_json::Value::Object(map)) => input.extend(map),
                    Ok(_) => return Err("--input must be a JSON object".to_string()),
                    Err(e) => return Err(format!("--input is not valid JSON: {e}")),
                }
            }
            arg => return Err(format!("unexpected argument to create: {arg}")),
        }
        i += 1;
    }

    if let Some(prompt) = prompt {
        input.insert("prompt".to_string(), prompt.into());
    }
    if let Some(ratio) = aspect_ratio {
        input.insert("aspect_ratio".to_string(), ratio.into());
    }
    if !input.contains_key("aspect_ratio") && !input.contains_key("aspectRatio") {
        return Err("create requires --aspect-ratio".to_string());
    }

    Ok(Command::Create(serde_json::Value::Object(input)))
}

fn parse_watch(args: &[String]) -> Result<Command, String> {
    let mut interval = None;
    let mut until_done = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--interval" => {
                let secs = number(value(args, &mut i, "--interval")?, "--interval")?;
                let period = Duration::try_from_secs_f64(secs)
                    .ok()
                    .filter(|period| !period.is_zero())
                    .ok_or_else(|| format!("--interval must be a positive duration, got {secs}"))?;
                interval = Some(period);
            }
            "--until-done" => until_done = true,
            arg => return Err(format!("unexpected argument to watch: {arg}")),
        }
        i += 1;
    }

    Ok(Command::Watch {
        interval,
        until_done,
    })
}

fn parse_move(args: &[String]) -> Result<Command, String> {
    let mut positional = Vec::new();
    let mut width = None;
    let mut height = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--width" => width = Some(number(value(args, &mut i, "--width")?, "--width")?),
            "--height" => height = Some(number(value(args, &mut i, "--height")?, "--height")?),
            arg => positional.push(arg),
        }
        i += 1;
    }

    let [id, x, y, rotation] = positional[..] else {
        return Err("move requires <id> <x> <y> <rotation>".to_string());
    };

    let mut update = PlacementUpdate::new(
        number(x, "x")?,
        number(y, "y")?,
        number(rotation, "rotation")?,
    );
    update.width = width;
    update.height = height;

    Ok(Command::Move {
        id: id.to_string(),
        update,
    })
}

fn open_manager(cli: &Cli) -> anyhow::Result<OutputManager> {
    let config = match &cli.api_url {
        Some(url) => ClientConfig::with_base_url(url.clone()),
        None => ClientConfig::default(),
    };
    let timeout = config.timeout;
    let client = HttpPredictionClient::new(config).context("failed to build HTTP client")?;
    let inliner = AssetInliner::new(timeout).context("failed to build HTTP client")?;

    let store = match &cli.state_dir {
        Some(dir) => FileStore::new(dir),
        None => FileStore::from_env(),
    };
    tracing::debug!(state_dir = %store.root().display(), "Opening session");

    OutputManager::open(Arc::new(client), inliner, Arc::new(store))
        .context("failed to load session state")
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let manager = Arc::new(open_manager(&cli)?);

    match cli.command {
        Command::SetToken(token) => {
            let cleared = token.is_none();
            manager.set_credential(token);
            manager.save().context("failed to save credential")?;
            println!("{}", if cleared { "credential cleared" } else { "credential saved" });
        }
        Command::Create(input) => {
            let output = manager.create_output(input).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Poll => match manager.poll_incomplete().await? {
            PollOutcome::Idle => println!("nothing to poll"),
            PollOutcome::AlreadyRunning => println!("a poll is already running"),
            PollOutcome::Reconciled(report) => {
                println!(
                    "polled {} job(s), updated {} output(s)",
                    report.requested.len(),
                    report.updated
                );
                for (job, failure) in &report.conversion_failures {
                    println!("  {job}: {failure}");
                }
            }
        },
        Command::Watch {
            interval,
            until_done,
        } => watch(manager, interval, until_done).await,
        Command::List => {
            for output in manager.outputs() {
                let p = &output.placement;
                println!(
                    "{}\t{}\t{}\tat ({}, {}) {}x{} rot {}\t{}",
                    output.id,
                    output.status,
                    p.remote_job_id.as_deref().unwrap_or("-"),
                    p.x,
                    p.y,
                    p.width,
                    p.height,
                    p.rotation_degrees,
                    if output.result.is_some() { "result" } else { "pending" },
                );
            }
        }
        Command::Move { id, update } => {
            if !manager.update_placement(&id, update) {
                bail!("no output with id '{id}'");
            }
        }
        Command::Remove(ids) => {
            let removed = manager.remove_output(&ids);
            println!("removed {removed} output(s)");
        }
        Command::Cleanup => {
            let dropped = manager.cleanup();
            println!("discarded {dropped} output(s)");
        }
    }

    Ok(())
}

async fn watch(manager: Arc<OutputManager>, interval: Option<Duration>, until_done: bool) {
    let mut config = PollerConfig::default();
    if let Some(interval) = interval {
        config.interval = interval;
    }

    let shutdown = CancellationToken::new();
    let check_every = config.interval;
    let handle = tokio::spawn(poller::run(Arc::clone(&manager), config, shutdown.clone()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(check_every) => {
                if until_done && manager.incomplete_outputs().is_empty() {
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = handle.await {
        tracing::error!(error = %e, "Poller task panicked");
    }
}
