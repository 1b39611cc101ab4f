use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use waitroom::{
    AdmissionConfig, AdmissionController, AdmissionStatus, AdmissionView, ClientIdentity,
    FileStore, HttpAdmissionService, ServiceConfig,
};

#[derive(Debug, PartialEq)]
struct CliArgs {
    base_url: String,
    client_id: String,
    state_dir: PathBuf,
    interval: Option<Duration>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let cli = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: waitroom <base_url> <client_id> [--state-dir <dir>] [--interval <secs>]"
            );
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <base_url>           Admission service, e.g. https://interviews.example.com/api");
            eprintln!("  <client_id>          Identity issued at registration");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --state-dir <dir>    Where the resume record is kept [default: .waitroom]");
            eprintln!("  --interval <secs>    Status poll interval [default: WAITROOM_POLL_INTERVAL or 5]");
            eprintln!();
            eprintln!("While waiting, type 'retry' after an error or 'exit' to leave the queue.");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => {}
        Ok(false) => process::exit(3),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut state_dir = PathBuf::from(".waitroom");
    let mut interval = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--state-dir" => {
                i += 1;
                state_dir = PathBuf::from(args.get(i).ok_or("--state-dir requires a value")?);
            }
            "--interval" => {
                i += 1;
                let raw = args.get(i).ok_or("--interval requires a value")?;
                let secs: f64 = raw
                    .parse()
                    .map_err(|_| format!("invalid interval '{raw}'"))?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(format!("interval must be positive, got '{raw}'"));
                }
                interval = Some(Duration::from_secs_f64(secs));
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if positional.len() == 2 {
                    return Err(format!("unexpected argument: {arg}"));
                }
                positional.push(arg.to_string());
            }
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let base_url = positional
        .next()
        .ok_or("missing required argument: <base_url>")?;
    let client_id = positional
        .next()
        .ok_or("missing required argument: <client_id>")?;

    Ok(CliArgs {
        base_url,
        client_id,
        state_dir,
        interval,
    })
}

/// Initialize tracing with WAITROOM_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("WAITROOM_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("waitroom={level},waitroom_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Returns `true` when admitted, `false` when the client left the queue.
async fn run(cli: CliArgs) -> anyhow::Result<bool> {
    let identity = ClientIdentity::new(cli.client_id);
    identity
        .validate()
        .with_context(|| format!("cannot queue as '{identity}'"))?;

    let mut config = AdmissionConfig::default();
    if let Some(interval) = cli.interval {
        config.poll_interval = interval;
    }

    let service = Arc::new(HttpAdmissionService::new(ServiceConfig::new(cli.base_url)));
    let store = Arc::new(FileStore::new(cli.state_dir));
    info!(
        %identity,
        base_url = %service.config().base_url,
        state_dir = %store.dir().display(),
        "Entering waiting room"
    );

    let controller = AdmissionController::new(identity, service, store, config);
    let mut views = controller.subscribe();
    controller.start();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    render(&controller.view());
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    anyhow::bail!("admission controller stopped unexpectedly");
                }
                let view = views.borrow_and_update().clone();
                render(&view);
                if view.terminal {
                    return Ok(true);
                }
                if view.closed {
                    return Ok(false);
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line.context("reading stdin")? {
                    Some(line) => match line.trim() {
                        "retry" | "r" => controller.retry(),
                        "exit" | "q" => controller.exit(),
                        "" => {}
                        other => eprintln!("unknown command '{other}', expected 'retry' or 'exit'"),
                    },
                    None => stdin_open = false,
                }
            }
            _ = &mut ctrl_c => {
                // Unmount without exit: the record stays so the next run resumes.
                info!("Interrupted, queue position kept for the next run");
                return Ok(false);
            }
        }
    }
}

fn render(view: &AdmissionView) {
    match view.status {
        AdmissionStatus::Error => {
            println!("[{}] {}", view.status, view.message);
            println!("Type 'retry' to try again or 'exit' to leave.");
        }
        _ => println!("[{}] {}", view.status, view.message),
    }
}
