mod terminal;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pyterm::engine::EngineFactory;
use pyterm::{RunStatus, ScriptEngine, Session, SessionConfig};

use terminal::{AnsiTerminal, StdinLines};

#[derive(Debug)]
struct Options {
    engine: String,
    capacity: Option<usize>,
    json: bool,
    path: PathBuf,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: pyterm [--engine script|python] [--capacity <bytes>] [--json] <file>");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <file>              Program to run; stdin is forwarded to it");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --engine <engine>   Engine: script or python [default: script]");
            eprintln!("  --capacity <bytes>  Stdin buffer size, header included [default: 1024]");
            eprintln!("  --json              Print the run report as JSON instead of a banner");
            process::exit(2);
        }
    };

    init_tracing();

    match run(options).await {
        Ok(RunStatus::Succeeded) => {}
        Ok(RunStatus::Failed) => process::exit(1),
        Ok(RunStatus::Canceled) => process::exit(130),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut engine = "script".to_string();
    let mut capacity = None;
    let mut json = false;
    let mut path: Option<PathBuf> = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--engine" => {
                i += 1;
                engine = args.get(i).ok_or("--engine requires a value")?.clone();
            }
            "--capacity" => {
                i += 1;
                let value = args.get(i).ok_or("--capacity requires a value")?;
                capacity = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid capacity: {value}"))?,
                );
            }
            "--json" => json = true,
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if path.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                path = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    let path = path.ok_or("missing required argument: <file>")?;
    Ok(Options {
        engine,
        capacity,
        json,
        path,
    })
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PYTERM_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("pyterm={level},pyterm_cli={level}"))
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

fn engine_factory(name: &str) -> anyhow::Result<EngineFactory> {
    match name {
        "script" => Ok(ScriptEngine::factory()),
        #[cfg(feature = "python")]
        "python" => Ok(pyterm::PythonEngine::factory()),
        #[cfg(not(feature = "python"))]
        "python" => bail!("this build has no python engine (enable the `python` feature)"),
        other => bail!("invalid engine '{other}', expected 'script' or 'python'"),
    }
}

async fn run(options: Options) -> anyhow::Result<RunStatus> {
    let mut config = SessionConfig::from_env()?;
    if let Some(capacity) = options.capacity {
        config = config.with_input_capacity(capacity);
    }
    let factory = engine_factory(&options.engine)?;

    let source = std::fs::read_to_string(&options.path)
        .with_context(|| format!("failed to read {}", options.path.display()))?;

    let display = Arc::new(AnsiTerminal::detect());
    let session = Arc::new(Session::new(
        config,
        Arc::new(StdinLines::new()),
        display.clone(),
    ));

    session.initialize(factory).await?;

    let interrupter = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if session.stop().is_err() {
                    tracing::debug!("Interrupt with nothing running");
                }
            }
        })
    };

    let report = session.run(source).await;
    interrupter.abort();
    let report = report?;

    if options.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        display.banner(report.status.is_success());
    }

    session.shutdown().await?;
    Ok(report.status)
}
