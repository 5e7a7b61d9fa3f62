use std::io::Write;

use chatstream::client::ChatStreamClient;
use chatstream::config::{load_config, AppConfig};
use chatstream::error::StreamError;
use chatstream::observability::init_tracing;
use chatstream::protocol::canonical::StreamEvent;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const USAGE: &str = "usage: chatstream [--config <path>] <request.json>";
const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    config_path: String,
    request_path: String,
}

fn parse_args<I>(mut args: I) -> Result<CliArgs, String>
where
    I: Iterator<Item = String>,
{
    let mut config_path = None;
    let mut request_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| "--config requires a path".to_string())?;
                config_path = Some(path);
            }
            "--help" | "-h" => return Err(USAGE.to_string()),
            other if other.starts_with('-') => return Err(format!("unknown option '{other}'")),
            _ if request_path.is_some() => return Err("only one request file is accepted".into()),
            path => request_path = Some(path.to_owned()),
        }
    }
    Ok(CliArgs {
        config_path: config_path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
        request_path: request_path.ok_or_else(|| "missing request file".to_string())?,
    })
}

fn main() {
    let args = parse_args(std::env::args().skip(1)).unwrap_or_else(|e| {
        eprintln!("{e}");
        eprintln!("{USAGE}");
        std::process::exit(2);
    });

    let config = load_config(&args.config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level);

    let request = read_request(&args.request_path).unwrap_or_else(|e| {
        eprintln!("Failed to read request '{}': {e}", args.request_path);
        std::process::exit(1);
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        });

    let code = runtime.block_on(run(config, request));
    std::process::exit(code);
}

fn read_request(path: &str) -> Result<serde_json::Value, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&contents).map_err(|e| e.to_string())
}

async fn run(config: AppConfig, request: serde_json::Value) -> i32 {
    let client = match ChatStreamClient::from_config(&config) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("Failed to build client: {err}");
            return 1;
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut events = match client.stream_chat(request, cancel).await {
        Ok(events) => events,
        Err(err) => return report_error(&err),
    };

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    while let Some(item) = events.next().await {
        let event = match into_event(item) {
            Ok(event) => event,
            Err(err) => return report_error(&err),
        };
        let written = match event {
            StreamEvent::TextDelta(text) => write!(stdout, "{text}").and_then(|()| stdout.flush()),
            StreamEvent::ThinkingDelta(text) => {
                write!(stderr, "\x1b[2m{text}\x1b[0m").and_then(|()| stderr.flush())
            }
            StreamEvent::ToolCallDelta(call) => match serde_json::to_string(&call) {
                Ok(line) => writeln!(stdout, "\n{line}"),
                Err(err) => writeln!(stderr, "unserializable tool call: {err}"),
            },
            StreamEvent::Completion(response) => match serde_json::to_string_pretty(&response) {
                Ok(pretty) => writeln!(stdout, "\n{pretty}"),
                Err(err) => writeln!(stderr, "unserializable response: {err}"),
            },
            StreamEvent::ProtocolError(message) => {
                eprintln!("\nupstream error: {message}");
                return 1;
            }
        };
        if let Err(err) = written {
            eprintln!("Failed to write output: {err}");
            return 1;
        }
    }
    0
}

/// Vendor error frames surface as a terminal event; other failures stay errors.
fn into_event(item: Result<StreamEvent, StreamError>) -> Result<StreamEvent, StreamError> {
    match item {
        Err(StreamError::Protocol { message, .. }) => Ok(StreamEvent::ProtocolError(message)),
        other => other,
    }
}

fn report_error(err: &StreamError) -> i32 {
    if err.is_cancelled() {
        eprintln!("\ncancelled");
        return EXIT_CANCELLED;
    }
    eprintln!("\nstream failed: {err} (category: {:?})", err.category());
    1
}
