//! Hubsockets CLI - connect to a hub, invoke one method and print what comes back.
//!
//! This is the binary entry point. See the `hubsockets` library for the
//! connection and transport machinery.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hubsockets::connection::ClientConnection;
use hubsockets::protocol::{CompletionOutcome, Value};
use hubsockets::{ClientConfig, HubMessage, TransportKind};
use tokio_util::sync::CancellationToken;

// CLI
#[derive(Parser)]
#[command(name = "hubsockets")]
#[command(version)]
#[command(about = "Real-time hub client over WebSockets, Server-Sent Events or long polling")]
struct Cli {
    /// Config file (defaults to <config dir>/hubsockets/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, send one invocation and print hub messages until closed
    Invoke {
        /// Hub endpoint URL (http or https)
        url: String,
        /// Method name on the server
        target: String,
        /// Arguments as a JSON array (a single non-array value is one argument)
        args: Option<String>,
        /// Restrict candidate transports (repeatable or comma separated)
        #[arg(long = "transport", value_delimiter = ',')]
        transports: Vec<TransportKind>,
        /// Extra request header as NAME:VALUE
        #[arg(long = "header", short = 'H')]
        headers: Vec<String>,
        /// Send without an invocation id and expect no completion
        #[arg(long)]
        nonblocking: bool,
        /// Keep printing after the completion arrives
        #[arg(long)]
        wait: bool,
    },
    /// Print the effective client configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Invoke {
            url,
            target,
            args,
            transports,
            headers,
            nonblocking,
            wait,
        } => {
            let mut config = config;
            if !transports.is_empty() {
                config.transports = transports;
            }
            let arguments = parse_arguments(args.as_deref())?;
            let headers = headers
                .iter()
                .map(|h| parse_header(h))
                .collect::<Result<Vec<_>>>()?;

            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(invoke(InvokeRequest {
                url,
                target,
                arguments,
                headers,
                nonblocking,
                wait,
                config,
            }))?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<ClientConfig> {
    match path {
        Some(path) => {
            let mut config = ClientConfig::load_from_file(path)?;
            config.apply_env_overrides();
            Ok(config)
        }
        None => Ok(ClientConfig::load()),
    }
}

struct InvokeRequest {
    url: String,
    target: String,
    arguments: Vec<Value>,
    headers: Vec<(String, String)>,
    nonblocking: bool,
    wait: bool,
    config: ClientConfig,
}

async fn invoke(request: InvokeRequest) -> Result<()> {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    ctrlc::set_handler(move || token.cancel()).context("Failed to install Ctrl-C handler")?;

    let mut builder = ClientConnection::builder(&request.url).config(request.config);
    for (name, value) in request.headers {
        builder = builder.header(name, value);
    }
    let connection = builder.build();

    connection
        .start()
        .await
        .with_context(|| format!("Failed to connect to {}", request.url))?;
    println!(
        "Connected to {} via {} (connection {})",
        request.url,
        connection
            .transport_kind()
            .map_or_else(|| "?".to_string(), |kind| kind.to_string()),
        connection.connection_id().unwrap_or("?")
    );

    let mut received = connection
        .take_receiver()
        .context("Received stream already taken")?;

    let invocation_id = uuid::Uuid::new_v4().to_string();
    let message = if request.nonblocking {
        HubMessage::nonblocking_invocation(&request.target, request.arguments)
    } else {
        HubMessage::invocation(&invocation_id, &request.target, request.arguments)
    };
    connection.send(&message).await.context("Failed to send invocation")?;
    log::info!("Sent invocation of '{}'", request.target);

    let mut done = request.nonblocking && !request.wait;
    while !done {
        tokio::select! {
            () = shutdown.cancelled() => {
                println!("Interrupted, closing connection");
                done = true;
            }
            message = received.recv() => match message {
                Some(message) => {
                    println!("{}", describe(&message));
                    let completes_ours = matches!(
                        &message,
                        HubMessage::Completion { invocation_id: id, .. } if *id == invocation_id
                    );
                    done = completes_ours && !request.wait;
                }
                None => break,
            },
        }
    }

    connection.stop().await;
    // Print whatever was drained before the close.
    while let Ok(message) = received.try_recv() {
        println!("{}", describe(&message));
    }

    match connection.closed().await {
        Some(error) => anyhow::bail!("Connection closed with error: {}", error),
        None => {
            println!("Connection closed");
            Ok(())
        }
    }
}

fn describe(message: &HubMessage) -> String {
    match message {
        HubMessage::Invocation {
            target, arguments, ..
        } => {
            let args: Vec<String> = arguments.iter().map(ToString::to_string).collect();
            format!("invocation {}({})", target, args.join(", "))
        }
        HubMessage::StreamItem {
            invocation_id,
            item,
        } => format!("item [{}] {}", invocation_id, item),
        HubMessage::Completion {
            invocation_id,
            outcome: CompletionOutcome::Result(value),
        } => format!("completion [{}] {}", invocation_id, value),
        HubMessage::Completion {
            invocation_id,
            outcome: CompletionOutcome::Error(error),
        } => format!("completion [{}] error: {}", invocation_id, error),
    }
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Header '{}' is not NAME:VALUE", raw))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn parse_arguments(raw: Option<&str>) -> Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let json: serde_json::Value =
        serde_json::from_str(raw).with_context(|| format!("Arguments are not valid JSON: {}", raw))?;
    Ok(match json {
        serde_json::Value::Array(items) => items.into_iter().map(json_to_value).collect(),
        other => vec![json_to_value(other)],
    })
}

fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Boolean(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::from(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::from(s),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (Value::from(k), json_to_value(v)))
                .collect(),
        ),
    }
}
