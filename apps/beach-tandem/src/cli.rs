use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

#[derive(Parser)]
#[command(name = "beach-tandem")]
#[command(about = "Collaborative editing coordinator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a coordinator node (the default)
    Serve,
    /// Join a room and print every collab frame until interrupted
    Debug {
        /// Node base URL
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Access token presented on connect
        #[arg(short, long)]
        token: String,

        #[arg(short, long)]
        collection: String,

        #[arg(short, long)]
        item: Option<String>,

        #[arg(long)]
        version: Option<String>,

        /// Field to focus once joined
        #[arg(long)]
        focus: Option<String>,

        /// JSON value written to the focused field
        #[arg(long, requires = "focus")]
        value: Option<String>,
    },
}

pub struct DebugOptions {
    pub url: String,
    pub token: String,
    pub collection: String,
    pub item: Option<String>,
    pub version: Option<String>,
    pub focus: Option<String>,
    pub value: Option<String>,
}

fn socket_url(base: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/ws", base.trim_end_matches('/')))
        .with_context(|| format!("invalid node url {base}"))?;
    url.query_pairs_mut().append_pair("access_token", token);
    Ok(url)
}

fn frame(action: &str, mut body: Value) -> Message {
    if let Value::Object(map) = &mut body {
        map.insert("type".into(), json!("collab"));
        map.insert("action".into(), json!(action));
    }
    Message::Text(body.to_string().into())
}

pub async fn run_debug_client(options: DebugOptions) -> Result<()> {
    let url = socket_url(&options.url, &options.token)?;
    println!("Connecting to {}", options.url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(url.as_str())).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(err)) => return Err(anyhow!("failed to connect: {err}")),
        Err(_) => bail!("connection timeout, is the node running?"),
    };
    let (mut write, mut read) = ws_stream.split();

    write
        .send(frame(
            "join",
            json!({
                "collection": options.collection,
                "item": options.item,
                "version": options.version,
            }),
        ))
        .await?;

    let mut room: Option<String> = None;
    while let Some(message) = read.next().await {
        let text = match message? {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => {
                println!("Connection closed by node");
                break;
            }
            other => {
                debug!("ignoring {:?}", other);
                continue;
            }
        };
        let event: Value = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(err) => {
                warn!("unparseable frame: {}", err);
                continue;
            }
        };
        println!("{}", serde_json::to_string_pretty(&event)?);

        let action = event.get("action").and_then(Value::as_str);
        if action == Some("init") && room.is_none() {
            let joined = event
                .get("room")
                .and_then(Value::as_str)
                .map(str::to_string)
                .context("init frame without a room")?;
            if let Some(field) = &options.focus {
                match &options.value {
                    Some(raw) => {
                        let value: Value = serde_json::from_str(raw)
                            .unwrap_or_else(|_| Value::String(raw.clone()));
                        write
                            .send(frame(
                                "update",
                                json!({ "room": joined, "field": field, "changes": value }),
                            ))
                            .await?;
                    }
                    None => {
                        write
                            .send(frame("focus", json!({ "room": joined, "field": field })))
                            .await?;
                    }
                }
            }
            room = Some(joined);
        }
    }

    Ok(())
}
