//! In-memory MCP servers for tests.

use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc};
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};

use crate::{
    config::{ServerConfig, TransportKind},
    models::Message,
};

use super::{
    McpError,
    manager::Connector,
    transport::{ArcTransport, stdio::Stdio},
};

/// Server end of an in-memory pipe.
pub(crate) struct Peer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

pub(crate) fn pipe(name: &str) -> (ArcTransport, Peer) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);
    (
        Arc::new(Stdio::from_io(name, local_read, local_write)),
        Peer {
            reader: BufReader::new(remote_read),
            writer: remote_write,
        },
    )
}

impl Peer {
    /// Next message from the client, `None` once the client hung up.
    pub(crate) async fn recv(&mut self) -> Option<Message> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await.ok()? == 0 {
                return None;
            }
            if !line.trim().is_empty() {
                return serde_json::from_str(&line).ok();
            }
        }
    }

    pub(crate) async fn send(&mut self, message: &Message) {
        let line = serde_json::to_string(message).expect("serialize message") + "\n";
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("write to client");
    }

    pub(crate) async fn reply(&mut self, request: &Message, result: Value) {
        let id = request.id.expect("request id");
        self.send(&Message::response(id, result)).await;
    }
}

pub(crate) fn tool(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        }
    })
}

pub(crate) fn text_result(text: &str, is_error: bool) -> Value {
    json!({ "content": [{ "type": "text", "text": text }], "isError": is_error })
}

type CallHandler = dyn Fn(&str, &Value) -> Value + Send + Sync;

/// Spawns a well-behaved server exposing `tools`. `tools/call` requests are
/// answered by `handler` with the tool name and its arguments.
pub(crate) fn serve(
    name: &str,
    tools: Vec<Value>,
    handler: impl Fn(&str, &Value) -> Value + Send + Sync + 'static,
) -> ArcTransport {
    let (transport, peer) = pipe(name);
    tokio::spawn(run_server(name.to_string(), peer, tools, Arc::new(handler)));
    transport
}

async fn run_server(name: String, mut peer: Peer, tools: Vec<Value>, handler: Arc<CallHandler>) {
    while let Some(request) = peer.recv().await {
        let Some(id) = request.id else {
            continue;
        };
        let params = request.params.clone().unwrap_or(Value::Null);
        let response = match request.method() {
            Some("initialize") => Message::response(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": name, "version": "1.0.0" }
                }),
            ),
            Some("tools/list") => Message::response(id, json!({ "tools": tools })),
            Some("tools/call") => {
                let tool = params["name"].as_str().unwrap_or_default();
                Message::response(id, handler(tool, &params["arguments"]))
            }
            Some("ping") => Message::response(id, json!({})),
            _ => Message::error_response(id, -32601, "Method not found"),
        };
        peer.send(&response).await;
    }
}

type Spawner = Box<dyn Fn() -> ArcTransport + Send + Sync>;

/// Connector that hands out in-memory servers by server name.
#[derive(Default)]
pub(crate) struct TestConnector {
    servers: HashMap<String, Spawner>,
}

impl TestConnector {
    pub(crate) fn with_server(
        mut self,
        name: &str,
        spawn: impl Fn() -> ArcTransport + Send + Sync + 'static,
    ) -> Self {
        self.servers.insert(name.to_string(), Box::new(spawn));
        self
    }
}

impl Connector for TestConnector {
    fn open(&self, _kind: TransportKind, config: &ServerConfig) -> Result<ArcTransport, McpError> {
        self.servers
            .get(config.name())
            .map(|spawn| spawn())
            .ok_or_else(|| McpError::Transport(format!("{}: connection refused", config.name())))
    }
}
