#[cfg(test)]
#[path = "client_test.rs"]
mod tests;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{
        APP_NAME, VERSION,
        constants::{PROTOCOL_VERSION, REQUEST_TIMEOUT_SECS},
    },
    models::{
        CallToolResult, ClientInfo, InitializeParams, InitializeResult, ListToolsResult, Message,
        ServerInfo, Tool,
    },
};

use super::{MCP, McpError, transport::ArcTransport};

type Delivery = oneshot::Sender<Result<Message, McpError>>;

/// In-flight requests. Delivering a response and closing the client both
/// happen under this lock, so a response can never land in a torn-down slot.
#[derive(Default)]
struct Pending {
    slots: HashMap<i64, Delivery>,
    closed: bool,
}

impl Pending {
    /// Hands the message to whoever waits on `id`. Responses for unknown,
    /// expired or already answered ids are dropped.
    fn deliver(&mut self, id: i64, message: Message) -> bool {
        if self.closed {
            return false;
        }
        match self.slots.remove(&id) {
            Some(slot) => slot.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    fn fail_all(&mut self, err: impl Fn() -> McpError) -> usize {
        self.closed = true;
        let count = self.slots.len();
        for (_, slot) in self.slots.drain() {
            // The caller may have given up already
            let _ = slot.send(Err(err()));
        }
        count
    }
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the request slot however the call ends, including when the call
/// future is dropped.
struct Registration<'a> {
    id: i64,
    pending: &'a Mutex<Pending>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        lock(self.pending).slots.remove(&self.id);
    }
}

/// JSON-RPC client for one MCP server.
///
/// The client owns its transport. A background task reads every inbound
/// message and routes responses to the waiting caller by request id, so any
/// number of calls may be in flight at once.
pub struct Client {
    name: String,
    transport: ArcTransport,
    next_id: AtomicI64,
    pending: Arc<Mutex<Pending>>,
    timeout: Duration,
    server: OnceLock<InitializeResult>,
    shutdown: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl Client {
    /// Takes over `transport` and starts the receive task. Must be called
    /// from within a tokio runtime.
    pub fn new(name: impl Into<String>, transport: ArcTransport) -> Self {
        let name = name.into();
        let pending = Arc::new(Mutex::new(Pending::default()));
        let shutdown = CancellationToken::new();
        let reader = tokio::spawn(receive_loop(
            name.clone(),
            transport.clone(),
            pending.clone(),
            shutdown.clone(),
        ));

        Self {
            name,
            transport,
            next_id: AtomicI64::new(1),
            pending,
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            server: OnceLock::new(),
            shutdown,
            reader: Mutex::new(Some(reader)),
            released: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// What the server declared during the handshake.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server.get().map(|s| &s.server_info)
    }

    pub fn capabilities(&self) -> Option<&Value> {
        self.server.get().map(|s| &s.capabilities)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.pending).closed
    }

    /// Runs the `initialize` handshake and announces `notifications/initialized`.
    pub async fn initialize(&self) -> Result<&InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: ClientInfo {
                name: APP_NAME.to_string(),
                version: VERSION.to_string(),
            },
        };

        let result = async {
            let params = serde_json::to_value(params).map_err(McpError::Encode)?;
            let result = self.request("initialize", Some(params), None).await?;
            decode::<InitializeResult>("initialize", result)
        }
        .await
        .map_err(|e| McpError::Handshake(Box::new(e)))?;

        if result.protocol_version != PROTOCOL_VERSION {
            log::warn!(
                "[{}] server negotiated protocol {} instead of {}",
                self.name,
                result.protocol_version,
                PROTOCOL_VERSION
            );
        }
        log::info!(
            "[{}] connected to {} {}",
            self.name,
            result.server_info.name,
            result.server_info.version
        );
        let result = self.server.get_or_init(|| result);

        if let Err(err) = self.notify("notifications/initialized", None).await {
            log::warn!("[{}] sending initialized notification: {}", self.name, err);
        }
        Ok(result)
    }

    /// Lists every tool, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult = self.call("tools/list", params).await?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_ref() != Some(&next) => {
                    cursor = Some(next)
                }
                _ => return Ok(tools),
            }
        }
    }

    /// Invokes a tool. Errors reported by the tool itself come back as
    /// `is_error` in the result, not as an `Err`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        self.invoke_tool(name, arguments, None).await
    }

    /// Like [`Client::call_tool`] but gives up as soon as `cancel` fires.
    pub async fn call_tool_cancellable(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult, McpError> {
        self.invoke_tool(name, arguments, Some(cancel)).await
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.request("ping", None, None).await.map(|_| ())
    }

    /// Sends a notification. Nothing is awaited besides the write.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        self.transport
            .send(&Message::notification(method, params))
            .await
    }

    /// Fails every in-flight call with [`McpError::Cancelled`] and releases
    /// the transport. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), McpError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let cancelled = lock(&self.pending).fail_all(|| McpError::Cancelled);
        if cancelled > 0 {
            log::debug!("[{}] cancelled {} in-flight requests", self.name, cancelled);
        }
        self.shutdown.cancel();

        let result = self.transport.close().await;
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            if let Err(err) = reader.await {
                log::debug!("[{}] receive task ended abnormally: {}", self.name, err);
            }
        }
        log::debug!("[{}] closed", self.name);
        result
    }

    async fn invoke_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request("tools/call", Some(params), cancel).await?;
        decode("tools/call", result)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, McpError> {
        let result = self.request(method, params, None).await?;
        decode(method, result)
    }

    /// Sends one request and waits for its response, the caller's
    /// cancellation, or the timeout, whichever comes first.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(McpError::Closed);
            }
            pending.slots.insert(id, tx);
        }
        let _registration = Registration {
            id,
            pending: &self.pending,
        };

        let message = Message::request(id, method, params);
        let exchange = async {
            self.transport.send(&message).await?;
            rx.await.unwrap_or(Err(McpError::Cancelled))
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let response = tokio::select! {
            biased;
            _ = cancelled => return Err(McpError::Cancelled),
            // Close may land while the request is still being written
            _ = self.shutdown.cancelled() => return Err(McpError::Cancelled),
            response = exchange => response?,
            _ = tokio::time::sleep(self.timeout) => {
                log::warn!("[{}] {} (id {}) timed out after {:?}", self.name, method, id, self.timeout);
                return Err(McpError::Timeout(self.timeout));
            }
        };

        if let Some(err) = response.error {
            return Err(McpError::Rpc(err));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl MCP for Client {
    async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        Client::list_tools(self).await
    }

    async fn call_tool(&self, tool: &str, args: Value) -> Result<CallToolResult, McpError> {
        Client::call_tool(self, tool, args).await
    }

    async fn ping(&self) -> Result<(), McpError> {
        Client::ping(self).await
    }

    async fn close(&self) -> Result<(), McpError> {
        Client::close(self).await
    }
}

async fn receive_loop(
    name: String,
    transport: ArcTransport,
    pending: Arc<Mutex<Pending>>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return,
            message = transport.receive() => message,
        };

        match message {
            Ok(message) => dispatch(&name, &pending, message),
            Err(err) => {
                if !shutdown.is_cancelled() {
                    log::warn!("[{}] receive loop stopped: {}", name, err);
                }
                let failed = lock(&pending).fail_all(|| McpError::Disconnected);
                if failed > 0 {
                    log::debug!("[{}] failed {} in-flight requests", name, failed);
                }
                return;
            }
        }
    }
}

fn dispatch(name: &str, pending: &Mutex<Pending>, message: Message) {
    // Server-initiated requests and notifications have no subscriber
    if let Some(method) = message.method() {
        log::debug!("[{}] ignoring server message {}", name, method);
        return;
    }
    let Some(id) = message.id else {
        log::debug!("[{}] dropping message without id", name);
        return;
    };
    if !lock(pending).deliver(id, message) {
        log::debug!("[{}] dropping response for unknown request {}", name, id);
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, McpError> {
    serde_json::from_value(value).map_err(|source| McpError::Decode {
        method: method.to_string(),
        source,
    })
}
