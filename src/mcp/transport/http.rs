#[cfg(test)]
#[path = "http_test.rs"]
mod tests;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use std::{
    sync::{Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ServerConfig, constants::HTTP_SESSION_HEADER, expand_env, user_agent},
    mcp::McpError,
    models::Message,
};

use super::Transport;

const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One POST per outbound message. Whatever the server answers in the
/// response body is queued for `receive`, so the server can only ever speak
/// in reply to a request.
pub struct Http {
    name: String,
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    session: StdMutex<Option<String>>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    inbox: Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: CancellationToken,
}

impl Http {
    pub fn new(config: &ServerConfig) -> Result<Self, McpError> {
        let url = config.url().ok_or_else(|| {
            McpError::InvalidConfig(format!("server {} has no url", config.name()))
        })?;

        let mut headers = HeaderMap::new();
        for (key, value) in config.headers() {
            let value = expand_env(value).map_err(|e| {
                McpError::InvalidConfig(format!("expanding header {}: {}", key, e))
            })?;
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::InvalidConfig(format!("header {}: {}", key, e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| McpError::InvalidConfig(format!("header {}: {}", key, e)))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .build()?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Ok(Self {
            name: config.name().to_string(),
            url: url.to_string(),
            client,
            headers,
            session: StdMutex::new(None),
            inbox_tx,
            inbox: Mutex::new(inbox_rx),
            closed: CancellationToken::new(),
        })
    }

    fn session(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session(&self, session: String) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }
}

#[async_trait]
impl Transport for Http {
    async fn send(&self, message: &Message) -> Result<(), McpError> {
        if self.closed.is_cancelled() {
            return Err(McpError::Closed);
        }

        let mut req = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(session) = self.session() {
            req = req.header(HTTP_SESSION_HEADER, session);
        }

        let res = tokio::select! {
            _ = self.closed.cancelled() => return Err(McpError::Closed),
            res = req.send() => res?,
        };

        if let Some(session) = res
            .headers()
            .get(HTTP_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.set_session(session.to_string());
        }

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!(
                "{} responded {}: {}",
                self.url, status, body
            )));
        }

        let event_stream = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let body = res.text().await?;

        let messages = if event_stream {
            parse_event_stream(&body)
        } else if body.trim().is_empty() {
            Ok(vec![])
        } else {
            serde_json::from_str::<Message>(&body).map(|m| vec![m])
        }
        .map_err(|e| McpError::Transport(format!("malformed response body: {}", e)))?;

        for message in messages {
            if self.inbox_tx.send(message).is_err() {
                return Err(McpError::Closed);
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Message, McpError> {
        let mut inbox = tokio::select! {
            _ = self.closed.cancelled() => return Err(McpError::Closed),
            inbox = self.inbox.lock() => inbox,
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(McpError::Closed),
            message = inbox.recv() => message.ok_or(McpError::Disconnected),
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        // Let the server drop its session state
        if let Some(session) = self.session() {
            let res = self
                .client
                .delete(&self.url)
                .headers(self.headers.clone())
                .header(HTTP_SESSION_HEADER, session)
                .timeout(SESSION_CLOSE_TIMEOUT)
                .send()
                .await;
            if let Err(err) = res {
                log::debug!("[{}] terminating session: {}", self.name, err);
            }
        }
        Ok(())
    }
}

/// Splits a `text/event-stream` body into messages, one per `data` event.
fn parse_event_stream(body: &str) -> Result<Vec<Message>, serde_json::Error> {
    let mut messages = Vec::new();
    let mut data = String::new();

    let mut flush = |data: &mut String| -> Result<(), serde_json::Error> {
        if !data.trim().is_empty() {
            messages.push(serde_json::from_str(data)?);
        }
        data.clear();
        Ok(())
    };

    for line in body.lines() {
        if line.is_empty() {
            flush(&mut data)?;
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    flush(&mut data)?;
    Ok(messages)
}
