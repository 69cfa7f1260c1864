use std::time::Duration;

use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
    time::timeout,
};

use super::*;

fn pipe() -> (Stdio, BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);
    (
        Stdio::from_io("test", local_read, local_write),
        BufReader::new(remote_read),
        remote_write,
    )
}

#[tokio::test]
async fn test_send_writes_one_line_per_message() {
    let (transport, mut remote_reader, _remote_writer) = pipe();

    transport
        .send(&Message::request(1, "tools/list", None))
        .await
        .expect("send request");
    transport
        .send(&Message::notification("notifications/initialized", None))
        .await
        .expect("send notification");

    let mut line = String::new();
    remote_reader.read_line(&mut line).await.expect("read line");
    let first: Message = serde_json::from_str(&line).expect("parse first");
    assert_eq!(first.id, Some(1));
    assert_eq!(first.method(), Some("tools/list"));

    line.clear();
    remote_reader.read_line(&mut line).await.expect("read line");
    let second: Message = serde_json::from_str(&line).expect("parse second");
    assert!(second.is_notification());
}

#[tokio::test]
async fn test_receive_skips_noise() {
    let (transport, _remote_reader, mut remote_writer) = pipe();

    let response = serde_json::to_string(&Message::response(4, json!({ "ok": true })))
        .expect("serialize response");
    remote_writer
        .write_all(b"\xff\xfe banner\n")
        .await
        .expect("write");
    remote_writer
        .write_all(format!("\nserver starting...\n{{\"not\":\"rpc\"}}\n{response}\n").as_bytes())
        .await
        .expect("write");

    let message = timeout(Duration::from_secs(1), transport.receive())
        .await
        .expect("receive in time")
        .expect("message");
    assert_eq!(message.id, Some(4));
    assert_eq!(message.result, Some(json!({ "ok": true })));
}

#[tokio::test]
async fn test_receive_end_of_stream() {
    let (transport, remote_reader, remote_writer) = pipe();
    drop(remote_reader);
    drop(remote_writer);

    let err = timeout(Duration::from_secs(1), transport.receive())
        .await
        .expect("receive in time")
        .expect_err("end of stream");
    assert!(matches!(err, McpError::Disconnected));
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let (transport, mut remote_reader, _remote_writer) = pipe();

    transport.close().await.expect("first close");
    transport.close().await.expect("second close");

    let err = transport
        .send(&Message::request(1, "ping", None))
        .await
        .expect_err("send after close");
    assert!(matches!(err, McpError::Closed));

    let err = transport.receive().await.expect_err("receive after close");
    assert!(matches!(err, McpError::Closed));

    // The peer sees the write side shut down
    let mut line = String::new();
    let read = remote_reader.read_line(&mut line).await.expect("read");
    assert_eq!(read, 0);
}

#[tokio::test]
async fn test_close_interrupts_pending_receive() {
    let (transport, _remote_reader, _remote_writer) = pipe();
    let transport = std::sync::Arc::new(transport);

    let receiver = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.close().await.expect("close");

    let result = timeout(Duration::from_secs(1), receiver)
        .await
        .expect("receiver finished")
        .expect("join");
    assert!(matches!(result, Err(McpError::Closed)));
}

#[test]
fn test_missing_command() {
    let config = ServerConfig::new("broken", "stdio");
    let err = Stdio::new(&config).err().expect("missing command");
    assert!(matches!(err, McpError::InvalidConfig(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_spawned_process_round_trip() {
    let config = ServerConfig::stdio("cat", "cat");
    let transport = Stdio::new(&config).expect("spawn cat");

    let request = Message::request(9, "ping", Some(json!({})));
    transport.send(&request).await.expect("send");

    let echoed = timeout(Duration::from_secs(5), transport.receive())
        .await
        .expect("receive in time")
        .expect("message");
    assert_eq!(echoed, request);

    transport.close().await.expect("close");
    transport.close().await.expect("close again");
}

#[cfg(unix)]
#[tokio::test]
async fn test_spawned_process_env_expansion() {
    unsafe {
        std::env::set_var("TOOLHUB_STDIO_GREETING", "hello");
    }
    let script = r#"printf '{"jsonrpc":"2.0","id":1,"result":{"greeting":"%s"}}\n' "$GREETING""#;
    let config = ServerConfig::stdio("sh", "sh")
        .with_args(vec!["-c".to_string(), script.to_string()])
        .with_env("GREETING", "${TOOLHUB_STDIO_GREETING}");
    let transport = Stdio::new(&config).expect("spawn sh");

    let message = timeout(Duration::from_secs(5), transport.receive())
        .await
        .expect("receive in time")
        .expect("message");
    assert_eq!(message.result, Some(json!({ "greeting": "hello" })));

    let err = timeout(Duration::from_secs(5), transport.receive())
        .await
        .expect("receive in time")
        .expect_err("process exited");
    assert!(matches!(err, McpError::Disconnected));
}
