use serde_json::{Value, json};

use super::*;
use crate::{
    mcp::testing::{TestConnector, serve, text_result, tool},
    tools::{MockToolRegistry, Registry, Tool as _},
};

/// Server whose every tool answers `<server> handled <tool>`.
fn server(
    name: &'static str,
    tools: &'static [&'static str],
) -> impl Fn() -> ArcTransport + Send + Sync + 'static {
    move || {
        serve(
            name,
            tools.iter().map(|t| tool(t, "")).collect(),
            move |tool, _| text_result(&format!("{} handled {}", name, tool), false),
        )
    }
}

fn manager(servers: Vec<ServerConfig>, connector: TestConnector) -> Manager {
    Manager::new(servers)
        .expect("create manager")
        .with_connector(Arc::new(connector))
}

#[tokio::test]
async fn test_same_tool_on_two_servers() {
    let connector = TestConnector::default()
        .with_server("alpha", server("alpha", &["search"]))
        .with_server("beta", server("beta", &["search", "fetch"]));
    let manager = manager(
        vec![
            ServerConfig::stdio("alpha", "alpha-server"),
            ServerConfig::stdio("beta", "beta-server"),
        ],
        connector,
    );

    manager.connect_all().await.expect("connect all");

    let names = manager
        .tools()
        .await
        .iter()
        .map(|t| t.name().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["alpha:search", "beta:fetch", "beta:search"]);

    let alpha = manager.tool("alpha:search").await.expect("alpha:search");
    assert_eq!(alpha.description(), "tool from alpha");
    assert_eq!(
        alpha.execute(json!({ "query": "q" })).await.output,
        "alpha handled search"
    );

    manager.disconnect("alpha").await.expect("disconnect alpha");

    assert!(manager.tool("alpha:search").await.is_none());
    assert!(alpha.execute(json!({ "query": "q" })).await.is_error);

    let beta = manager.tool("beta:search").await.expect("beta:search");
    let output = beta.execute(json!({ "query": "q" })).await;
    assert!(!output.is_error);
    assert_eq!(output.output, "beta handled search");
}

#[tokio::test]
async fn test_connect_all_reports_only_failures() {
    let connector = TestConnector::default().with_server("good", server("good", &["echo"]));
    let manager = manager(
        vec![
            ServerConfig::stdio("good", "good-server"),
            ServerConfig::new("bad", "carrier-pigeon"),
            ServerConfig::stdio("manual", "manual-server").with_auto_connect(false),
        ],
        connector,
    );

    let err = manager.connect_all().await.expect_err("bad server fails");
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].server, "bad");
    assert!(matches!(
        err.failures[0].reason.downcast_ref::<McpError>(),
        Some(McpError::UnsupportedTransport(t)) if t == "carrier-pigeon"
    ));
    assert!(err.to_string().contains("bad: unsupported transport carrier-pigeon"));

    let status = manager.status().await;
    let states = status
        .iter()
        .map(|s| (s.name.as_str(), s.state, s.connected))
        .collect::<Vec<_>>();
    assert_eq!(
        states,
        vec![
            ("bad", ServerState::Configured, false),
            ("good", ServerState::Connected, true),
            ("manual", ServerState::Configured, false),
        ]
    );
    assert_eq!(status[1].tools, vec!["good:echo".to_string()]);
    assert_eq!(
        status[1].server_info.as_ref().map(|s| s.name.as_str()),
        Some("good")
    );
}

#[tokio::test]
async fn test_unknown_and_disconnected_servers() {
    let manager = manager(
        vec![ServerConfig::stdio("idle", "idle-server")],
        TestConnector::default(),
    );

    let err = manager.connect("ghost").await.expect_err("unknown server");
    assert!(matches!(
        err.downcast_ref::<McpError>(),
        Some(McpError::UnknownServer(name)) if name == "ghost"
    ));

    let err = manager.disconnect("ghost").await.expect_err("unknown server");
    assert!(matches!(
        err.downcast_ref::<McpError>(),
        Some(McpError::UnknownServer(_))
    ));

    let err = manager.disconnect("idle").await.expect_err("not connected");
    assert!(matches!(
        err.downcast_ref::<McpError>(),
        Some(McpError::NotConnected(name)) if name == "idle"
    ));
}

#[tokio::test]
async fn test_failed_connect_stays_configured() {
    // No server behind "down", so opening the transport fails
    let manager = manager(
        vec![ServerConfig::stdio("down", "down-server")],
        TestConnector::default(),
    );

    let err = manager.connect("down").await.expect_err("connect fails");
    assert!(format!("{:#}", err).contains("connection refused"));

    let status = manager.status().await;
    assert_eq!(status[0].state, ServerState::Configured);
    assert!(!status[0].connected);
    assert!(status[0].tools.is_empty());
    assert!(manager.tools().await.is_empty());
}

#[tokio::test]
async fn test_handshake_failure_closes_client() {
    let connector = TestConnector::default().with_server("broken", || {
        let (transport, mut peer) = crate::mcp::testing::pipe("broken");
        tokio::spawn(async move {
            while let Some(request) = peer.recv().await {
                if let Some(id) = request.id {
                    peer.send(&crate::models::Message::error_response(id, -32603, "boot failure"))
                        .await;
                }
            }
        });
        transport
    });
    let manager = manager(vec![ServerConfig::stdio("broken", "broken")], connector);

    let err = manager.connect("broken").await.expect_err("handshake fails");
    assert!(matches!(
        err.downcast_ref::<McpError>(),
        Some(McpError::Handshake(_))
    ));
    assert_eq!(manager.status().await[0].state, ServerState::Configured);
}

#[tokio::test]
async fn test_reconnect_replaces_tools() {
    let generation = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let connector = TestConnector::default().with_server("evolving", {
        let generation = generation.clone();
        move || {
            let tools: &[&str] =
                match generation.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
                    0 => &["old", "kept"],
                    _ => &["kept", "new"],
                };
            serve(
                "evolving",
                tools.iter().map(|t| tool(t, "")).collect(),
                |_, _| text_result("ok", false),
            )
        }
    });
    let manager = manager(vec![ServerConfig::stdio("evolving", "evolving")], connector);

    manager.connect("evolving").await.expect("first connect");
    let first = manager.tool("evolving:kept").await.expect("kept tool");

    manager.connect("evolving").await.expect("reconnect");
    let status = manager.status().await;
    assert_eq!(status[0].tools, vec!["evolving:kept", "evolving:new"]);
    assert_eq!(status[0].state, ServerState::Connected);

    // Adapters from the first connection talk to a closed client
    assert!(first.execute(Value::Null).await.is_error);
    let kept = manager.tool("evolving:kept").await.expect("kept tool");
    assert!(!kept.execute(Value::Null).await.is_error);
}

#[tokio::test]
async fn test_register_tools() {
    let connector = TestConnector::default()
        .with_server("alpha", server("alpha", &["search"]))
        .with_server("beta", server("beta", &["search"]));
    let manager = manager(
        vec![
            ServerConfig::stdio("alpha", "alpha"),
            ServerConfig::stdio("beta", "beta"),
        ],
        connector,
    );
    manager.connect_all().await.expect("connect all");

    let registry = Registry::default();
    manager
        .register_tools(&registry)
        .await
        .expect("register tools");
    assert_eq!(registry.names(), vec!["alpha:search", "beta:search"]);

    let declarations = registry.declarations();
    assert_eq!(declarations[0].name, "alpha:search");
    assert_eq!(declarations[0].parameters.required, vec!["query".to_string()]);

    // Registering the same tools again is refused by the registry
    let err = manager
        .register_tools(&registry)
        .await
        .expect_err("duplicates refused");
    assert!(format!("{:#}", err).contains("registering tool alpha:search"));
}

#[tokio::test]
async fn test_register_tools_fails_fast() {
    let connector = TestConnector::default().with_server("multi", server("multi", &["a", "b", "c"]));
    let manager = manager(vec![ServerConfig::stdio("multi", "multi")], connector);
    manager.connect("multi").await.expect("connect");

    let mut registry = MockToolRegistry::new();
    registry
        .expect_register()
        .times(2)
        .returning(|tool| match tool.name() {
            "multi:b" => Err(eyre::eyre!("name clash")),
            _ => Ok(()),
        });

    let err = manager
        .register_tools(&registry)
        .await
        .expect_err("second tool refused");
    let message = format!("{:#}", err);
    assert!(message.contains("registering tool multi:b"));
    assert!(message.contains("name clash"));
}

#[tokio::test]
async fn test_shutdown() {
    let connector = TestConnector::default()
        .with_server("alpha", server("alpha", &["search"]))
        .with_server("beta", server("beta", &["fetch"]));
    let manager = manager(
        vec![
            ServerConfig::stdio("alpha", "alpha"),
            ServerConfig::stdio("beta", "beta"),
        ],
        connector,
    );
    manager.connect_all().await.expect("connect all");
    let fetch = manager.tool("beta:fetch").await.expect("beta:fetch");

    manager.shutdown().await.expect("shutdown");

    assert!(manager.tools().await.is_empty());
    for status in manager.status().await {
        assert_eq!(status.state, ServerState::Disconnected);
        assert!(!status.connected);
        assert!(status.tools.is_empty());
    }
    assert!(fetch.execute(json!({})).await.is_error);

    manager.shutdown().await.expect("shutdown twice");
    manager.connect("alpha").await.expect("reconnect after shutdown");
}

#[test]
fn test_duplicate_server_names() {
    let err = Manager::new(vec![
        ServerConfig::stdio("twin", "a"),
        ServerConfig::stdio("twin", "b"),
    ])
    .err()
    .expect("duplicate names rejected");
    assert!(err.to_string().contains("twin"));
}

#[test]
fn test_from_config_timeouts() {
    let config = McpConfig {
        timeout_secs: 5,
        servers: vec![ServerConfig::stdio("quick", "quick").with_timeout_secs(1)],
    };
    let manager = Manager::from_config(&config).expect("manager");
    assert_eq!(manager.timeout, Duration::from_secs(5));
    assert_eq!(
        manager.servers().next().and_then(|s| s.timeout()),
        Some(Duration::from_secs(1))
    );
}
