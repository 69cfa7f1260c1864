use eyre::{Context, Result};
use serde_json::Value;
use toolhub::{
    cli::{Action, Command},
    config::init_logger,
    mcp::Manager,
    tools::Registry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Command::new();
    if cmd.version() {
        cmd.print_version();
        return Ok(());
    }

    better_panic::Settings::auto().install();

    let config = cmd.get_config()?;
    init_logger(&config.log)?;
    log::debug!("Logger initialized");

    if config.mcp.servers.is_empty() {
        eyre::bail!("No MCP server configured");
    }

    let manager = Manager::from_config(&config.mcp)?;
    if let Err(err) = manager.connect_all().await {
        log::warn!("{}", err);
        eprintln!("Warning: {}", err);
    }

    let result = run(&manager, cmd.action()).await;

    if let Err(err) = manager.shutdown().await {
        log::error!("Shutdown error: {:#}", err);
    }
    result
}

async fn run(manager: &Manager, action: Action) -> Result<()> {
    match action {
        Action::Status => {
            for status in manager.status().await {
                let server = status
                    .server_info
                    .map(|info| format!(" ({} {})", info.name, info.version))
                    .unwrap_or_default();
                println!("{}: {}{}", status.name, status.state, server);
                for tool in status.tools {
                    println!("  {}", tool);
                }
            }
        }
        Action::Tools => {
            let registry = Registry::default();
            manager.register_tools(&registry).await?;
            for declaration in registry.declarations() {
                println!("{}", serde_json::to_string_pretty(&declaration)?);
            }
        }
        Action::Call { tool: name, args } => {
            let args: Value = serde_json::from_str(&args).wrap_err("parsing --args")?;
            let registry = Registry::default();
            manager.register_tools(&registry).await?;
            let Some(tool) = registry.get(&name) else {
                eyre::bail!("tool {} not found", name);
            };

            let result = tool.execute(args).await;
            if result.is_error {
                eyre::bail!("{} failed: {}", tool.name(), result.output);
            }
            println!("{}", result.output);
        }
    }
    Ok(())
}
