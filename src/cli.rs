use clap::{Parser, Subcommand};
use eyre::{Context, Result};

use crate::config::{self, Configuration, load_configuration, lookup_config_path};

#[derive(Debug, Parser)]
#[command(
    version,
    about,
    long_about = r#"Connects to the configured MCP servers and exposes their tools

Default configuration file location looks up in the following order:
    * $XDG_CONFIG_HOME/toolhub/config.toml
    * $HOME/.config/toolhub/config.toml
    * $HOME/.toolhub.toml
"#,
    disable_version_flag = true
)]
pub struct Command {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Show the version
    #[arg(short, long)]
    version: bool,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Action {
    /// Show the state of every configured server
    Status,

    /// List every discovered tool with its parameters
    Tools,

    /// Invoke a tool by its qualified name, e.g. `files:read_file`
    Call {
        #[arg(value_name = "SERVER:TOOL")]
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, value_name = "JSON", default_value = "{}")]
        args: String,
    },
}

impl Command {
    pub fn new() -> Command {
        Self::parse()
    }

    pub fn get_config(&self) -> Result<Configuration> {
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| lookup_config_path().unwrap_or_default());

        if config_path.is_empty() {
            // No config path is specified just use the default config
            return Ok(Configuration::default());
        }
        load_configuration(config_path.as_str()).wrap_err("loading configuration")
    }

    pub fn action(&self) -> Action {
        self.action.clone().unwrap_or(Action::Status)
    }

    pub fn version(&self) -> bool {
        self.version
    }

    pub fn print_version(&self) {
        println!("{}", config::version())
    }
}

impl Default for Command {
    fn default() -> Self {
        Self::new()
    }
}
