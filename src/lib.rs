pub mod cli;
pub mod config;
pub mod mcp;
pub mod models;
pub mod tools;
