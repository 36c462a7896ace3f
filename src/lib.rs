pub mod agent;
pub mod backend;
pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod llm;
pub mod policy;
pub mod rpc;
pub mod runtime;
pub mod sandbox;
pub mod store;
pub mod tool_collection;
pub mod tools;

pub use config::Config;
pub use tool_collection::ToolCollection;
