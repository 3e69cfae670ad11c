pub mod agent;
pub mod bus;
pub mod compaction;
pub mod config;
pub mod error;
pub mod id;
pub mod lock;
pub mod logging;
pub mod mcp;
pub mod message;
pub mod migration;
pub mod prompt;
pub mod provider;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod tool;
pub mod turn;
