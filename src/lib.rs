pub mod auth;
pub mod cancel;
pub mod canonical;
pub mod config;
pub mod error;
pub mod evidence;
pub mod exec;
pub mod kill_switch;
pub mod logging;
pub mod operator;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod replay;
pub mod risk;
pub mod scope;
pub mod storage;
pub mod wal;
