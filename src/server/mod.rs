//! Server module for Clawgate
//!
//! Contains gateway initialization and the runtime loop.
//!
//! # Module Structure
//!
//! - `config`: Configuration structures for all gateway components
//! - `loader`: Configuration loading from files and environment
//! - `state`: Shared application state handed to handlers
//! - `init`: Gateway initialization and run loop

pub mod config;
mod init;
mod loader;
mod state;

pub use config::AppConfig;
pub use init::run;
pub use loader::load_config;
pub use state::AppState;
