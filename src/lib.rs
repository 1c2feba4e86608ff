//! minit - a minimal init process for containers.
//!
//! minit runs as the root process of a container. It launches the units
//! declared for the container, supervises them and shuts them down in order:
//!
//! - render units rewrite config files from templates
//! - once units run a command to completion
//! - daemon units keep a command running, restarting it when it exits
//! - cron units run a command on a schedule
//!
//! Render and once units run first, one after another. Daemon and cron units
//! then run concurrently until minit receives SIGINT or SIGTERM, or a
//! critical unit fails.

pub mod config;
pub mod env;
pub mod error;
pub mod exec;
pub mod init;
pub mod loader;
pub mod log;
pub mod runner;
pub mod template;
pub mod unit;

pub use config::InitConfig;
pub use error::{Error, Result};
pub use init::Init;
pub use unit::{Unit, UnitKind};
