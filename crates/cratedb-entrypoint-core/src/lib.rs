//! Entrypoint logic for the CrateDB container image: turns the container's
//! arguments and environment into a configured server (or client shell, or
//! arbitrary command) and keeps signal and exit-code semantics intact.

pub mod command;
pub mod config;
pub mod env;
pub mod error;
pub mod files;
pub mod supervisor;

pub use command::{ResolvedCommand, resolve_command};
pub use config::{EntrypointConfig, LaunchConfig, LaunchMode, RuntimeUser, SubcommandKind};
pub use env::{EffectiveEnv, EnvSnapshot, build_environment, capture_environment};
pub use error::{EntrypointError, Result};
pub use supervisor::{ChildHandle, Supervisor, SupervisorState};

use std::ffi::OsString;
use std::path::PathBuf;

/// Resolve configuration once from `env` and run `argv` (program name
/// excluded) with relative paths taken against `working_dir`. Returns the
/// code the entrypoint should exit with.
pub async fn run(argv: Vec<OsString>, env: EnvSnapshot, working_dir: PathBuf) -> i32 {
    let config = LaunchConfig::from_env(&env).with_working_dir(working_dir);
    Supervisor::new(&config).run(&argv, &env).await
}
