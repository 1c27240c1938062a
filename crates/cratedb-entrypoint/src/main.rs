use anyhow::{Result, anyhow};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cratedb_entrypoint_core::config::{LOG_FILTER_VAR, LOG_FORMAT_VAR};
use cratedb_entrypoint_core::{EnvSnapshot, capture_environment};

/// Filter directives from the captured `RUST_LOG`, `info` when unset or unparsable.
fn log_filter(env: &EnvSnapshot) -> EnvFilter {
    env.get(OsStr::new(LOG_FILTER_VAR))
        .and_then(|v| v.to_str())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Supervisor logs go to stderr so the child's stdout stays untouched.
fn init_logging(env: &EnvSnapshot) -> Result<()> {
    let json = env.get(OsStr::new(LOG_FORMAT_VAR)).is_some_and(|v| v == "json");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_filter(env))
        .with_writer(std::io::stderr);
    let res = if json { builder.json().try_init() } else { builder.try_init() };
    res.map_err(|e| anyhow!(e))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Environment, arguments and working directory are read exactly once, here.
    let env = capture_environment();
    if let Err(err) = init_logging(&env) {
        eprintln!("cratedb-entrypoint: failed to initialize logging: {err:#}");
    }

    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    debug!(?args, cwd = %working_dir.display(), "entrypoint started");
    let code = cratedb_entrypoint_core::run(args, env, working_dir).await;
    std::process::exit(code);
}
