use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

/// Templates could not be installed or the data directory could not be prepared.
pub const EXIT_SETUP_FAILED: i32 = 125;
/// The program was found but could not be started.
pub const EXIT_CANNOT_EXECUTE: i32 = 126;
/// The program could not be found.
pub const EXIT_NOT_FOUND: i32 = 127;

#[derive(Debug, Error)]
pub enum EntrypointError {
    /// A recognized setting had an unusable value. Recovered with a default.
    #[error("invalid value for {name}: {reason}")]
    ConfigResolution { name: String, reason: String },

    #[error("executable not found: {program}")]
    ExecResolution { program: String },

    #[error("failed to launch {program}: {source}")]
    ChildLaunch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to deliver {signal} to pid {pid}: {source}")]
    SignalForwarding {
        signal: Signal,
        pid: i32,
        #[source]
        source: Errno,
    },

    #[error("failed to prepare {}: {source}", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl EntrypointError {
    /// Exit code the supervisor terminates with when this error is fatal.
    pub fn exit_code(&self) -> i32 {
        match self {
            EntrypointError::ExecResolution { .. } => EXIT_NOT_FOUND,
            EntrypointError::ChildLaunch { .. } => EXIT_CANNOT_EXECUTE,
            EntrypointError::Setup { .. } => EXIT_SETUP_FAILED,
            // never fatal on their own
            EntrypointError::ConfigResolution { .. } | EntrypointError::SignalForwarding { .. } => 1,
        }
    }

    /// Classify an OS error from spawning or exec'ing `program`.
    pub(crate) fn from_launch(program: impl Into<String>, source: io::Error) -> Self {
        let program = program.into();
        if source.kind() == io::ErrorKind::NotFound {
            EntrypointError::ExecResolution { program }
        } else {
            EntrypointError::ChildLaunch { program, source }
        }
    }
}

pub type Result<T> = std::result::Result<T, EntrypointError>;
