use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use crate::config::{EntrypointConfig, LaunchMode, SubcommandKind, SubcommandSpec};

/// What the entrypoint decided to run for a given argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCommand {
    Server { spec: SubcommandSpec, args: Vec<OsString> },
    ClientShell { spec: SubcommandSpec, args: Vec<OsString> },
    /// Anything else, run verbatim. `argv[0]` is the program.
    Passthrough { argv: Vec<OsString> },
}

impl ResolvedCommand {
    fn from_spec(spec: &SubcommandSpec, args: Vec<OsString>) -> Self {
        let spec = spec.clone();
        match spec.kind {
            SubcommandKind::Server => ResolvedCommand::Server { spec, args },
            SubcommandKind::ClientShell => ResolvedCommand::ClientShell { spec, args },
        }
    }

    pub fn mode(&self) -> LaunchMode {
        match self {
            ResolvedCommand::Server { spec, .. } | ResolvedCommand::ClientShell { spec, .. } => spec.mode,
            ResolvedCommand::Passthrough { .. } => LaunchMode::Exec,
        }
    }

    /// Arguments following the program.
    pub fn args(&self) -> &[OsString] {
        match self {
            ResolvedCommand::Server { args, .. } | ResolvedCommand::ClientShell { args, .. } => args,
            ResolvedCommand::Passthrough { argv } => argv.get(1..).unwrap_or_default(),
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, ResolvedCommand::Server { .. })
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> String {
        match self {
            ResolvedCommand::Server { spec, .. } | ResolvedCommand::ClientShell { spec, .. } => spec.name.clone(),
            ResolvedCommand::Passthrough { argv } => argv
                .first()
                .map(|a| a.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Decide what to run from the container arguments (program name excluded).
///
/// No arguments, or a first argument that looks like an option, starts the
/// default subcommand. A recognized first argument starts that subcommand
/// with the remaining arguments. Anything else is passed through unmodified.
pub fn resolve_command(argv: &[OsString], config: &EntrypointConfig) -> ResolvedCommand {
    let Some(first) = argv.first() else {
        return match config.default_subcommand() {
            Some(spec) => ResolvedCommand::from_spec(spec, Vec::new()),
            None => ResolvedCommand::Passthrough { argv: Vec::new() },
        };
    };

    if looks_like_option(first) {
        if let Some(spec) = config.default_subcommand() {
            return ResolvedCommand::from_spec(spec, argv.to_vec());
        }
    }

    match config.subcommand(first) {
        Some(spec) => ResolvedCommand::from_spec(spec, argv[1..].to_vec()),
        None => ResolvedCommand::Passthrough { argv: argv.to_vec() },
    }
}

fn looks_like_option(arg: &OsStr) -> bool {
    arg.as_bytes().first() == Some(&b'-')
}
