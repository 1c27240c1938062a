use futures::StreamExt;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, geteuid};
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::process::{Child, Command};
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::StreamMap;
use tokio_stream::wrappers::SignalStream;
use tracing::{debug, error, info, warn};

use crate::command::{ResolvedCommand, resolve_command};
use crate::config::{LaunchConfig, LaunchMode, RuntimeUser};
use crate::env::{EffectiveEnv, EnvSnapshot, build_environment};
use crate::error::{EntrypointError, Result};
use crate::files::{install_templates, prepare_data_dir};

/// Signals relayed to a supervised child.
pub const FORWARDED_SIGNALS: &[Signal] = &[
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

pub type SignalStreams = StreamMap<Signal, SignalStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Resolving,
    Launching,
    Running { pid: i32 },
    ForwardingSignal { pid: i32, signal: Signal },
    Exited { code: i32 },
}

impl SupervisorState {
    pub fn can_transition_to(&self, next: &SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Idle, Resolving)
                | (Resolving, Launching)
                | (Launching, Running { .. })
                | (Running { .. }, ForwardingSignal { .. })
                | (ForwardingSignal { .. }, Running { .. })
                | (Running { .. }, Exited { .. })
                | (ForwardingSignal { .. }, Exited { .. })
                // resolution and launch failures end the run early
                | (Resolving, Exited { .. })
                | (Launching, Exited { .. })
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Exited { .. })
    }
}

/// The wrapped server process. Only the supervisor signals or reaps it.
#[derive(Debug)]
pub struct ChildHandle {
    pid: i32,
    child: Child,
}

impl ChildHandle {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}

/// Map a child's status to the code the entrypoint exits with. Death by
/// signal N becomes `128 + N`, as a shell would report it.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Locate the program a command refers to, using the effective `PATH` for
/// bare names.
pub fn resolve_program(command: &ResolvedCommand, env: &EffectiveEnv) -> Result<PathBuf> {
    match command {
        ResolvedCommand::Server { spec, .. } | ResolvedCommand::ClientShell { spec, .. } => {
            find_executable(spec.program.as_os_str(), env).or_else(|err| match &spec.fallback {
                Some(name) => {
                    debug!(program = %spec.program.display(), fallback = %name, "trying PATH fallback");
                    find_executable(OsStr::new(name), env)
                }
                None => Err(err),
            })
        }
        ResolvedCommand::Passthrough { argv } => match argv.first() {
            Some(program) => find_executable(program, env),
            None => Err(EntrypointError::ExecResolution { program: String::new() }),
        },
    }
}

fn find_executable(program: &OsStr, env: &EffectiveEnv) -> Result<PathBuf> {
    let not_found = || EntrypointError::ExecResolution {
        program: program.to_string_lossy().into_owned(),
    };
    if program.is_empty() {
        return Err(not_found());
    }
    if program.as_bytes().contains(&b'/') {
        let path = env.working_dir().join(program);
        return if path.is_file() { Ok(path) } else { Err(not_found()) };
    }
    which::which_in(program, env.get("PATH"), env.working_dir()).map_err(|_| not_found())
}

/// Register the forwarded signals. Must happen before server setup starts so
/// nothing arriving before the spawn is lost.
pub fn register_signals() -> io::Result<SignalStreams> {
    let mut streams = StreamMap::new();
    for &sig in FORWARDED_SIGNALS {
        let stream = signal(SignalKind::from_raw(sig as i32))?;
        streams.insert(sig, SignalStream::new(stream));
    }
    Ok(streams)
}

/// Resolve and spawn a supervised child.
pub fn launch(command: &ResolvedCommand, env: &EffectiveEnv, user: Option<RuntimeUser>) -> Result<ChildHandle> {
    let program = resolve_program(command, env)?;
    spawn(&program, command, env, user)
}

fn spawn(program: &Path, command: &ResolvedCommand, env: &EffectiveEnv, user: Option<RuntimeUser>) -> Result<ChildHandle> {
    let mut std_cmd = std::process::Command::new(program);
    std_cmd
        .args(command.args())
        .env_clear()
        .envs(env.iter())
        // own group: terminal signals reach the child once, through us
        .process_group(0);
    if let Some(user) = user {
        std_cmd.uid(user.uid).gid(user.gid);
    }
    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(false);

    let child = cmd
        .spawn()
        .map_err(|source| EntrypointError::from_launch(program.display().to_string(), source))?;
    let pid = child.id().ok_or_else(|| EntrypointError::ChildLaunch {
        program: program.display().to_string(),
        source: io::Error::other("child exited before its pid was read"),
    })?;

    #[allow(clippy::cast_possible_wrap)]
    let pid = pid as i32;
    info!(pid, program = %program.display(), args = ?command.args(), "launched");
    Ok(ChildHandle { pid, child })
}

/// Replace this process with the command. Only returns on failure.
pub fn exec(command: &ResolvedCommand, env: &EffectiveEnv) -> EntrypointError {
    match resolve_program(command, env) {
        Ok(program) => exec_program(&program, command, env, None),
        Err(err) => err,
    }
}

fn exec_program(
    program: &Path,
    command: &ResolvedCommand,
    env: &EffectiveEnv,
    user: Option<RuntimeUser>,
) -> EntrypointError {
    let mut cmd = std::process::Command::new(program);
    cmd.args(command.args()).env_clear().envs(env.iter());
    if let Some(user) = user {
        cmd.uid(user.uid).gid(user.gid);
    }
    if let ResolvedCommand::Passthrough { argv } = command {
        if let Some(arg0) = argv.first() {
            cmd.arg0(arg0);
        }
    }
    info!(program = %program.display(), args = ?command.args(), "exec");
    let err = cmd.exec();
    EntrypointError::from_launch(program.display().to_string(), err)
}

/// Send `signal` to the child. A child that already exited is not an error:
/// the pending wait will observe it.
pub fn deliver(pid: i32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(EntrypointError::SignalForwarding { signal, pid, source }),
    }
}

fn is_terminating(signal: Signal) -> bool {
    matches!(signal, Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT)
}

/// Signal to send for `received`. Once a delivery has failed, terminating
/// signals become SIGKILL; everything else is relayed as is.
pub fn forward_target(received: Signal, escalate: bool) -> Signal {
    if escalate && is_terminating(received) { Signal::SIGKILL } else { received }
}

pub struct Supervisor<'a> {
    config: &'a LaunchConfig,
    state: SupervisorState,
}

impl<'a> Supervisor<'a> {
    pub fn new(config: &'a LaunchConfig) -> Self {
        Self { config, state: SupervisorState::Idle }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn advance(&mut self, next: SupervisorState) {
        if !self.state.can_transition_to(&next) {
            warn!(from = ?self.state, to = ?next, "ignoring invalid state transition");
            return;
        }
        debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    fn exit(&mut self, code: i32) -> i32 {
        self.advance(SupervisorState::Exited { code });
        code
    }

    fn fail(&mut self, err: EntrypointError) -> i32 {
        error!(error = %err, "entrypoint failed");
        self.exit(err.exit_code())
    }

    /// Runtime user to hand files and the server process to. Only applies
    /// when the entrypoint itself runs as root.
    fn runtime_owner(&self) -> Option<RuntimeUser> {
        self.config.entrypoint.runtime_user.filter(|_| geteuid().is_root())
    }

    fn prepare_server(&self, owner: Option<RuntimeUser>) -> Result<()> {
        let installed = install_templates(&self.config.entrypoint.templates, &self.config.config_dir, owner)?;
        info!(count = installed.len(), dir = %self.config.config_dir.display(), "config templates installed");
        prepare_data_dir(&self.config.data_dir, owner)
    }

    /// Run the container command to completion and return the exit code.
    pub async fn run(&mut self, argv: &[OsString], process_env: &EnvSnapshot) -> i32 {
        self.advance(SupervisorState::Resolving);
        let command = resolve_command(argv, &self.config.entrypoint);
        let mut env = build_environment(self.config, process_env);
        info!(
            command = %command.name(),
            mode = ?command.mode(),
            heap_size = %self.config.heap_size,
            "resolved command"
        );

        self.advance(SupervisorState::Launching);
        if !command.is_server() && command.mode() == LaunchMode::Exec {
            let err = exec(&command, &env);
            return self.fail(err);
        }

        // resolve before touching the filesystem
        let program = match resolve_program(&command, &env) {
            Ok(program) => program,
            Err(err) => return self.fail(err),
        };

        // Registered before setup: signals arriving while templates are
        // copied or the data directory is chowned are queued, then relayed
        // once the child runs.
        let signals = if command.mode() == LaunchMode::Supervise {
            match register_signals() {
                Ok(signals) => Some(signals),
                Err(source) => {
                    return self.fail(EntrypointError::ChildLaunch { program: command.name(), source });
                }
            }
        } else {
            None
        };

        let owner = self.runtime_owner().filter(|_| command.is_server());
        if let Some(user) = owner {
            env.apply_runtime_user(user);
        }
        if command.is_server() {
            if let Err(err) = self.prepare_server(owner) {
                return self.fail(err);
            }
        }

        let Some(signals) = signals else {
            let err = exec_program(&program, &command, &env, owner);
            return self.fail(err);
        };
        let child = match spawn(&program, &command, &env, owner) {
            Ok(child) => child,
            Err(err) => return self.fail(err),
        };
        self.advance(SupervisorState::Running { pid: child.pid() });
        self.forward_signals(child, signals).await
    }

    /// Relay incoming signals to the child until it exits, then return its
    /// exit code. After a failed delivery the next terminating signal is
    /// escalated to SIGKILL.
    pub async fn forward_signals(&mut self, mut child: ChildHandle, mut signals: SignalStreams) -> i32 {
        let pid = child.pid();
        let mut escalate = false;
        loop {
            tokio::select! {
                status = child.wait() => {
                    let code = match status {
                        Ok(status) => exit_code_of(status),
                        Err(err) => {
                            error!(pid, error = %err, "failed to wait for child");
                            1
                        }
                    };
                    info!(pid, code, "child exited");
                    return self.exit(code);
                }
                Some((received, ())) = signals.next() => {
                    self.advance(SupervisorState::ForwardingSignal { pid, signal: received });
                    let target = forward_target(received, escalate);
                    match deliver(pid, target) {
                        Ok(()) => info!(pid, signal = %target, "forwarded signal"),
                        Err(err) => {
                            warn!(error = %err, "signal not delivered, next termination signal will kill");
                            escalate = true;
                        }
                    }
                    self.advance(SupervisorState::Running { pid });
                }
            }
        }
    }
}
