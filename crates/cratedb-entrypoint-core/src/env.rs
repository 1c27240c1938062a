use nix::unistd::{Uid, User};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{CONFIG_DIR_VAR, DATA_DIR_VAR, HEAP_SIZE_VAR, JAVA_OPTS_VAR, LaunchConfig, RuntimeUser};

/// Environment of the entrypoint process, captured once at startup.
pub type EnvSnapshot = BTreeMap<OsString, OsString>;

pub fn capture_environment() -> EnvSnapshot {
    std::env::vars_os().collect()
}

/// Environment handed to the launched command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveEnv {
    vars: BTreeMap<OsString, OsString>,
    working_dir: PathBuf,
}

impl EffectiveEnv {
    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars.get(OsStr::new(key)).map(OsString::as_os_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<OsString>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Point `HOME` and `USER` at the account the child will run as, instead
    /// of whatever root's environment carried. Uids without a passwd entry
    /// get `HOME=/`, like a container runtime would give them.
    pub fn apply_runtime_user(&mut self, user: RuntimeUser) {
        match User::from_uid(Uid::from_raw(user.uid)) {
            Ok(Some(account)) => {
                self.set("HOME", account.dir.into_os_string());
                self.set("USER", account.name);
            }
            Ok(None) | Err(_) => {
                debug!(uid = user.uid, "no passwd entry for runtime user");
                self.set("HOME", "/");
                self.vars.remove(OsStr::new("USER"));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Merge resolved settings over the process environment. Recognized
/// variables carry their effective (possibly defaulted) values, everything
/// else passes through untouched.
pub fn build_environment(config: &LaunchConfig, process_env: &EnvSnapshot) -> EffectiveEnv {
    let mut vars = process_env.clone();
    vars.insert(HEAP_SIZE_VAR.into(), config.heap_size.clone().into());
    if config.java_opts.is_empty() {
        vars.remove(OsStr::new(JAVA_OPTS_VAR));
    } else {
        vars.insert(JAVA_OPTS_VAR.into(), config.java_opts.join(" ").into());
    }
    vars.insert(CONFIG_DIR_VAR.into(), config.config_dir.clone().into_os_string());
    vars.insert(DATA_DIR_VAR.into(), config.data_dir.clone().into_os_string());
    EffectiveEnv { vars, working_dir: config.working_dir.clone() }
}
