use serde::Deserialize;
use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::env::EnvSnapshot;
use crate::error::{EntrypointError, Result};

pub const HEAP_SIZE_VAR: &str = "CRATE_HEAP_SIZE";
pub const JAVA_OPTS_VAR: &str = "CRATE_JAVA_OPTS";
pub const CONFIG_DIR_VAR: &str = "CRATE_CONFIG_DIR";
pub const DATA_DIR_VAR: &str = "CRATE_DATA_DIR";
pub const CONFIG_FILE_VAR: &str = "ENTRYPOINT_CONFIG";
pub const LOG_FORMAT_VAR: &str = "ENTRYPOINT_LOG_FORMAT";
pub const LOG_FILTER_VAR: &str = "RUST_LOG";

pub const DEFAULT_HEAP_SIZE: &str = "512M";

/// Launch setting fed by a recognized environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeapSize,
    JavaOpts,
    ConfigDir,
    DataDir,
}

/// Environment variables the entrypoint translates into launch settings.
pub const RECOGNIZED_VARS: &[(&str, Setting)] = &[
    (HEAP_SIZE_VAR, Setting::HeapSize),
    (JAVA_OPTS_VAR, Setting::JavaOpts),
    (CONFIG_DIR_VAR, Setting::ConfigDir),
    (DATA_DIR_VAR, Setting::DataDir),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubcommandKind {
    Server,
    ClientShell,
}

/// How a resolved command is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Spawn a child, forward signals to it and mirror its exit code.
    Supervise,
    /// Replace the entrypoint process.
    Exec,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubcommandSpec {
    pub name: String,
    pub kind: SubcommandKind,
    pub program: PathBuf,
    /// Looked up in `PATH` when `program` does not exist.
    #[serde(default)]
    pub fallback: Option<String>,
    pub mode: LaunchMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TemplateSpec {
    pub source: PathBuf,
    /// Destination name inside the config directory.
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RuntimeUser {
    pub uid: u32,
    pub gid: u32,
}

/// Static tables describing what the entrypoint recognizes. Loaded from the
/// JSON file named by `ENTRYPOINT_CONFIG`, otherwise built in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EntrypointConfig {
    pub subcommands: Vec<SubcommandSpec>,
    /// Used when no arguments are given or the first one is an option.
    pub default_subcommand: String,
    pub heap_size: String,
    pub java_opts: Vec<String>,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub templates: Vec<TemplateSpec>,
    /// `None` keeps the server running as whoever started the container.
    pub runtime_user: Option<RuntimeUser>,
}

impl Default for EntrypointConfig {
    fn default() -> Self {
        Self {
            subcommands: vec![
                SubcommandSpec {
                    name: "crate".to_string(),
                    kind: SubcommandKind::Server,
                    program: PathBuf::from("/crate/bin/crate"),
                    fallback: Some("crate".to_string()),
                    mode: LaunchMode::Supervise,
                },
                SubcommandSpec {
                    name: "crash".to_string(),
                    kind: SubcommandKind::ClientShell,
                    program: PathBuf::from("/usr/local/bin/crash"),
                    fallback: Some("crash".to_string()),
                    mode: LaunchMode::Exec,
                },
            ],
            default_subcommand: "crate".to_string(),
            heap_size: DEFAULT_HEAP_SIZE.to_string(),
            java_opts: Vec::new(),
            config_dir: PathBuf::from("/crate/config"),
            data_dir: PathBuf::from("/data"),
            templates: vec![
                TemplateSpec {
                    source: PathBuf::from("/crate/config-templates/crate.yml"),
                    file_name: "crate.yml".to_string(),
                },
                TemplateSpec {
                    source: PathBuf::from("/crate/config-templates/log4j2.properties"),
                    file_name: "log4j2.properties".to_string(),
                },
            ],
            runtime_user: Some(RuntimeUser { uid: 1000, gid: 1000 }),
        }
    }
}

impl EntrypointConfig {
    pub fn subcommand(&self, name: &OsStr) -> Option<&SubcommandSpec> {
        self.subcommands.iter().find(|s| OsStr::new(&s.name) == name)
    }

    pub fn default_subcommand(&self) -> Option<&SubcommandSpec> {
        self.subcommand(OsStr::new(&self.default_subcommand))
    }

    fn validate(&self) -> Result<()> {
        for template in &self.templates {
            if !is_plain_file_name(&template.file_name) {
                return Err(EntrypointError::ConfigResolution {
                    name: "templates".to_string(),
                    reason: format!("{:?} is not a plain file name", template.file_name),
                });
            }
        }
        if !is_valid_heap_size(&self.heap_size) {
            return Err(EntrypointError::ConfigResolution {
                name: "heap_size".to_string(),
                reason: format!("{:?} is not a memory size", self.heap_size),
            });
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<EntrypointConfig> {
    let invalid = |reason: String| EntrypointError::ConfigResolution {
        name: CONFIG_FILE_VAR.to_string(),
        reason,
    };
    let content = fs::read_to_string(path).map_err(|e| invalid(format!("{}: {e}", path.display())))?;
    let config: EntrypointConfig =
        serde_json::from_str(&content).map_err(|e| invalid(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Accepts digits with an optional single `k`, `m`, `g` or `t` suffix.
pub fn is_valid_heap_size(value: &str) -> bool {
    let digits = value.trim_end_matches(|c: char| matches!(c, 'k' | 'K' | 'm' | 'M' | 'g' | 'G' | 't' | 'T'));
    let suffix_len = value.len() - digits.len();
    suffix_len <= 1 && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Return true only for a single normal path component (no separators, no `..`).
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!((components.next(), components.next()), (Some(Component::Normal(_)), None))
}

/// Effective launch settings, built once from the environment at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub heap_size: String,
    pub java_opts: Vec<String>,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Base for relative program paths and `PATH` entries.
    pub working_dir: PathBuf,
    pub entrypoint: EntrypointConfig,
}

impl LaunchConfig {
    /// Resolve settings from an environment snapshot. Unusable values are
    /// logged and replaced by defaults; this never fails.
    pub fn from_env(env: &EnvSnapshot) -> Self {
        let entrypoint = match env.get(OsStr::new(CONFIG_FILE_VAR)) {
            Some(path) if !path.is_empty() => match load_config(Path::new(path)) {
                Ok(config) => {
                    debug!(path = %Path::new(path).display(), "loaded entrypoint config");
                    config
                }
                Err(err) => {
                    warn!(error = %err, "using built-in entrypoint config");
                    EntrypointConfig::default()
                }
            },
            _ => EntrypointConfig::default(),
        };

        let mut config = LaunchConfig {
            heap_size: entrypoint.heap_size.clone(),
            java_opts: entrypoint.java_opts.clone(),
            config_dir: entrypoint.config_dir.clone(),
            data_dir: entrypoint.data_dir.clone(),
            working_dir: PathBuf::from("/"),
            entrypoint,
        };

        for &(name, setting) in RECOGNIZED_VARS {
            let Some(value) = env.get(OsStr::new(name)).filter(|v| !v.is_empty()) else {
                continue;
            };
            if let Err(err) = config.apply(name, setting, value) {
                warn!(error = %err, "falling back to default");
            }
        }
        config
    }

    pub fn with_working_dir(mut self, working_dir: PathBuf) -> Self {
        self.working_dir = working_dir;
        self
    }

    fn apply(&mut self, name: &str, setting: Setting, value: &OsStr) -> Result<()> {
        let invalid = |reason: &str| EntrypointError::ConfigResolution {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        match setting {
            Setting::HeapSize => {
                let value = value.to_str().ok_or_else(|| invalid("not valid UTF-8"))?;
                if !is_valid_heap_size(value) {
                    return Err(invalid(&format!("{value:?} is not a memory size")));
                }
                self.heap_size = value.to_string();
            }
            Setting::JavaOpts => {
                let value = value.to_str().ok_or_else(|| invalid("not valid UTF-8"))?;
                self.java_opts.extend(value.split_whitespace().map(str::to_string));
            }
            Setting::ConfigDir => self.config_dir = PathBuf::from(value),
            Setting::DataDir => self.data_dir = PathBuf::from(value),
        }
        Ok(())
    }
}
