#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

pub const TEMPLATE_CRATE_YML: &str = "cluster.name: docker-test\npath.data: /data\n";
pub const TEMPLATE_LOG4J2: &str = "rootLogger.level = info\n";

/// A scratch container layout: fake server script, templates, config and
/// data directories, and an `out` directory the script reports into.
pub struct Fixture {
    pub dir: TempDir,
    pub config_file: PathBuf,
}

impl Fixture {
    pub fn new(server_script: &str) -> Self {
        Self::with_mode(server_script, "supervise")
    }

    /// Like `new`, with the server started in the given launch mode.
    pub fn with_mode(server_script: &str, mode: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = dir.path().join("crate");
        fs::write(&server, server_script).expect("write server script");
        fs::set_permissions(&server, fs::Permissions::from_mode(0o755)).expect("chmod server script");
        Self::with_server_program(dir, &server, mode)
    }

    pub fn with_server_program(dir: TempDir, program: &Path, mode: &str) -> Self {
        let templates = dir.path().join("templates");
        fs::create_dir_all(&templates).expect("templates dir");
        fs::create_dir_all(dir.path().join("out")).expect("out dir");
        fs::write(templates.join("crate.yml"), TEMPLATE_CRATE_YML).expect("write template");
        fs::write(templates.join("log4j2.properties"), TEMPLATE_LOG4J2).expect("write template");

        let config = serde_json::json!({
            "subcommands": [{
                "name": "crate",
                "kind": "server",
                "program": program,
                "fallback": null,
                "mode": mode
            }],
            "default_subcommand": "crate",
            "config_dir": dir.path().join("config"),
            "data_dir": dir.path().join("data"),
            "templates": [
                { "source": templates.join("crate.yml"), "file_name": "crate.yml" },
                { "source": templates.join("log4j2.properties"), "file_name": "log4j2.properties" }
            ],
            "runtime_user": null
        });
        let config_file = dir.path().join("entrypoint.json");
        fs::write(&config_file, config.to_string()).expect("write entrypoint config");

        Fixture { dir, config_file }
    }

    pub fn out(&self, name: &str) -> PathBuf {
        self.dir.path().join("out").join(name)
    }

    pub fn read_out(&self, name: &str) -> String {
        fs::read_to_string(self.out(name)).unwrap_or_else(|e| panic!("read {name}: {e}"))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dir.path().join("config")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn template(&self, name: &str) -> PathBuf {
        self.dir.path().join("templates").join(name)
    }

    /// Entrypoint command with a clean set of recognized variables.
    pub fn entrypoint(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_cratedb-entrypoint"));
        cmd.env("ENTRYPOINT_CONFIG", &self.config_file)
            .env("OUT", self.dir.path().join("out"))
            .env_remove("CRATE_HEAP_SIZE")
            .env_remove("CRATE_JAVA_OPTS")
            .env_remove("CRATE_CONFIG_DIR")
            .env_remove("CRATE_DATA_DIR")
            .env_remove("ENTRYPOINT_LOG_FORMAT")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

pub fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(20));
    }
    let _ = child.kill();
    let _ = child.wait();
    None
}
