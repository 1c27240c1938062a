mod common;

use common::{Fixture, TEMPLATE_CRATE_YML, wait_for_file, wait_with_timeout};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::sys::stat::Mode;
use nix::unistd::{Pid, mkfifo};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

fn start(fixture: &Fixture) -> std::process::Child {
    let child = fixture.entrypoint().arg("crate").spawn().expect("spawn entrypoint");
    assert!(wait_for_file(&fixture.out("ready"), TIMEOUT), "server never became ready");
    child
}

fn signal(child: &std::process::Child, signal: Signal) {
    kill(Pid::from_raw(child.id() as i32), signal).expect("signal entrypoint");
}

/// Open the write end of a FIFO once a reader is blocked on it.
fn open_fifo_writer(path: &Path, timeout: Duration) -> Option<File> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match OpenOptions::new().write(true).custom_flags(OFlag::O_NONBLOCK.bits()).open(path) {
            Ok(file) => return Some(file),
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("open {}: {e}", path.display()),
        }
    }
    None
}

#[test]
fn sigterm_is_forwarded_and_exit_code_mirrored() {
    let fixture = Fixture::new(
        "#!/bin/sh\n\
         trap 'echo TERM > \"$OUT/signal\"; exit 42' TERM\n\
         touch \"$OUT/ready\"\n\
         while :; do sleep 0.05; done\n",
    );
    let mut child = start(&fixture);
    signal(&child, Signal::SIGTERM);

    let status = wait_with_timeout(&mut child, TIMEOUT).expect("entrypoint did not exit");
    assert_eq!(status.code(), Some(42));
    assert_eq!(fixture.read_out("signal").trim(), "TERM");
}

#[test]
fn sigint_is_forwarded() {
    let fixture = Fixture::new(
        "#!/bin/sh\n\
         trap 'exit 21' INT\n\
         touch \"$OUT/ready\"\n\
         while :; do sleep 0.05; done\n",
    );
    let mut child = start(&fixture);
    signal(&child, Signal::SIGINT);

    let status = wait_with_timeout(&mut child, TIMEOUT).expect("entrypoint did not exit");
    assert_eq!(status.code(), Some(21));
}

#[test]
fn child_killed_by_forwarded_signal_maps_to_128_plus_n() {
    let fixture = Fixture::new(
        "#!/bin/sh\n\
         touch \"$OUT/ready\"\n\
         while :; do sleep 0.05; done\n",
    );
    let mut child = start(&fixture);
    signal(&child, Signal::SIGTERM);

    let status = wait_with_timeout(&mut child, TIMEOUT).expect("entrypoint did not exit");
    assert_eq!(status.code(), Some(128 + 15));
}

#[test]
fn entrypoint_waits_for_graceful_shutdown() {
    let fixture = Fixture::new(
        "#!/bin/sh\n\
         trap 'sleep 0.3; touch \"$OUT/stopped\"; exit 0' TERM\n\
         touch \"$OUT/ready\"\n\
         while :; do sleep 0.05; done\n",
    );
    let mut child = start(&fixture);
    signal(&child, Signal::SIGTERM);

    let status = wait_with_timeout(&mut child, TIMEOUT).expect("entrypoint did not exit");
    assert_eq!(status.code(), Some(0));
    assert!(fixture.out("stopped").exists(), "entrypoint exited before the server finished");
}

#[test]
fn non_terminating_signals_do_not_stop_the_server() {
    let fixture = Fixture::new(
        "#!/bin/sh\n\
         trap 'touch \"$OUT/hup\"' HUP\n\
         trap 'exit 5' TERM\n\
         touch \"$OUT/ready\"\n\
         while :; do sleep 0.05; done\n",
    );
    let mut child = start(&fixture);
    signal(&child, Signal::SIGHUP);
    assert!(wait_for_file(&fixture.out("hup"), TIMEOUT), "SIGHUP was not forwarded");
    assert!(child.try_wait().expect("try_wait").is_none());

    signal(&child, Signal::SIGTERM);
    let status = wait_with_timeout(&mut child, TIMEOUT).expect("entrypoint did not exit");
    assert_eq!(status.code(), Some(5));
}

#[test]
fn signal_during_setup_is_forwarded_once_the_server_starts() {
    let fixture = Fixture::new(
        "#!/bin/sh\n\
         while :; do sleep 0.05; done\n",
    );
    // The entrypoint blocks reading this template until the test writes it.
    let template = fixture.template("crate.yml");
    fs::remove_file(&template).expect("remove template");
    mkfifo(&template, Mode::S_IRUSR | Mode::S_IWUSR).expect("mkfifo");

    let mut child = fixture.entrypoint().arg("crate").spawn().expect("spawn entrypoint");
    let mut writer = open_fifo_writer(&template, TIMEOUT).expect("entrypoint never read the template");
    signal(&child, Signal::SIGTERM);
    thread::sleep(Duration::from_millis(200));
    assert!(child.try_wait().expect("try_wait").is_none(), "entrypoint died during setup");

    writer.write_all(TEMPLATE_CRATE_YML.as_bytes()).expect("write template");
    drop(writer);

    let status = wait_with_timeout(&mut child, TIMEOUT).expect("entrypoint did not exit");
    assert_eq!(status.code(), Some(128 + 15));
    assert_eq!(
        fs::read_to_string(fixture.config_dir().join("crate.yml")).expect("crate.yml"),
        TEMPLATE_CRATE_YML
    );
}
