//! End-to-end tests driving real backend scripts from `tests/scripts/`.
//!
//! Every test spawns an actual child process through the library API and
//! observes the event stream; deadlines are generous so slow CI machines do
//! not produce false failures.

use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use backend_spawn::config::SpawnConfig;
use backend_spawn::invocation::Invocation;
use backend_spawn::spawn::{ExitClass, SpawnError, SpawnEvent, Supervisor};

/// Absolute path to a helper script.
fn script(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("scripts")
        .join(name)
        .display()
        .to_string()
}

fn supervisor() -> (Supervisor, Receiver<SpawnEvent>) {
    Supervisor::new(SpawnConfig::default())
}

/// Receive exactly `n` line events, panicking on a premature exit event or
/// an empty stream.
fn recv_lines(events: &Receiver<SpawnEvent>, n: usize, deadline: Duration) -> Vec<String> {
    let start = Instant::now();
    let mut lines = Vec::new();
    while lines.len() < n {
        let remaining = deadline
            .checked_sub(start.elapsed())
            .unwrap_or_else(|| panic!("timed out with {} of {n} lines: {lines:?}", lines.len()));
        match events.recv_timeout(remaining) {
            Ok(SpawnEvent::Line(line)) => lines.push(line),
            Ok(SpawnEvent::Exit(class)) => {
                panic!("child exited ({class:?}) after {} of {n} lines", lines.len())
            }
            Err(e) => panic!("event stream stalled: {e}"),
        }
    }
    lines
}

/// Drain events until the terminal exit record arrives.
fn collect_until_exit(
    events: &Receiver<SpawnEvent>,
    deadline: Duration,
) -> (Vec<String>, ExitClass) {
    let start = Instant::now();
    let mut lines = Vec::new();
    loop {
        let remaining = deadline
            .checked_sub(start.elapsed())
            .unwrap_or_else(|| panic!("timed out waiting for exit; lines so far: {lines:?}"));
        match events.recv_timeout(remaining) {
            Ok(SpawnEvent::Line(line)) => lines.push(line),
            Ok(SpawnEvent::Exit(class)) => return (lines, class),
            Err(e) => panic!("event stream stalled: {e}"),
        }
    }
}

// ── launching ──────────────────────────────────────────────────────────────

#[test]
fn missing_executable_fails_without_events() {
    let (sup, events) = supervisor();
    let err = sup
        .run(&Invocation::new(
            vec!["backend-spawn-missing-xyz.sh".to_string()],
            None,
        ))
        .expect_err("missing executable");
    assert!(matches!(err, SpawnError::SpawnFailed { .. }));
    assert!(!sup.is_running());
    assert!(sup.pid().is_none());
    assert!(events.try_recv().is_err(), "no events for a failed spawn");
}

#[test]
fn one_shot_success_emits_every_line() {
    let (sup, events) = supervisor();
    sup.run(&Invocation::new(vec![script("spawn-test.sh")], None))
        .expect("launch");

    let (lines, class) = collect_until_exit(&events, Duration::from_secs(10));
    assert_eq!(class, ExitClass::Success);
    assert_eq!(lines.len(), 15, "lines: {lines:?}");
    assert_eq!(lines[0], "percentage\t10");
    assert_eq!(lines[14], "status\tfinished");
    assert!(!sup.is_running());
}

#[test]
fn replacement_environment_reaches_the_child() {
    let (sup, events) = supervisor();
    sup.run(&Invocation::new(
        vec![script("spawn-proxy.sh")],
        Some(vec![
            "http_proxy=username:password@server:port".to_string(),
            "ftp_proxy=username:password@server:port".to_string(),
        ]),
    ))
    .expect("launch");

    let (lines, class) = collect_until_exit(&events, Duration::from_secs(10));
    assert_eq!(class, ExitClass::Success);
    assert_eq!(
        lines,
        vec![
            "http_proxy\tusername:password@server:port",
            "ftp_proxy\tusername:password@server:port",
        ]
    );
}

// ── termination ────────────────────────────────────────────────────────────

#[test]
fn forced_kill_when_polite_quit_is_ignored() {
    let (sup, events) = supervisor();
    sup.run(&Invocation::new(vec![script("spawn-ignore-quit.sh")], None))
        .expect("launch");

    thread::sleep(Duration::from_secs(1));
    sup.kill().expect("kill");

    let (lines, class) = collect_until_exit(&events, Duration::from_secs(5));
    assert_eq!(class, ExitClass::SigKill);
    assert_eq!(lines, vec!["looping"]);
    assert!(sup.pid().is_none());
}

#[test]
fn polite_kill_when_the_child_cooperates() {
    let (sup, events) = supervisor();
    sup.run(&Invocation::new(vec![script("spawn-test-sigquit.sh")], None))
        .expect("launch");

    thread::sleep(Duration::from_secs(1));
    sup.kill().expect("kill");

    let (_, class) = collect_until_exit(&events, Duration::from_secs(5));
    assert_eq!(class, ExitClass::SigQuit);
}

#[test]
fn kill_after_reap_reports_already_finished() {
    let (sup, events) = supervisor();
    sup.run(&Invocation::new(vec![script("spawn-test.sh")], None))
        .expect("launch");
    let (_, class) = collect_until_exit(&events, Duration::from_secs(10));
    assert_eq!(class, ExitClass::Success);
    assert!(matches!(sup.kill(), Err(SpawnError::AlreadyFinished)));
}

// ── dispatcher sessions ────────────────────────────────────────────────────

#[test]
fn dispatcher_reuse_and_cooperative_exit() {
    let (sup, events) = supervisor();
    let inv = Invocation::new(
        vec![
            script("spawn-dispatcher.sh"),
            "search-name".to_string(),
            "none".to_string(),
            "power manager".to_string(),
        ],
        None,
    );

    // The launch arguments are the first request: one result, one sentinel.
    sup.run(&inv).expect("launch");
    let lines = recv_lines(&events, 2, Duration::from_secs(5));
    assert_eq!(lines[1], "finished");
    assert!(sup.is_running(), "dispatcher idles between requests");
    let pid = sup.pid().expect("live pid");

    // Identical descriptor: the request goes down the live child's stdin.
    sup.run(&inv).expect("reuse");
    let lines = recv_lines(&events, 2, Duration::from_secs(5));
    assert_eq!(lines[1], "finished");
    assert_eq!(sup.pid(), Some(pid), "reuse must not start a new process");

    // No further output until the next request.
    thread::sleep(Duration::from_millis(200));
    assert!(events.try_recv().is_err());

    // Cooperative exit; a nested request while it is in flight is refused.
    // The dispatcher lingers ~1s on its way out, so the overlap is reliable.
    thread::scope(|s| {
        let first = s.spawn(|| sup.send_exit());
        thread::sleep(Duration::from_millis(300));
        assert!(matches!(sup.send_exit(), Err(SpawnError::ExitInProgress)));
        first.join().expect("join").expect("cooperative exit");
    });

    let (rest, class) = collect_until_exit(&events, Duration::from_secs(5));
    assert!(rest.is_empty(), "unexpected output during shutdown: {rest:?}");
    assert_eq!(class, ExitClass::DispatcherExit);
    assert!(!sup.is_running());
    assert!(matches!(sup.send_exit(), Err(SpawnError::AlreadyFinished)));
}

#[test]
fn differing_environment_rotates_the_dispatcher() {
    let (sup, events) = supervisor();
    let first = Invocation::new(
        vec![script("spawn-dispatcher.sh"), "get-updates".to_string()],
        None,
    );
    sup.run(&first).expect("launch");
    recv_lines(&events, 2, Duration::from_secs(5));
    let old_pid = sup.pid().expect("live pid");

    // Same script, different environment: the live child must be retired.
    let second = Invocation::new(
        vec![script("spawn-dispatcher.sh")],
        Some(vec!["dispatcher_profile=isolated".to_string()]),
    );
    sup.run(&second).expect("rotate");

    let new_pid = sup.pid().expect("fresh pid");
    assert_ne!(old_pid, new_pid);
    assert!(sup.is_running());

    let (lines, class) = collect_until_exit(&events, Duration::from_secs(5));
    assert!(lines.is_empty(), "idle dispatcher wrote: {lines:?}");
    assert_eq!(class, ExitClass::DispatcherChanged);

    // The fresh child belongs to the new descriptor; retire it too.
    sup.send_exit().expect("exit fresh dispatcher");
    let (_, class) = collect_until_exit(&events, Duration::from_secs(5));
    assert_eq!(class, ExitClass::DispatcherExit);
}

#[test]
fn relaunch_after_cooperative_exit_is_fresh() {
    let (sup, events) = supervisor();
    let inv = Invocation::new(
        vec![script("spawn-dispatcher.sh"), "resolve".to_string()],
        None,
    );

    sup.run(&inv).expect("launch");
    recv_lines(&events, 2, Duration::from_secs(5));
    let old_pid = sup.pid().expect("live pid");

    sup.send_exit().expect("cooperative exit");
    let (_, class) = collect_until_exit(&events, Duration::from_secs(5));
    assert_eq!(class, ExitClass::DispatcherExit);

    // Identical descriptor, but the previous child is gone: fresh process.
    sup.run(&inv).expect("relaunch");
    assert!(sup.is_running());
    let new_pid = sup.pid().expect("fresh pid");
    assert_ne!(old_pid, new_pid);
    recv_lines(&events, 2, Duration::from_secs(5));

    sup.send_exit().expect("exit");
    let (_, class) = collect_until_exit(&events, Duration::from_secs(5));
    assert_eq!(class, ExitClass::DispatcherExit);
}

// ── cli ────────────────────────────────────────────────────────────────────

/// Path to the compiled binary.
fn binary() -> PathBuf {
    // Prefer the current exe's directory (works inside cargo test).
    let mut p = std::env::current_exe().expect("current exe");
    p.pop(); // remove test binary name
    if p.ends_with("deps") {
        p.pop();
    }
    // Binary name is "backend-spawn" as defined in [[bin]] of Cargo.toml.
    p.push("backend-spawn");
    p
}

#[test]
fn cli_run_streams_json_records() {
    let output = std::process::Command::new(binary())
        .args(["run", "--", &script("spawn-test.sh")])
        .output()
        .expect("run binary");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let records: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap_or_else(|e| panic!("bad JSON {l}: {e}")))
        .collect();

    for record in &records {
        assert_eq!(record["schema_version"].as_str(), Some("0.1"));
        assert_eq!(record["ok"].as_bool(), Some(true));
    }
    assert_eq!(records.first().map(|r| r["type"].as_str()), Some(Some("spawn")));
    let line_count = records.iter().filter(|r| r["type"] == "line").count();
    assert_eq!(line_count, 15);
    let last = records.last().expect("records");
    assert_eq!(last["type"].as_str(), Some("exit"));
    assert_eq!(last["class"].as_str(), Some("success"));
}

#[test]
fn cli_reports_spawn_failure_as_json_error() {
    let output = std::process::Command::new(binary())
        .args(["run", "--", "backend-spawn-missing-xyz.sh"])
        .output()
        .expect("run binary");
    assert!(!output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let record: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("error record is JSON");
    assert_eq!(record["ok"].as_bool(), Some(false));
    assert_eq!(record["type"].as_str(), Some("error"));
    assert_eq!(record["error"]["code"].as_str(), Some("spawn_failed"));
}
