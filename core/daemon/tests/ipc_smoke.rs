use serde_json::json;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use timeclock_daemon_protocol::{Method, Request, Response, PROTOCOL_VERSION};

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn temp_home(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in("/tmp")
        .expect("failed to create temp home")
}

fn spawn_daemon(home: &Path) -> DaemonGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_timeclock-daemon"))
        .env("TIMECLOCK_HOME", home)
        .env("HOME", home)
        .env_remove("TIMECLOCK_TENANT_ID")
        .env_remove("TIMECLOCK_CLIENT_ID")
        .env_remove("TIMECLOCK_CLIENT_SECRET")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn timeclock-daemon");
    DaemonGuard { child }
}

fn socket_path(home: &Path) -> PathBuf {
    home.join("daemon.sock")
}

fn can_bind_socket(home: &Path) -> bool {
    let probe_path = home.join("probe.sock");
    match UnixListener::bind(&probe_path) {
        Ok(listener) => {
            drop(listener);
            let _ = std::fs::remove_file(&probe_path);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for daemon socket at {}", path.display());
}

fn send_raw(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    stream.write_all(payload).expect("failed to write request");
    stream.flush().expect("failed to flush request");
    read_response(&mut stream)
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut payload = serde_json::to_vec(&request).expect("failed to serialize request");
    payload.push(b'\n');
    send_raw(socket, &payload)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    serde_json::from_slice(response_bytes).expect("failed to parse response JSON")
}

fn error_code(response: &Response) -> Option<&str> {
    response.error.as_ref().map(|err| err.code.as_str())
}

#[test]
fn daemon_ipc_health_prompts_and_configure_smoke() {
    let home = temp_home("timeclock-daemon-smoke");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping smoke test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let health = send_request(&socket, Request::new(Method::GetHealth, None));
    assert!(health.ok, "health response was not ok");
    let data = health.data.expect("health payload");
    assert_eq!(data["status"], "ok");
    assert_eq!(data["protocol_version"], PROTOCOL_VERSION);

    let prompts = send_request(&socket, Request::new(Method::ListPrompts, None));
    assert!(prompts.ok);
    assert_eq!(prompts.data.expect("prompts payload"), json!([]));

    let activity = send_request(
        &socket,
        Request::new(Method::ReportActivity, Some(json!({ "idle_secs": 5 }))),
    );
    assert!(activity.ok);
    assert_eq!(activity.data.expect("activity payload")["worker_active"], true);

    let configure = send_request(
        &socket,
        Request::new(
            Method::Configure,
            Some(json!({ "email": "nobody", "team_name": "Engines" })),
        ),
    );
    assert!(!configure.ok);
    assert_eq!(error_code(&configure), Some("invalid_email"));

    let answer = send_request(
        &socket,
        Request::new(
            Method::AnswerPrompt,
            Some(json!({ "id": 1, "answer": { "delay_minutes": 0 } })),
        ),
    );
    assert_eq!(error_code(&answer), Some("invalid_delay"));
}

#[test]
fn daemon_rejects_malformed_payloads_and_stays_healthy() {
    let home = temp_home("timeclock-daemon-malformed");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping malformed payload test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    for _ in 0..32 {
        let response = send_raw(&socket, b"{\"bad_json\": true\n");
        assert!(!response.ok, "malformed payload must be rejected");
        assert_eq!(error_code(&response), Some("invalid_json"));
    }

    let mut mismatched = Request::new(Method::GetHealth, None);
    mismatched.protocol_version = PROTOCOL_VERSION + 1;
    assert_eq!(
        error_code(&send_request(&socket, mismatched)),
        Some("protocol_mismatch")
    );

    let health = send_request(&socket, Request::new(Method::GetHealth, None));
    assert!(health.ok, "daemon should remain healthy after malformed payloads");
}

#[test]
fn daemon_idle_connection_returns_read_timeout_error() {
    let home = temp_home("timeclock-daemon-timeout");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping timeout test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut idle = UnixStream::connect(&socket).expect("failed to connect idle stream");
    let response = read_response(&mut idle);
    assert!(!response.ok, "idle request should return an error");
    assert_eq!(error_code(&response), Some("read_timeout"));
}

#[test]
fn second_instance_exits_while_the_first_serves() {
    let home = temp_home("timeclock-daemon-single");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping single-instance test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(home.path());
    let _first = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut second = spawn_daemon(home.path());
    let status = second.child.wait().expect("second instance exit status");
    assert!(status.success());

    let health = send_request(&socket, Request::new(Method::GetHealth, None));
    assert!(health.ok, "first instance should keep serving");
}
