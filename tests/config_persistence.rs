use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_recordsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn recordsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn select(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
}

#[test]
fn config_update_persists_across_restart() {
    let workspace = temp_dir("recordsd-config-persist");
    {
        let (mut child, mut stdin, mut reader) = spawn_sidecar();
        select(&mut stdin, &mut reader, &workspace);

        let defaults = request_ok(&mut stdin, &mut reader, "get", "config.get", json!({}));
        assert_eq!(defaults["config"]["maxAllocationAttempts"], 5);
        assert_eq!(defaults["config"]["registrationWidth"], 3);
        assert_eq!(defaults["config"]["examPassValidityDays"], 90);

        let updated = request_ok(
            &mut stdin,
            &mut reader,
            "set",
            "config.update",
            json!({ "patch": { "registrationWidth": 4, "examPassValidityDays": 30 } }),
        );
        assert_eq!(updated["config"]["registrationWidth"], 4);

        let rejected = request(
            &mut stdin,
            &mut reader,
            "bad",
            "config.update",
            json!({ "patch": { "maxAllocationAttempts": 0 } }),
        );
        assert_eq!(error_code(&rejected), "bad_params");

        drop(stdin);
        let _ = child.wait();
    }

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select(&mut stdin, &mut reader, &workspace);
    let reloaded = request_ok(&mut stdin, &mut reader, "get", "config.get", json!({}));
    assert_eq!(reloaded["config"]["registrationWidth"], 4);
    assert_eq!(reloaded["config"]["examPassValidityDays"], 30);
    assert_eq!(reloaded["config"]["maxAllocationAttempts"], 5);

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s",
        "students.create",
        json!({ "name": "Wide Number" }),
    );
    let reg = student["registrationNo"].as_str().expect("registrationNo");
    assert!(reg.ends_with("/GEN/0001"), "{}", reg);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn config_requires_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let res = request(&mut stdin, &mut reader, "get", "config.get", json!({}));
    assert_eq!(error_code(&res), "no_workspace");
    drop(stdin);
    let _ = child.wait();
}
