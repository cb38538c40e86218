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

fn year() -> i32 {
    use chrono::Datelike;
    chrono::Local::now().year()
}

fn setup(prefix: &str) -> (PathBuf, Child, ChildStdin, BufReader<ChildStdout>, String) {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "student",
        "students.create",
        json!({ "name": "Ada Lovelace" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    (workspace, child, stdin, reader, student_id)
}

fn submit(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    payment_type: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "payments.create",
        json!({
            "studentId": student_id,
            "semester": "Semester 1",
            "academicYear": "2024/2025",
            "amount": 150.0,
            "paymentType": payment_type,
            "paymentMethod": "Mobile Money",
            "transactionReference": "MM-1234",
        }),
    )
}

#[test]
fn receipts_are_sequential_per_year() {
    let (workspace, mut child, mut stdin, mut reader, student_id) =
        setup("recordsd-pay-receipts");
    let y = year();

    let first = submit(&mut stdin, &mut reader, "p1", &student_id, "Tuition Fee");
    let second = submit(&mut stdin, &mut reader, "p2", &student_id, "Library Fee");
    assert_eq!(first["receiptNumber"], format!("RCP-{}-000001", y));
    assert_eq!(second["receiptNumber"], format!("RCP-{}-000002", y));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "payments.list",
        json!({ "studentId": student_id }),
    );
    let payments = listed["payments"].as_array().cloned().expect("payments");
    assert_eq!(payments.len(), 2);
    assert!(payments.iter().all(|p| p["status"] == "Pending"));

    let bad = request(
        &mut stdin,
        &mut reader,
        "bad",
        "payments.create",
        json!({
            "studentId": student_id,
            "semester": "Semester 1",
            "academicYear": "2024/2025",
            "amount": 0,
            "paymentType": "Tuition Fee",
            "paymentMethod": "Cash",
        }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    // Validation failures never reach the allocator.
    let third = submit(&mut stdin, &mut reader, "p3", &student_id, "Other");
    assert_eq!(third["receiptNumber"], format!("RCP-{}-000003", y));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn confirming_exam_fee_issues_a_pass_once() {
    let (workspace, mut child, mut stdin, mut reader, student_id) =
        setup("recordsd-pay-exam-fee");
    let y = year();

    let payment = submit(&mut stdin, &mut reader, "p", &student_id, "Exam Fee");
    let payment_id = payment["paymentId"].as_str().expect("paymentId").to_string();

    let confirmed = request_ok(
        &mut stdin,
        &mut reader,
        "confirm",
        "payments.confirm",
        json!({ "paymentId": payment_id, "examType": "Final" }),
    );
    let pass = &confirmed["examPass"];
    assert_eq!(pass["passNumber"], format!("EP-{}-000001", y));
    assert_eq!(pass["examType"], "Final");
    assert_eq!(pass["status"], "Active");
    assert_eq!(pass["isValid"], true);
    assert_eq!(pass["verificationCode"].as_str().map(|s| s.len()), Some(16));
    assert!(pass["issueDate"]
        .as_str()
        .expect("issueDate")
        .starts_with(&y.to_string()));
    assert_eq!(confirmed["payment"]["status"], "Confirmed");
    assert_eq!(confirmed["payment"]["examPassGenerated"], true);
    assert_eq!(confirmed["payment"]["passNumber"], pass["passNumber"]);

    let again = request(
        &mut stdin,
        &mut reader,
        "again",
        "payments.confirm",
        json!({ "paymentId": payment_id }),
    );
    assert_eq!(error_code(&again), "conflict");

    let manual = request(
        &mut stdin,
        &mut reader,
        "manual",
        "payments.generateExamPass",
        json!({ "paymentId": payment_id }),
    );
    assert_eq!(error_code(&manual), "conflict");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn non_exam_payments_do_not_issue_passes() {
    let (workspace, mut child, mut stdin, mut reader, student_id) =
        setup("recordsd-pay-tuition");

    let tuition = submit(&mut stdin, &mut reader, "t", &student_id, "Tuition Fee");
    let tuition_id = tuition["paymentId"].as_str().expect("paymentId").to_string();
    let confirmed = request_ok(
        &mut stdin,
        &mut reader,
        "confirm",
        "payments.confirm",
        json!({ "paymentId": tuition_id }),
    );
    assert!(confirmed["examPass"].is_null());

    let manual = request(
        &mut stdin,
        &mut reader,
        "manual",
        "payments.generateExamPass",
        json!({ "paymentId": tuition_id }),
    );
    assert_eq!(error_code(&manual), "bad_params");

    let fee = submit(&mut stdin, &mut reader, "f", &student_id, "Exam Fee");
    let fee_id = fee["paymentId"].as_str().expect("paymentId").to_string();
    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "reject",
        "payments.reject",
        json!({ "paymentId": fee_id, "reason": "reference not found" }),
    );
    assert_eq!(rejected["payment"]["status"], "Rejected");
    assert_eq!(rejected["payment"]["rejectionReason"], "reference not found");

    let after_reject = request(
        &mut stdin,
        &mut reader,
        "confirm-rejected",
        "payments.confirm",
        json!({ "paymentId": fee_id }),
    );
    assert_eq!(error_code(&after_reject), "conflict");

    let passes = request_ok(&mut stdin, &mut reader, "passes", "examPasses.list", json!({}));
    assert_eq!(passes["examPasses"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn verify_and_revoke_exam_pass() {
    let (workspace, mut child, mut stdin, mut reader, student_id) =
        setup("recordsd-pay-verify");

    let payment = submit(&mut stdin, &mut reader, "p", &student_id, "Exam Fee");
    let confirmed = request_ok(
        &mut stdin,
        &mut reader,
        "confirm",
        "payments.confirm",
        json!({ "paymentId": payment["paymentId"] }),
    );
    let pass_number = confirmed["examPass"]["passNumber"]
        .as_str()
        .expect("passNumber")
        .to_string();
    let pass_id = confirmed["examPass"]["id"].as_str().expect("id").to_string();
    let code = confirmed["examPass"]["verificationCode"]
        .as_str()
        .expect("verificationCode")
        .to_lowercase();

    let ok = request_ok(
        &mut stdin,
        &mut reader,
        "verify",
        "examPasses.verify",
        json!({ "passNumber": pass_number, "verificationCode": code }),
    );
    assert_eq!(ok["isValid"], true);
    assert_eq!(ok["examPass"]["studentName"], "Ada Lovelace");

    let wrong = request_ok(
        &mut stdin,
        &mut reader,
        "verify-wrong",
        "examPasses.verify",
        json!({ "passNumber": pass_number, "verificationCode": "0000000000000000" }),
    );
    assert_eq!(wrong["isValid"], false);

    let revoked = request_ok(
        &mut stdin,
        &mut reader,
        "revoke",
        "examPasses.revoke",
        json!({ "examPassId": pass_id, "reason": "duplicate" }),
    );
    assert_eq!(revoked["examPass"]["status"], "Revoked");

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "verify-revoked",
        "examPasses.verify",
        json!({ "passNumber": pass_number }),
    );
    assert_eq!(after["isValid"], false);

    let unknown = request(
        &mut stdin,
        &mut reader,
        "verify-unknown",
        "examPasses.verify",
        json!({ "passNumber": "EP-1999-000001" }),
    );
    assert_eq!(error_code(&unknown), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn failed_pass_issue_leaves_payment_pending() {
    let (workspace, mut child, mut stdin, mut reader, student_id) =
        setup("recordsd-pay-issue-failure");
    let y = year();

    let payment = submit(&mut stdin, &mut reader, "p", &student_id, "Exam Fee");
    let payment_id = payment["paymentId"].as_str().expect("paymentId").to_string();

    // A stray pass already tied to this payment makes issuance fail.
    let conn = rusqlite::Connection::open(workspace.join("records.sqlite3")).expect("open db");
    conn.busy_timeout(std::time::Duration::from_secs(5)).expect("busy timeout");
    conn.execute(
        "INSERT INTO exam_passes(
           id, student_id, payment_id, semester, academic_year, pass_number,
           issue_date, expiry_date, verification_code, created_at
         ) VALUES('stray', ?1, ?2, 'Semester 1', '2024/2025', 'EP-IMPORT-1',
                  '2024-01-01', '2024-04-01', 'X', '2024-01-01T00:00:00Z')",
        (&student_id, &payment_id),
    )
    .expect("insert stray pass");

    let failed = request(
        &mut stdin,
        &mut reader,
        "confirm",
        "payments.confirm",
        json!({ "paymentId": payment_id }),
    );
    assert_eq!(error_code(&failed), "conflict", "{}", failed);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "payments.list",
        json!({ "studentId": student_id }),
    );
    assert_eq!(listed["payments"][0]["status"], "Pending");
    assert!(listed["payments"][0]["examPassId"].is_null());

    conn.execute("DELETE FROM exam_passes WHERE id = 'stray'", [])
        .expect("remove stray pass");
    drop(conn);

    let confirmed = request_ok(
        &mut stdin,
        &mut reader,
        "retry",
        "payments.confirm",
        json!({ "paymentId": payment_id }),
    );
    assert_eq!(confirmed["payment"]["status"], "Confirmed");
    // The number drawn by the failed attempt is not reused.
    assert_eq!(confirmed["examPass"]["passNumber"], format!("EP-{}-000002", y));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
