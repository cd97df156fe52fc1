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
    let exe = env!("CARGO_BIN_EXE_rosterd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rosterd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn start(workspace: &PathBuf) -> Self {
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Sidecar {
            child,
            stdin,
            reader,
            next_id: 1,
        };
        let selected = s.request_ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        assert!(selected.get("workspacePath").is_some());
        s
    }

    fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = format!("t{}", self.next_id);
        self.next_id += 1;
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response");
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn request_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "expected ok for {}: {}",
            method,
            value
        );
        value.get("result").cloned().expect("result payload")
    }

    fn request_err(&mut self, method: &str, params: serde_json::Value, code: &str) {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "expected error for {}: {}",
            method,
            value
        );
        let got = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        assert_eq!(got, code, "wrong error code for {}: {}", method, value);
    }

    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

fn create_student(s: &mut Sidecar, last: &str, first: &str) -> String {
    let result = s.request_ok(
        "students.create",
        json!({ "lastName": last, "firstName": first }),
    );
    result
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

fn class_row(s: &mut Sidecar, class_id: &str) -> serde_json::Value {
    let listed = s.request_ok("classes.list", json!({}));
    listed
        .get("classes")
        .and_then(|v| v.as_array())
        .expect("classes array")
        .iter()
        .find(|c| c.get("id").and_then(|v| v.as_str()) == Some(class_id))
        .cloned()
        .expect("class row present")
}

fn student_class_id(s: &mut Sidecar, student_id: &str) -> Option<String> {
    let listed = s.request_ok("students.list", json!({}));
    listed
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students array")
        .iter()
        .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(student_id))
        .and_then(|r| r.get("classId"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

#[test]
fn pending_approval_updates_seat_count_and_placement() {
    let workspace = temp_dir("rosterd-lifecycle");
    let mut s = Sidecar::start(&workspace);

    let created = s.request_ok(
        "classes.create",
        json!({
            "code": "10A1",
            "gradeLevel": 10,
            "academicYear": "2024-2025",
            "maxStudents": 2
        }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let student_id = create_student(&mut s, "Ahmadi", "Leila");

    let created = s.request_ok(
        "enrollments.create",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "academicYear": "2024-2025"
        }),
    );
    let enrollment = created.get("enrollment").expect("enrollment");
    assert_eq!(
        enrollment.get("status").and_then(|v| v.as_str()),
        Some("pending")
    );
    let enrollment_id = enrollment
        .get("id")
        .and_then(|v| v.as_str())
        .expect("enrollment id")
        .to_string();

    // Pending reserves nothing and places nobody.
    let row = class_row(&mut s, &class_id);
    assert_eq!(row.get("studentCount").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(row.get("pendingCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(student_class_id(&mut s, &student_id), None);

    let updated = s.request_ok(
        "enrollments.updateStatus",
        json!({ "enrollmentId": enrollment_id, "status": "approved" }),
    );
    assert_eq!(
        updated
            .get("enrollment")
            .and_then(|e| e.get("status"))
            .and_then(|v| v.as_str()),
        Some("approved")
    );

    let row = class_row(&mut s, &class_id);
    assert_eq!(row.get("studentCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(row.get("pendingCount").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(
        student_class_id(&mut s, &student_id),
        Some(class_id.clone())
    );

    s.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn approved_and_rejected_are_terminal() {
    let workspace = temp_dir("rosterd-terminal");
    let mut s = Sidecar::start(&workspace);

    let created = s.request_ok(
        "classes.create",
        json!({ "code": "9B1", "gradeLevel": 9, "academicYear": "2024-2025" }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let approved_student = create_student(&mut s, "Nowak", "Piotr");
    let rejected_student = create_student(&mut s, "Okafor", "Chidi");

    let a = s.request_ok(
        "enrollments.create",
        json!({
            "studentId": approved_student,
            "classId": class_id,
            "academicYear": "2024-2025",
            "status": "approved"
        }),
    );
    let a_id = a
        .get("enrollment")
        .and_then(|e| e.get("id"))
        .and_then(|v| v.as_str())
        .expect("approved id")
        .to_string();

    let r = s.request_ok(
        "enrollments.create",
        json!({
            "studentId": rejected_student,
            "classId": class_id,
            "academicYear": "2024-2025"
        }),
    );
    let r_id = r
        .get("enrollment")
        .and_then(|e| e.get("id"))
        .and_then(|v| v.as_str())
        .expect("pending id")
        .to_string();
    let _ = s.request_ok(
        "enrollments.updateStatus",
        json!({ "enrollmentId": r_id, "status": "rejected" }),
    );

    // No path out of a terminal state.
    s.request_err(
        "enrollments.updateStatus",
        json!({ "enrollmentId": a_id, "status": "rejected" }),
        "invalid_transition",
    );
    s.request_err(
        "enrollments.updateStatus",
        json!({ "enrollmentId": r_id, "status": "approved" }),
        "invalid_transition",
    );
    // And pending is never a target.
    s.request_err(
        "enrollments.updateStatus",
        json!({ "enrollmentId": a_id, "status": "pending" }),
        "bad_params",
    );
    s.request_err(
        "enrollments.updateStatus",
        json!({ "enrollmentId": "no-such-enrollment", "status": "approved" }),
        "not_found",
    );

    // A rejection holds no seat, so the student may apply again.
    let again = s.request_ok(
        "enrollments.create",
        json!({
            "studentId": rejected_student,
            "classId": class_id,
            "academicYear": "2024-2025"
        }),
    );
    assert_eq!(
        again
            .get("enrollment")
            .and_then(|e| e.get("status"))
            .and_then(|v| v.as_str()),
        Some("pending")
    );

    s.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn duplicate_live_enrollment_is_a_conflict() {
    let workspace = temp_dir("rosterd-duplicate");
    let mut s = Sidecar::start(&workspace);

    let c1 = s.request_ok(
        "classes.create",
        json!({ "code": "10A1", "gradeLevel": 10, "academicYear": "2024-2025" }),
    );
    let c2 = s.request_ok(
        "classes.create",
        json!({ "code": "10A2", "gradeLevel": 10, "academicYear": "2024-2025" }),
    );
    let class1 = c1.get("classId").and_then(|v| v.as_str()).expect("classId").to_string();
    let class2 = c2.get("classId").and_then(|v| v.as_str()).expect("classId").to_string();
    let student_id = create_student(&mut s, "Petrov", "Ivan");

    let _ = s.request_ok(
        "enrollments.create",
        json!({
            "studentId": student_id,
            "classId": class1,
            "academicYear": "2024-2025"
        }),
    );
    // One live enrollment per student per year, even toward another class.
    s.request_err(
        "enrollments.create",
        json!({
            "studentId": student_id,
            "classId": class2,
            "academicYear": "2024-2025"
        }),
        "conflict",
    );
    // A different year is fine.
    let c3 = s.request_ok(
        "classes.create",
        json!({ "code": "11A1", "gradeLevel": 11, "academicYear": "2025-2026" }),
    );
    let class3 = c3.get("classId").and_then(|v| v.as_str()).expect("classId").to_string();
    let _ = s.request_ok(
        "enrollments.create",
        json!({
            "studentId": student_id,
            "classId": class3,
            "academicYear": "2025-2026"
        }),
    );

    s.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn thirty_first_approval_is_refused_until_a_seat_frees() {
    let workspace = temp_dir("rosterd-capacity");
    let mut s = Sidecar::start(&workspace);

    // Default cap of 30; the 31st approval must hit the gate.
    let created = s.request_ok(
        "classes.create",
        json!({ "code": "10A1", "gradeLevel": 10, "academicYear": "2024-2025" }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let mut enrollment_ids = Vec::new();
    for i in 0..31 {
        let student_id = create_student(&mut s, &format!("Student{:02}", i), "Test");
        let created = s.request_ok(
            "enrollments.create",
            json!({
                "studentId": student_id,
                "classId": class_id,
                "academicYear": "2024-2025"
            }),
        );
        enrollment_ids.push(
            created
                .get("enrollment")
                .and_then(|e| e.get("id"))
                .and_then(|v| v.as_str())
                .expect("enrollment id")
                .to_string(),
        );
    }

    for id in &enrollment_ids[..30] {
        let _ = s.request_ok(
            "enrollments.updateStatus",
            json!({ "enrollmentId": id, "status": "approved" }),
        );
    }
    s.request_err(
        "enrollments.updateStatus",
        json!({ "enrollmentId": enrollment_ids[30], "status": "approved" }),
        "capacity_exceeded",
    );

    let row = class_row(&mut s, &class_id);
    assert_eq!(row.get("studentCount").and_then(|v| v.as_i64()), Some(30));
    // The failed approval left the row pending.
    assert_eq!(row.get("pendingCount").and_then(|v| v.as_i64()), Some(1));

    // Deleting an approved enrollment returns the seat.
    let _ = s.request_ok(
        "enrollments.delete",
        json!({ "enrollmentId": enrollment_ids[0] }),
    );
    let row = class_row(&mut s, &class_id);
    assert_eq!(row.get("studentCount").and_then(|v| v.as_i64()), Some(29));

    let _ = s.request_ok(
        "enrollments.updateStatus",
        json!({ "enrollmentId": enrollment_ids[30], "status": "approved" }),
    );
    let row = class_row(&mut s, &class_id);
    assert_eq!(row.get("studentCount").and_then(|v| v.as_i64()), Some(30));

    s.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleting_an_approved_enrollment_clears_placement() {
    let workspace = temp_dir("rosterd-delete");
    let mut s = Sidecar::start(&workspace);

    let created = s.request_ok(
        "classes.create",
        json!({ "code": "8C1", "gradeLevel": 8, "academicYear": "2024-2025" }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let student_id = create_student(&mut s, "Silva", "Marta");

    let created = s.request_ok(
        "enrollments.create",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "academicYear": "2024-2025",
            "status": "approved"
        }),
    );
    let enrollment_id = created
        .get("enrollment")
        .and_then(|e| e.get("id"))
        .and_then(|v| v.as_str())
        .expect("enrollment id")
        .to_string();
    assert_eq!(
        student_class_id(&mut s, &student_id),
        Some(class_id.clone())
    );

    let _ = s.request_ok(
        "enrollments.delete",
        json!({ "enrollmentId": enrollment_id }),
    );
    assert_eq!(student_class_id(&mut s, &student_id), None);
    let row = class_row(&mut s, &class_id);
    assert_eq!(row.get("studentCount").and_then(|v| v.as_i64()), Some(0));

    let listed = s.request_ok("enrollments.list", json!({ "studentId": student_id }));
    assert_eq!(
        listed
            .get("enrollments")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(0)
    );
    s.request_err(
        "enrollments.delete",
        json!({ "enrollmentId": enrollment_id }),
        "not_found",
    );

    s.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn validation_rejects_malformed_input() {
    let workspace = temp_dir("rosterd-validation");
    let mut s = Sidecar::start(&workspace);

    let created = s.request_ok(
        "classes.create",
        json!({ "code": "7A1", "gradeLevel": 7, "academicYear": "2024-2025" }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let student_id = create_student(&mut s, "Berg", "Nils");

    s.request_err(
        "enrollments.create",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "academicYear": "2024/2025"
        }),
        "bad_params",
    );
    s.request_err(
        "enrollments.create",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "academicYear": "2024-2026"
        }),
        "bad_params",
    );
    s.request_err(
        "enrollments.create",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "academicYear": "2024-2025",
            "enrollmentDate": "yesterday"
        }),
        "bad_params",
    );
    // Year must match the class the enrollment targets.
    s.request_err(
        "enrollments.create",
        json!({
            "studentId": student_id,
            "classId": class_id,
            "academicYear": "2025-2026"
        }),
        "bad_params",
    );
    s.request_err(
        "enrollments.create",
        json!({
            "studentId": "no-such-student",
            "classId": class_id,
            "academicYear": "2024-2025"
        }),
        "not_found",
    );
    s.request_err(
        "classes.create",
        json!({ "code": "7A1", "gradeLevel": 7, "academicYear": "2024-2025" }),
        "conflict",
    );

    s.finish();
    let _ = std::fs::remove_dir_all(workspace);
}
