//! Enrollment lifecycle: born PENDING (manual registration) or born APPROVED
//! (auto-assignment, promotion), then at most one transition out of PENDING.
//! APPROVED is terminal; the only way back is `delete`.

use crate::capacity;
use crate::coordinator::{self, CacheHooks, Entity, SideEffects};
use crate::model::{
    validate_academic_year, validate_enrollment_date, ClassRow, EnrollmentRow, EnrollmentStatus,
    OpError,
};
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::json;
use uuid::Uuid;

pub struct CreateParams {
    pub student_id: String,
    pub class_id: String,
    pub academic_year: String,
    pub enrollment_date: Option<String>,
    pub notes: Option<String>,
    pub status: EnrollmentStatus,
}

pub fn create(
    conn: &Connection,
    cache: &dyn CacheHooks,
    actor_id: &str,
    p: CreateParams,
) -> Result<EnrollmentRow, OpError> {
    validate_academic_year(&p.academic_year)?;
    let enrollment_date = match p.enrollment_date {
        Some(d) => {
            validate_enrollment_date(&d)?;
            d
        }
        None => chrono::Local::now().date_naive().format("%Y-%m-%d").to_string(),
    };
    if p.status == EnrollmentStatus::Rejected {
        return Err(OpError::Validation(
            "an enrollment cannot be created rejected".to_string(),
        ));
    }

    coordinator::run_unit(conn, cache, |tx, fx| {
        if !student_exists(tx, &p.student_id)? {
            return Err(OpError::NotFound(format!(
                "student not found: {}",
                p.student_id
            )));
        }
        let class = fetch_class(tx, &p.class_id)?;
        if class.academic_year != p.academic_year {
            return Err(OpError::Validation(format!(
                "class {} belongs to academic year {}, not {}",
                class.code, class.academic_year, p.academic_year
            )));
        }
        if has_live_enrollment(tx, &p.student_id, &p.academic_year)? {
            return Err(OpError::Conflict(format!(
                "student {} already has a live enrollment for {}",
                p.student_id, p.academic_year
            )));
        }

        let row = EnrollmentRow {
            id: Uuid::new_v4().to_string(),
            student_id: p.student_id.clone(),
            class_id: p.class_id.clone(),
            academic_year: p.academic_year.clone(),
            enrollment_date,
            status: p.status,
            notes: p.notes.clone(),
        };

        // A direct-APPROVED creation takes the same seat gate as approve().
        if row.status == EnrollmentStatus::Approved {
            if !capacity::reserve_seat(tx, &row.class_id)? {
                return Err(OpError::CapacityExceeded(format!(
                    "class {} is full",
                    class.code
                )));
            }
            set_student_class(tx, &row.student_id, Some(&row.class_id))?;
            fx.invalidate(Entity::Student, &row.student_id);
            fx.invalidate(Entity::Class, &row.class_id);
        }
        insert_row(tx, &row)?;

        fx.invalidate(Entity::Enrollment, &row.id);
        fx.audit(
            actor_id,
            "enrollment.create",
            Entity::Enrollment,
            &row.id,
            Some(json!({
                "studentId": row.student_id,
                "classId": row.class_id,
                "academicYear": row.academic_year,
                "status": row.status.as_str(),
            })),
        );
        Ok(row)
    })
}

pub fn update_status(
    conn: &Connection,
    cache: &dyn CacheHooks,
    actor_id: &str,
    enrollment_id: &str,
    new_status: EnrollmentStatus,
    notes: Option<String>,
) -> Result<EnrollmentRow, OpError> {
    coordinator::run_unit(conn, cache, |tx, fx| {
        let mut row = fetch_enrollment(tx, enrollment_id)?;
        if row.status.is_terminal() {
            return Err(OpError::InvalidTransition(format!(
                "enrollment {} is already {}",
                enrollment_id,
                row.status.as_str()
            )));
        }

        match new_status {
            EnrollmentStatus::Approved => {
                let class = fetch_class(tx, &row.class_id)?;
                if !capacity::reserve_seat(tx, &row.class_id)? {
                    return Err(OpError::CapacityExceeded(format!(
                        "class {} is full",
                        class.code
                    )));
                }
                set_student_class(tx, &row.student_id, Some(&row.class_id))?;
                fx.invalidate(Entity::Student, &row.student_id);
                fx.invalidate(Entity::Class, &row.class_id);
            }
            // Rejection never held the pointer, so there is nothing to undo.
            EnrollmentStatus::Rejected => {}
            EnrollmentStatus::Pending => {
                return Err(OpError::InvalidTransition(
                    "an enrollment cannot return to pending".to_string(),
                ));
            }
        }

        row.status = new_status;
        if notes.is_some() {
            row.notes = notes.clone();
        }
        tx.execute(
            "UPDATE enrollments SET status = ?, notes = ? WHERE id = ?",
            (row.status.as_str(), &row.notes, &row.id),
        )?;

        fx.invalidate(Entity::Enrollment, &row.id);
        fx.audit(
            actor_id,
            "enrollment.updateStatus",
            Entity::Enrollment,
            &row.id,
            Some(json!({ "status": row.status.as_str() })),
        );
        Ok(row)
    })
}

pub fn delete(
    conn: &Connection,
    cache: &dyn CacheHooks,
    actor_id: &str,
    enrollment_id: &str,
) -> Result<(), OpError> {
    coordinator::run_unit(conn, cache, |tx, fx| {
        let row = fetch_enrollment(tx, enrollment_id)?;
        tx.execute("DELETE FROM enrollments WHERE id = ?", [&row.id])?;

        if row.status == EnrollmentStatus::Approved {
            capacity::release_seat(tx, &row.class_id)?;
            // Only clear the pointer if it still mirrors this enrollment; a
            // later promotion may have moved the student on already.
            let changed = tx.execute(
                "UPDATE students SET class_id = NULL, updated_at = ? WHERE id = ? AND class_id = ?",
                (now_string(), &row.student_id, &row.class_id),
            )?;
            if changed > 0 {
                fx.invalidate(Entity::Student, &row.student_id);
            }
            fx.invalidate(Entity::Class, &row.class_id);
        }

        fx.invalidate(Entity::Enrollment, &row.id);
        fx.audit(
            actor_id,
            "enrollment.delete",
            Entity::Enrollment,
            &row.id,
            Some(json!({
                "studentId": row.student_id,
                "classId": row.class_id,
                "status": row.status.as_str(),
            })),
        );
        Ok(())
    })
}

/// Shared approved-insert path for the batch engines: seat gate, enrollment
/// row and pointer update inside the caller's transaction.
pub(crate) fn insert_approved(
    tx: &Transaction,
    fx: &mut SideEffects,
    actor_id: &str,
    student_id: &str,
    class: &ClassRow,
    enrollment_date: &str,
    notes: &str,
) -> Result<EnrollmentRow, OpError> {
    if has_live_enrollment(tx, student_id, &class.academic_year)? {
        return Err(OpError::Conflict(format!(
            "student {} already has a live enrollment for {}",
            student_id, class.academic_year
        )));
    }
    if !capacity::reserve_seat(tx, &class.id)? {
        return Err(OpError::CapacityExceeded(format!(
            "class {} is full",
            class.code
        )));
    }

    let row = EnrollmentRow {
        id: Uuid::new_v4().to_string(),
        student_id: student_id.to_string(),
        class_id: class.id.clone(),
        academic_year: class.academic_year.clone(),
        enrollment_date: enrollment_date.to_string(),
        status: EnrollmentStatus::Approved,
        notes: Some(notes.to_string()),
    };
    insert_row(tx, &row)?;
    set_student_class(tx, student_id, Some(&class.id))?;

    fx.invalidate(Entity::Enrollment, &row.id);
    fx.invalidate(Entity::Student, student_id);
    fx.invalidate(Entity::Class, &class.id);
    fx.audit(
        actor_id,
        "enrollment.create",
        Entity::Enrollment,
        &row.id,
        Some(json!({
            "studentId": student_id,
            "classId": class.id,
            "academicYear": class.academic_year,
            "status": "approved",
        })),
    );
    Ok(row)
}

fn insert_row(conn: &Connection, row: &EnrollmentRow) -> Result<(), OpError> {
    conn.execute(
        "INSERT INTO enrollments(id, student_id, class_id, academic_year, enrollment_date, status, notes)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.student_id,
            &row.class_id,
            &row.academic_year,
            &row.enrollment_date,
            row.status.as_str(),
            &row.notes,
        ),
    )?;
    Ok(())
}

pub(crate) fn set_student_class(
    conn: &Connection,
    student_id: &str,
    class_id: Option<&str>,
) -> Result<(), OpError> {
    conn.execute(
        "UPDATE students SET class_id = ?, updated_at = ? WHERE id = ?",
        (class_id, now_string(), student_id),
    )?;
    Ok(())
}

pub(crate) fn fetch_enrollment(conn: &Connection, id: &str) -> Result<EnrollmentRow, OpError> {
    let row = conn
        .query_row(
            "SELECT id, student_id, class_id, academic_year, enrollment_date, status, notes
             FROM enrollments WHERE id = ?",
            [id],
            map_enrollment_row,
        )
        .optional()?;
    row.ok_or_else(|| OpError::NotFound(format!("enrollment not found: {}", id)))
}

pub(crate) fn map_enrollment_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<EnrollmentRow> {
    let status_raw: String = r.get(5)?;
    Ok(EnrollmentRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        class_id: r.get(2)?,
        academic_year: r.get(3)?,
        enrollment_date: r.get(4)?,
        // Unknown strings can only come from hand-edited rows; surface them
        // as pending so they stay visible rather than silently terminal.
        status: EnrollmentStatus::parse(&status_raw).unwrap_or(EnrollmentStatus::Pending),
        notes: r.get(6)?,
    })
}

pub(crate) fn fetch_class(conn: &Connection, id: &str) -> Result<ClassRow, OpError> {
    let row = conn
        .query_row(
            "SELECT id, code, name, grade_level, academic_year, max_students, student_count
             FROM classes WHERE id = ?",
            [id],
            map_class_row,
        )
        .optional()?;
    row.ok_or_else(|| OpError::NotFound(format!("class not found: {}", id)))
}

pub(crate) fn map_class_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ClassRow> {
    Ok(ClassRow {
        id: r.get(0)?,
        code: r.get(1)?,
        name: r.get(2)?,
        grade_level: r.get(3)?,
        academic_year: r.get(4)?,
        max_students: r.get(5)?,
        student_count: r.get(6)?,
    })
}

pub(crate) fn student_exists(conn: &Connection, id: &str) -> Result<bool, OpError> {
    let hit: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    Ok(hit.is_some())
}

fn has_live_enrollment(
    conn: &Connection,
    student_id: &str,
    academic_year: &str,
) -> Result<bool, OpError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments
             WHERE student_id = ? AND academic_year = ? AND status IN ('pending', 'approved')",
            (student_id, academic_year),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

pub(crate) fn now_string() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::NullCache;
    use crate::db;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn add_class(conn: &Connection, id: &str, code: &str, max: i64) {
        conn.execute(
            "INSERT INTO classes(id, code, name, grade_level, academic_year, max_students)
             VALUES(?, ?, ?, 10, '2024-2025', ?)",
            (id, code, format!("Class {}", code), max),
        )
        .expect("insert class");
    }

    fn add_student(conn: &Connection, id: &str, last: &str, first: &str) {
        conn.execute(
            "INSERT INTO students(id, last_name, first_name, status) VALUES(?, ?, ?, 'active')",
            (id, last, first),
        )
        .expect("insert student");
    }

    fn params(student: &str, class: &str, status: EnrollmentStatus) -> CreateParams {
        CreateParams {
            student_id: student.to_string(),
            class_id: class.to_string(),
            academic_year: "2024-2025".to_string(),
            enrollment_date: Some("2024-09-01".to_string()),
            notes: None,
            status,
        }
    }

    fn student_class(conn: &Connection, id: &str) -> Option<String> {
        conn.query_row("SELECT class_id FROM students WHERE id = ?", [id], |r| r.get(0))
            .expect("student row")
    }

    fn class_count(conn: &Connection, id: &str) -> i64 {
        conn.query_row("SELECT student_count FROM classes WHERE id = ?", [id], |r| r.get(0))
            .expect("class row")
    }

    #[test]
    fn pending_create_then_approve_moves_pointer_and_count() {
        let conn = test_conn();
        add_class(&conn, "c1", "10A1", 30);
        add_student(&conn, "s1", "Ng", "An");

        let row = create(&conn, &NullCache, "admin", params("s1", "c1", EnrollmentStatus::Pending))
            .expect("create pending");
        assert_eq!(row.status, EnrollmentStatus::Pending);
        assert_eq!(student_class(&conn, "s1"), None, "pending holds no pointer");
        assert_eq!(class_count(&conn, "c1"), 0);

        let row = update_status(&conn, &NullCache, "admin", &row.id, EnrollmentStatus::Approved, None)
            .expect("approve");
        assert_eq!(row.status, EnrollmentStatus::Approved);
        assert_eq!(student_class(&conn, "s1").as_deref(), Some("c1"));
        assert_eq!(class_count(&conn, "c1"), 1);
    }

    #[test]
    fn terminal_states_refuse_further_transitions() {
        let conn = test_conn();
        add_class(&conn, "c1", "10A1", 30);
        add_student(&conn, "s1", "Ng", "An");

        let row = create(&conn, &NullCache, "admin", params("s1", "c1", EnrollmentStatus::Pending))
            .expect("create");
        update_status(&conn, &NullCache, "admin", &row.id, EnrollmentStatus::Approved, None)
            .expect("approve");

        let err = update_status(&conn, &NullCache, "admin", &row.id, EnrollmentStatus::Rejected, None)
            .expect_err("approved is terminal");
        assert_eq!(err.code(), "invalid_transition");
        // Nothing moved.
        assert_eq!(student_class(&conn, "s1").as_deref(), Some("c1"));
        assert_eq!(class_count(&conn, "c1"), 1);
        let status: String = conn
            .query_row("SELECT status FROM enrollments WHERE id = ?", [&row.id], |r| r.get(0))
            .expect("status");
        assert_eq!(status, "approved");
    }

    #[test]
    fn reject_never_touches_pointer_or_count() {
        let conn = test_conn();
        add_class(&conn, "c1", "10A1", 30);
        add_student(&conn, "s1", "Ng", "An");

        let row = create(&conn, &NullCache, "admin", params("s1", "c1", EnrollmentStatus::Pending))
            .expect("create");
        let row = update_status(
            &conn,
            &NullCache,
            "admin",
            &row.id,
            EnrollmentStatus::Rejected,
            Some("no seat paperwork".to_string()),
        )
        .expect("reject");
        assert_eq!(row.status, EnrollmentStatus::Rejected);
        assert_eq!(row.notes.as_deref(), Some("no seat paperwork"));
        assert_eq!(student_class(&conn, "s1"), None);
        assert_eq!(class_count(&conn, "c1"), 0);
    }

    #[test]
    fn approval_fails_capacity_exceeded_with_nothing_applied() {
        let conn = test_conn();
        add_class(&conn, "c1", "10A1", 1);
        add_student(&conn, "s1", "Ng", "An");
        add_student(&conn, "s2", "Tran", "Binh");

        create(&conn, &NullCache, "admin", params("s1", "c1", EnrollmentStatus::Approved))
            .expect("fill the only seat");
        let pending = create(&conn, &NullCache, "admin", params("s2", "c1", EnrollmentStatus::Pending))
            .expect("second registration stays pending");

        let err = update_status(&conn, &NullCache, "admin", &pending.id, EnrollmentStatus::Approved, None)
            .expect_err("class is full");
        assert_eq!(err.code(), "capacity_exceeded");
        assert_eq!(class_count(&conn, "c1"), 1, "failed approval must not bump the count");
        assert_eq!(student_class(&conn, "s2"), None);
        let status: String = conn
            .query_row("SELECT status FROM enrollments WHERE id = ?", [&pending.id], |r| r.get(0))
            .expect("status");
        assert_eq!(status, "pending", "enrollment stays pending after refused approval");
    }

    #[test]
    fn duplicate_live_enrollment_is_conflict() {
        let conn = test_conn();
        add_class(&conn, "c1", "10A1", 30);
        add_class(&conn, "c2", "10A2", 30);
        add_student(&conn, "s1", "Ng", "An");

        create(&conn, &NullCache, "admin", params("s1", "c1", EnrollmentStatus::Pending))
            .expect("first registration");
        let err = create(&conn, &NullCache, "admin", params("s1", "c2", EnrollmentStatus::Pending))
            .expect_err("duplicate live enrollment");
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn delete_approved_restores_seat_and_clears_pointer() {
        let conn = test_conn();
        add_class(&conn, "c1", "10A1", 1);
        add_student(&conn, "s1", "Ng", "An");
        add_student(&conn, "s2", "Tran", "Binh");

        let row = create(&conn, &NullCache, "admin", params("s1", "c1", EnrollmentStatus::Approved))
            .expect("approved create");
        assert_eq!(class_count(&conn, "c1"), 1);

        delete(&conn, &NullCache, "admin", &row.id).expect("delete");
        assert_eq!(class_count(&conn, "c1"), 0);
        assert_eq!(student_class(&conn, "s1"), None);

        // The freed seat is usable again.
        create(&conn, &NullCache, "admin", params("s2", "c1", EnrollmentStatus::Approved))
            .expect("seat freed by delete");
        assert_eq!(class_count(&conn, "c1"), 1);
    }

    #[test]
    fn create_validates_references_and_year() {
        let conn = test_conn();
        add_class(&conn, "c1", "10A1", 30);
        add_student(&conn, "s1", "Ng", "An");

        let err = create(&conn, &NullCache, "admin", params("ghost", "c1", EnrollmentStatus::Pending))
            .expect_err("unknown student");
        assert_eq!(err.code(), "not_found");

        let err = create(&conn, &NullCache, "admin", params("s1", "ghost", EnrollmentStatus::Pending))
            .expect_err("unknown class");
        assert_eq!(err.code(), "not_found");

        let mut p = params("s1", "c1", EnrollmentStatus::Pending);
        p.academic_year = "2025-2026".to_string();
        let err = create(&conn, &NullCache, "admin", p).expect_err("year mismatch with class");
        assert_eq!(err.code(), "bad_params");

        let mut p = params("s1", "c1", EnrollmentStatus::Pending);
        p.enrollment_date = Some("not-a-date".to_string());
        let err = create(&conn, &NullCache, "admin", p).expect_err("bad date");
        assert_eq!(err.code(), "bad_params");

        let err = create(&conn, &NullCache, "admin", params("s1", "c1", EnrollmentStatus::Rejected))
            .expect_err("born rejected");
        assert_eq!(err.code(), "bad_params");
    }

    #[test]
    fn delete_missing_enrollment_is_not_found() {
        let conn = test_conn();
        let err = delete(&conn, &NullCache, "admin", "ghost").expect_err("missing row");
        assert_eq!(err.code(), "not_found");
    }
}
