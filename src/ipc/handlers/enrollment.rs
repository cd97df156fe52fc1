use crate::capacity;
use crate::enrollment;
use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::{actor_id, get_opt_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::model::{EnrollmentStatus, OpError};
use rusqlite::Connection;
use serde_json::json;

fn enrollments_create(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, OpError> {
    let status = match get_opt_str(params, "status") {
        Some(raw) => EnrollmentStatus::parse(&raw)
            .ok_or_else(|| OpError::Validation(format!("unknown enrollment status: {}", raw)))?,
        None => EnrollmentStatus::Pending,
    };
    let p = enrollment::CreateParams {
        student_id: get_required_str(params, "studentId")?,
        class_id: get_required_str(params, "classId")?,
        academic_year: get_required_str(params, "academicYear")?,
        enrollment_date: get_opt_str(params, "enrollmentDate"),
        notes: get_opt_str(params, "notes"),
        status,
    };
    let row = enrollment::create(conn, state.cache.as_ref(), &actor_id(params), p)?;
    // Pending registrations carry a seat advisory so the registrar can see a
    // doomed approval coming; the hard gate still runs at approval time.
    let class_has_capacity = match row.status {
        EnrollmentStatus::Pending => {
            Some(capacity::can_accept(conn, &row.class_id, &row.academic_year)?)
        }
        _ => None,
    };
    Ok(json!({
        "enrollment": row.to_json(),
        "classHasCapacity": class_has_capacity,
    }))
}

fn enrollments_update_status(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, OpError> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let raw = get_required_str(params, "status")?;
    let status = EnrollmentStatus::parse(&raw)
        .ok_or_else(|| OpError::Validation(format!("unknown enrollment status: {}", raw)))?;
    // The API only moves rows out of PENDING; "pending" is not a target.
    if status == EnrollmentStatus::Pending {
        return Err(OpError::Validation(
            "status must be approved or rejected".to_string(),
        ));
    }
    let notes = get_opt_str(params, "notes");
    let row = enrollment::update_status(
        conn,
        state.cache.as_ref(),
        &actor_id(params),
        &enrollment_id,
        status,
        notes,
    )?;
    Ok(json!({ "enrollment": row.to_json() }))
}

fn enrollments_delete(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, OpError> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    enrollment::delete(conn, state.cache.as_ref(), &actor_id(params), &enrollment_id)?;
    Ok(json!({ "ok": true }))
}

fn enrollments_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let status = match get_opt_str(params, "status") {
        Some(raw) => Some(
            EnrollmentStatus::parse(&raw)
                .ok_or_else(|| OpError::Validation(format!("unknown enrollment status: {}", raw)))?,
        ),
        None => None,
    };

    let mut sql = String::from(
        "SELECT e.id, e.student_id, e.class_id, e.academic_year, e.enrollment_date, e.status, e.notes
         FROM enrollments e WHERE 1=1",
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(sid) = get_opt_str(params, "studentId") {
        sql.push_str(" AND e.student_id = ?");
        args.push(Box::new(sid));
    }
    if let Some(cid) = get_opt_str(params, "classId") {
        sql.push_str(" AND e.class_id = ?");
        args.push(Box::new(cid));
    }
    if let Some(year) = get_opt_str(params, "academicYear") {
        sql.push_str(" AND e.academic_year = ?");
        args.push(Box::new(year));
    }
    if let Some(st) = status {
        sql.push_str(" AND e.status = ?");
        args.push(Box::new(st.as_str().to_string()));
    }
    sql.push_str(" ORDER BY e.enrollment_date, e.id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            enrollment::map_enrollment_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "enrollments": rows.iter().map(|r| r.to_json()).collect::<Vec<_>>()
    }))
}

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match enrollments_create(state, conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

fn handle_enrollments_update_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match enrollments_update_status(state, conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

fn handle_enrollments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match enrollments_delete(state, conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match enrollments_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.updateStatus" => Some(handle_enrollments_update_status(state, req)),
        "enrollments.delete" => Some(handle_enrollments_delete(state, req)),
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        _ => None,
    }
}
