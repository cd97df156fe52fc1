use crate::coordinator::{self, CacheHooks, Entity};
use crate::enrollment;
use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::{actor_id, get_opt_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::model::{OpError, StudentStatus};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let status = match get_opt_str(params, "status") {
        Some(raw) => Some(
            StudentStatus::parse(&raw)
                .ok_or_else(|| OpError::Validation(format!("unknown student status: {}", raw)))?,
        ),
        None => None,
    };
    let class_id = get_opt_str(params, "classId");

    let mut sql = String::from(
        "SELECT s.id, s.last_name, s.first_name, s.status, s.class_id, c.name
         FROM students s
         LEFT JOIN classes c ON c.id = s.class_id
         WHERE 1=1",
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(st) = status {
        sql.push_str(" AND s.status = ?");
        args.push(Box::new(st.as_str().to_string()));
    }
    if let Some(cid) = class_id {
        sql.push_str(" AND s.class_id = ?");
        args.push(Box::new(cid));
    }
    sql.push_str(" ORDER BY s.last_name, s.first_name, s.id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "lastName": row.get::<_, String>(1)?,
                "firstName": row.get::<_, String>(2)?,
                "status": row.get::<_, String>(3)?,
                "classId": row.get::<_, Option<String>>(4)?,
                "className": row.get::<_, Option<String>>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "students": rows }))
}

fn students_create(
    conn: &Connection,
    cache: &dyn CacheHooks,
    params: &serde_json::Value,
) -> Result<serde_json::Value, OpError> {
    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    let status = match get_opt_str(params, "status") {
        Some(raw) => StudentStatus::parse(&raw)
            .ok_or_else(|| OpError::Validation(format!("unknown student status: {}", raw)))?,
        None => StudentStatus::Active,
    };
    let actor = actor_id(params);

    let student_id = Uuid::new_v4().to_string();
    coordinator::run_unit(conn, cache, |tx, fx| {
        tx.execute(
            "INSERT INTO students(id, last_name, first_name, status, class_id, updated_at)
             VALUES(?, ?, ?, ?, NULL, ?)",
            (
                &student_id,
                &last_name,
                &first_name,
                status.as_str(),
                enrollment::now_string(),
            ),
        )?;
        fx.invalidate(Entity::Student, &student_id);
        fx.audit(
            &actor,
            "student.create",
            Entity::Student,
            &student_id,
            Some(json!({ "lastName": last_name, "firstName": first_name })),
        );
        Ok(())
    })?;

    Ok(json!({
        "studentId": student_id,
        "lastName": last_name,
        "firstName": first_name,
        "status": status.as_str(),
    }))
}

fn students_set_status(
    conn: &Connection,
    cache: &dyn CacheHooks,
    params: &serde_json::Value,
) -> Result<serde_json::Value, OpError> {
    let student_id = get_required_str(params, "studentId")?;
    let raw = get_required_str(params, "status")?;
    let status = StudentStatus::parse(&raw)
        .ok_or_else(|| OpError::Validation(format!("unknown student status: {}", raw)))?;
    let actor = actor_id(params);

    coordinator::run_unit(conn, cache, |tx, fx| {
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(OpError::NotFound(format!("student not found: {}", student_id)));
        }
        // Status changes leave enrollment rows alone; unwinding a seat is an
        // explicit enrollment delete, not a side effect of deactivation.
        tx.execute(
            "UPDATE students SET status = ?, updated_at = ? WHERE id = ?",
            (status.as_str(), enrollment::now_string(), &student_id),
        )?;
        fx.invalidate(Entity::Student, &student_id);
        fx.audit(
            &actor,
            "student.setStatus",
            Entity::Student,
            &student_id,
            Some(json!({ "status": status.as_str() })),
        );
        Ok(())
    })?;

    Ok(json!({ "studentId": student_id, "status": status.as_str() }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_create(conn, state.cache.as_ref(), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

fn handle_students_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_set_status(conn, state.cache.as_ref(), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.setStatus" => Some(handle_students_set_status(state, req)),
        _ => None,
    }
}
