use crate::coordinator::{self, CacheHooks, Entity};
use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::{actor_id, get_opt_i64, get_opt_str, get_required_i64, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::model::{validate_academic_year, OpError};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const DEFAULT_MAX_STUDENTS: i64 = 30;

fn classes_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let grade_level = get_opt_i64(params, "gradeLevel");
    let academic_year = get_opt_str(params, "academicYear");

    // Pending counts ride along so the UI can show work queues per class.
    let mut sql = String::from(
        "SELECT
           c.id, c.code, c.name, c.grade_level, c.academic_year, c.max_students, c.student_count,
           (SELECT COUNT(*) FROM enrollments e
            WHERE e.class_id = c.id AND e.academic_year = c.academic_year AND e.status = 'pending')
         FROM classes c WHERE 1=1",
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(g) = grade_level {
        sql.push_str(" AND c.grade_level = ?");
        args.push(Box::new(g));
    }
    if let Some(y) = academic_year {
        sql.push_str(" AND c.academic_year = ?");
        args.push(Box::new(y));
    }
    sql.push_str(" ORDER BY c.academic_year, c.grade_level, c.name");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "code": row.get::<_, String>(1)?,
                "name": row.get::<_, String>(2)?,
                "gradeLevel": row.get::<_, i64>(3)?,
                "academicYear": row.get::<_, String>(4)?,
                "maxStudents": row.get::<_, i64>(5)?,
                "studentCount": row.get::<_, i64>(6)?,
                "pendingCount": row.get::<_, i64>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "classes": rows }))
}

fn classes_create(
    conn: &Connection,
    cache: &dyn CacheHooks,
    params: &serde_json::Value,
) -> Result<serde_json::Value, OpError> {
    let code = get_required_str(params, "code")?;
    let academic_year = get_required_str(params, "academicYear")?;
    validate_academic_year(&academic_year)?;
    let grade_level = get_required_i64(params, "gradeLevel")?;
    if grade_level <= 0 {
        return Err(OpError::Validation(format!(
            "gradeLevel must be positive: {}",
            grade_level
        )));
    }
    let max_students = get_opt_i64(params, "maxStudents").unwrap_or(DEFAULT_MAX_STUDENTS);
    if max_students <= 0 {
        return Err(OpError::Validation(format!(
            "maxStudents must be positive: {}",
            max_students
        )));
    }
    let name = get_opt_str(params, "name").unwrap_or_else(|| format!("Class {}", code));
    let actor = actor_id(params);

    let class_id = Uuid::new_v4().to_string();
    coordinator::run_unit(conn, cache, |tx, fx| {
        let taken: i64 = tx.query_row(
            "SELECT COUNT(*) FROM classes WHERE code = ? AND academic_year = ?",
            (&code, &academic_year),
            |r| r.get(0),
        )?;
        if taken > 0 {
            return Err(OpError::Conflict(format!(
                "class code {} already exists for {}",
                code, academic_year
            )));
        }
        tx.execute(
            "INSERT INTO classes(id, code, name, grade_level, academic_year, max_students, student_count)
             VALUES(?, ?, ?, ?, ?, ?, 0)",
            (&class_id, &code, &name, grade_level, &academic_year, max_students),
        )?;
        fx.invalidate(Entity::Class, &class_id);
        fx.audit(
            &actor,
            "class.create",
            Entity::Class,
            &class_id,
            Some(json!({ "code": code, "academicYear": academic_year })),
        );
        Ok(())
    })?;

    Ok(json!({
        "classId": class_id,
        "code": code,
        "name": name,
        "gradeLevel": grade_level,
        "academicYear": academic_year,
        "maxStudents": max_students,
    }))
}

fn classes_delete(
    conn: &Connection,
    cache: &dyn CacheHooks,
    params: &serde_json::Value,
) -> Result<serde_json::Value, OpError> {
    let class_id = get_required_str(params, "classId")?;
    let actor = actor_id(params);

    coordinator::run_unit(conn, cache, |tx, fx| {
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(OpError::NotFound(format!("class not found: {}", class_id)));
        }

        // Enrollment history must outlive nothing; refuse the delete while
        // any row still references the class.
        let referenced: i64 = tx.query_row(
            "SELECT COUNT(*) FROM enrollments WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )?;
        if referenced > 0 {
            return Err(OpError::Conflict(format!(
                "class {} has {} enrollment record(s); delete those first",
                class_id, referenced
            )));
        }

        tx.execute(
            "UPDATE students SET class_id = NULL WHERE class_id = ?",
            [&class_id],
        )?;
        tx.execute("DELETE FROM classes WHERE id = ?", [&class_id])?;
        fx.invalidate(Entity::Class, &class_id);
        fx.audit(&actor, "class.delete", Entity::Class, &class_id, None);
        Ok(())
    })?;

    Ok(json!({ "ok": true }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match classes_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match classes_create(conn, state.cache.as_ref(), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match classes_delete(conn, state.cache.as_ref(), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
