use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::{get_opt_i64, get_opt_str};
use crate::ipc::types::{AppState, Request};
use crate::model::OpError;
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeMap;

/// Enrollment statistics rollup: totals by status, by grade level and per
/// class, optionally scoped to an academic year and/or grade level.
fn enrollment_statistics(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, OpError> {
    let academic_year = get_opt_str(params, "academicYear");
    let grade_level = get_opt_i64(params, "gradeLevel");

    let mut filter = String::new();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(ref y) = academic_year {
        filter.push_str(" AND e.academic_year = ?");
        args.push(Box::new(y.clone()));
    }
    if let Some(g) = grade_level {
        filter.push_str(" AND c.grade_level = ?");
        args.push(Box::new(g));
    }

    let mut by_status: BTreeMap<String, i64> = BTreeMap::new();
    for s in ["pending", "approved", "rejected"] {
        by_status.insert(s.to_string(), 0);
    }
    let mut total = 0i64;
    {
        let sql = format!(
            "SELECT e.status, COUNT(*) FROM enrollments e
             JOIN classes c ON c.id = e.class_id
             WHERE 1=1{} GROUP BY e.status",
            filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, count) in rows {
            total += count;
            by_status.insert(status, count);
        }
    }

    let by_grade: Vec<serde_json::Value> = {
        let sql = format!(
            "SELECT c.grade_level,
                    SUM(CASE WHEN e.status = 'pending' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN e.status = 'approved' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN e.status = 'rejected' THEN 1 ELSE 0 END)
             FROM enrollments e
             JOIN classes c ON c.id = e.class_id
             WHERE 1=1{} GROUP BY c.grade_level ORDER BY c.grade_level",
            filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |r| {
                Ok(json!({
                    "gradeLevel": r.get::<_, i64>(0)?,
                    "pending": r.get::<_, i64>(1)?,
                    "approved": r.get::<_, i64>(2)?,
                    "rejected": r.get::<_, i64>(3)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let by_class: Vec<serde_json::Value> = {
        let mut sql = String::from(
            "SELECT c.id, c.code, c.name, c.grade_level, c.academic_year, c.max_students,
                    c.student_count,
                    (SELECT COUNT(*) FROM enrollments e
                     WHERE e.class_id = c.id AND e.academic_year = c.academic_year
                       AND e.status = 'pending')
             FROM classes c WHERE 1=1",
        );
        let mut class_args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(ref y) = academic_year {
            sql.push_str(" AND c.academic_year = ?");
            class_args.push(Box::new(y.clone()));
        }
        if let Some(g) = grade_level {
            sql.push_str(" AND c.grade_level = ?");
            class_args.push(Box::new(g));
        }
        sql.push_str(" ORDER BY c.academic_year, c.grade_level, c.name");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(class_args.iter().map(|a| a.as_ref())),
                |r| {
                    Ok(json!({
                        "classId": r.get::<_, String>(0)?,
                        "code": r.get::<_, String>(1)?,
                        "name": r.get::<_, String>(2)?,
                        "gradeLevel": r.get::<_, i64>(3)?,
                        "academicYear": r.get::<_, String>(4)?,
                        "maxStudents": r.get::<_, i64>(5)?,
                        "approved": r.get::<_, i64>(6)?,
                        "pending": r.get::<_, i64>(7)?,
                    }))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    Ok(json!({
        "totalEnrollments": total,
        "byStatus": by_status,
        "byGrade": by_grade,
        "byClass": by_class,
    }))
}

fn handle_enrollment_statistics(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match enrollment_statistics(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.statistics" => Some(handle_enrollment_statistics(state, req)),
        _ => None,
    }
}
