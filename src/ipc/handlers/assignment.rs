use crate::assignment::{self, AssignParams, DEFAULT_MAX_STUDENTS_PER_CLASS};
use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::{actor_id, get_opt_i64, get_required_i64, get_required_str};
use crate::ipc::types::{AppState, Request};

fn handle_auto_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let params = match (
        get_required_i64(&req.params, "gradeLevel"),
        get_required_str(&req.params, "academicYear"),
    ) {
        (Ok(grade_level), Ok(academic_year)) => AssignParams {
            grade_level,
            academic_year,
            max_students_per_class: get_opt_i64(&req.params, "maxStudentsPerClass")
                .unwrap_or(DEFAULT_MAX_STUDENTS_PER_CLASS),
        },
        (Err(e), _) | (_, Err(e)) => return op_err(&req.id, &e),
    };

    match assignment::auto_assign(conn, state.cache.as_ref(), &actor_id(&req.params), params) {
        Ok(outcome) => ok(&req.id, outcome.to_json()),
        Err(e) => op_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.autoAssign" => Some(handle_auto_assign(state, req)),
        _ => None,
    }
}
