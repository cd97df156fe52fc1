use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::{actor_id, get_required_i64, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::promotion::{self, PromoteParams};

fn handle_promote(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let params = match (
        get_required_i64(&req.params, "currentGradeLevel"),
        get_required_str(&req.params, "currentAcademicYear"),
        get_required_str(&req.params, "newAcademicYear"),
    ) {
        (Ok(current_grade_level), Ok(current_academic_year), Ok(new_academic_year)) => {
            PromoteParams {
                current_grade_level,
                current_academic_year,
                new_academic_year,
            }
        }
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return op_err(&req.id, &e),
    };

    match promotion::promote(conn, state.cache.as_ref(), &actor_id(&req.params), params) {
        Ok(outcome) => ok(&req.id, outcome.to_json()),
        Err(e) => op_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.promote" => Some(handle_promote(state, req)),
        _ => None,
    }
}
