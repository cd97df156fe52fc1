use crate::ipc::error::{err, ok, op_err};
use crate::ipc::helpers::{get_opt_i64, get_opt_str};
use crate::ipc::types::{AppState, Request};
use crate::model::OpError;
use rusqlite::Connection;
use serde_json::json;

const DEFAULT_LIMIT: i64 = 50;

fn audit_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, OpError> {
    let limit = get_opt_i64(params, "limit").unwrap_or(DEFAULT_LIMIT).clamp(1, 500);

    let mut sql = String::from(
        "SELECT id, actor_id, action, resource_kind, resource_id, details, logged_at
         FROM audit_log WHERE 1=1",
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(kind) = get_opt_str(params, "resourceKind") {
        sql.push_str(" AND resource_kind = ?");
        args.push(Box::new(kind));
    }
    if let Some(rid) = get_opt_str(params, "resourceId") {
        sql.push_str(" AND resource_id = ?");
        args.push(Box::new(rid));
    }
    sql.push_str(" ORDER BY logged_at DESC, id LIMIT ?");
    args.push(Box::new(limit));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |r| {
            let details_raw: Option<String> = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "actorId": r.get::<_, String>(1)?,
                "action": r.get::<_, String>(2)?,
                "resourceKind": r.get::<_, String>(3)?,
                "resourceId": r.get::<_, String>(4)?,
                "details": details_raw
                    .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok()),
                "loggedAt": r.get::<_, String>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "entries": rows }))
}

fn handle_audit_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match audit_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => op_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_audit_list(state, req)),
        _ => None,
    }
}
