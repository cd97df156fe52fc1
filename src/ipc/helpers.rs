use crate::model::OpError;

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, OpError> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(OpError::Validation(format!("missing {}", key))),
    }
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, OpError> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| OpError::Validation(format!("missing {}", key)))
}

pub fn get_opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Requests may carry the acting administrator's id for the audit trail;
/// absent means the host shell itself.
pub fn actor_id(params: &serde_json::Value) -> String {
    get_opt_str(params, "actorId").unwrap_or_else(|| "system".to_string())
}
