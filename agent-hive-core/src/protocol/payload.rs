//! Standard payload shapes for common interactions

use serde_json::{json, Value};

use super::task::AgentStatus;

pub fn status_request() -> Value {
    json!({"action": "status_request"})
}

pub fn status_response(status: &AgentStatus) -> Value {
    json!({
        "action": "status_response",
        "agent_id": status.agent_id,
        "state": status.state,
        "current_task": status.current_task,
        "capabilities": status.capabilities,
        "workload": status.workload,
        "processed": status.processed,
        "failed": status.failed,
    })
}

/// Parse an [`AgentStatus`] out of a STATUS_RESPONSE payload
pub fn parse_status_response(payload: &Value) -> crate::Result<AgentStatus> {
    Ok(serde_json::from_value(payload.clone())?)
}

pub fn data_request(query: &str, parameters: Option<Value>) -> Value {
    json!({
        "action": "data_request",
        "query": query,
        "parameters": parameters.unwrap_or_else(|| json!({})),
    })
}

/// Data reply; confidence is clamped to `[0.0, 1.0]`
pub fn data_response(data: Value, confidence: f64) -> Value {
    json!({
        "action": "data_response",
        "data": data,
        "confidence": confidence.clamp(0.0, 1.0),
    })
}

pub fn error(message: &str, original_message_id: &str) -> Value {
    json!({
        "error": message,
        "original_message_id": original_message_id,
    })
}

/// Extract a human-readable error from an ERROR payload
pub fn error_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("error")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}
