use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

#[derive(Serialize)]
pub struct ExceptionReport {
    pub timestamp: i64,
    pub context: String,
    pub tenant_id: Option<i64>,
    pub details: Value,
}

/// Emit a structured exception record on the `exception` target. The binary
/// routes that target to its own rolling file.
pub fn report_exception(context: &str, tenant_id: Option<i64>, details: Value) {
    let report = ExceptionReport {
        timestamp: Utc::now().timestamp_millis(),
        context: context.to_string(),
        tenant_id,
        details,
    };

    if let Ok(json_str) = serde_json::to_string(&report) {
        error!(target: "exception", "{}", json_str);
    }
}
