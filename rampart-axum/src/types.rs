use chrono::{DateTime, Utc};
use rampart::{AuditEvent, SecurityEventType, Severity};
use rampart_core::services::AuditQuery;
use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

/// Query string accepted by `GET /audit-logs`.
///
/// Every field is optional and filters combine with AND. Dates are RFC 3339.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditLogParams {
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub risk_level: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<usize>,
}

impl AuditLogParams {
    pub fn into_query(self) -> Result<AuditQuery, SecurityError> {
        let mut query = AuditQuery::new();

        if let Some(event_type) = non_empty(self.event_type) {
            let event_type = event_type
                .parse::<SecurityEventType>()
                .map_err(|e| SecurityError::BadRequest(e.to_string()))?;
            query = query.event_type(event_type);
        }
        if let Some(user_id) = non_empty(self.user_id) {
            query = query.user_id(user_id);
        }
        if let Some(risk_level) = non_empty(self.risk_level) {
            let severity = risk_level
                .parse::<Severity>()
                .map_err(|e| SecurityError::BadRequest(e.to_string()))?;
            query = query.risk_level(severity);
        }

        query.start_date = parse_date("start_date", self.start_date)?;
        query.end_date = parse_date("end_date", self.end_date)?;
        query.limit = self.limit;

        Ok(query)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_date(field: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, SecurityError> {
    non_empty(value)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw.trim())
                .map(|date| date.with_timezone(&Utc))
                .map_err(|e| SecurityError::BadRequest(format!("Invalid {field}: {e}")))
        })
        .transpose()
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogResponse {
    pub events: Vec<AuditEvent>,
    pub count: usize,
}
