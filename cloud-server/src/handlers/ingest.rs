//! Alert ingest handler
//!
//! The body is the agent's `SignedEnvelope`. The HMAC is checked over the
//! decoded payload bytes before anything is parsed; a mismatch is a 401.

use axum::{body::Bytes, extract::State, Json};

use crate::{AppError, AppResult, AppState};
use crate::models::{AlertPayload, IngestResponse, IngestStatus, SignedEnvelope};

pub async fn ingest(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<IngestResponse>> {
    let envelope: SignedEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::MalformedEnvelope(format!("invalid envelope: {}", e)))?;
    let payload = envelope.open(&state.config.hmac_key)?;

    let alert: AlertPayload = serde_json::from_slice(&payload)
        .map_err(|e| AppError::MalformedPayload(format!("invalid alert payload: {}", e)))?;
    if alert.id != envelope.alert_id {
        return Err(AppError::MalformedPayload(format!(
            "envelope alert_id {} does not match payload id {}",
            envelope.alert_id, alert.id
        )));
    }

    let alert_id = alert.id;
    let agent_id = alert.agent_id.clone();
    let severity = alert.severity.clone();
    let status = state.store.insert(alert).await;
    match status {
        IngestStatus::Accepted => {
            tracing::info!(agent_id = %agent_id, alert_id, severity = %severity, "Alert accepted")
        }
        IngestStatus::Duplicate => {
            tracing::debug!(agent_id = %agent_id, alert_id, "Duplicate alert acknowledged")
        }
    }

    Ok(Json(IngestResponse { alert_id, status }))
}
