use super::BatchError;
use crate::dispatch::{DispatchResult, DispatchSummary};
use serde::Serialize;

#[derive(Serialize)]
struct FailedRow<'a> {
    id: &'a str,
    #[serde(rename = "error-text")]
    error_text: &'a str,
}

#[derive(Serialize)]
struct SummaryRow {
    failed: usize,
    successful: usize,
    #[serde(rename = "startAt")]
    start_at: String,
    #[serde(rename = "endAt")]
    end_at: String,
}

#[derive(Serialize)]
struct ResultRow<'a> {
    id: &'a str,
    to: &'a str,
    #[serde(rename = "message-id")]
    message_id: &'a str,
    status: &'a str,
}

fn writer(delimiter: u8) -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_writer(Vec::new())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, BatchError> {
    writer
        .into_inner()
        .map_err(|e| BatchError::Write(e.to_string()))
}

/// Failed records for operator follow-up: `id;error-text`
pub fn failed_csv(results: &[DispatchResult], delimiter: u8) -> Result<Vec<u8>, BatchError> {
    let mut w = writer(delimiter);
    w.write_record(["id", "error-text"])?;
    for result in results.iter().filter(|r| !r.is_success()) {
        w.serialize(FailedRow {
            id: &result.reference,
            error_text: result.error_text.as_deref().unwrap_or_default(),
        })?;
    }
    finish(w)
}

/// Aggregate counts of one dispatch: `failed;successful;startAt;endAt`
pub fn summary_csv(summary: &DispatchSummary, delimiter: u8) -> Result<Vec<u8>, BatchError> {
    let mut w = writer(delimiter);
    w.write_record(["failed", "successful", "startAt", "endAt"])?;
    w.serialize(SummaryRow {
        failed: summary.failed,
        successful: summary.succeeded,
        start_at: summary.started_at.to_rfc3339(),
        end_at: summary.ended_at.to_rfc3339(),
    })?;
    finish(w)
}

/// Accepted messages: `id;to;message-id;status`
pub fn results_csv(results: &[DispatchResult], delimiter: u8) -> Result<Vec<u8>, BatchError> {
    let mut w = writer(delimiter);
    w.write_record(["id", "to", "message-id", "status"])?;
    for result in results.iter().filter(|r| r.is_success()) {
        w.serialize(ResultRow {
            id: &result.reference,
            to: &result.recipient,
            message_id: result.provider_message_id.as_deref().unwrap_or_default(),
            status: &result.status_code,
        })?;
    }
    finish(w)
}
