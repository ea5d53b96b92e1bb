//! Upload step: post accumulated records to a leaderboard endpoint.

use otokit_types::ScoreRecord;
use tracing::{debug, info};

use crate::error::{Result, SyncError};

/// POST `records` as a JSON array. Every failure is a skippable
/// [`SyncError::Upload`].
pub async fn upload_records(
    client: &reqwest::Client,
    endpoint: &str,
    url: &str,
    records: &[ScoreRecord],
) -> Result<()> {
    let fail = |message: String| SyncError::Upload {
        endpoint: endpoint.to_string(),
        message,
    };

    debug!(endpoint, %url, records = records.len(), "Uploading scores");
    let response = client
        .post(url)
        .json(records)
        .send()
        .await
        .map_err(|e| fail(format!("request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(fail(format!("{}: {}", status, error_text)));
    }

    info!(endpoint, records = records.len(), "Upload accepted");
    Ok(())
}
