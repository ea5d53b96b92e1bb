//! Crawl step: fetch score records for one (difficulty, genre) pair.

use otokit_types::{ScoreRecord, SessionConfig};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Expand a fetch URL template.
///
/// `{diff}`, `{genre}` and `{game_type}` are substituted; the genre is
/// URL-encoded and empty when the pair has none.
pub fn expand_template(template: &str, difficulty: i32, genre: Option<&str>, game_type: i32) -> String {
    template
        .replace("{diff}", &difficulty.to_string())
        .replace("{genre}", &urlencoding::encode(genre.unwrap_or_default()))
        .replace("{game_type}", &game_type.to_string())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    List(Vec<ScoreRecord>),
    Wrapped { records: Vec<ScoreRecord> },
}

/// Parse a vendor payload: a JSON array of records or `{"records": [...]}`.
pub fn parse_records(body: &str) -> std::result::Result<Vec<ScoreRecord>, serde_json::Error> {
    let payload: Payload = serde_json::from_str(body)?;
    Ok(match payload {
        Payload::List(records) => records,
        Payload::Wrapped { records } => records,
    })
}

/// Fetch one pair. Every failure is a skippable [`SyncError::Crawl`].
pub async fn fetch_pair(
    client: &reqwest::Client,
    session: &SessionConfig,
    difficulty: i32,
    genre: Option<&str>,
) -> Result<Vec<ScoreRecord>> {
    let fail = |message: String| SyncError::Crawl {
        difficulty,
        genre: genre.map(str::to_string),
        message,
    };

    let template = session
        .fetch_url_map
        .get(&difficulty)
        .ok_or_else(|| fail("no fetch url configured".to_string()))?;
    let url = expand_template(template, difficulty, genre, session.game_type);
    debug!(difficulty, genre, %url, "Fetching scores");

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| fail(format!("request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(fail(format!("vendor returned {}", status)));
    }

    let body = response
        .text()
        .await
        .map_err(|e| fail(format!("failed to read body: {}", e)))?;
    let records = parse_records(&body).map_err(|e| fail(format!("invalid payload: {}", e)))?;

    Ok(records
        .into_iter()
        .map(|r| r.tagged(difficulty, genre))
        .collect())
}
