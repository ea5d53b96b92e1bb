//! Crawled score records.

use serde::{Deserialize, Serialize};

/// One crawled result.
///
/// `difficulty` and `genre` are stamped by the crawler from the pair that
/// produced the record; payloads from the vendor may omit them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    #[serde(default)]
    pub song_id: Option<i64>,
    pub title: String,
    #[serde(default, rename = "type")]
    pub song_type: Option<String>,
    #[serde(default)]
    pub difficulty: i32,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub achievement: f64,
    #[serde(default)]
    pub dx_score: u32,
    #[serde(default)]
    pub fc: Option<String>,
    #[serde(default)]
    pub fs: Option<String>,
}

impl ScoreRecord {
    pub fn new(title: impl Into<String>, difficulty: i32, achievement: f64) -> Self {
        Self {
            song_id: None,
            title: title.into(),
            song_type: None,
            difficulty,
            genre: None,
            achievement,
            dx_score: 0,
            fc: None,
            fs: None,
        }
    }

    /// Stamp the pair that produced this record.
    pub fn tagged(mut self, difficulty: i32, genre: Option<&str>) -> Self {
        self.difficulty = difficulty;
        self.genre = genre.map(str::to_string);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_record() {
        let record: ScoreRecord =
            serde_json::from_str(r#"{"title": "Oshama Scramble!", "achievement": 100.5}"#)
                .unwrap();
        assert_eq!(record.title, "Oshama Scramble!");
        assert_eq!(record.achievement, 100.5);
        assert_eq!(record.difficulty, 0);
        assert!(record.genre.is_none());
    }

    #[test]
    fn test_tagged_overrides_pair() {
        let record = ScoreRecord::new("song", 0, 99.0).tagged(3, Some("maimai"));
        assert_eq!(record.difficulty, 3);
        assert_eq!(record.genre.as_deref(), Some("maimai"));
    }
}
