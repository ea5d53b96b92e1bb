//! Per-run session configuration.
//!
//! A [`SessionConfig`] is built once from caller-supplied parameters and then
//! frozen behind an `Arc`. Components that need mutable run state keep it
//! themselves.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Difficulties crawled when the caller does not supply any.
pub const DEFAULT_DIFFICULTIES: [i32; 6] = [0, 1, 2, 3, 4, 10];

/// A frozen, shareable session config.
pub type SharedSessionConfig = Arc<SessionConfig>;

/// Immutable snapshot of everything a run needs.
///
/// Field names serialize in camelCase to match the intake contract used by
/// the mobile front end (`lxnsUploadUrl`, `fetchUrlMap`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Account credentials. Intake only: carried with the session for the
    /// front end, never sent by any run step. Authorization goes through
    /// the identity-provider flow and uploads go out unauthenticated.
    pub username: String,
    pub password: String,
    pub lxns_upload_url: String,
    pub df_upload_url: String,
    pub wahlap_auth_url: String,
    pub game_type: i32,
    pub difficulties: Vec<i32>,
    pub genre_list: Vec<String>,
    /// Difficulty → fetch URL template.
    pub fetch_url_map: BTreeMap<i32, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            lxns_upload_url: String::new(),
            df_upload_url: String::new(),
            wahlap_auth_url: String::new(),
            game_type: 0,
            difficulties: DEFAULT_DIFFICULTIES.to_vec(),
            genre_list: Vec::new(),
            fetch_url_map: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Parse the JSON intake payload. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.wahlap_auth_url = url.into();
        self
    }

    pub fn with_lxns_upload_url(mut self, url: impl Into<String>) -> Self {
        self.lxns_upload_url = url.into();
        self
    }

    pub fn with_df_upload_url(mut self, url: impl Into<String>) -> Self {
        self.df_upload_url = url.into();
        self
    }

    pub fn with_game_type(mut self, game_type: i32) -> Self {
        self.game_type = game_type;
        self
    }

    pub fn with_difficulties(mut self, difficulties: impl IntoIterator<Item = i32>) -> Self {
        self.difficulties = difficulties.into_iter().collect();
        self
    }

    pub fn with_genres<S: Into<String>>(mut self, genres: impl IntoIterator<Item = S>) -> Self {
        self.genre_list = genres.into_iter().map(Into::into).collect();
        self
    }

    /// Set the fetch URL template for one difficulty, replacing any previous one.
    pub fn with_fetch_url(mut self, difficulty: i32, template: impl Into<String>) -> Self {
        self.fetch_url_map.insert(difficulty, template.into());
        self
    }

    /// Upload endpoints that are configured, in upload order.
    pub fn upload_endpoints(&self) -> Vec<(&'static str, &str)> {
        [
            ("lxns", self.lxns_upload_url.as_str()),
            ("diving-fish", self.df_upload_url.as_str()),
        ]
        .into_iter()
        .filter(|(_, url)| !url.trim().is_empty())
        .collect()
    }

    /// Ordered `(difficulty, genre)` pairs to crawl.
    ///
    /// Difficulties are the outer loop. An empty genre list yields one pair
    /// per difficulty with no genre.
    pub fn crawl_pairs(&self) -> Vec<(i32, Option<String>)> {
        let mut pairs = Vec::new();
        for &difficulty in &self.difficulties {
            if self.genre_list.is_empty() {
                pairs.push((difficulty, None));
            } else {
                for genre in &self.genre_list {
                    pairs.push((difficulty, Some(genre.clone())));
                }
            }
        }
        pairs
    }

    /// Check the fields a run cannot start without.
    pub fn validate(&self) -> Result<()> {
        if self.wahlap_auth_url.trim().is_empty() {
            return Err(Error::MissingField("wahlapAuthUrl"));
        }
        if self.difficulties.is_empty() {
            return Err(Error::InvalidInput(
                "at least one difficulty is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Freeze the config for sharing between components.
    pub fn freeze(self) -> SharedSessionConfig {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.difficulties, vec![0, 1, 2, 3, 4, 10]);
        assert_eq!(config.game_type, 0);
        assert!(config.lxns_upload_url.is_empty());
        assert!(config.fetch_url_map.is_empty());
    }

    #[test]
    fn test_from_json_camel_case() {
        let json = r#"{
            "username": "player",
            "password": "secret",
            "wahlapAuthUrl": "http://auth.example/authorize",
            "dfUploadUrl": "http://df.example/upload",
            "difficulties": [2, 3],
            "genreList": ["maimai", "pops"],
            "fetchUrlMap": {"2": "http://vendor/{diff}", "3": "http://vendor/{diff}"}
        }"#;
        let config = SessionConfig::from_json(json).unwrap();
        assert_eq!(config.username, "player");
        assert_eq!(config.difficulties, vec![2, 3]);
        assert_eq!(config.fetch_url_map.len(), 2);
        assert_eq!(config.fetch_url_map[&3], "http://vendor/{diff}");
        assert!(config.lxns_upload_url.is_empty());
    }

    #[test]
    fn test_from_json_missing_difficulties_uses_default() {
        let config = SessionConfig::from_json(r#"{"username": "p"}"#).unwrap();
        assert_eq!(config.difficulties, DEFAULT_DIFFICULTIES.to_vec());
    }

    #[test]
    fn test_crawl_pairs_order() {
        let config = SessionConfig::default()
            .with_difficulties([0, 1])
            .with_genres(["a", "b"]);
        let pairs = config.crawl_pairs();
        assert_eq!(
            pairs,
            vec![
                (0, Some("a".to_string())),
                (0, Some("b".to_string())),
                (1, Some("a".to_string())),
                (1, Some("b".to_string())),
            ]
        );
    }

    #[test]
    fn test_crawl_pairs_without_genres() {
        let config = SessionConfig::default().with_difficulties([3, 10]);
        assert_eq!(config.crawl_pairs(), vec![(3, None), (10, None)]);
    }

    #[test]
    fn test_upload_endpoints_skip_empty() {
        let config = SessionConfig::default().with_df_upload_url("http://df/upload");
        let endpoints = config.upload_endpoints();
        assert_eq!(endpoints, vec![("diving-fish", "http://df/upload")]);
    }

    #[test]
    fn test_validate_requires_auth_url() {
        let config = SessionConfig::new("u", "p");
        assert!(matches!(
            config.validate(),
            Err(Error::MissingField("wahlapAuthUrl"))
        ));

        let config = config.with_auth_url("http://auth/authorize");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_credentials_not_required_to_validate() {
        let config = SessionConfig::default().with_auth_url("http://auth/authorize");
        assert!(config.username.is_empty());
        assert!(config.password.is_empty());
        assert!(config.validate().is_ok());
    }
}
