//! Client for the external sports data provider.
//!
//! The provider is the system of record for match facts (teams, schedule,
//! scout roster) and for user facts of scouts. It is treated as a black box
//! reachable over HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use touchline_sdk::objects::matches::{MatchFields, MatchScout};
use touchline_sdk::objects::{MatchId, Role, UserId};
use url::Url;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid provider url: {0}")]
    Url(#[from] url::ParseError),

    #[error("provider responded with status {status}")]
    Status { status: u16 },
}

/// Match facts as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderMatch {
    pub sportlevel_id: MatchId,
    /// Raw provider state code; mapped through the synchronizer settings.
    pub state_code: i32,
    pub fields: MatchFields,
    #[serde(default)]
    pub scouts: Vec<MatchScout>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderUser {
    pub user_id: UserId,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub scout_number: Option<i32>,
}

#[async_trait]
pub trait SportsDataProvider: Send + Sync {
    /// `Ok(None)` when the provider does not know the match.
    async fn get_match(&self, match_id: MatchId) -> Result<Option<ProviderMatch>, ProviderError>;

    async fn get_user(&self, user_id: UserId) -> Result<Option<ProviderUser>, ProviderError>;
}

/// [`SportsDataProvider`] over the provider's JSON HTTP API.
pub struct HttpSportsDataProvider {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpSportsDataProvider {
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self {
            base_url,
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, ProviderError> {
        let url = self.base_url.join(path)?;
        let response = self.http_client.get(url).send().await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(ProviderError::Status {
                status: status.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl SportsDataProvider for HttpSportsDataProvider {
    #[tracing::instrument(skip(self), err, name = "Provider:GetMatch")]
    async fn get_match(&self, match_id: MatchId) -> Result<Option<ProviderMatch>, ProviderError> {
        self.get_json(&format!("matches/{match_id}")).await
    }

    #[tracing::instrument(skip(self), err, name = "Provider:GetUser")]
    async fn get_user(&self, user_id: UserId) -> Result<Option<ProviderUser>, ProviderError> {
        self.get_json(&format!("users/{user_id}")).await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Provider backed by a mutable map.
    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub matches: Mutex<HashMap<MatchId, ProviderMatch>>,
        pub users: Mutex<HashMap<UserId, ProviderUser>>,
        pub match_calls: Mutex<u32>,
    }

    impl FakeProvider {
        pub(crate) fn put_match(&self, m: ProviderMatch) {
            self.matches
                .lock()
                .unwrap()
                .insert(m.sportlevel_id, m);
        }

        pub(crate) fn match_calls(&self) -> u32 {
            *self.match_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SportsDataProvider for FakeProvider {
        async fn get_match(
            &self,
            match_id: MatchId,
        ) -> Result<Option<ProviderMatch>, ProviderError> {
            *self.match_calls.lock().unwrap() += 1;
            Ok(self.matches.lock().unwrap().get(&match_id).cloned())
        }

        async fn get_user(&self, user_id: UserId) -> Result<Option<ProviderUser>, ProviderError> {
            Ok(self.users.lock().unwrap().get(&user_id).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_payload_decodes_without_scouts() {
        let json = r#"{
            "sportlevel_id": 9,
            "state_code": 2,
            "fields": {"sport": "football", "tournament": "Cup",
                       "home_team": "A", "away_team": "B", "starts_at": 0}
        }"#;
        let m: ProviderMatch = serde_json::from_str(json).unwrap();
        assert_eq!(m.state_code, 2);
        assert!(m.scouts.is_empty());
    }

    #[test]
    fn test_relative_paths_keep_base_prefix() {
        let base = Url::parse("http://provider.local/api/v1/").unwrap();
        assert_eq!(
            base.join("matches/5").unwrap().as_str(),
            "http://provider.local/api/v1/matches/5"
        );
    }
}
