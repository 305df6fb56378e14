//! HTTP client for the SMIR coordinates API.
//!
//! The consumer core only cares about one thing here: a rate-limited call
//! surfaces as [`SmirError::TooManyRequests`], the single failure classified
//! as dependency-rate-limited by the dead-letter router.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SmirError {
    #[error("SMIR API rejected the call: too many requests")]
    TooManyRequests,

    #[error("SMIR API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMIR API returned unexpected status {0}")]
    UnexpectedStatus(u16),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmirCoordinates {
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SmirClient {
    client: reqwest::Client,
    base_url: String,
}

impl SmirClient {
    pub fn new(base_url: String) -> Self {
        SmirClient {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Fetch contact coordinates for a subject. A 429 from the API maps to
    /// the rate-limited error class; any other non-success status is a
    /// generic failure.
    pub async fn get_coordinates(&self, user_id: &str) -> Result<SmirCoordinates, SmirError> {
        let url = format!("{}/coordonnees/{}", self.base_url, user_id);
        tracing::debug!(user_id = %user_id, "Calling SMIR API");

        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SmirError::TooManyRequests);
        }
        if !response.status().is_success() {
            return Err(SmirError::UnexpectedStatus(response.status().as_u16()));
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_error_display() {
        let err = SmirError::TooManyRequests;
        assert!(err.to_string().contains("too many requests"));
    }

    #[test]
    fn test_unexpected_status_display() {
        let err = SmirError::UnexpectedStatus(503);
        assert!(err.to_string().contains("503"));
    }
}
