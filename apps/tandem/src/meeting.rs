//! Meeting record lookup against the meetings API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid meetings api url: {0}")]
    InvalidUrl(String),
    #[error("meeting {0} not found")]
    NotFound(String),
    #[error("meetings api refused the token")]
    Unauthorized,
    #[error("meetings api request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(rename = "_id")]
    pub id: String,
    pub full_name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub meeting_id: String,
    pub creator: Participant,
    pub participant: Participant,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl MeetingRecord {
    /// The other side of the meeting as seen by `local_user_id`: the creator
    /// for the invited participant, the participant for everyone else.
    pub fn counterpart_of(&self, local_user_id: &str) -> &Participant {
        if self.participant.id == local_user_id {
            &self.creator
        } else {
            &self.participant
        }
    }
}

#[async_trait]
pub trait MeetingDirectory: Send + Sync {
    async fn meeting(&self, meeting_id: &str) -> Result<MeetingRecord, DirectoryError>;
}

/// `GET <api>/meeting/<id>` with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpMeetingDirectory {
    base: Url,
    token: String,
    http: reqwest::Client,
}

impl HttpMeetingDirectory {
    pub fn new(base: &str, token: impl Into<String>) -> Result<Self, DirectoryError> {
        let mut base = Url::parse(base).map_err(|err| DirectoryError::InvalidUrl(err.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            token: token.into(),
            http: reqwest::Client::new(),
        })
    }

    pub fn meeting_url(&self, meeting_id: &str) -> Result<Url, DirectoryError> {
        self.base
            .join(&format!("meeting/{meeting_id}"))
            .map_err(|err| DirectoryError::InvalidUrl(err.to_string()))
    }
}

#[async_trait]
impl MeetingDirectory for HttpMeetingDirectory {
    async fn meeting(&self, meeting_id: &str) -> Result<MeetingRecord, DirectoryError> {
        let url = self.meeting_url(meeting_id)?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(DirectoryError::NotFound(meeting_id.to_owned())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DirectoryError::Unauthorized);
            }
            _ => {}
        }
        let record = response.error_for_status()?.json::<MeetingRecord>().await?;
        tracing::debug!(meeting = %record.meeting_id, "meeting record loaded");
        Ok(record)
    }
}
