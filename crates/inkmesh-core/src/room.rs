//! Room identifiers and share links.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Maximum room id length.
pub const MAX_ROOM_ID_LEN: usize = 64;
/// Prefix for transport topics.
pub const TOPIC_PREFIX: &str = "inkmesh/";
/// Query parameter carrying the room id in share links.
pub const ROOM_QUERY_PARAM: &str = "room";

/// Room id errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("Room id is empty")]
    Empty,
    #[error("Room id is longer than {MAX_ROOM_ID_LEN} characters")]
    TooLong,
    #[error("Room id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Opaque room token shared out-of-band.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room id.
    pub fn new(id: impl Into<String>) -> Result<Self, RoomIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if id.len() > MAX_ROOM_ID_LEN {
            return Err(RoomIdError::TooLong);
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(RoomIdError::InvalidChar(c));
        }
        Ok(Self(id))
    }

    /// Generate a random room id.
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple[..12].to_string())
    }

    /// Read the room id from a share link (`?room=<id>`, else `#<id>`).
    pub fn from_url(url: &Url) -> Option<Self> {
        let from_query = url
            .query_pairs()
            .find(|(key, _)| key == ROOM_QUERY_PARAM)
            .map(|(_, value)| value.into_owned());
        from_query
            .or_else(|| url.fragment().map(str::to_string))
            .and_then(|id| Self::new(id).ok())
    }

    /// Room id from the link if present, otherwise a fresh one.
    pub fn from_url_or_generate(url: &Url) -> Self {
        Self::from_url(url).unwrap_or_else(Self::generate)
    }

    /// Share link for this room based on `base`.
    pub fn share_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        let others: Vec<(String, String)> = base
            .query_pairs()
            .filter(|(key, _)| key != ROOM_QUERY_PARAM)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(others)
            .append_pair(ROOM_QUERY_PARAM, &self.0);
        url.set_fragment(None);
        url
    }

    /// Transport topic peers use to find each other.
    pub fn topic(&self) -> String {
        format!("{}{}", TOPIC_PREFIX, self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}
