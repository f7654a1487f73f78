//! Recorded exchanges and the store they are replayed from.

mod store;

pub use store::{MockStore, MockUsage, UsageKind};

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::protocol::{PacketBundle, Request, Response};

/// Metadata key marking a mock recorded during connection setup.
pub const MOCK_TYPE_KEY: &str = "type";
pub const MOCK_TYPE_CONFIG: &str = "config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MockKind {
    #[default]
    #[serde(rename = "MySQL")]
    MySql,
    Http,
}

/// One recorded exchange: requests and responses in recording order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mock {
    pub name: String,
    #[serde(default)]
    pub kind: MockKind,
    #[serde(default)]
    pub requests: Vec<Request>,
    #[serde(default)]
    pub responses: Vec<Response>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub is_filtered: bool,
    #[serde(default)]
    pub sort_order: i64,
    /// Assigned by the store.
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub is_used: bool,
}

impl Mock {
    pub fn new(
        name: impl Into<String>,
        requests: Vec<PacketBundle>,
        responses: Vec<PacketBundle>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: MockKind::MySql,
            requests: requests.into_iter().map(Request).collect(),
            responses: responses.into_iter().map(Response).collect(),
            metadata: BTreeMap::new(),
            is_filtered: true,
            sort_order: 0,
            id: 0,
            is_used: false,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this mock was recorded during connection setup.
    pub fn is_handshake(&self) -> bool {
        self.metadata.get(MOCK_TYPE_KEY).map(String::as_str) == Some(MOCK_TYPE_CONFIG)
    }
}

#[derive(Debug, Error)]
pub enum MockLoadError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("mock {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Load a JSON array of mocks and check every bundle's tag.
pub fn load_mocks<P: AsRef<Path>>(path: P) -> Result<Vec<Mock>, MockLoadError> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let mocks: Vec<Mock> = serde_json::from_str(&content)?;
    for mock in &mocks {
        let bundles = mock
            .requests
            .iter()
            .map(|r| &r.0)
            .chain(mock.responses.iter().map(|r| &r.0));
        for bundle in bundles {
            bundle.validate().map_err(|e| MockLoadError::Invalid {
                name: mock.name.clone(),
                reason: e.to_string(),
            })?;
        }
    }
    info!(path = %path.as_ref().display(), count = mocks.len(), "Loaded mocks");
    Ok(mocks)
}
