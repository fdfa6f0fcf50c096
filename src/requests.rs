//! Decoding of session creation requests.
//!
//! A request body looks like:
//!
//! ```json
//! {
//!   "drain_id": "d.1234",
//!   "filters": [
//!     {"field": "procid", "type": "contains", "param": "web"},
//!     {"field": "msgid", "type": "regexp", "param": "^router$"}
//!   ]
//! }
//! ```
//!
//! No filters means accept everything, one filter is used as is, and several
//! are combined so that all of them must pass.

use crate::error::{BrokerError, Result};
use crate::filter::Filter;
use crate::store::StoreConfig;
use serde::Deserialize;

/// Body of a session creation request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub drain_id: String,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

/// One filter as it appears in a request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub field: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub param: String,
}

impl FilterSpec {
    pub fn to_filter(&self) -> Result<Filter> {
        if self.field.is_empty() {
            return Err(BrokerError::InvalidFilterField);
        }
        if self.param.is_empty() {
            return Err(BrokerError::InvalidFilterParam);
        }

        match self.kind.as_str() {
            "contains" => Ok(Filter::contains(self.field.as_str(), self.param.as_str())),
            "regexp" => Filter::regex(self.field.as_str(), &self.param),
            other => Err(BrokerError::UnknownFilterType(other.to_string())),
        }
    }
}

impl SessionRequest {
    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Validate the request and build its drain id and filter.
    pub fn into_parts(self) -> Result<(String, Filter)> {
        if self.drain_id.is_empty() {
            return Err(BrokerError::MissingDrainId);
        }

        let filter = match self.filters.as_slice() {
            [] => Filter::accept_all(),
            [single] => single.to_filter()?,
            many => Filter::all(
                many.iter()
                    .map(FilterSpec::to_filter)
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        Ok((self.drain_id, filter))
    }
}

/// Decode a request body into a drain id and filter.
pub fn parse_session_request(body: &[u8]) -> Result<(String, Filter)> {
    SessionRequest::from_json(body)?.into_parts()
}

/// Interpret the `backfill` request parameter. Absent or unparsable values
/// fall back to the configured default; anything else is clamped.
pub fn parse_backfill(raw: Option<&str>, config: &StoreConfig) -> usize {
    match raw.map(|s| s.trim().parse::<i64>()) {
        Some(Ok(requested)) => config.clamp_backfill(requested),
        _ => config.default_backfill.min(config.max_backfill),
    }
}
