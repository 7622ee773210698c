/// inline-literal provider: settings whose data is written straight into the configuration
///
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{FetchOutcome, FetchRequest, ProviderAdapter};
use crate::registry::{ProviderKind, ResourceType};

/// parse literal text into a json payload for the given resource type; no i/o.
///
/// Text that already looks like json is validated and passed through. Anything else is read
/// as a comma separated list shaped by the resource type: strings for a string list, integers
/// for an id list. Other types fall back to numbers when every item is an integer.
pub fn parse_literal(text: &str, resource_type: ResourceType) -> Result<Option<Vec<u8>>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    if text.starts_with('[') || text.starts_with('{') || text.starts_with('"') {
        let value: Value = serde_json::from_str(text).context("inline literal is not valid json")?;
        return Ok(Some(serde_json::to_vec(&value)?));
    }

    let items: Vec<&str> = text
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    let ids = || {
        items
            .iter()
            .map(|s| s.parse::<i64>())
            .collect::<std::result::Result<Vec<i64>, _>>()
    };

    let payload = match resource_type {
        ResourceType::StringList => serde_json::to_vec(&items)?,
        ResourceType::IdList => {
            let ids = ids().context("inline id list holds a non-integer item")?;
            serde_json::to_vec(&ids)?
        }
        _ => match ids() {
            Ok(ids) => serde_json::to_vec(&ids)?,
            Err(_) => serde_json::to_vec(&items)?,
        },
    };

    Ok(Some(payload))
}

#[derive(Debug, Default, Clone)]
pub struct InlineAdapter;

impl InlineAdapter {
    pub fn new() -> InlineAdapter {
        InlineAdapter
    }
}

#[async_trait]
impl ProviderAdapter for InlineAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Inline
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        let outcome = match parse_literal(&request.path, request.resource_type) {
            Ok(Some(payload)) => FetchOutcome::success(payload),
            Ok(None) => FetchOutcome::empty(),
            Err(e) => FetchOutcome::failure(format!("{:#}", e)),
        };

        Ok(outcome)
    }
}
