use crate::error::PipelineError;
use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const BUNDLED_CATALOG: &str = include_str!("../../catalog.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Upstream already reports a usable running average.
    Aggregated,
    /// Upstream only exposes point-in-time listings; averaged locally.
    RawSample,
}

/// How an item is fetched. The variant doubles as the item's source kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchParams {
    Aggregated {
        upstream_id: String,
    },
    RawSample {
        query: String,
        #[serde(default)]
        category: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Integer,
    OneDecimal,
}

impl Precision {
    pub fn round(self, value: f64) -> f64 {
        match self {
            Self::Integer => value.round(),
            Self::OneDecimal => (value * 10.0).round() / 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: String,
    pub display_name: String,
    pub source: FetchParams,
    #[serde(default)]
    pub precision: Precision,
}

impl TrackedItem {
    pub fn source_kind(&self) -> SourceKind {
        match self.source {
            FetchParams::Aggregated { .. } => SourceKind::Aggregated,
            FetchParams::RawSample { .. } => SourceKind::RawSample,
        }
    }
}

/// Immutable registry of tracked items, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Catalog {
    items: Vec<TrackedItem>,
}

impl Catalog {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let items: Vec<TrackedItem> =
            serde_json::from_str(text).context("catalog is not a valid item list")?;
        Self::new(items)
    }

    pub fn new(items: Vec<TrackedItem>) -> anyhow::Result<Self> {
        ensure!(!items.is_empty(), "catalog must contain at least one item");

        let mut seen = BTreeSet::new();
        for item in &items {
            let id = item.id.trim();
            ensure!(!id.is_empty(), "catalog item id must be non-empty");
            ensure!(
                id != crate::publish::snapshot::META_KEY,
                "catalog item id {id:?} is reserved"
            );
            ensure!(seen.insert(id.to_string()), "duplicate catalog item id: {id}");
            match &item.source {
                FetchParams::Aggregated { upstream_id } => ensure!(
                    !upstream_id.trim().is_empty(),
                    "item {id}: upstream_id must be non-empty"
                ),
                FetchParams::RawSample { query, .. } => ensure!(
                    !query.trim().is_empty(),
                    "item {id}: query must be non-empty"
                ),
            }
        }

        Ok(Self { items })
    }

    pub fn bundled() -> anyhow::Result<Self> {
        Self::from_json(BUNDLED_CATALOG)
    }

    /// Loads `path` when given, else the catalog compiled into the binary.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read catalog {p}"))?;
                Self::from_json(&text).with_context(|| format!("invalid catalog {p}"))
            }
            None => Self::bundled(),
        }
    }

    pub fn items(&self) -> &[TrackedItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&TrackedItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Resolves a subset by id; `None` selects the whole catalog.
    pub fn select(&self, ids: Option<&[String]>) -> Result<Vec<&TrackedItem>, PipelineError> {
        let Some(ids) = ids else {
            return Ok(self.items.iter().collect());
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let item = self
                .get(id.trim())
                .ok_or_else(|| PipelineError::InvalidRequest(format!("unknown item id: {id}")))?;
            if !out.iter().any(|i: &&TrackedItem| i.id == item.id) {
                out.push(item);
            }
        }
        Ok(out)
    }
}
