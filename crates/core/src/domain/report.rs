use crate::error::{ErrorKind, PipelineError};
use crate::publish::snapshot::PublishOutcome;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Sample applied to the current accumulator bucket.
    Sampled,
    /// History record inserted or changed.
    Written,
    /// Upsert produced the same record that was already stored.
    Unchanged,
    /// Nothing to finalize; the existing record was left in place.
    Kept,
    Deleted,
    /// Backfill seeded history and the current bucket.
    Seeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ItemResult {
    pub fn new(item_id: impl Into<String>, status: ItemStatus) -> Self {
        Self {
            item_id: item_id.into(),
            status,
            date: None,
            price: None,
            detail: None,
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    /// `None` for failures not tied to one item (snapshot writes, cache invalidation).
    pub item_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for ItemError {
    fn from(err: &PipelineError) -> Self {
        Self {
            item_id: err.item_id().map(str::to_string),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one batch operation: per-item results and errors side by side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub operation: String,
    pub service_day: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub success: bool,
    pub results: Vec<ItemResult>,
    pub errors: Vec<ItemError>,
    pub published: Vec<PublishOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized: Option<Box<BatchReport>>,
}

impl BatchReport {
    pub fn new(operation: &str, service_day: NaiveDate, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            operation: operation.to_string(),
            service_day,
            started_at,
            success: false,
            results: Vec::new(),
            errors: Vec::new(),
            published: Vec::new(),
            finalized: None,
        }
    }

    pub fn push_ok(&mut self, result: ItemResult) {
        self.results.push(result);
    }

    pub fn push_err(&mut self, err: &PipelineError) {
        self.errors.push(ItemError::from(err));
    }

    pub fn item_errors(&self) -> impl Iterator<Item = &ItemError> {
        self.errors.iter().filter(|e| e.item_id.is_some())
    }

    pub fn finish(mut self) -> Self {
        let nested_ok = self.finalized.as_ref().map_or(true, |f| f.success);
        self.success = self.errors.is_empty() && nested_ok;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn success_reflects_errors_and_nested_report() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 7, 0, 0).unwrap();

        let mut report = BatchReport::new("sample", day, at);
        report.push_ok(ItemResult::new("a", ItemStatus::Sampled).with_price(10.0));
        assert!(report.clone().finish().success);

        let mut nested = BatchReport::new("finalize", day, at);
        nested.push_err(&PipelineError::UpstreamDataMissing {
            item_id: "b".to_string(),
            detail: "no samples".to_string(),
        });
        report.finalized = Some(Box::new(nested.finish()));
        assert!(!report.finish().success);
    }

    #[test]
    fn serializes_itemized_payload() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 7, 0, 0).unwrap();
        let mut report = BatchReport::new("sample", day, at);
        report.push_err(&PipelineError::UpstreamUnavailable {
            item_id: "a".to_string(),
            detail: "HTTP 503".to_string(),
        });
        let v = serde_json::to_value(report.finish()).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["errors"][0]["item_id"], "a");
        assert_eq!(v["errors"][0]["kind"], "upstream_unavailable");
        assert!(v.get("finalized").is_none());
    }
}
