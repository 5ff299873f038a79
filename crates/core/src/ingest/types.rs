use crate::error::PipelineError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Per-item endpoint payload. Every price field is optional on the wire; the decode
/// functions below decide what counts as usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStatsResponse {
    pub item_id: String,
    #[serde(default)]
    pub average_24h: Option<f64>,
    #[serde(default)]
    pub average_7d: Option<f64>,
    #[serde(default)]
    pub lowest_price: Option<f64>,
    #[serde(default)]
    pub daily: Vec<DailyStatEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStatEntry {
    pub date: NaiveDate,
    #[serde(default)]
    pub average_price: Option<f64>,
    #[serde(default)]
    pub volume: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub listings: Vec<Listing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub quantity: Option<u64>,
}

/// A usable daily statistic from the upstream trailing window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub average_price: f64,
}

fn usable(v: Option<f64>) -> Option<f64> {
    v.filter(|p| p.is_finite() && *p > 0.0)
}

/// Aggregated kind: just-closed-period average, then the longer trailing window,
/// then the instantaneous best price. Zero and absent are both unavailable.
pub fn decode_aggregated_price(
    item_id: &str,
    resp: &ItemStatsResponse,
) -> Result<f64, PipelineError> {
    usable(resp.average_24h)
        .or_else(|| usable(resp.average_7d))
        .or_else(|| usable(resp.lowest_price))
        .ok_or_else(|| PipelineError::UpstreamDataMissing {
            item_id: item_id.to_string(),
            detail: "no average_24h, average_7d or lowest_price".to_string(),
        })
}

/// RawSample kind: lowest listed price among listings whose name matches the query.
pub fn decode_lowest_listing(
    item_id: &str,
    query: &str,
    resp: &SearchResponse,
) -> Result<f64, PipelineError> {
    let wanted = query.trim();
    resp.listings
        .iter()
        .filter(|l| l.name.trim().eq_ignore_ascii_case(wanted))
        .filter_map(|l| usable(l.price))
        .min_by(|a, b| a.total_cmp(b))
        .ok_or_else(|| PipelineError::UpstreamDataMissing {
            item_id: item_id.to_string(),
            detail: format!("no priced listing named {wanted:?}"),
        })
}

/// Usable daily statistics, ascending by date, one per date.
pub fn decode_daily_stats(resp: &ItemStatsResponse) -> Vec<DailyStat> {
    let mut out: Vec<DailyStat> = resp
        .daily
        .iter()
        .filter_map(|e| {
            usable(e.average_price).map(|average_price| DailyStat {
                date: e.date,
                average_price,
            })
        })
        .collect();
    out.sort_by_key(|s| s.date);
    out.dedup_by_key(|s| s.date);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn stats(v: serde_json::Value) -> ItemStatsResponse {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn prefers_closed_period_average() {
        let r = stats(json!({"item_id": "1", "average_24h": 101.0, "average_7d": 99.0, "lowest_price": 95.0}));
        assert_eq!(decode_aggregated_price("gold", &r).unwrap(), 101.0);
    }

    #[test]
    fn zero_counts_as_unavailable() {
        let r = stats(json!({"item_id": "1", "average_24h": 0.0, "average_7d": null, "lowest_price": 95.0}));
        assert_eq!(decode_aggregated_price("gold", &r).unwrap(), 95.0);
    }

    #[test]
    fn missing_everything_fails_closed() {
        let r = stats(json!({"item_id": "1"}));
        let err = decode_aggregated_price("gold", &r).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamDataMissing);
        assert_eq!(err.item_id(), Some("gold"));
    }

    #[test]
    fn lowest_matching_listing_wins() {
        let r: SearchResponse = serde_json::from_value(json!({
            "listings": [
                {"name": "Phoenix Feather", "price": 130.0},
                {"name": "Phoenix Feather Fragment", "price": 5.0},
                {"name": "phoenix feather", "price": 118.0},
                {"name": "Phoenix Feather", "price": null}
            ]
        }))
        .unwrap();
        assert_eq!(decode_lowest_listing("feather", "Phoenix Feather", &r).unwrap(), 118.0);
    }

    #[test]
    fn empty_search_fails_closed() {
        let r: SearchResponse = serde_json::from_value(json!({"listings": []})).unwrap();
        assert!(decode_lowest_listing("feather", "Phoenix Feather", &r).is_err());
    }

    #[test]
    fn daily_stats_sorted_and_filtered() {
        let r = stats(json!({
            "item_id": "1",
            "daily": [
                {"date": "2026-03-09", "average_price": 120.0},
                {"date": "2026-03-07", "average_price": 100.0},
                {"date": "2026-03-08", "average_price": 0.0}
            ]
        }));
        let out = decode_daily_stats(&r);
        assert_eq!(out.len(), 2);
        assert!(out[0].date < out[1].date);
        assert_eq!(out[1].average_price, 120.0);
    }
}
