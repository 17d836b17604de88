use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Aggregation window for usage metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum UsagePeriod {
    Daily,
    #[default]
    Monthly,
    Yearly,
}

impl UsagePeriod {
    pub const ALL: [UsagePeriod; 3] = [UsagePeriod::Daily, UsagePeriod::Monthly, UsagePeriod::Yearly];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsagePeriod::Daily => "daily",
            UsagePeriod::Monthly => "monthly",
            UsagePeriod::Yearly => "yearly",
        }
    }
}

impl fmt::Display for UsagePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsagePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(UsagePeriod::Daily),
            "monthly" | "month" => Ok(UsagePeriod::Monthly),
            "yearly" | "year" => Ok(UsagePeriod::Yearly),
            other => Err(format!(
                "Unknown usage period '{}' (expected daily, monthly or yearly)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UsageMetrics {
    #[serde(default)]
    pub total_calls: u64,
    #[serde(default)]
    pub total_credits_used: f64,
    #[serde(default)]
    pub remaining_credits: f64,
    #[serde(default)]
    pub most_used_endpoint: Option<String>,
}

impl UsageMetrics {
    /// Usage for an account that has made no metered calls yet.
    /// The backend answers 404 in that case rather than an empty record.
    pub fn zeroed(remaining_credits: f64) -> Self {
        Self {
            total_calls: 0,
            total_credits_used: 0.0,
            remaining_credits,
            most_used_endpoint: None,
        }
    }

    pub fn has_activity(&self) -> bool {
        self.total_calls > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_parse() {
        assert_eq!("daily".parse::<UsagePeriod>(), Ok(UsagePeriod::Daily));
        assert_eq!("Monthly".parse::<UsagePeriod>(), Ok(UsagePeriod::Monthly));
        assert_eq!(" year ".parse::<UsagePeriod>(), Ok(UsagePeriod::Yearly));
        assert!("weekly".parse::<UsagePeriod>().is_err());
    }

    #[test]
    fn test_period_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&UsagePeriod::Yearly).expect("serialize"),
            "\"yearly\""
        );
    }

    #[test]
    fn test_zeroed_usage() {
        let usage = UsageMetrics::zeroed(42.5);
        assert_eq!(usage.total_calls, 0);
        assert_eq!(usage.total_credits_used, 0.0);
        assert_eq!(usage.remaining_credits, 42.5);
        assert!(usage.most_used_endpoint.is_none());
        assert!(!usage.has_activity());
    }
}
