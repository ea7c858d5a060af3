//! Temporal constraint extraction from natural-language queries.
//!
//! Recognizes absolute month-year ("June 2024"), absolute year ("2023"),
//! and relative expressions ("last year", "last month", "last week",
//! "yesterday", "today") against a caller-supplied reference time.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// A closed time interval extracted from a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalConstraint {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Inclusive end.
    pub end: DateTime<Utc>,
}

impl TemporalConstraint {
    /// Whether a timestamp falls inside the interval.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// The result of analyzing a query.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryAnalysis {
    /// Detected temporal constraint, if any.
    pub temporal_constraint: Option<TemporalConstraint>,
}

static MONTH_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{4})\b",
    )
    .expect("month-year regex")
});

static BARE_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("year regex"));

/// Extracts temporal constraints from natural-language queries.
///
/// Stateless; a single instance is shared across the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryAnalyzer;

impl QueryAnalyzer {
    /// Creates a new analyzer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Analyzes a query against a reference time.
    ///
    /// Returns an empty analysis when no temporal signal is present.
    #[must_use]
    pub fn analyze(&self, query: &str, reference_time: DateTime<Utc>) -> QueryAnalysis {
        QueryAnalysis {
            temporal_constraint: Self::extract(query, reference_time),
        }
    }

    fn extract(query: &str, reference: DateTime<Utc>) -> Option<TemporalConstraint> {
        let lowered = query.to_lowercase();

        if let Some(captures) = MONTH_YEAR.captures(&lowered) {
            let month = month_number(captures.get(1)?.as_str())?;
            let year: i32 = captures.get(2)?.as_str().parse().ok()?;
            return month_range(year, month);
        }

        if lowered.contains("last year") {
            let year = reference.year() - 1;
            return year_range(year);
        }
        if lowered.contains("last month") {
            let (year, month) = if reference.month() == 1 {
                (reference.year() - 1, 12)
            } else {
                (reference.year(), reference.month() - 1)
            };
            return month_range(year, month);
        }
        if lowered.contains("last week") {
            let end = reference;
            let start = reference - Duration::days(7);
            return Some(TemporalConstraint { start, end });
        }
        if lowered.contains("yesterday") {
            let day = (reference - Duration::days(1)).date_naive();
            return day_range(day);
        }
        if lowered.contains("today") {
            return day_range(reference.date_naive());
        }

        if let Some(captures) = BARE_YEAR.captures(&lowered) {
            let year: i32 = captures.get(1)?.as_str().parse().ok()?;
            return year_range(year);
        }

        None
    }
}

fn month_number(name: &str) -> Option<u32> {
    match name {
        "january" => Some(1),
        "february" => Some(2),
        "march" => Some(3),
        "april" => Some(4),
        "may" => Some(5),
        "june" => Some(6),
        "july" => Some(7),
        "august" => Some(8),
        "september" => Some(9),
        "october" => Some(10),
        "november" => Some(11),
        "december" => Some(12),
        _ => None,
    }
}

fn month_range(year: i32, month: u32) -> Option<TemporalConstraint> {
    let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()?
        - Duration::seconds(1);
    Some(TemporalConstraint { start, end })
}

fn year_range(year: i32) -> Option<TemporalConstraint> {
    let start = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()?;
    let end = Utc.with_ymd_and_hms(year, 12, 31, 23, 59, 59).single()?;
    Some(TemporalConstraint { start, end })
}

fn day_range(day: chrono::NaiveDate) -> Option<TemporalConstraint> {
    let start = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0)?);
    let end = Utc.from_utc_datetime(&day.and_hms_opt(23, 59, 59)?);
    Some(TemporalConstraint { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_month_year() {
        let analyzer = QueryAnalyzer::new();
        let analysis = analyzer.analyze("melanie activities in June 2024", reference());
        let constraint = analysis.temporal_constraint.unwrap();
        assert_eq!(constraint.start.month(), 6);
        assert_eq!(constraint.start.year(), 2024);
        assert!(constraint.contains(Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap()));
        assert!(!constraint.contains(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_bare_year() {
        let analyzer = QueryAnalyzer::new();
        let constraint = analyzer
            .analyze("what happened in 2023", reference())
            .temporal_constraint
            .unwrap();
        assert_eq!(constraint.start.year(), 2023);
        assert_eq!(constraint.end.year(), 2023);
    }

    #[test]
    fn test_last_year() {
        let analyzer = QueryAnalyzer::new();
        let constraint = analyzer
            .analyze("trips last year", reference())
            .temporal_constraint
            .unwrap();
        assert_eq!(constraint.start.year(), 2023);
        assert_eq!(constraint.end.year(), 2023);
    }

    #[test]
    fn test_last_month_january_wraps() {
        let analyzer = QueryAnalyzer::new();
        let january = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let constraint = analyzer
            .analyze("meetings last month", january)
            .temporal_constraint
            .unwrap();
        assert_eq!(constraint.start.year(), 2023);
        assert_eq!(constraint.start.month(), 12);
    }

    #[test]
    fn test_yesterday() {
        let analyzer = QueryAnalyzer::new();
        let constraint = analyzer
            .analyze("what did I do yesterday", reference())
            .temporal_constraint
            .unwrap();
        assert_eq!(constraint.start.day(), 14);
        assert_eq!(constraint.end.day(), 14);
    }

    #[test]
    fn test_no_signal() {
        let analyzer = QueryAnalyzer::new();
        assert!(analyzer
            .analyze("favorite color", reference())
            .temporal_constraint
            .is_none());
    }

    #[test]
    fn test_december_month_range() {
        let constraint = month_range(2023, 12).unwrap();
        assert_eq!(constraint.end.year(), 2023);
        assert_eq!(constraint.end.month(), 12);
        assert_eq!(constraint.end.day(), 31);
    }
}
