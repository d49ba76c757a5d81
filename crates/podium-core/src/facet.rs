//! Facets: the dimensions a leaderboard is partitioned by.
//!
//! A [`Facet`] is one labelled dimension of a score: either a time window
//! derived from the event timestamp, or an opaque categorical value such as an
//! organisation, a location, or a tag. Facets of one score are combined into a
//! [`FacetSet`], which holds at most one facet per dimension key.
//!
//! # Canonical Keys
//!
//! The canonical key of a facet set is the partition identity of a leaderboard
//! row. Facets are ordered by dimension key and rendered as `_(key-value)`:
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use podium_core::facet::{FacetSet, TimeGranularity};
//!
//! let at = Utc.with_ymd_and_hms(2017, 9, 14, 8, 5, 3).unwrap();
//! let facets = FacetSet::new()
//!     .with_generic("location", "melbourne")
//!     .with_time(TimeGranularity::Day, at);
//!
//! assert_eq!(facets.canonical_key(), "_(day-2017/09/14)_(location-melbourne)");
//! ```
//!
//! A dimension that is not filtered is simply absent from the set and
//! contributes nothing to the key.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Time window a timestamp is truncated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeGranularity {
    /// `YYYY/MM/DD/H/m/s`
    Second,
    /// `YYYY/MM/DD/H/m`
    Minute,
    /// `YYYY/MM/DD/H`
    Hour,
    /// `YYYY/MM/DD`
    Day,
    /// `YYYY/MM/` followed by the week of the month, `ceil(day / 7)`.
    Week,
    /// `YYYY/MM`
    Month,
    /// `YYYY`
    Year,
    /// Ignores the timestamp entirely.
    AllTime,
}

impl TimeGranularity {
    /// Every supported granularity, finest first.
    pub const ALL: [Self; 8] = [
        Self::Second,
        Self::Minute,
        Self::Hour,
        Self::Day,
        Self::Week,
        Self::Month,
        Self::Year,
        Self::AllTime,
    ];

    /// Returns the dimension key used for this granularity.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
            Self::AllTime => "allTime",
        }
    }

    /// Returns true if `key` names a time granularity.
    #[must_use]
    pub fn is_granularity_key(key: &str) -> bool {
        Self::ALL.iter().any(|g| g.as_str() == key)
    }

    /// Truncates a timestamp to this granularity.
    ///
    /// Hours, minutes and seconds are not zero padded. The week is the week of
    /// the month (`ceil(day_of_month / 7)`), not an ISO week.
    #[must_use]
    pub fn truncate(self, timestamp: DateTime<Utc>) -> String {
        match self {
            Self::Second => timestamp.format("%Y/%m/%d/%-H/%-M/%-S").to_string(),
            Self::Minute => timestamp.format("%Y/%m/%d/%-H/%-M").to_string(),
            Self::Hour => timestamp.format("%Y/%m/%d/%-H").to_string(),
            Self::Day => timestamp.format("%Y/%m/%d").to_string(),
            Self::Week => format!(
                "{}/{}",
                timestamp.format("%Y/%m"),
                timestamp.day().div_ceil(7)
            ),
            Self::Month => timestamp.format("%Y/%m").to_string(),
            Self::Year => timestamp.format("%Y").to_string(),
            Self::AllTime => "AT".to_string(),
        }
    }
}

impl fmt::Display for TimeGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeGranularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown time granularity: {s}")))
    }
}

/// Deterministically truncates a timestamp to a named granularity.
#[must_use]
pub fn time_facet_value(granularity: TimeGranularity, timestamp: DateTime<Utc>) -> String {
    granularity.truncate(timestamp)
}

/// One labelled dimension of a score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Facet {
    /// A time window derived from the event timestamp.
    Time {
        /// Window size.
        granularity: TimeGranularity,
        /// Raw event timestamp.
        timestamp: DateTime<Utc>,
    },
    /// An opaque categorical value.
    Generic {
        /// Dimension key, e.g. `location`.
        key: String,
        /// Dimension value, e.g. `melbourne`.
        value: String,
    },
}

impl Facet {
    /// Creates a time facet.
    #[must_use]
    pub const fn time(granularity: TimeGranularity, timestamp: DateTime<Utc>) -> Self {
        Self::Time {
            granularity,
            timestamp,
        }
    }

    /// Creates a generic facet.
    #[must_use]
    pub fn generic(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Generic {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns the dimension key.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Time { granularity, .. } => granularity.as_str(),
            Self::Generic { key, .. } => key,
        }
    }

    /// Returns the rendered dimension value.
    #[must_use]
    pub fn value(&self) -> String {
        match self {
            Self::Time {
                granularity,
                timestamp,
            } => granularity.truncate(*timestamp),
            Self::Generic { value, .. } => value.clone(),
        }
    }

    /// Renders this facet as its canonical key segment, `_(key-value)`.
    ///
    /// Segments are only unambiguous for keys accepted by
    /// [`is_dimension_key`] and values accepted by [`is_dimension_value`].
    #[must_use]
    pub fn render(&self) -> String {
        format!("_({}-{})", self.key(), self.value())
    }
}

/// Returns true if `key` can name a generic dimension.
///
/// A key may not be empty or contain `(`, `)` or `-`: the first `-` of a
/// segment ends its key.
#[must_use]
pub fn is_dimension_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(|c| matches!(c, '(' | ')' | '-'))
}

/// Returns true if `value` can be a generic dimension value.
///
/// A value may not be empty or contain `(` or `)`, so it can never close its
/// own segment or open another one.
#[must_use]
pub fn is_dimension_value(value: &str) -> bool {
    !value.is_empty() && !value.contains(|c| matches!(c, '(' | ')'))
}

/// A combination of facets with at most one facet per dimension key.
///
/// Iteration is always ordered by dimension key, so two set-equal facet sets
/// render to the same canonical key regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FacetSet {
    facets: BTreeMap<String, Facet>,
}

impl FacetSet {
    /// Creates an empty facet set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a facet, replacing any facet with the same dimension key.
    ///
    /// Returns the replaced facet, if any.
    pub fn insert(&mut self, facet: Facet) -> Option<Facet> {
        self.facets.insert(facet.key().to_string(), facet)
    }

    /// Adds a facet (builder style).
    #[must_use]
    pub fn with(mut self, facet: Facet) -> Self {
        self.insert(facet);
        self
    }

    /// Adds a time facet (builder style).
    #[must_use]
    pub fn with_time(self, granularity: TimeGranularity, timestamp: DateTime<Utc>) -> Self {
        self.with(Facet::time(granularity, timestamp))
    }

    /// Adds a generic facet (builder style).
    #[must_use]
    pub fn with_generic(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(Facet::generic(key, value))
    }

    /// Returns the facet for a dimension key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Facet> {
        self.facets.get(key)
    }

    /// Returns the number of facets in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.facets.len()
    }

    /// Returns true if no dimension is filtered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facets.is_empty()
    }

    /// Iterates facets ordered by dimension key.
    pub fn iter(&self) -> impl Iterator<Item = &Facet> {
        self.facets.values()
    }

    /// Computes the canonical key of this combination.
    #[must_use]
    pub fn canonical_key(&self) -> String {
        self.iter().map(Facet::render).collect()
    }
}

impl FromIterator<Facet> for FacetSet {
    fn from_iter<I: IntoIterator<Item = Facet>>(iter: I) -> Self {
        let mut set = Self::new();
        for facet in iter {
            set.insert(facet);
        }
        set
    }
}

/// Computes the canonical key of a collection of facets.
///
/// Later facets replace earlier ones with the same dimension key.
#[must_use]
pub fn canonical_key<'a>(facets: impl IntoIterator<Item = &'a Facet>) -> String {
    facets.into_iter().cloned().collect::<FacetSet>().canonical_key()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn time_values_match_window_formats() {
        let ts = at(2017, 9, 4, 8, 5, 3);
        assert_eq!(TimeGranularity::Second.truncate(ts), "2017/09/04/8/5/3");
        assert_eq!(TimeGranularity::Minute.truncate(ts), "2017/09/04/8/5");
        assert_eq!(TimeGranularity::Hour.truncate(ts), "2017/09/04/8");
        assert_eq!(TimeGranularity::Day.truncate(ts), "2017/09/04");
        assert_eq!(TimeGranularity::Month.truncate(ts), "2017/09");
        assert_eq!(TimeGranularity::Year.truncate(ts), "2017");
        assert_eq!(TimeGranularity::AllTime.truncate(ts), "AT");
    }

    #[test]
    fn delimiters_are_not_dimension_text() {
        assert!(is_dimension_key("location"));
        assert!(!is_dimension_key(""));
        assert!(!is_dimension_key("loc-ation"));
        assert!(!is_dimension_key("loc)"));

        assert!(is_dimension_value("new-york"));
        assert!(!is_dimension_value(""));
        assert!(!is_dimension_value("melbourne)_(tags-aws"));
        assert!(!is_dimension_value("("));
    }

    #[test]
    fn week_is_week_of_month() {
        assert_eq!(TimeGranularity::Week.truncate(at(2017, 9, 1, 0, 0, 0)), "2017/09/1");
        assert_eq!(TimeGranularity::Week.truncate(at(2017, 9, 7, 0, 0, 0)), "2017/09/1");
        assert_eq!(TimeGranularity::Week.truncate(at(2017, 9, 8, 0, 0, 0)), "2017/09/2");
        assert_eq!(TimeGranularity::Week.truncate(at(2017, 9, 30, 0, 0, 0)), "2017/09/5");
    }

    #[test]
    fn all_time_ignores_timestamp() {
        assert_eq!(
            time_facet_value(TimeGranularity::AllTime, at(1999, 1, 1, 0, 0, 0)),
            time_facet_value(TimeGranularity::AllTime, at(2030, 12, 31, 23, 59, 59)),
        );
    }

    #[test]
    fn granularity_round_trips_through_key_name() {
        for granularity in TimeGranularity::ALL {
            let parsed: TimeGranularity = granularity.as_str().parse().unwrap();
            assert_eq!(parsed, granularity);
        }
        assert!("fortnight".parse::<TimeGranularity>().is_err());
        assert!(TimeGranularity::is_granularity_key("allTime"));
        assert!(!TimeGranularity::is_granularity_key("location"));
    }

    #[test]
    fn granularity_serde_uses_key_names() {
        let json = serde_json::to_string(&TimeGranularity::AllTime).unwrap();
        assert_eq!(json, "\"allTime\"");
    }

    #[test]
    fn canonical_key_is_order_independent() {
        let ts = at(2017, 9, 14, 0, 0, 0);
        let a = FacetSet::new()
            .with_time(TimeGranularity::Month, ts)
            .with_generic("tag", "aws")
            .with_generic("location", "melbourne");
        let b = FacetSet::new()
            .with_generic("location", "melbourne")
            .with_generic("tag", "aws")
            .with_time(TimeGranularity::Month, ts);

        assert_eq!(a.canonical_key(), b.canonical_key());
        assert_eq!(
            a.canonical_key(),
            "_(location-melbourne)_(month-2017/09)_(tag-aws)"
        );
    }

    #[test]
    fn empty_set_renders_empty_key() {
        assert_eq!(FacetSet::new().canonical_key(), "");
    }

    #[test]
    fn insert_replaces_same_dimension() {
        let mut set = FacetSet::new().with_generic("location", "sydney");
        let replaced = set.insert(Facet::generic("location", "melbourne"));
        assert_eq!(replaced, Some(Facet::generic("location", "sydney")));
        assert_eq!(set.len(), 1);
        assert_eq!(set.canonical_key(), "_(location-melbourne)");
    }

    #[test]
    fn free_function_matches_set() {
        let facets = [Facet::generic("b", "2"), Facet::generic("a", "1")];
        assert_eq!(canonical_key(&facets), "_(a-1)_(b-2)");
    }
}
