//! In-memory series index for a single shard.
//!
//! Points are grouped by series key and ordered by time within a series.
//! Two writes to the same series at the same timestamp merge their fields,
//! with the later write winning per field.

use std::collections::BTreeMap;
use strata_common::{FieldValue, Point};

pub type Fields = BTreeMap<String, FieldValue>;

/// All points of one series.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    /// time -> fields, ascending by time.
    pub values: BTreeMap<i64, Fields>,
}

#[derive(Debug, Default)]
pub struct SeriesIndex {
    /// series key -> series.
    series: BTreeMap<String, Series>,
    point_count: usize,
}

impl SeriesIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, point: &Point) {
        let series = self
            .series
            .entry(point.series_key())
            .or_insert_with(|| Series {
                measurement: point.measurement.clone(),
                tags: point.tags.clone(),
                values: BTreeMap::new(),
            });
        let fields = series.values.entry(point.time).or_insert_with(|| {
            self.point_count += 1;
            Fields::new()
        });
        for (k, v) in &point.fields {
            fields.insert(k.clone(), v.clone());
        }
    }

    /// Series of one measurement (or every series when `measurement` is
    /// empty), in series-key order.
    pub fn select<'a>(&'a self, measurement: &'a str) -> impl Iterator<Item = &'a Series> + 'a {
        self.series
            .values()
            .filter(move |s| measurement.is_empty() || s.measurement == measurement)
    }

    /// Number of distinct (series, time) entries.
    pub fn point_count(&self) -> usize {
        self.point_count
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(measurement: &str, host: &str, time: i64, value: f64) -> Point {
        Point::new(measurement, time)
            .with_tag("host", host)
            .with_field("value", FieldValue::Float(value))
    }

    #[test]
    fn test_insert_groups_by_series_and_sorts_by_time() {
        let mut index = SeriesIndex::new();
        index.insert(&point("cpu", "b", 30, 3.0));
        index.insert(&point("cpu", "a", 20, 2.0));
        index.insert(&point("cpu", "a", 10, 1.0));

        assert_eq!(index.series_count(), 2);
        assert_eq!(index.point_count(), 3);

        let first = index.select("cpu").next().unwrap();
        assert_eq!(first.tags["host"], "a");
        let times: Vec<i64> = first.values.keys().copied().collect();
        assert_eq!(times, vec![10, 20]);
    }

    #[test]
    fn test_same_timestamp_merges_fields() {
        let mut index = SeriesIndex::new();
        index.insert(&point("cpu", "a", 10, 1.0));
        index.insert(
            &Point::new("cpu", 10)
                .with_tag("host", "a")
                .with_field("value", FieldValue::Float(5.0))
                .with_field("idle", FieldValue::Integer(3)),
        );

        assert_eq!(index.point_count(), 1);
        let series = index.select("").next().unwrap();
        let fields = &series.values[&10];
        assert_eq!(fields["value"], FieldValue::Float(5.0));
        assert_eq!(fields["idle"], FieldValue::Integer(3));
    }

    #[test]
    fn test_select_filters_measurement() {
        let mut index = SeriesIndex::new();
        index.insert(&point("cpu", "a", 1, 1.0));
        index.insert(&point("mem", "a", 1, 1.0));

        assert_eq!(index.select("cpu").count(), 1);
        assert_eq!(index.select("").count(), 2);
        assert_eq!(index.select("disk").count(), 0);
    }
}
