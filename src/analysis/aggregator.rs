//! Folds normalized records into calendar-aligned window buckets.

use crate::core::calendar::{tile, window_for, Granularity};
use crate::error::PipelineError;
use crate::models::{DateRange, FieldStats, NormalizedRecord, WindowBucket};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;

/// Points collected for one window. Keyed by timestamp so the final sums are
/// computed in a fixed order no matter how records arrived.
#[derive(Debug)]
struct BucketAccumulator {
    window_end: NaiveDate,
    points: BTreeMap<NaiveDateTime, BTreeMap<String, f64>>,
}

impl BucketAccumulator {
    fn insert(&mut self, record: &NormalizedRecord) {
        let slot = self.points.entry(record.timestamp).or_default();
        for (name, value) in &record.fields {
            let Some(v) = value.as_f64() else { continue };
            slot.entry(name.clone())
                .and_modify(|existing| {
                    // duplicate observation: keep the larger value so the merge is order independent
                    if v.total_cmp(existing).is_gt() {
                        *existing = v;
                    }
                })
                .or_insert(v);
        }
    }

    fn finalize(&self) -> BTreeMap<String, FieldStats> {
        let mut stats: BTreeMap<String, FieldStats> = BTreeMap::new();
        for fields in self.points.values() {
            for (name, &v) in fields {
                let s = stats.entry(name.clone()).or_default();
                s.count += 1;
                s.sum += v;
                s.min = Some(s.min.map_or(v, |m| m.min(v)));
                s.max = Some(s.max.map_or(v, |m| m.max(v)));
            }
        }
        stats
    }
}

/// Per-key window accumulators for one run.
///
/// Owned by a single writer (the pipeline's merge stage), so keys need no
/// locking; every key's buckets are independent of every other key's.
#[derive(Debug)]
pub struct Aggregator {
    granularity: Granularity,
    range: DateRange,
    keys: BTreeMap<String, BTreeMap<NaiveDate, BucketAccumulator>>,
}

impl Aggregator {
    pub fn new(granularity: Granularity, range: DateRange) -> Self {
        Self { granularity, range, keys: BTreeMap::new() }
    }

    /// Register a key so it gets a full (possibly empty) tiling at finalize.
    pub fn touch(&mut self, key: &str) {
        if !self.keys.contains_key(key) {
            self.keys.insert(key.to_string(), BTreeMap::new());
        }
    }

    /// Fold one record. Returns `Ok(false)` when the record falls outside the
    /// run's range and was dropped.
    pub fn fold(&mut self, record: &NormalizedRecord) -> Result<bool, PipelineError> {
        let date = record.date();
        if !self.range.contains(date) {
            return Ok(false);
        }

        let window = window_for(date, self.granularity).ok_or_else(|| {
            PipelineError::AggregationInvariant(format!("no {:?} window for {}", self.granularity, date))
        })?;
        if !window.contains(date) {
            return Err(PipelineError::AggregationInvariant(format!(
                "{} outside its window [{}, {})",
                date, window.start, window.end
            )));
        }

        self.touch(&record.key);
        let buckets = self.keys.get_mut(&record.key).ok_or_else(|| {
            PipelineError::AggregationInvariant(format!("accumulator for '{}' vanished", record.key))
        })?;
        let bucket = buckets.entry(window.start).or_insert_with(|| BucketAccumulator {
            window_end: window.end,
            points: BTreeMap::new(),
        });
        if bucket.window_end != window.end {
            return Err(PipelineError::AggregationInvariant(format!(
                "window starting {} ends at both {} and {}",
                window.start, bucket.window_end, window.end
            )));
        }

        bucket.insert(record);
        Ok(true)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.keys.keys()
    }

    /// Emit the full tiling for every touched key, gaps included, ordered by
    /// (key, window_start).
    pub fn finalize(self) -> Result<BTreeMap<String, Vec<WindowBucket>>, PipelineError> {
        let windows = tile(self.range, self.granularity);
        let mut out = BTreeMap::new();

        for (key, mut accumulators) in self.keys {
            let mut buckets = Vec::with_capacity(windows.len());
            for window in &windows {
                let aggregates = match accumulators.remove(&window.start) {
                    Some(acc) if acc.window_end != window.end => {
                        return Err(PipelineError::AggregationInvariant(format!(
                            "bucket [{}, {}) does not match tile [{}, {})",
                            window.start, acc.window_end, window.start, window.end
                        )));
                    }
                    Some(acc) => acc.finalize(),
                    None => BTreeMap::new(),
                };
                buckets.push(WindowBucket {
                    key: key.clone(),
                    window_start: window.start,
                    window_end: window.end,
                    aggregates,
                });
            }

            if let Some(stray) = accumulators.keys().next() {
                return Err(PipelineError::AggregationInvariant(format!(
                    "bucket starting {} for '{}' is not part of the tiling",
                    stray, key
                )));
            }
            out.insert(key, buckets);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldValue;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(key: &str, day: NaiveDate, value: f64) -> NormalizedRecord {
        NormalizedRecord {
            key: key.to_string(),
            timestamp: day.and_hms_opt(0, 0, 0).unwrap(),
            fields: BTreeMap::from([("value".to_string(), FieldValue::Number(value))]),
        }
    }

    fn january() -> DateRange {
        DateRange::new(date(2024, 1, 1), date(2024, 1, 15))
    }

    #[test]
    fn test_weekly_sums() {
        let mut agg = Aggregator::new(Granularity::Week, january());
        for d in 1..15 {
            agg.fold(&record("A", date(2024, 1, d), d as f64)).unwrap();
        }

        let out = agg.finalize().unwrap();
        let a = &out["A"];
        assert_eq!(a.len(), 2);
        let first = a[0].stats("value");
        assert_eq!(first.count, 7);
        assert_eq!(first.sum, 28.0);
        assert_eq!(first.mean(), Some(4.0));
        assert_eq!(first.min, Some(1.0));
        assert_eq!(first.max, Some(7.0));
        assert_eq!(a[1].stats("value").sum, 77.0);
    }

    #[test]
    fn test_gaps_are_explicit() {
        let mut agg = Aggregator::new(Granularity::Week, january());
        agg.fold(&record("A", date(2024, 1, 10), 0.0)).unwrap();
        agg.touch("B");

        let out = agg.finalize().unwrap();
        assert!(out["A"][0].is_gap());
        // a real zero is not a gap
        assert!(!out["A"][1].is_gap());
        assert_eq!(out["A"][1].stats("value").mean(), Some(0.0));
        assert_eq!(out["B"].len(), 2);
        assert!(out["B"].iter().all(WindowBucket::is_gap));
    }

    #[test]
    fn test_out_of_range_records_dropped() {
        let mut agg = Aggregator::new(Granularity::Day, january());
        assert!(!agg.fold(&record("A", date(2023, 12, 31), 1.0)).unwrap());
        assert!(!agg.fold(&record("A", date(2024, 1, 15), 1.0)).unwrap());
        assert!(agg.fold(&record("A", date(2024, 1, 14), 1.0)).unwrap());
    }

    #[test]
    fn test_duplicates_merge_deterministically() {
        let fwd = {
            let mut agg = Aggregator::new(Granularity::Month, january());
            agg.fold(&record("A", date(2024, 1, 2), 5.0)).unwrap();
            agg.fold(&record("A", date(2024, 1, 2), 7.0)).unwrap();
            agg.finalize().unwrap()
        };
        let rev = {
            let mut agg = Aggregator::new(Granularity::Month, january());
            agg.fold(&record("A", date(2024, 1, 2), 7.0)).unwrap();
            agg.fold(&record("A", date(2024, 1, 2), 5.0)).unwrap();
            agg.finalize().unwrap()
        };
        assert_eq!(fwd, rev);
        assert_eq!(fwd["A"][0].stats("value").count, 1);
        assert_eq!(fwd["A"][0].stats("value").sum, 7.0);
    }

    #[test]
    fn test_order_independent_bit_identical() {
        let values = [0.1, 0.2, 0.3, 1e16, -1e16, 0.7, 3.3];
        let records: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, v)| record("A", date(2024, 1, 1 + i as u32), *v))
            .collect();

        let run = |order: &[usize]| {
            let mut agg = Aggregator::new(Granularity::Month, january());
            for &i in order {
                agg.fold(&records[i]).unwrap();
            }
            agg.finalize().unwrap()["A"][0].stats("value")
        };

        let base = run(&[0, 1, 2, 3, 4, 5, 6]);
        for order in [[6, 5, 4, 3, 2, 1, 0], [3, 0, 4, 1, 5, 2, 6], [4, 3, 6, 0, 2, 5, 1]] {
            let other = run(&order);
            assert_eq!(base.count, other.count);
            assert_eq!(base.sum.to_bits(), other.sum.to_bits());
            assert_eq!(base.min, other.min);
            assert_eq!(base.max, other.max);
        }
    }

    #[test]
    fn test_text_fields_are_ignored() {
        let mut agg = Aggregator::new(Granularity::Day, january());
        let mut rec = record("A", date(2024, 1, 3), 2.0);
        rec.fields.insert("note".into(), FieldValue::Text("holiday".into()));
        agg.fold(&rec).unwrap();

        let out = agg.finalize().unwrap();
        let bucket = &out["A"][2];
        assert!(bucket.aggregates.contains_key("value"));
        assert!(!bucket.aggregates.contains_key("note"));
    }
}
