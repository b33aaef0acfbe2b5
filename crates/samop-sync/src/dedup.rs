use std::collections::HashMap;

use samop_core::{MergedResult, Opportunity, PartitionResult};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Share of identified records removed above which a warning is logged.
    pub warn_duplicate_rate: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            warn_duplicate_rate: 0.2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    /// Flatten successful partitions in input order, then deduplicate by notice id.
    pub fn merge(&self, results: &[PartitionResult]) -> MergedResult {
        let mut merged = MergedResult::default();
        let mut flattened = Vec::new();

        for result in results {
            merged.partitions_queried.push(result.partition().to_string());
            match result {
                PartitionResult::Success(success) => {
                    merged.partitions_succeeded.push(success.partition.clone());
                    flattened.extend(success.opportunities.iter().cloned().map(|mut opp| {
                        opp.naics_code = Some(success.partition.clone());
                        opp
                    }));
                }
                PartitionResult::Failure(failure) => {
                    merged.partitions_failed.push(failure.partition.clone());
                }
            }
        }

        merged.count_before_dedup = flattened.len();
        let (opportunities, removed) = self.dedupe(flattened);
        merged.total_after_dedup = opportunities.len();
        merged.total_count = opportunities.len();
        merged.duplicates_removed = removed;
        merged.opportunities = opportunities;
        merged
    }

    /// Stable: survivors keep the position of the first record seen for their id.
    pub fn dedupe(&self, items: Vec<Opportunity>) -> (Vec<Opportunity>, usize) {
        let mut out: Vec<Opportunity> = Vec::with_capacity(items.len());
        let mut index_by_id: HashMap<String, usize> = HashMap::new();
        let mut identified = 0usize;
        let mut removed = 0usize;

        for item in items {
            let Some(id) = item.notice_id.clone() else {
                out.push(item);
                continue;
            };
            identified += 1;
            match index_by_id.get(&id) {
                Some(&slot) => {
                    removed += 1;
                    if supersedes(&item, &out[slot]) {
                        debug!(notice_id = %id, "newer duplicate replaces earlier record");
                        out[slot] = item;
                    }
                }
                None => {
                    index_by_id.insert(id, out.len());
                    out.push(item);
                }
            }
        }

        if identified > 0 {
            let rate = removed as f64 / identified as f64;
            if rate > self.config.warn_duplicate_rate {
                warn!(
                    removed,
                    identified,
                    rate = %format!("{:.1}%", rate * 100.0),
                    "high duplicate rate across partitions; review NAICS overlap"
                );
            }
        }
        (out, removed)
    }
}

/// Later `last_modified` wins; a timestamp beats none; otherwise first seen stays.
fn supersedes(incoming: &Opportunity, existing: &Opportunity) -> bool {
    match (incoming.last_modified, existing.last_modified) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use samop_core::ErrorKind;

    fn opp(id: Option<&str>, title: &str, modified_hour: Option<u32>) -> Opportunity {
        Opportunity {
            notice_id: id.map(String::from),
            title: Some(title.into()),
            last_modified: modified_hour.map(|h| Utc.with_ymd_and_hms(2025, 1, 10, h, 0, 0).unwrap()),
            ..Opportunity::default()
        }
    }

    fn titles(items: &[Opportunity]) -> Vec<&str> {
        items.iter().map(|o| o.title.as_deref().unwrap_or_default()).collect()
    }

    #[test]
    fn later_timestamp_wins_regardless_of_order() {
        let d = Deduplicator::default();
        let old = opp(Some("A"), "old", Some(1));
        let new = opp(Some("A"), "new", Some(5));

        let (forward, removed) = d.dedupe(vec![old.clone(), new.clone()]);
        assert_eq!(titles(&forward), vec!["new"]);
        assert_eq!(removed, 1);

        let (backward, _) = d.dedupe(vec![new, old]);
        assert_eq!(titles(&backward), vec!["new"]);
    }

    #[test]
    fn timestamp_beats_missing_and_ties_keep_first() {
        let d = Deduplicator::default();
        let (out, _) = d.dedupe(vec![opp(Some("A"), "bare", None), opp(Some("A"), "stamped", Some(2))]);
        assert_eq!(titles(&out), vec!["stamped"]);

        let (out, _) = d.dedupe(vec![opp(Some("A"), "stamped", Some(2)), opp(Some("A"), "bare", None)]);
        assert_eq!(titles(&out), vec!["stamped"]);

        let (out, _) = d.dedupe(vec![opp(Some("A"), "first", None), opp(Some("A"), "second", None)]);
        assert_eq!(titles(&out), vec!["first"]);

        let (out, _) = d.dedupe(vec![opp(Some("A"), "first", Some(3)), opp(Some("A"), "second", Some(3))]);
        assert_eq!(titles(&out), vec!["first"]);
    }

    #[test]
    fn records_without_ids_are_never_merged() {
        let d = Deduplicator::default();
        let items: Vec<_> = (0..4).map(|i| opp(None, &format!("anon{i}"), None)).collect();
        let (out, removed) = d.dedupe(items);
        assert_eq!(out.len(), 4);
        assert_eq!(removed, 0);
    }

    #[test]
    fn dedupe_is_idempotent_and_stable() {
        let d = Deduplicator::default();
        let input = vec![
            opp(Some("A"), "a1", Some(1)),
            opp(None, "anon", None),
            opp(Some("B"), "b1", None),
            opp(Some("A"), "a2", Some(4)),
            opp(Some("C"), "c1", None),
        ];
        let (once, removed) = d.dedupe(input);
        assert_eq!(removed, 1);
        assert_eq!(titles(&once), vec!["a2", "anon", "b1", "c1"]);

        let (twice, removed_again) = d.dedupe(once.clone());
        assert_eq!(removed_again, 0);
        assert_eq!(twice, once);
    }

    #[test]
    fn merge_only_flattens_successful_partitions() {
        let d = Deduplicator::default();
        let results = vec![
            PartitionResult::success("111111", vec![opp(Some("A"), "a", None), opp(Some("B"), "b", None)], false),
            PartitionResult::failure("222222", ErrorKind::ServerError, "HTTP 503", Some(503)),
            PartitionResult::success("333333", vec![opp(Some("A"), "a-dup", None)], true),
        ];
        let merged = d.merge(&results);

        assert_eq!(merged.partitions_queried, vec!["111111", "222222", "333333"]);
        assert_eq!(merged.partitions_succeeded, vec!["111111", "333333"]);
        assert_eq!(merged.partitions_failed, vec!["222222"]);
        assert_eq!(merged.count_before_dedup, 3);
        assert_eq!(merged.total_after_dedup, 2);
        assert_eq!(merged.total_count, 2);
        assert_eq!(merged.duplicates_removed, 1);
        assert_eq!(merged.opportunities[0].naics_code.as_deref(), Some("111111"));
    }
}
