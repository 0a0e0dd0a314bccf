use std::collections::HashSet;

use strsim::normalized_levenshtein;

use crate::schema::StrategyRecord;

/// Case-insensitive similarity between two strategy texts, in [0, 1].
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a == b {
        return 1.0;
    }
    normalized_levenshtein(&a, &b)
}

/// Best match for `text` among `records` with similarity at or above
/// `threshold`, if any.  Ties go to the earlier record.
pub fn find_near_duplicate<'a>(
    text: &str,
    records: &[&'a StrategyRecord],
    threshold: f64,
) -> Option<&'a StrategyRecord> {
    records
        .iter()
        .map(|record| (text_similarity(text, &record.text), *record))
        .filter(|(similarity, _)| *similarity >= threshold)
        .max_by(|(left, _), (right, _)| left.total_cmp(right))
        .map(|(_, record)| record)
}

/// Pairwise duplicate scan.  For each near-duplicate pair the lower-scored
/// member loses; on a score tie the younger record loses.  Returns
/// `(archive_id, keep_id)` pairs; a record already slated for archival is
/// not paired again.
pub fn sweep(records: &[&StrategyRecord], threshold: f64) -> Vec<(String, String)> {
    let mut doomed: HashSet<&str> = HashSet::new();
    let mut pairs = Vec::new();

    for i in 0..records.len() {
        if doomed.contains(records[i].id.as_str()) {
            continue;
        }
        for j in (i + 1)..records.len() {
            if doomed.contains(records[j].id.as_str()) {
                continue;
            }
            if text_similarity(&records[i].text, &records[j].text) < threshold {
                continue;
            }

            let (keep, lose) = pick_survivor(records[i], records[j]);
            doomed.insert(lose.id.as_str());
            pairs.push((lose.id.clone(), keep.id.clone()));
            if lose.id == records[i].id {
                break;
            }
        }
    }

    pairs
}

fn pick_survivor<'a>(
    a: &'a StrategyRecord,
    b: &'a StrategyRecord,
) -> (&'a StrategyRecord, &'a StrategyRecord) {
    if a.score != b.score {
        if a.score > b.score { (a, b) } else { (b, a) }
    } else if a.created_at <= b.created_at {
        (a, b)
    } else {
        (b, a)
    }
}
