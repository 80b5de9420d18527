//! Missing-range computation over indexed heights.

use crate::schema::HeightRange;

/// Interior gaps of `[from, to]` given the indexed heights, ascending.
///
/// For each indexed `h` in `(from, to]` whose predecessor is not indexed,
/// yields `[max(from, previous indexed + 1), h - 1]`. The part after the
/// highest indexed height is not included; see [`trailing_gap`].
pub fn interior_gaps(from: u64, to: u64, indexed: &[u64]) -> Vec<HeightRange> {
    let mut gaps = Vec::new();
    let mut previous: Option<u64> = None;
    for &h in indexed {
        if h < from {
            previous = Some(h);
            continue;
        }
        if h > to {
            break;
        }
        let predecessor_missing = previous.map_or(true, |p| p + 1 != h);
        if h > from && predecessor_missing {
            let gap_from = previous.map_or(from, |p| (p + 1).max(from));
            gaps.push(HeightRange::new(gap_from, h - 1));
        }
        previous = Some(h);
    }
    gaps
}

/// The range after the highest indexed height, if it ends before `to`.
pub fn trailing_gap(from: u64, to: u64, highest: Option<u64>) -> Option<HeightRange> {
    match highest {
        Some(h) if h < to => Some(HeightRange::new((h + 1).max(from), to)),
        Some(_) => None,
        None if from <= to => Some(HeightRange::new(from, to)),
        None => None,
    }
}

/// Expand ranges into explicit heights, ascending.
pub fn expand(ranges: &[HeightRange]) -> Vec<u64> {
    ranges.iter().flat_map(|r| r.heights()).collect()
}
