//! Property tests for the pure range algebra in `src/range.rs` (§8).

use std::collections::BTreeSet;

use proptest::prelude::*;
use repage::Range;

fn as_set(r: Range) -> BTreeSet<i64> {
    if r.is_empty() {
        BTreeSet::new()
    } else {
        (r.first..=r.last).collect()
    }
}

proptest! {
    #[test]
    fn subtract_covers_set_difference_disjoint_and_ascending(
        a_first in -50i64..50, a_len in 0i64..60,
        b_first in -50i64..50, b_len in 0i64..60,
    ) {
        let a = Range::new(a_first, a_first + a_len - 1);
        let b = Range::new(b_first, b_first + b_len - 1);
        let pieces = repage::range::subtract(a, Some(b));

        // Ascending, non-overlapping.
        for w in pieces.windows(2) {
            prop_assert!(w[0].last < w[1].first);
        }

        let expected: BTreeSet<i64> = as_set(a).difference(&as_set(b)).copied().collect();
        let actual: BTreeSet<i64> = pieces.iter().flat_map(|r| as_set(*r)).collect();
        prop_assert_eq!(expected, actual);
    }

    #[test]
    fn subtract_none_returns_a_unchanged(a_first in -50i64..50, a_len in 1i64..60) {
        let a = Range::new(a_first, a_first + a_len - 1);
        let pieces = repage::range::subtract(a, None);
        prop_assert_eq!(pieces.as_slice(), &[a]);
    }

    #[test]
    fn chunked_is_a_partition_with_fixed_width_except_last(
        r_first in -50i64..50, r_len in 1i64..200, size in 1i64..30,
    ) {
        let r = Range::new(r_first, r_first + r_len - 1);
        let pieces = repage::range::chunked(r, size);

        prop_assert!(!pieces.is_empty());
        for (i, p) in pieces.iter().enumerate() {
            if i + 1 < pieces.len() {
                prop_assert_eq!(p.width(), size);
            } else {
                prop_assert!(p.width() <= size && p.width() > 0);
            }
        }
        for w in pieces.windows(2) {
            prop_assert_eq!(w[1].first, w[0].last + 1);
        }
        prop_assert_eq!(pieces.first().unwrap().first, r.first);
        prop_assert_eq!(pieces.last().unwrap().last, r.last);
    }

    #[test]
    fn aligned_chunk_start_is_floor_division_from_base(
        base in -50i64..50, n in -10i64..10, d in 0i64..20, load_size in 1i64..20,
    ) {
        let d = d % load_size;
        let key = base + n * load_size + d;
        prop_assert_eq!(repage::range::aligned_chunk_start(key, base, load_size), base + n * load_size);
    }

    #[test]
    fn distance_beyond_zero_iff_intersects(
        a_first in -50i64..50, a_len in 1i64..60,
        b_first in -50i64..50, b_len in 1i64..60,
    ) {
        let a = Range::new(a_first, a_first + a_len - 1);
        let b = Range::new(b_first, b_first + b_len - 1);
        prop_assert_eq!(a.distance_beyond(&b) == 0, a.intersects(&b));
    }
}
