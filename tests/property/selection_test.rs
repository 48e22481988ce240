// tests/property/selection_test.rs

//! The bounded heap must agree with a naive sort over any offer stream.

use proptest::prelude::*;
use shepherd::core::pipeline::poorest::PoorestN;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn poorest_n_equals_the_n_smallest(
        counts in prop::collection::vec(0usize..50, 1..40),
        n in 1usize..10
    ) {
        let mut poorest = PoorestN::new(n);
        for (i, count) in counts.iter().enumerate() {
            poorest.offer(&format!("node-{i:03}"), *count);
        }
        let selected = poorest.into_sorted();

        let mut expected: Vec<(usize, String)> = counts
            .iter()
            .enumerate()
            .map(|(i, count)| (*count, format!("node-{i:03}")))
            .collect();
        expected.sort();
        let expected: Vec<String> = expected
            .into_iter()
            .take(n)
            .map(|(_, id)| id)
            .collect();

        prop_assert_eq!(selected, expected);
    }

    #[test]
    fn selection_size_is_bounded(
        counts in prop::collection::vec(0usize..50, 0..30),
        n in 0usize..8
    ) {
        let mut poorest = PoorestN::new(n);
        for (i, count) in counts.iter().enumerate() {
            poorest.offer(&format!("node-{i:03}"), *count);
        }
        prop_assert_eq!(poorest.len(), n.min(counts.len()));
    }
}
