// tests/property/classify_test.rs

//! Classifier totality: every input maps to exactly one operation, and
//! case or padding never changes the outcome.

use proptest::prelude::*;
use shepherd::core::pipeline::task::{TaskOp, classify_key};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn classifier_is_total(key in ".{0,32}") {
        let op = classify_key(&key);
        prop_assert!(matches!(
            op,
            TaskOp::AddMaster
                | TaskOp::AddReplica
                | TaskOp::RemoveNode
                | TaskOp::Reshard
                | TaskOp::Unsupported
        ));
    }

    #[test]
    fn classifier_ignores_case_and_padding(
        key in "[a-z_]{1,16}",
        left in "[ \\t]{0,4}",
        right in "[ \\t]{0,4}"
    ) {
        let dressed = format!("{left}{}{right}", key.to_uppercase());
        prop_assert_eq!(classify_key(&key), classify_key(&dressed));
    }

    #[test]
    fn only_the_known_keys_classify_as_operations(key in "[a-z_]{1,16}") {
        let op = classify_key(&key);
        let known = matches!(
            key.as_str(),
            "add_master" | "add_replica" | "remove_node" | "reshard"
        );
        if known {
            prop_assert_ne!(op, TaskOp::Unsupported);
        } else if key != "unsupported" {
            prop_assert_eq!(op, TaskOp::Unsupported);
        }
    }
}
