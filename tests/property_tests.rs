/// Property-based tests using proptest
/// Invariants of phone-link synthesis, CNPJ mining, backoff, and the
/// detail-bag overlay.
use proptest::prelude::*;
use prospecta_api::discovery::whatsapp_deep_link;
use prospecta_api::enrichment::strip_code_fences;
use prospecta_api::gateway::backoff_delay;
use prospecta_api::models::{DetailSource, LeadDetails};
use prospecta_api::registry::{extract_cnpj_candidates, normalize_cnpj};
use std::collections::BTreeMap;
use std::time::Duration;

proptest! {
    #[test]
    fn whatsapp_links_never_panic(input in "\\PC*") {
        let _ = whatsapp_deep_link(&input);
    }

    #[test]
    fn whatsapp_links_always_carry_the_country_code(digits in "[0-9]{8,13}") {
        let link = whatsapp_deep_link(&digits).unwrap();
        let tail = link.strip_prefix("https://wa.me/").unwrap();
        prop_assert!(tail.starts_with("55"));
        // Never double-prefix a number that already has the country code
        if digits.starts_with("55") {
            prop_assert_eq!(tail, digits.as_str());
        } else {
            let expected = format!("55{}", digits);
            prop_assert_eq!(tail, expected.as_str());
        }
    }

    #[test]
    fn short_inputs_never_produce_a_link(digits in "[0-9]{0,7}") {
        prop_assert_eq!(whatsapp_deep_link(&digits), None);
    }
}

proptest! {
    #[test]
    fn cnpj_normalization_never_panics(input in "\\PC*") {
        let _ = normalize_cnpj(&input);
    }

    #[test]
    fn only_fourteen_digit_strings_normalize(digits in "[0-9]{1,20}") {
        let normalized = normalize_cnpj(&digits);
        if digits.len() == 14 {
            prop_assert_eq!(normalized.as_deref(), Some(digits.as_str()));
        } else {
            prop_assert_eq!(normalized, None);
        }
    }

    #[test]
    fn formatting_does_not_change_the_normalized_cnpj(digits in "[0-9]{14}") {
        let formatted = format!(
            "{}.{}.{}/{}-{}",
            &digits[0..2], &digits[2..5], &digits[5..8], &digits[8..12], &digits[12..14]
        );
        prop_assert_eq!(normalize_cnpj(&formatted), Some(digits.clone()));

        // And the extractor finds it exactly once, however often repeated
        let text = format!("CNPJ {} mencionado de novo: {}", formatted, formatted);
        let found = extract_cnpj_candidates(&text);
        prop_assert_eq!(found, vec![digits]);
    }
}

proptest! {
    #[test]
    fn backoff_is_nondecreasing_in_the_attempt(base_ms in 1u64..2000, attempt in 0u32..8) {
        let base = Duration::from_millis(base_ms);
        let current = backoff_delay(attempt, base);
        let next = backoff_delay(attempt + 1, base);
        prop_assert!(next >= current);
    }

    #[test]
    fn backoff_stays_within_the_jitter_envelope(base_ms in 1u64..2000, attempt in 0u32..8) {
        let base = Duration::from_millis(base_ms);
        let delay = backoff_delay(attempt, base);
        let floor = base * (1 << attempt);
        prop_assert!(delay >= floor);
        prop_assert!(delay <= floor + base);
    }
}

proptest! {
    #[test]
    fn overlay_never_removes_keys(
        first in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,12}", 0..8),
        second in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,12}", 0..8),
    ) {
        let to_values = |m: &BTreeMap<String, String>| {
            m.iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect::<BTreeMap<_, _>>()
        };

        let mut details = LeadDetails::new();
        details.overlay(DetailSource::Registry, to_values(&first));
        details.overlay(DetailSource::Ai, to_values(&second));

        for key in first.keys().chain(second.keys()) {
            prop_assert!(details.contains_key(key));
        }

        // Later source wins every collision
        for (key, value) in &second {
            prop_assert_eq!(details.get_str(key), Some(value.as_str()));
        }
    }

    #[test]
    fn overlay_is_idempotent(
        values in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,12}", 0..8),
    ) {
        let values: BTreeMap<String, serde_json::Value> = values
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();

        let mut once = LeadDetails::new();
        once.overlay(DetailSource::Social, values.clone());

        let mut twice = once.clone();
        twice.overlay(DetailSource::Social, values);

        prop_assert_eq!(once, twice);
    }
}

proptest! {
    #[test]
    fn fence_stripping_never_panics(input in "\\PC*") {
        let _ = strip_code_fences(&input);
    }

    #[test]
    fn fenced_json_objects_survive_stripping(key in "[a-z]{1,8}", value in "[a-z0-9]{0,12}") {
        let body = format!("{{\"{}\":\"{}\"}}", key, value);
        for fenced in [
            format!("```json\n{}\n```", body),
            format!("```\n{}\n```", body),
            body.clone(),
        ] {
            let stripped = strip_code_fences(&fenced);
            let parsed: serde_json::Value = serde_json::from_str(&stripped).unwrap();
            prop_assert_eq!(parsed[&key].as_str(), Some(value.as_str()));
        }
    }
}
