//! Property-based test generators using proptest.

use arkive_core::Triple;
use proptest::prelude::*;

/// Strategy for predicate IRIs from a small vocabulary, so that generated
/// triples collide on property often.
pub fn property_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "http://purl.org/dc/terms/title",
        "http://purl.org/dc/terms/creator",
        "http://purl.org/dc/terms/subject",
        "urn:test:note",
    ])
    .prop_map(str::to_string)
}

/// Strategy for literal triples with an optional language tag.
pub fn triple_strategy() -> impl Strategy<Value = Triple> {
    (
        property_strategy(),
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
        prop::option::of(prop::sample::select(vec!["en", "de", "fr"])),
    )
        .prop_map(|(property, value, lang)| {
            let triple = Triple::new(property, crate::fixtures::XSD_STRING, value);
            match lang {
                Some(lang) => triple.with_lang(lang),
                None => triple,
            }
        })
}

/// Strategy for metadata sets, duplicates included.
pub fn triples_strategy(max: usize) -> impl Strategy<Value = Vec<Triple>> {
    prop::collection::vec(triple_strategy(), 0..max)
}

/// Strategy for payload bodies, empty included.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_triples_are_literal(triple in triple_strategy()) {
            prop_assert!(!triple.value.is_empty());
            prop_assert_eq!(triple.kind.as_str(), crate::fixtures::XSD_STRING);
        }
    }
}
