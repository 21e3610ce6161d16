//! Property-based tests for the tool-call extractor.
//!
//! The repair list is heuristic, so these check the shapes it claims to
//! handle for arbitrary tool names, arguments and surrounding prose.

use proptest::prelude::*;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tierloop_extract::{Extractor, ParseResult, default_transforms, extract, parse_fragment};

fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z_]{0,11}").unwrap()
}

fn args_strategy() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,8}").unwrap(),
        -1000i64..1000,
        0..4,
    )
}

fn prose_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z ,.!?]{0,40}").unwrap()
}

fn to_map(args: &BTreeMap<String, i64>) -> Map<String, Value> {
    args.iter()
        .map(|(k, v)| (k.clone(), Value::from(*v)))
        .collect()
}

fn fragment(name: &str, args: &BTreeMap<String, i64>) -> String {
    serde_json::json!({ "name": name, "arguments": to_map(args) }).to_string()
}

proptest! {
    /// A well-formed marker surrounded by prose yields exactly that call.
    #[test]
    fn prop_single_marker_roundtrip(
        name in name_strategy(),
        args in args_strategy(),
        before in prose_strategy(),
        after in prose_strategy(),
    ) {
        let text = format!("{before}\nTOOL_CALL: {}\n{after}", fragment(&name, &args));
        let ex = extract(&text, &[name.as_str()]);
        prop_assert_eq!(ex.invocations.len(), 1);
        prop_assert_eq!(&ex.invocations[0].name, &name);
        prop_assert_eq!(&ex.invocations[0].arguments, &to_map(&args));
        prop_assert!(ex.malformed.is_empty());
    }

    /// Dropping the final closing brace is always repairable.
    #[test]
    fn prop_missing_final_brace_is_repaired(
        name in name_strategy(),
        args in args_strategy(),
        before in prose_strategy(),
    ) {
        let mut frag = fragment(&name, &args);
        frag.pop();
        let text = format!("{before}\nTOOL_CALL: {frag}");
        let ex = extract(&text, &[name.as_str()]);
        prop_assert_eq!(ex.invocations.len(), 1);
        prop_assert_eq!(&ex.invocations[0].arguments, &to_map(&args));
        prop_assert_eq!(ex.repaired.len(), 1);
    }

    /// A separator before the closing brace of the arguments is stripped.
    #[test]
    fn prop_trailing_separator_is_repaired(
        name in name_strategy(),
        args in args_strategy(),
    ) {
        let mut args_json = Value::Object(to_map(&args)).to_string();
        args_json.pop();
        let frag = format!(r#"{{"name":"{name}","arguments":{args_json},}}}}"#);
        match parse_fragment(&frag, &default_transforms()) {
            ParseResult::Repaired(inv, transforms) => {
                prop_assert_eq!(inv.arguments, to_map(&args));
                prop_assert!(transforms.contains(&"strip_trailing_separator"));
            }
            other => prop_assert!(false, "expected repair, got {:?}", other),
        }
    }

    /// Several markers always collapse to the first, with the rest counted.
    #[test]
    fn prop_sequential_enforcement_keeps_first(
        name in name_strategy(),
        count in 2usize..6,
    ) {
        let text = (0..count)
            .map(|i| {
                let args: BTreeMap<String, i64> = [("i".to_string(), i as i64)].into();
                format!("TOOL_CALL: {}", fragment(&name, &args))
            })
            .collect::<Vec<_>>()
            .join("\n");
        let ex = extract(&text, &[name.as_str()]);
        prop_assert_eq!(ex.invocations.len(), 1);
        prop_assert_eq!(ex.invocations[0].arguments.get("i"), Some(&Value::from(0)));
        prop_assert_eq!(ex.dropped, count - 1);
    }

    /// Arbitrary input never panics and never yields more than one
    /// invocation from free text.
    #[test]
    fn prop_arbitrary_text_is_safe(text in ".{0,200}") {
        let ex = Extractor::new().extract(&text, &["add"]);
        prop_assert!(ex.invocations.len() <= 1);
    }

    /// Arbitrary marker payloads never panic.
    #[test]
    fn prop_arbitrary_marker_payload_is_safe(payload in "[{}\\[\\]\",:'a-z0-9 \n`]{0,80}") {
        let ex = extract(&format!("TOOL_CALL: {payload}"), &["add"]);
        prop_assert!(ex.invocations.len() <= 1);
    }
}
