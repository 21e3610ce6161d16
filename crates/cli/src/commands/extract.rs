//! `tierloop extract`: run the extractor against the built-in tools.

use anyhow::Context;
use std::io::Read;
use tierloop_extract::{Extraction, Extractor};

pub fn run(text: Option<String>) -> anyhow::Result<()> {
    let text = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            buf
        }
    };

    let extraction = extract(&text);
    println!("{}", serde_json::to_string_pretty(&extraction)?);
    Ok(())
}

fn extract(text: &str) -> Extraction {
    let registry = tierloop_tools::default_registry();
    Extractor::new().extract(text, &registry.names())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_against_builtin_tools() {
        let extraction = extract(r#"TOOL_CALL: {"name": "divide", "arguments": {"a": 120, "b": 3}}"#);
        assert_eq!(extraction.invocations.len(), 1);
        assert_eq!(extraction.invocations[0].name, "divide");

        let extraction = extract(r#"TOOL_CALL: {"name": "sqrt", "arguments": {"x": 2}}"#);
        assert!(extraction.invocations.is_empty());
        assert_eq!(extraction.unknown, vec!["sqrt"]);
    }
}
