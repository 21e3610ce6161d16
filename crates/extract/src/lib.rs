//! # tierloop Extract
//!
//! Turns a raw model reply into zero or more validated-by-name tool
//! invocations.
//!
//! ```text
//! reply ──► native calls? ──yes──► use them (sequential only if enforced)
//!             │ no
//!             ▼
//!      find markers (TOOL_CALL: / <tool_call>) ─► isolate fragments
//!             ▼
//!      parse + ordered repairs ─► dedupe ─► unknown names reported
//!             ▼
//!      keep first candidate, count the rest as dropped
//! ```
//!
//! Nothing here is fatal: malformed fragments and unknown tools are
//! reported on the [`Extraction`] so the caller can tell the model.

pub mod repair;
mod scan;

use regex_lite::Regex;
use serde::Serialize;
use std::collections::HashSet;
use tierloop_core::{Message, ToolInvocation};
use tracing::{debug, warn};

pub use repair::{
    CloseDelimiters, NormalizeQuotes, ParseResult, RepairTransform, StripTrailingSeparator,
    TrimTrailing, default_transforms, parse_fragment,
};

/// Where the invocations of an [`Extraction`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallSource {
    /// No tool call in the reply.
    None,
    /// Provider-native structured calls.
    Native,
    /// Markers in free text.
    Text,
}

/// A fragment that could not be turned into a tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MalformedFragment {
    pub fragment: String,
    pub reason: String,
}

/// A fragment that parsed only after repair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairedFragment {
    pub tool: String,
    pub transforms: Vec<&'static str>,
}

/// The result of extracting tool calls from one reply.
#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    /// Reply text with markers and fragments removed.
    pub cleaned_text: String,
    /// Invocations to execute, in issue order.
    pub invocations: Vec<ToolInvocation>,
    pub source: CallSource,
    /// Registered candidates discarded by sequential enforcement.
    pub dropped: usize,
    /// Byte-identical fragments discarded.
    pub duplicates: usize,
    /// Names of candidates that are not registered.
    pub unknown: Vec<String>,
    pub malformed: Vec<MalformedFragment>,
    pub repaired: Vec<RepairedFragment>,
}

impl Extraction {
    fn empty(cleaned_text: String) -> Self {
        Self {
            cleaned_text,
            invocations: Vec::new(),
            source: CallSource::None,
            dropped: 0,
            duplicates: 0,
            unknown: Vec::new(),
            malformed: Vec::new(),
            repaired: Vec::new(),
        }
    }

    /// True when the reply tried to call tools but nothing is executable.
    pub fn needs_correction(&self) -> bool {
        self.invocations.is_empty() && (!self.malformed.is_empty() || !self.unknown.is_empty())
    }

    /// A short description of what went wrong, phrased for the model.
    pub fn correction_message(&self, available: &[&str]) -> Option<String> {
        if !self.needs_correction() {
            return None;
        }
        let mut parts = Vec::new();
        for m in &self.malformed {
            parts.push(format!("Your tool call could not be parsed ({}).", m.reason));
        }
        for name in &self.unknown {
            parts.push(format!("There is no tool named '{name}'."));
        }
        parts.push(format!(
            "Available tools: {}. Reply with exactly one line of the form \
             TOOL_CALL: {{\"name\": \"<tool>\", \"arguments\": {{...}}}}, or answer without a tool call.",
            available.join(", ")
        ));
        Some(parts.join(" "))
    }
}

/// Configurable tool-call extractor.
pub struct Extractor {
    transforms: Vec<Box<dyn RepairTransform>>,
    enforce_sequential_native: bool,
    bare_object: Option<Regex>,
}

impl Extractor {
    /// Default transforms, sequential enforcement for native calls on,
    /// marker-only scanning.
    pub fn new() -> Self {
        Self {
            transforms: default_transforms(),
            enforce_sequential_native: true,
            bare_object: None,
        }
    }

    /// Replace the repair transform list.
    pub fn with_transforms(mut self, transforms: Vec<Box<dyn RepairTransform>>) -> Self {
        self.transforms = transforms;
        self
    }

    /// Append a repair transform after the existing ones.
    pub fn with_transform(mut self, transform: Box<dyn RepairTransform>) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Whether native multi-call replies are cut to one invocation.
    /// Free-text replies are always cut.
    pub fn with_sequential_native(mut self, enforce: bool) -> Self {
        self.enforce_sequential_native = enforce;
        self
    }

    /// Accept bare `{"name": ...}` objects when a reply has no markers.
    /// Only objects naming a registered tool count; anything else is
    /// left in the text as ordinary content.
    pub fn with_bare_objects(mut self) -> Self {
        self.bare_object = Regex::new(r#"\{\s*["'](?:name|tool)["']\s*:"#).ok();
        self
    }

    /// Extract from an assistant message, preferring its native calls.
    pub fn extract_message(&self, message: &Message, available: &[&str]) -> Extraction {
        if message.tool_calls.is_empty() {
            return self.extract(message.text(), available);
        }
        self.from_native(message.text(), &message.tool_calls, available)
    }

    /// Extract from free text.
    pub fn extract(&self, raw: &str, available: &[&str]) -> Extraction {
        let mut candidates = scan::candidates(raw, self.bare_object.as_ref());
        candidates.retain(|c| !c.bare || self.names_registered_tool(c, available));
        if candidates.is_empty() {
            return Extraction::empty(raw.trim().to_string());
        }

        let mut extraction = Extraction::empty(remove_spans(raw, &candidates));
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();

        for candidate in candidates {
            let Some(fragment) = candidate.fragment else {
                warn!("Tool-call marker without a JSON object");
                extraction.malformed.push(MalformedFragment {
                    fragment: String::new(),
                    reason: "marker not followed by a JSON object".into(),
                });
                continue;
            };

            if !seen.insert(fragment.clone()) {
                debug!(fragment = %fragment, "Dropping duplicate tool-call fragment");
                extraction.duplicates += 1;
                continue;
            }

            match parse_fragment(&fragment, &self.transforms) {
                ParseResult::Valid(inv) => accepted.push(inv),
                ParseResult::Repaired(inv, transforms) => {
                    debug!(tool = %inv.name, ?transforms, "Repaired tool-call fragment");
                    extraction.repaired.push(RepairedFragment {
                        tool: inv.name.clone(),
                        transforms,
                    });
                    accepted.push(inv);
                }
                ParseResult::Failed(reason) => {
                    warn!(reason = %reason, "Could not repair tool-call fragment");
                    extraction.malformed.push(MalformedFragment { fragment, reason });
                }
            }
        }

        let known = self.partition_known(accepted, available, &mut extraction);
        extraction.source = if known.is_empty() {
            CallSource::None
        } else {
            CallSource::Text
        };
        self.apply_sequential(known, true, &mut extraction);
        extraction
    }

    fn names_registered_tool(&self, candidate: &scan::Candidate, available: &[&str]) -> bool {
        let Some(fragment) = candidate.fragment.as_deref() else {
            return false;
        };
        parse_fragment(fragment, &self.transforms)
            .invocation()
            .is_some_and(|inv| available.contains(&inv.name.as_str()))
    }

    fn from_native(&self, text: &str, calls: &[ToolInvocation], available: &[&str]) -> Extraction {
        let mut extraction = Extraction::empty(text.trim().to_string());
        let known = self.partition_known(calls.to_vec(), available, &mut extraction);
        extraction.source = if known.is_empty() {
            CallSource::None
        } else {
            CallSource::Native
        };
        self.apply_sequential(known, self.enforce_sequential_native, &mut extraction);
        extraction
    }

    fn partition_known(
        &self,
        candidates: Vec<ToolInvocation>,
        available: &[&str],
        extraction: &mut Extraction,
    ) -> Vec<ToolInvocation> {
        let mut known = Vec::with_capacity(candidates.len());
        for inv in candidates {
            if available.contains(&inv.name.as_str()) {
                known.push(inv);
            } else {
                warn!(tool = %inv.name, "Model requested an unknown tool");
                extraction.unknown.push(inv.name);
            }
        }
        known
    }

    fn apply_sequential(
        &self,
        mut known: Vec<ToolInvocation>,
        enforce: bool,
        extraction: &mut Extraction,
    ) {
        if enforce && known.len() > 1 {
            extraction.dropped = known.len() - 1;
            debug!(
                kept = %known[0].name,
                dropped = extraction.dropped,
                "Sequential enforcement dropped extra invocations"
            );
            known.truncate(1);
        }
        extraction.invocations = known;
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract with the default configuration.
pub fn extract(raw: &str, available: &[&str]) -> Extraction {
    Extractor::new().extract(raw, available)
}

fn remove_spans(raw: &str, candidates: &[scan::Candidate]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pos = 0;
    for c in candidates {
        let (start, end) = c.span;
        if start >= pos {
            out.push_str(&raw[pos..start]);
            pos = end;
        }
    }
    out.push_str(&raw[pos.min(raw.len())..]);

    // Collapse the gaps left behind.
    let mut cleaned = String::with_capacity(out.len());
    let mut blank_run = 0;
    for line in out.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        cleaned.push_str(line);
        cleaned.push('\n');
    }
    cleaned.trim().to_string()
}
