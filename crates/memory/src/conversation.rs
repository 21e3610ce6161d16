//! Conversation memory: the bounded message history of one run.
//!
//! Pruning works on *units* rather than single messages. An assistant
//! message carrying tool calls forms one unit with the tool-result
//! messages that answer it, so eviction never leaves a call without its
//! result or a result without its call.
//!
//! Retention order:
//! 1. system messages, when `preserve_system` is on
//! 2. the most recent units that fit in the remaining budget
//!
//! Kept messages stay in their original order.

use std::collections::HashSet;
use tierloop_core::{Message, Role};
use tracing::debug;

/// Bounded, pair-preserving message history.
///
/// Owned by a single execution loop; never shared between conversations.
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_messages: usize,
    preserve_system: bool,
    evicted: usize,
}

impl ConversationMemory {
    /// Create an empty memory. `max_messages` is clamped to at least 1.
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: max_messages.max(1),
            preserve_system: true,
            evicted: 0,
        }
    }

    pub fn with_preserve_system(mut self, preserve: bool) -> Self {
        self.preserve_system = preserve;
        self
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    pub fn preserve_system(&self) -> bool {
        self.preserve_system
    }

    /// Append a message and prune. Returns how many messages were evicted.
    pub fn push(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.prune()
    }

    /// Append several messages, pruning once at the end.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        self.messages.extend(messages);
        self.prune()
    }

    /// Prune to the configured bound. Returns how many messages were evicted.
    pub fn prune(&mut self) -> usize {
        if self.messages.len() <= self.max_messages {
            return 0;
        }
        let before = self.messages.len();
        self.messages = prune(
            std::mem::take(&mut self.messages),
            self.max_messages,
            self.preserve_system,
        );
        let evicted = before - self.messages.len();
        self.evicted += evicted;
        if evicted > 0 {
            debug!(evicted, kept = self.messages.len(), "Pruned conversation memory");
        }
        evicted
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total messages evicted over this memory's lifetime.
    pub fn evicted_total(&self) -> usize {
        self.evicted
    }
}

/// Prune `messages` to at most `max_messages`.
///
/// When the newest unit alone is larger than the budget it is still kept
/// whole, so the result may exceed `max_messages` in that one case.
pub fn prune(messages: Vec<Message>, max_messages: usize, preserve_system: bool) -> Vec<Message> {
    if messages.len() <= max_messages {
        return messages;
    }

    let units = group_units(&messages, preserve_system);
    let mut keep = vec![false; messages.len()];

    let mut budget = max_messages;
    if preserve_system {
        for (i, m) in messages.iter().enumerate() {
            if m.role == Role::System {
                keep[i] = true;
                budget = budget.saturating_sub(1);
            }
        }
    }

    let mut kept_any = false;
    for unit in units.iter().rev() {
        if unit.len() > budget && kept_any {
            break;
        }
        for &i in unit {
            keep[i] = true;
        }
        budget = budget.saturating_sub(unit.len());
        kept_any = true;
    }

    messages
        .into_iter()
        .zip(keep)
        .filter_map(|(m, k)| k.then_some(m))
        .collect()
}

/// Split non-preserved messages into atomic units of message indices.
fn group_units(messages: &[Message], preserve_system: bool) -> Vec<Vec<usize>> {
    let mut units: Vec<Vec<usize>> = Vec::new();
    let mut open_calls: Option<HashSet<&str>> = None;

    for (i, m) in messages.iter().enumerate() {
        if preserve_system && m.role == Role::System {
            continue;
        }

        if m.role == Role::Tool {
            let answers_open = match (&open_calls, m.tool_call_id.as_deref()) {
                (Some(ids), Some(id)) => ids.contains(id),
                _ => false,
            };
            if answers_open {
                if let Some(unit) = units.last_mut() {
                    unit.push(i);
                }
                continue;
            }
        }

        open_calls = m
            .has_tool_calls()
            .then(|| m.tool_calls.iter().map(|c| c.id.as_str()).collect());
        units.push(vec![i]);
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierloop_core::ToolInvocation;

    fn call(name: &str) -> ToolInvocation {
        ToolInvocation::new(name, serde_json::Map::new())
    }

    fn exchange(name: &str) -> Vec<Message> {
        let inv = call(name);
        let id = inv.id.clone();
        vec![
            Message::assistant_with_calls(None, vec![inv]),
            Message::tool_result(id, name, "ok"),
        ]
    }

    #[test]
    fn under_limit_is_untouched() {
        let mut mem = ConversationMemory::new(5);
        assert_eq!(mem.push(Message::user("hi")), 0);
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn keeps_most_recent_messages() {
        let mut mem = ConversationMemory::new(3);
        for i in 0..6 {
            mem.push(Message::user(format!("m{i}")));
        }
        let texts: Vec<&str> = mem.messages().iter().map(Message::text).collect();
        assert_eq!(texts, vec!["m3", "m4", "m5"]);
        assert_eq!(mem.evicted_total(), 3);
    }

    #[test]
    fn system_messages_survive_pruning() {
        let mut mem = ConversationMemory::new(3);
        mem.push(Message::system("rules"));
        for i in 0..5 {
            mem.push(Message::user(format!("m{i}")));
        }
        assert_eq!(mem.messages()[0].role, Role::System);
        assert_eq!(mem.len(), 3);
        assert_eq!(mem.last().unwrap().text(), "m4");
    }

    #[test]
    fn system_messages_can_be_evicted_when_not_preserved() {
        let mut mem = ConversationMemory::new(2).with_preserve_system(false);
        mem.push(Message::system("rules"));
        mem.extend([Message::user("a"), Message::user("b")]);
        assert!(mem.messages().iter().all(|m| m.role != Role::System));
    }

    #[test]
    fn tool_pair_is_never_split() {
        let mut messages = vec![Message::user("q")];
        messages.extend(exchange("add"));
        messages.push(Message::assistant("done"));

        // Budget 2 would cut between the call and its result; the pair is
        // dropped whole instead.
        let pruned = prune(messages, 2, true);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].text(), "done");
    }

    #[test]
    fn pair_kept_whole_when_it_fits() {
        let mut messages = vec![Message::system("s"), Message::user("q")];
        messages.extend(exchange("add"));
        let pruned = prune(messages, 3, true);
        assert_eq!(pruned.len(), 3);
        assert_eq!(pruned[0].role, Role::System);
        assert!(pruned[1].has_tool_calls());
        assert_eq!(pruned[2].role, Role::Tool);
    }

    #[test]
    fn oversized_newest_unit_is_kept_whole() {
        let inv_a = call("add");
        let inv_b = call("multiply");
        let ids = (inv_a.id.clone(), inv_b.id.clone());
        let messages = vec![
            Message::user("q"),
            Message::assistant_with_calls(None, vec![inv_a, inv_b]),
            Message::tool_result(ids.0, "add", "1"),
            Message::tool_result(ids.1, "multiply", "2"),
        ];
        let pruned = prune(messages, 2, true);
        assert_eq!(pruned.len(), 3);
        assert!(pruned[0].has_tool_calls());
    }

    #[test]
    fn orphan_tool_result_is_its_own_unit() {
        let messages = vec![
            Message::tool_result("call_gone", "add", "3"),
            Message::user("a"),
            Message::user("b"),
        ];
        let pruned = prune(messages, 2, true);
        assert!(pruned.iter().all(|m| m.role == Role::User));
    }
}
