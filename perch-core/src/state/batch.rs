//! IRCv3 `BATCH` reassembly.
//!
//! Messages tagged `batch=<ref>` are held until the batch closes. A
//! `draft/multiline` batch is released as a single synthetic PRIVMSG or
//! NOTICE whose text joins the parts with newlines, except parts tagged
//! `draft/multiline-concat`, which are appended directly. Other batch
//! types release their messages in order; a `label` on the opening line
//! (`labeled-response`) is copied onto each of them.
//!
//! A batch that never closes is dropped after [`BATCH_TIMEOUT`] seconds,
//! and one that grows past [`MAX_BATCH_MESSAGES`] is dropped at once.

use std::collections::HashMap;

use crate::message::Message;

pub const MULTILINE: &str = "draft/multiline";
pub const MULTILINE_CONCAT: &str = "draft/multiline-concat";

pub const BATCH_TIMEOUT: f64 = 300.0;
pub const MAX_BATCH_MESSAGES: usize = 4096;

#[derive(Debug, Clone)]
struct Open {
    kind: String,
    /// The `BATCH +ref` line, kept for its tags and prefix.
    start: Message,
    messages: Vec<Message>,
    /// Enclosing batch, when nested.
    parent: Option<String>,
    opened: f64,
}

#[derive(Debug, Default)]
pub struct BatchAssembler {
    open: HashMap<String, Open>,
}

impl BatchAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, reference: &str) -> bool {
        self.open.contains_key(reference)
    }

    /// Feed one inbound message; returns the messages ready for the rest
    /// of the pipeline (possibly none while a batch is open).
    pub fn feed(&mut self, msg: Message, now: f64) -> Vec<Message> {
        if msg.command == "BATCH"
            && let Some(reference) = msg.param(0)
        {
            if let Some(name) = reference.strip_prefix('+') {
                let parent = msg.tag("batch").filter(|p| self.open.contains_key(*p)).map(str::to_string);
                self.open.insert(
                    name.to_string(),
                    Open {
                        kind: msg.param(1).unwrap_or_default().to_string(),
                        start: msg.clone(),
                        messages: Vec::new(),
                        parent,
                        opened: now,
                    },
                );
                return Vec::new();
            }
            if let Some(name) = reference.strip_prefix('-') {
                let Some(batch) = self.open.remove(name) else {
                    tracing::debug!(batch = name, "Closing unknown batch");
                    return Vec::new();
                };
                let released = close(batch.clone());
                return match batch.parent.and_then(|p| self.open.get_mut(&p)) {
                    Some(parent) => {
                        parent.messages.extend(released);
                        Vec::new()
                    }
                    None => released,
                };
            }
        }
        if let Some(reference) = msg.tag("batch").map(str::to_string)
            && let Some(batch) = self.open.get_mut(&reference)
        {
            batch.messages.push(msg);
            if batch.messages.len() > MAX_BATCH_MESSAGES {
                tracing::warn!(batch = %reference, "Batch too large, dropping it");
                self.open.remove(&reference);
            }
            return Vec::new();
        }
        vec![msg]
    }

    /// Drop batches open for longer than `max_age`. Returns how many.
    pub fn expire(&mut self, now: f64, max_age: f64) -> usize {
        let before = self.open.len();
        self.open.retain(|reference, batch| {
            let keep = now - batch.opened <= max_age;
            if !keep {
                tracing::warn!(batch = %reference, kind = %batch.kind, "Batch never closed, dropping it");
            }
            keep
        });
        before - self.open.len()
    }

    /// Drop every open batch, e.g. on disconnect.
    pub fn clear(&mut self) {
        self.open.clear();
    }
}

fn close(batch: Open) -> Vec<Message> {
    if batch.kind != MULTILINE {
        let Some(label) = batch.start.tag("label").map(str::to_string) else {
            return batch.messages;
        };
        return batch
            .messages
            .into_iter()
            .map(|m| if m.has_tag("label") { m } else { m.with_tag("label", Some(label.clone())) })
            .collect();
    }
    let Some(first) = batch.messages.first() else {
        return Vec::new();
    };
    let command = first.command.clone();
    let target = batch
        .start
        .param(2)
        .or_else(|| first.param(0))
        .unwrap_or_default()
        .to_string();
    let mut text = String::new();
    for (i, part) in batch.messages.iter().enumerate() {
        let line = part.param(1).unwrap_or_default();
        let concat = part.has_tag(MULTILINE_CONCAT) || part.has_tag(&format!("+{MULTILINE_CONCAT}"));
        if i > 0 && !concat {
            text.push('\n');
        }
        text.push_str(line);
    }
    let mut merged = Message::new(&command, vec![target, text]);
    merged.prefix = first.prefix.clone().or_else(|| batch.start.prefix.clone());
    merged.tags = batch.start.tags.clone();
    merged.tags.remove("batch");
    for (key, value) in &first.tags {
        if key != "batch" && key != MULTILINE_CONCAT && key != &format!("+{MULTILINE_CONCAT}") {
            merged.tags.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    vec![merged]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(asm: &mut BatchAssembler, lines: &[&str]) -> Vec<Message> {
        lines
            .iter()
            .flat_map(|l| asm.feed(Message::parse(l).unwrap(), 0.0))
            .collect()
    }

    #[test]
    fn multiline_concat_joins_without_newline() {
        let mut asm = BatchAssembler::new();
        let out = feed_all(
            &mut asm,
            &[
                ":alice!a@h BATCH +abc draft/multiline #ch",
                "@batch=abc :alice!a@h PRIVMSG #ch :hello ",
                "@batch=abc;+draft/multiline-concat :alice!a@h PRIVMSG #ch world",
                ":alice!a@h BATCH -abc",
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].command, "PRIVMSG");
        assert_eq!(out[0].params, vec!["#ch", "hello world"]);
        assert_eq!(out[0].nick(), Some("alice"));
        assert!(!out[0].has_tag("batch"));
    }

    #[test]
    fn multiline_parts_join_with_newlines() {
        let mut asm = BatchAssembler::new();
        let out = feed_all(
            &mut asm,
            &[
                "@msgid=1 :alice!a@h BATCH +x draft/multiline #ch",
                "@batch=x :alice!a@h PRIVMSG #ch :one",
                "@batch=x :alice!a@h PRIVMSG #ch :two",
                "BATCH -x",
            ],
        );
        assert_eq!(out[0].params[1], "one\ntwo");
        assert_eq!(out[0].tag("msgid"), Some("1"));
    }

    #[test]
    fn other_batches_release_in_order() {
        let mut asm = BatchAssembler::new();
        let out = feed_all(
            &mut asm,
            &[
                ":srv BATCH +n netsplit a.example b.example",
                "@batch=n :x!x@x QUIT :a.example b.example",
                "@batch=n :y!y@y QUIT :a.example b.example",
                ":z!z@z PRIVMSG #c :outside",
                ":srv BATCH -n",
            ],
        );
        let commands: Vec<&str> = out.iter().map(|m| m.command.as_str()).collect();
        assert_eq!(commands, vec!["PRIVMSG", "QUIT", "QUIT"]);
    }

    #[test]
    fn nested_batches_release_through_parent() {
        let mut asm = BatchAssembler::new();
        let out = feed_all(
            &mut asm,
            &[
                ":srv BATCH +outer chathistory #c",
                "@batch=outer :srv BATCH +inner draft/multiline #c",
                "@batch=inner :a!a@a PRIVMSG #c :x",
                ":srv BATCH -inner",
                "@batch=outer :b!b@b PRIVMSG #c :y",
            ],
        );
        assert!(out.is_empty());
        assert!(asm.is_open("outer"));
        let out = feed_all(&mut asm, &[":srv BATCH -outer"]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].params[1], "x");
    }

    #[test]
    fn labeled_batches_pass_their_label_on() {
        let mut asm = BatchAssembler::new();
        let out = feed_all(
            &mut asm,
            &[
                "@label=perch2 :srv BATCH +x labeled-response",
                "@batch=x :srv NOTE REGISTER INFO :sent mail",
                "@batch=x :srv REGISTER SUCCESS bob :Account created",
                ":srv BATCH -x",
            ],
        );
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.tag("label") == Some("perch2")));
    }

    #[test]
    fn unclosed_and_oversized_batches_are_dropped() {
        let mut asm = BatchAssembler::new();
        asm.feed(Message::parse(":srv BATCH +stuck chathistory #c").unwrap(), 100.0);
        asm.feed(Message::parse("@batch=stuck :a!a@a PRIVMSG #c :x").unwrap(), 150.0);
        assert_eq!(asm.expire(100.0 + BATCH_TIMEOUT, BATCH_TIMEOUT), 0);
        assert_eq!(asm.expire(101.0 + BATCH_TIMEOUT, BATCH_TIMEOUT), 1);
        assert!(!asm.is_open("stuck"));
        // The close finds nothing to release.
        assert!(asm.feed(Message::parse(":srv BATCH -stuck").unwrap(), 500.0).is_empty());

        asm.feed(Message::parse(":srv BATCH +big chathistory #c").unwrap(), 0.0);
        for _ in 0..=MAX_BATCH_MESSAGES {
            asm.feed(Message::parse("@batch=big :a!a@a PRIVMSG #c :x").unwrap(), 0.0);
        }
        assert!(!asm.is_open("big"));
    }
}
