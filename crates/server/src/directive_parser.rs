//! Orchestrator directive parser.
//!
//! Extracts `FYP_*_JSON:` control directives from the orchestrator's
//! streaming PTY output. Chunks arrive at arbitrary boundaries, so each
//! session keeps a carry-over buffer; payloads are located with a
//! string/escape-aware brace walker and deduplicated by a SHA-1 prefix
//! over `<marker>|<payloadRaw>` within a sliding window.

use std::collections::HashMap;

use serde_json::Value;

/// Markers recognized in orchestrator output (matched case-insensitively).
const MARKERS: &[&str] = &[
    "FYP_SEND_TASK_JSON:",
    "FYP_DISPATCH_JSON:",
    "FYP_ANSWER_QUESTION_JSON:",
    "FYP_QUESTION_RESPONSE_JSON:",
];

const SEND_TASK_MARKER: &str = "FYP_SEND_TASK_JSON:";
const ANSWER_MARKERS: &[&str] = &["FYP_ANSWER_QUESTION_JSON:", "FYP_QUESTION_RESPONSE_JSON:"];

/// Carry + chunk scan window.
const MAX_MERGED_CHARS: usize = 20_000;
/// Carry-over bound when a marker's JSON is still incomplete.
const MAX_INCOMPLETE_CARRY_CHARS: usize = 4_000;
/// Dispatch text cap.
const MAX_TASK_CHARS: usize = 24_000;
/// Recent-signature map hard cap.
const MAX_RECENT_ENTRIES: usize = 360;

pub const DEFAULT_DEDUPE_WINDOW_MS: i64 = 30_000;

/// Literal placeholder tokens that mark un-filled bootstrap templates.
const PLACEHOLDER_TOKENS: &[&str] = &[
    "<prompt>",
    "<task prompt>",
    "<message>",
    "<text>",
    "<objective>",
    "<question>",
    "<answer>",
];

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchDirective {
    pub target: String,
    pub text: String,
    pub interrupt: bool,
    pub force_interrupt: bool,
    pub include_bootstrap_if_present: bool,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuestionAnswerDirective {
    pub attention_id: i64,
    pub option_id: String,
    pub source: String,
    pub meta: Value,
}

#[derive(Debug, Default)]
pub struct ParsedDirectives {
    pub dispatches: Vec<DispatchDirective>,
    pub question_answers: Vec<QuestionAnswerDirective>,
}

/// Per-session parser state.
pub struct DirectiveParser {
    carry: String,
    recent: HashMap<String, i64>,
    dedupe_window_ms: i64,
}

impl DirectiveParser {
    pub fn new(dedupe_window_ms: i64) -> Self {
        Self {
            carry: String::new(),
            recent: HashMap::new(),
            dedupe_window_ms,
        }
    }

    /// Consume one raw output chunk and return directives in buffer order.
    pub fn parse_chunk(&mut self, chunk: &str, now_ms: i64) -> ParsedDirectives {
        let normalized = chunk.replace("\r\n", "\n");
        let mut merged = std::mem::take(&mut self.carry);
        merged.push_str(&normalized);
        let merged = tail_chars(&merged, MAX_MERGED_CHARS);

        let upper = merged.to_ascii_uppercase();
        let mut found: Vec<(usize, &'static str, String)> = Vec::new();
        let mut earliest_incomplete: Option<usize> = None;

        for &marker in MARKERS {
            let mut from = 0usize;
            while let Some(rel) = upper[from..].find(marker) {
                let marker_at = from + rel;
                let after_marker = marker_at + marker.len();

                let Some(open_rel) = merged[after_marker..].find('{') else {
                    // Marker seen but the payload hasn't streamed in yet.
                    earliest_incomplete = Some(
                        earliest_incomplete.map_or(marker_at, |e: usize| e.min(marker_at)),
                    );
                    break;
                };
                let open_at = after_marker + open_rel;

                match find_json_end(&merged, open_at) {
                    Some(end) => {
                        found.push((marker_at, marker, merged[open_at..=end].to_string()));
                        from = end + 1;
                    }
                    None => {
                        earliest_incomplete = Some(
                            earliest_incomplete.map_or(marker_at, |e: usize| e.min(marker_at)),
                        );
                        break;
                    }
                }
            }
        }

        found.sort_by_key(|(offset, _, _)| *offset);

        let mut out = ParsedDirectives::default();
        for (_, marker, payload_raw) in &found {
            let sig = directive_signature(marker, payload_raw);
            if let Some(last_seen) = self.recent.get(&sig) {
                if now_ms - last_seen < self.dedupe_window_ms {
                    continue;
                }
            }

            let Ok(payload) = serde_json::from_str::<Value>(payload_raw) else {
                continue;
            };

            if ANSWER_MARKERS.contains(marker) {
                if let Some(answer) = parse_question_answer(marker, &payload) {
                    self.recent.insert(sig, now_ms);
                    out.question_answers.push(answer);
                }
            } else if let Some(dispatch) = parse_dispatch(marker, &payload) {
                self.recent.insert(sig, now_ms);
                out.dispatches.push(dispatch);
            }
        }

        self.gc_recent(now_ms);

        self.carry = match earliest_incomplete {
            Some(offset) => tail_chars(&merged[offset..], MAX_INCOMPLETE_CARRY_CHARS),
            None => {
                let keep = (2 * longest_marker_len()).max(200);
                tail_chars(&merged, keep)
            }
        };

        out
    }

    fn gc_recent(&mut self, now_ms: i64) {
        let horizon = self.dedupe_window_ms.saturating_mul(8);
        self.recent.retain(|_, seen| now_ms - *seen <= horizon);

        if self.recent.len() > MAX_RECENT_ENTRIES {
            let mut entries: Vec<(String, i64)> =
                self.recent.iter().map(|(k, v)| (k.clone(), *v)).collect();
            entries.sort_by_key(|(_, seen)| *seen);
            let excess = entries.len() - MAX_RECENT_ENTRIES;
            for (sig, _) in entries.into_iter().take(excess) {
                self.recent.remove(&sig);
            }
        }
    }
}

fn parse_dispatch(marker: &str, payload: &Value) -> Option<DispatchDirective> {
    let target = payload.get("target")?.as_str()?.trim().to_string();
    if target.is_empty() {
        return None;
    }

    let text = ["task", "text", "prompt", "message"]
        .iter()
        .find_map(|key| payload.get(key).and_then(|v| v.as_str()))
        .unwrap_or("")
        .trim()
        .to_string();
    if is_placeholder_task(&text) {
        return None;
    }
    let text: String = text.chars().take(MAX_TASK_CHARS).collect();

    let truthy = |key: &str| payload.get(key).and_then(|v| v.as_bool()) == Some(true);
    let force_interrupt = truthy("forceInterrupt")
        || matches!(
            payload.get("interruptMode").and_then(|v| v.as_str()),
            Some("force") | Some("FORCE")
        );
    let include_bootstrap = marker == SEND_TASK_MARKER
        || truthy("initialize")
        || truthy("init")
        || truthy("includeBootstrap")
        || truthy("first");

    Some(DispatchDirective {
        target,
        text,
        interrupt: truthy("interrupt"),
        force_interrupt,
        include_bootstrap_if_present: include_bootstrap,
        source: marker_source(marker),
    })
}

fn parse_question_answer(marker: &str, payload: &Value) -> Option<QuestionAnswerDirective> {
    let attention_id = payload.get("attentionId")?.as_i64()?;
    if attention_id <= 0 {
        return None;
    }
    let option_id = payload.get("optionId")?.as_str()?.trim().to_string();
    if option_id.is_empty() {
        return None;
    }
    let source = payload
        .get("source")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| marker_source(marker));
    Some(QuestionAnswerDirective {
        attention_id,
        option_id,
        source,
        meta: payload.get("meta").cloned().unwrap_or(Value::Null),
    })
}

/// Empty, fully-bracketed (`^<…>$`), or containing a known placeholder
/// token — bootstrap template echoes that must never be dispatched.
fn is_placeholder_task(text: &str) -> bool {
    if text.is_empty() {
        return true;
    }
    if text.starts_with('<') && text.ends_with('>') && text.len() > 1 {
        return true;
    }
    let lower = text.to_ascii_lowercase();
    PLACEHOLDER_TOKENS.iter().any(|t| lower.contains(t))
}

fn marker_source(marker: &str) -> String {
    marker.trim_end_matches(':').to_ascii_lowercase()
}

/// `sha1("<marker>|<payloadRaw>")[0..24]`
pub fn directive_signature(marker: &str, payload_raw: &str) -> String {
    let digest = ring::digest::digest(
        &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
        format!("{marker}|{payload_raw}").as_bytes(),
    );
    let hex: String = digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    hex[..24].to_string()
}

/// Walk from the `{` at `start` to its matching `}` honouring strings
/// and escapes. Returns the byte offset of the closing brace.
fn find_json_end(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    debug_assert_eq!(bytes.get(start), Some(&b'{'));
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn longest_marker_len() -> usize {
    MARKERS.iter().map(|m| m.len()).max().unwrap_or(0)
}

/// Last `n` chars of `s`, on char boundaries.
fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatch_chunk(target: &str, task: &str) -> String {
        format!(
            "some model output\nFYP_DISPATCH_JSON: {}\nmore output\n",
            json!({"target": target, "task": task})
        )
    }

    #[test]
    fn extracts_a_dispatch() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        let out = parser.parse_chunk(&dispatch_chunk("worker:Worker A", "PING-1"), 0);
        assert_eq!(out.dispatches.len(), 1);
        let d = &out.dispatches[0];
        assert_eq!(d.target, "worker:Worker A");
        assert_eq!(d.text, "PING-1");
        assert!(!d.interrupt);
        assert!(!d.include_bootstrap_if_present);
        assert_eq!(d.source, "fyp_dispatch_json");
    }

    #[test]
    fn markers_are_case_insensitive() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        let chunk = format!(
            "fyp_dispatch_json: {}\n",
            json!({"target": "all", "task": "go"})
        );
        let out = parser.parse_chunk(&chunk, 0);
        assert_eq!(out.dispatches.len(), 1);
    }

    #[test]
    fn payload_split_across_chunks_uses_carry() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        let full = format!(
            "FYP_DISPATCH_JSON: {}",
            json!({"target": "all", "task": "split task"})
        );
        let (a, b) = full.split_at(full.len() / 2);

        let out = parser.parse_chunk(a, 0);
        assert!(out.dispatches.is_empty());

        let out = parser.parse_chunk(b, 10);
        assert_eq!(out.dispatches.len(), 1);
        assert_eq!(out.dispatches[0].text, "split task");
    }

    #[test]
    fn crlf_is_normalized_before_scanning() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        let chunk = "FYP_DISPATCH_JSON:\r\n{\"target\": \"all\",\r\n \"task\": \"x\"}\r\n";
        let out = parser.parse_chunk(chunk, 0);
        assert_eq!(out.dispatches.len(), 1);
        assert_eq!(out.dispatches[0].text, "x");
    }

    #[test]
    fn dedupes_within_window_accepts_after() {
        let mut parser = DirectiveParser::new(1_000);
        let chunk = dispatch_chunk("all", "same");

        assert_eq!(parser.parse_chunk(&chunk, 0).dispatches.len(), 1);
        assert_eq!(parser.parse_chunk(&chunk, 500).dispatches.len(), 0);
        assert_eq!(parser.parse_chunk(&chunk, 1_500).dispatches.len(), 1);
    }

    #[test]
    fn different_payloads_are_not_deduped() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        assert_eq!(
            parser.parse_chunk(&dispatch_chunk("all", "a"), 0).dispatches.len(),
            1
        );
        assert_eq!(
            parser.parse_chunk(&dispatch_chunk("all", "b"), 1).dispatches.len(),
            1
        );
    }

    #[test]
    fn placeholder_tasks_are_ignored() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        for task in [
            "",
            "<your task here>",
            "Do this: <task prompt> now",
            "answer with <answer>",
        ] {
            let out = parser.parse_chunk(&dispatch_chunk("all", task), 0);
            assert!(out.dispatches.is_empty(), "task {task:?} should be filtered");
        }
    }

    #[test]
    fn force_interrupt_from_flag_or_mode() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        let chunk = format!(
            "FYP_DISPATCH_JSON: {}",
            json!({"target": "all", "task": "t1", "forceInterrupt": true})
        );
        assert!(parser.parse_chunk(&chunk, 0).dispatches[0].force_interrupt);

        let chunk = format!(
            "FYP_DISPATCH_JSON: {}",
            json!({"target": "all", "task": "t2", "interruptMode": "FORCE"})
        );
        assert!(parser.parse_chunk(&chunk, 0).dispatches[0].force_interrupt);

        let chunk = format!(
            "FYP_DISPATCH_JSON: {}",
            json!({"target": "all", "task": "t3", "interruptMode": "normal"})
        );
        assert!(!parser.parse_chunk(&chunk, 0).dispatches[0].force_interrupt);
    }

    #[test]
    fn send_task_marker_allows_bootstrap() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        let chunk = format!(
            "FYP_SEND_TASK_JSON: {}",
            json!({"target": "worker:a", "task": "start"})
        );
        let out = parser.parse_chunk(&chunk, 0);
        assert!(out.dispatches[0].include_bootstrap_if_present);

        let chunk = format!(
            "FYP_DISPATCH_JSON: {}",
            json!({"target": "worker:a", "task": "later", "initialize": true})
        );
        let out = parser.parse_chunk(&chunk, 0);
        assert!(out.dispatches[0].include_bootstrap_if_present);
    }

    #[test]
    fn question_answers_are_parsed_and_validated() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        let chunk = format!(
            "FYP_ANSWER_QUESTION_JSON: {}",
            json!({"attentionId": 42, "optionId": "y", "meta": {"note": "ok"}})
        );
        let out = parser.parse_chunk(&chunk, 0);
        assert_eq!(out.question_answers.len(), 1);
        let qa = &out.question_answers[0];
        assert_eq!(qa.attention_id, 42);
        assert_eq!(qa.option_id, "y");
        assert_eq!(qa.meta, json!({"note": "ok"}));

        // Non-positive id and empty option are rejected
        let chunk = format!(
            "FYP_ANSWER_QUESTION_JSON: {}",
            json!({"attentionId": 0, "optionId": "y"})
        );
        assert!(parser.parse_chunk(&chunk, 0).question_answers.is_empty());
        let chunk = format!(
            "FYP_QUESTION_RESPONSE_JSON: {}",
            json!({"attentionId": 7, "optionId": ""})
        );
        assert!(parser.parse_chunk(&chunk, 0).question_answers.is_empty());
    }

    #[test]
    fn directives_come_out_in_buffer_order() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        let chunk = format!(
            "FYP_DISPATCH_JSON: {}\nFYP_SEND_TASK_JSON: {}\nFYP_DISPATCH_JSON: {}\n",
            json!({"target": "all", "task": "first"}),
            json!({"target": "all", "task": "second"}),
            json!({"target": "all", "task": "third"}),
        );
        let out = parser.parse_chunk(&chunk, 0);
        let texts: Vec<&str> = out.dispatches.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn nested_braces_and_strings_survive_the_walker() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        let chunk = r#"FYP_DISPATCH_JSON: {"target": "all", "task": "use {braces} and \"quotes\" and }"}"#;
        let out = parser.parse_chunk(chunk, 0);
        assert_eq!(out.dispatches.len(), 1);
        assert_eq!(out.dispatches[0].text, "use {braces} and \"quotes\" and }");
    }

    #[test]
    fn task_text_is_capped() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        let long = "x".repeat(30_000);
        let chunk = format!("FYP_DISPATCH_JSON: {}", json!({"target": "all", "task": long}));
        let out = parser.parse_chunk(&chunk, 0);
        assert_eq!(out.dispatches[0].text.chars().count(), MAX_TASK_CHARS);
    }

    #[test]
    fn parse_error_is_skipped() {
        let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
        // Balanced braces but invalid JSON
        let out = parser.parse_chunk("FYP_DISPATCH_JSON: {not json}", 0);
        assert!(out.dispatches.is_empty());
    }

    #[test]
    fn signature_is_stable_24_hex() {
        let sig = directive_signature("FYP_DISPATCH_JSON:", "{\"a\":1}");
        assert_eq!(sig.len(), 24);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, directive_signature("FYP_DISPATCH_JSON:", "{\"a\":1}"));
    }
}
