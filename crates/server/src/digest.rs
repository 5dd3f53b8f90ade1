//! Digest builder.
//!
//! Pure functions that turn per-worker observations into deterministic
//! snapshots and the `ORCHESTRATION SYNC` text delivered to the
//! orchestrator. Only a whitelist of event kinds feeds the snapshot so
//! routine runtime events never churn the digest hash.

use std::path::Path;

use flypad_protocol::WorkerSnapshot;

/// Event kinds (exact) that are allowed to surface in digests.
pub const DIGEST_EVENT_KINDS: &[&str] = &[
    "claude.permission",
    "codex.approval",
    "codex.native.user_input",
    "inbox.respond",
    "inbox.dismiss",
    "inbox.timeout",
    "session.exit",
];

/// Event kind prefixes that are allowed to surface in digests.
pub const DIGEST_EVENT_PREFIXES: &[&str] = &["codex.native.approval.", "orchestration.question."];

pub const PREVIEW_MAX_CHARS: usize = 220;

/// Progress checklist info read from the worker tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressInfo {
    pub rel_path: String,
    pub updated_at: i64,
    pub done: u32,
    pub total: u32,
}

/// Everything observed about one worker at sync time.
#[derive(Debug, Clone, Default)]
pub struct WorkerObservation {
    pub name: String,
    pub session_id: String,
    pub running: bool,
    pub attention: u32,
    pub branch: Option<String>,
    pub preview: Option<String>,
    pub preview_ts: Option<i64>,
    /// `(id, kind, ts)` of the newest whitelisted event.
    pub last_event: Option<(i64, String, i64)>,
    pub progress: Option<ProgressInfo>,
}

/// Build the deterministic snapshot for one worker. `changed_at` is
/// inherited from `prev` iff the state hash is unchanged.
pub fn snapshot_worker(
    obs: &WorkerObservation,
    prev: Option<&WorkerSnapshot>,
    now_ms: i64,
) -> WorkerSnapshot {
    let progress = obs.progress.clone().unwrap_or_default();
    let state_hash = state_hash(obs);
    let changed_at = match prev {
        Some(prev) if prev.state_hash == state_hash => prev.changed_at,
        _ => now_ms,
    };

    WorkerSnapshot {
        state_hash,
        running: obs.running,
        attention: obs.attention,
        preview: obs.preview.clone(),
        preview_ts: obs.preview_ts,
        branch: obs.branch.clone(),
        last_event_id: obs.last_event.as_ref().map(|(id, _, _)| *id),
        last_event_kind: obs.last_event.as_ref().map(|(_, kind, _)| kind.clone()),
        last_event_ts: obs.last_event.as_ref().map(|(_, _, ts)| *ts),
        progress_updated_at: obs.progress.as_ref().map(|p| p.updated_at),
        checklist_done: progress.done,
        checklist_total: progress.total,
        progress_rel_path: obs.progress.as_ref().map(|p| p.rel_path.clone()),
        changed_at,
    }
}

/// SHA-256 prefix(16) over the canonical state tuple, in field order.
fn state_hash(obs: &WorkerObservation) -> String {
    let progress = obs.progress.clone().unwrap_or_default();
    let tuple = [
        if obs.running { "1" } else { "0" }.to_string(),
        obs.attention.to_string(),
        obs.branch.clone().unwrap_or_default(),
        obs.preview.clone().unwrap_or_default(),
        obs.progress
            .as_ref()
            .map(|p| p.rel_path.clone())
            .unwrap_or_default(),
        obs.progress
            .as_ref()
            .map(|p| p.updated_at.to_string())
            .unwrap_or_default(),
        progress.done.to_string(),
        progress.total.to_string(),
        obs.last_event
            .as_ref()
            .map(|(id, _, _)| id.to_string())
            .unwrap_or_default(),
        obs.last_event
            .as_ref()
            .map(|(_, kind, _)| kind.clone())
            .unwrap_or_default(),
        obs.last_event
            .as_ref()
            .map(|(_, _, ts)| ts.to_string())
            .unwrap_or_default(),
        obs.preview_ts.map(|ts| ts.to_string()).unwrap_or_default(),
    ];
    sha256_prefix(tuple.join("|").as_bytes(), 16)
}

/// SHA-256 prefix(20) over `sid|stateHash` lines.
pub fn digest_hash(entries: &[(String, String)]) -> String {
    let joined = entries
        .iter()
        .map(|(sid, hash)| format!("{sid}|{hash}"))
        .collect::<Vec<_>>()
        .join("\n");
    sha256_prefix(joined.as_bytes(), 20)
}

fn sha256_prefix(data: &[u8], hex_len: usize) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    let hex: String = digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    hex[..hex_len].to_string()
}

/// Human-readable deltas between two snapshots of the same worker.
pub fn change_bits(prev: Option<&WorkerSnapshot>, next: &WorkerSnapshot) -> Vec<String> {
    let Some(prev) = prev else {
        return vec!["new".to_string()];
    };
    if prev.state_hash == next.state_hash {
        return Vec::new();
    }

    let mut bits = Vec::new();
    if prev.running != next.running {
        bits.push(format!(
            "{}→{}",
            run_label(prev.running),
            run_label(next.running)
        ));
    }
    if prev.attention != next.attention {
        bits.push(format!("attention {}→{}", prev.attention, next.attention));
    }
    if prev.branch != next.branch {
        bits.push(format!(
            "branch {}→{}",
            prev.branch.as_deref().unwrap_or("-"),
            next.branch.as_deref().unwrap_or("-")
        ));
    }
    if (prev.checklist_done, prev.checklist_total) != (next.checklist_done, next.checklist_total) {
        bits.push(format!(
            "checklist {}/{}→{}/{}",
            prev.checklist_done, prev.checklist_total, next.checklist_done, next.checklist_total
        ));
    }
    if prev.last_event_id != next.last_event_id {
        if let (Some(kind), Some(id)) = (&next.last_event_kind, next.last_event_id) {
            bits.push(format!("{kind}#{id}"));
        }
    }
    if bits.is_empty() {
        bits.push("output".to_string());
    }
    bits
}

fn run_label(running: bool) -> &'static str {
    if running {
        "running"
    } else {
        "stopped"
    }
}

pub struct DigestInput<'a> {
    pub orchestration_id: &'a str,
    pub name: &'a str,
    pub trigger: &'a str,
    pub generated_at_iso: String,
    /// `(worker name, snapshot)` in worker order.
    pub workers: Vec<(&'a str, &'a str, &'a WorkerSnapshot)>,
    /// `(worker idx, bits)` for workers that changed.
    pub changes: Vec<(usize, Vec<String>)>,
    pub digest_hash: &'a str,
}

/// Render the digest message written into the orchestrator session.
pub fn render_digest(input: &DigestInput<'_>) -> String {
    let running = input.workers.iter().filter(|(_, _, s)| s.running).count();
    let total = input.workers.len();
    let attention_total: u32 = input.workers.iter().map(|(_, _, s)| s.attention).sum();
    let change_count: usize = input.changes.iter().map(|(_, bits)| bits.len()).sum();

    let mut out = String::new();
    out.push_str(&format!("ORCHESTRATION SYNC ({})\n", input.trigger));
    out.push_str(&format!("id: {}\n", input.orchestration_id));
    out.push_str(&format!("name: {}\n", input.name));
    out.push_str(&format!("generatedAt: {}\n", input.generated_at_iso));
    out.push_str(&format!("workers: {running}/{total} running\n"));
    out.push_str(&format!("attentionTotal: {attention_total}\n"));
    out.push_str(&format!("digestHash: {}\n", input.digest_hash));
    out.push_str(&format!("changes: {change_count}\n"));

    out.push_str("\nChanges since last digest:\n");
    if input.changes.is_empty() {
        out.push_str("- none\n");
    } else {
        for (idx, bits) in &input.changes {
            let (name, sid, _) = &input.workers[*idx];
            out.push_str(&format!(
                "- #{} {} ({}): {}\n",
                idx + 1,
                name,
                short_sid(sid),
                bits.join(" · ")
            ));
        }
    }

    out.push_str("\nWorker states:\n");
    for (idx, (name, sid, snap)) in input.workers.iter().enumerate() {
        out.push_str(&format!(
            "- #{} {} ({}) · {} · attention:{}\n",
            idx + 1,
            name,
            short_sid(sid),
            run_label(snap.running),
            snap.attention
        ));

        let mut details = Vec::new();
        if let Some(branch) = &snap.branch {
            details.push(format!("branch:{branch}"));
        }
        if snap.checklist_total > 0 {
            details.push(format!(
                "checklist:{}/{}",
                snap.checklist_done, snap.checklist_total
            ));
        }
        if let Some(rel) = &snap.progress_rel_path {
            details.push(format!("progress:{rel}"));
        }
        if let (Some(kind), Some(id)) = (&snap.last_event_kind, snap.last_event_id) {
            details.push(format!("{kind}#{id}"));
        }
        if !details.is_empty() {
            out.push_str(&format!("  · {}\n", details.join(" · ")));
        }
        if let Some(preview) = &snap.preview {
            let capped: String = preview.chars().take(PREVIEW_MAX_CHARS).collect();
            out.push_str(&format!("  last: {capped}\n"));
        }
    }

    out.push_str("\nTreat this as read-only status context. Do not interrupt workers unless asked.\n");
    out
}

fn short_sid(sid: &str) -> &str {
    &sid[..sid.len().min(8)]
}

/// Locate and count the worker's progress checklist. First hit wins.
pub fn read_progress(tree_path: &Path) -> Option<ProgressInfo> {
    const CANDIDATES: &[&str] = &["PROGRESS.md", "progress.md", ".flypad/progress.md"];
    for rel in CANDIDATES {
        let path = tree_path.join(rel);
        let Ok(metadata) = std::fs::metadata(&path) else {
            continue;
        };
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let updated_at = metadata
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let mut done = 0u32;
        let mut open = 0u32;
        for line in content.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("- [x]") || trimmed.starts_with("- [X]") {
                done += 1;
            } else if trimmed.starts_with("- [ ]") {
                open += 1;
            }
        }
        return Some(ProgressInfo {
            rel_path: rel.to_string(),
            updated_at,
            done,
            total: done + open,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(name: &str, sid: &str) -> WorkerObservation {
        WorkerObservation {
            name: name.into(),
            session_id: sid.into(),
            running: true,
            attention: 0,
            branch: Some("orch/o1/w1".into()),
            preview: Some("building".into()),
            preview_ts: Some(1_000),
            last_event: None,
            progress: None,
        }
    }

    #[test]
    fn snapshot_hash_is_stable_for_same_observation() {
        let a = snapshot_worker(&obs("w", "sid-1"), None, 10);
        let b = snapshot_worker(&obs("w", "sid-1"), Some(&a), 20);
        assert_eq!(a.state_hash, b.state_hash);
        // unchanged hash inherits changed_at
        assert_eq!(b.changed_at, 10);
    }

    #[test]
    fn snapshot_hash_changes_with_state() {
        let base = snapshot_worker(&obs("w", "sid-1"), None, 10);

        let mut stopped = obs("w", "sid-1");
        stopped.running = false;
        let changed = snapshot_worker(&stopped, Some(&base), 20);
        assert_ne!(base.state_hash, changed.state_hash);
        assert_eq!(changed.changed_at, 20);

        let mut with_event = obs("w", "sid-1");
        with_event.last_event = Some((5, "inbox.respond".into(), 123));
        let changed = snapshot_worker(&with_event, Some(&base), 30);
        assert_ne!(base.state_hash, changed.state_hash);
    }

    #[test]
    fn state_hash_is_16_hex_digest_hash_20() {
        let snap = snapshot_worker(&obs("w", "sid-1"), None, 0);
        assert_eq!(snap.state_hash.len(), 16);

        let h = digest_hash(&[("sid-1".into(), snap.state_hash.clone())]);
        assert_eq!(h.len(), 20);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn digest_hash_tracks_worker_hashes() {
        let a = digest_hash(&[("s1".into(), "aaaa".into()), ("s2".into(), "bbbb".into())]);
        let same = digest_hash(&[("s1".into(), "aaaa".into()), ("s2".into(), "bbbb".into())]);
        let different = digest_hash(&[("s1".into(), "aaaa".into()), ("s2".into(), "cccc".into())]);
        assert_eq!(a, same);
        assert_ne!(a, different);
    }

    #[test]
    fn change_bits_report_checklist_transitions() {
        let mut before_obs = obs("w", "sid-1");
        before_obs.progress = Some(ProgressInfo {
            rel_path: "PROGRESS.md".into(),
            updated_at: 1,
            done: 0,
            total: 0,
        });
        let before = snapshot_worker(&before_obs, None, 0);

        let mut after_obs = before_obs.clone();
        after_obs.progress = Some(ProgressInfo {
            rel_path: "PROGRESS.md".into(),
            updated_at: 2,
            done: 2,
            total: 4,
        });
        let after = snapshot_worker(&after_obs, Some(&before), 10);

        let bits = change_bits(Some(&before), &after);
        assert!(bits.contains(&"checklist 0/0→2/4".to_string()), "{bits:?}");
    }

    #[test]
    fn change_bits_for_new_and_unchanged_workers() {
        let snap = snapshot_worker(&obs("w", "sid-1"), None, 0);
        assert_eq!(change_bits(None, &snap), vec!["new".to_string()]);
        assert!(change_bits(Some(&snap), &snap).is_empty());
    }

    #[test]
    fn render_digest_has_expected_sections() {
        let snap = snapshot_worker(&obs("Worker A", "0123456789abcdef"), None, 0);
        let hash = digest_hash(&[("0123456789abcdef".into(), snap.state_hash.clone())]);
        let text = render_digest(&DigestInput {
            orchestration_id: "orch-1",
            name: "release",
            trigger: "manual",
            generated_at_iso: "2026-08-01T00:00:00Z".into(),
            workers: vec![("Worker A", "0123456789abcdef", &snap)],
            changes: vec![(0, vec!["new".into()])],
            digest_hash: &hash,
        });

        assert!(text.starts_with("ORCHESTRATION SYNC (manual)\n"));
        assert!(text.contains("id: orch-1"));
        assert!(text.contains("workers: 1/1 running"));
        assert!(text.contains(&format!("digestHash: {hash}")));
        assert!(text.contains("Changes since last digest:"));
        assert!(text.contains("- #1 Worker A (01234567): new"));
        assert!(text.contains("Worker states:"));
        assert!(text.contains("branch:orch/o1/w1"));
        assert!(text.contains("last: building"));
        assert!(text.contains("Do not interrupt workers unless asked."));
    }

    #[test]
    fn render_digest_none_when_no_changes() {
        let snap = snapshot_worker(&obs("w", "sid-1"), None, 0);
        let text = render_digest(&DigestInput {
            orchestration_id: "o",
            name: "n",
            trigger: "interval",
            generated_at_iso: "2026-08-01T00:00:00Z".into(),
            workers: vec![("w", "sid-1", &snap)],
            changes: vec![],
            digest_hash: "abc",
        });
        assert!(text.contains("Changes since last digest:\n- none"));
    }

    #[test]
    fn read_progress_counts_checkboxes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("PROGRESS.md"),
            "# Plan\n- [x] step one\n- [X] step two\n- [ ] step three\n- not a box\n",
        )
        .unwrap();

        let progress = read_progress(dir.path()).unwrap();
        assert_eq!(progress.rel_path, "PROGRESS.md");
        assert_eq!(progress.done, 2);
        assert_eq!(progress.total, 3);

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(read_progress(empty.path()), None);
    }
}
