//! Codex tool-session linker.
//!
//! After a Codex session spawns, the CLI writes a rollout log under
//! `~/.codex/sessions/**/rollout-*-<uuid>.jsonl`. We watch that tree for
//! a short window and link the first file whose `session_meta` line has
//! a matching cwd and whose mtime is at or after the spawn time — the
//! mtime gate rejects logs left over from earlier sessions in the same
//! directory.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::store::Store;

/// How long after spawn we keep looking for the rollout file.
const LINK_WINDOW: Duration = Duration::from_secs(6);

pub fn spawn_codex_linker(store: Arc<Store>, session_id: String, cwd: String, spawn_time_ms: i64) {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let sessions_dir = PathBuf::from(home).join(".codex/sessions");
    tokio::spawn(async move {
        run_linker(sessions_dir, store, session_id, cwd, spawn_time_ms).await;
    });
}

async fn run_linker(
    sessions_dir: PathBuf,
    store: Arc<Store>,
    session_id: String,
    cwd: String,
    spawn_time_ms: i64,
) {
    if !sessions_dir.exists() {
        debug!(
            component = "linker",
            event = "linker.sessions_dir_missing",
            path = %sessions_dir.display(),
            "Codex sessions directory missing, skipping link"
        );
        return;
    }

    // Filesystems truncate mtimes to whole seconds; compare against the
    // spawn second so a file written in the same second still links.
    let spawn_floor_ms = spawn_time_ms - spawn_time_ms.rem_euclid(1000);

    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
    let watcher_tx = tx.clone();
    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                for path in event.paths {
                    let _ = watcher_tx.send(path);
                }
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(
                component = "linker",
                event = "linker.watch_failed",
                error = %e,
                "Failed to create rollout watcher"
            );
            return;
        }
    };
    if let Err(e) = watcher.watch(&sessions_dir, RecursiveMode::Recursive) {
        warn!(
            component = "linker",
            event = "linker.watch_failed",
            error = %e,
            "Failed to watch Codex sessions directory"
        );
        return;
    }

    // Seed with files that appeared between spawn and watch start.
    for path in collect_jsonl_files(&sessions_dir) {
        if try_link(&store, &session_id, &cwd, spawn_floor_ms, &path) {
            return;
        }
    }

    let deadline = Instant::now() + LINK_WINDOW;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(path)) => {
                if try_link(&store, &session_id, &cwd, spawn_floor_ms, &path) {
                    return;
                }
            }
            Ok(None) => break,
            Err(_) => break, // window elapsed
        }
    }

    debug!(
        component = "linker",
        event = "linker.window_elapsed",
        session_id = %session_id,
        "No matching rollout file within the link window"
    );
}

fn collect_jsonl_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                files.push(path);
            }
        }
    }
    files
}

fn try_link(
    store: &Store,
    session_id: &str,
    cwd: &str,
    spawn_floor_ms: i64,
    path: &Path,
) -> bool {
    let Some(tool_session_id) = match_rollout_file(path, cwd, spawn_floor_ms) else {
        return false;
    };

    if let Err(e) = store.set_tool_session_id(session_id, &tool_session_id) {
        warn!(
            component = "linker",
            event = "linker.store_failed",
            session_id = %session_id,
            error = %e,
            "Failed to persist tool session id"
        );
        return false;
    }
    let _ = store.append_event(
        session_id,
        "session.tool_link",
        &serde_json::json!({
            "toolSessionId": tool_session_id,
            "rolloutPath": path.to_string_lossy(),
        }),
    );
    info!(
        component = "linker",
        event = "linker.linked",
        session_id = %session_id,
        tool_session_id = %tool_session_id,
        "Linked Codex rollout session"
    );
    true
}

/// Check one candidate rollout file: name shape, mtime recency, and the
/// `session_meta` first line. Returns the embedded session uuid.
pub fn match_rollout_file(path: &Path, cwd: &str, spawn_floor_ms: i64) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if !name.starts_with("rollout-") || !name.ends_with(".jsonl") {
        return None;
    }
    let uuid = extract_rollout_uuid(name)?;

    let metadata = std::fs::metadata(path).ok()?;
    let mtime_ms = metadata
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_millis() as i64;
    if mtime_ms < spawn_floor_ms {
        return None; // pre-existing session log
    }

    let file = File::open(path).ok()?;
    let mut first_line = String::new();
    BufReader::new(file).read_line(&mut first_line).ok()?;
    let json: Value = serde_json::from_str(first_line.trim()).ok()?;
    if json.get("type").and_then(|t| t.as_str()) != Some("session_meta") {
        return None;
    }
    let meta_cwd = json
        .get("payload")
        .and_then(|p| p.get("cwd"))
        .and_then(|c| c.as_str())?;
    if meta_cwd != cwd {
        return None;
    }

    Some(uuid)
}

/// `rollout-2026-01-02T03-04-05-<uuid>.jsonl` → `<uuid>`.
fn extract_rollout_uuid(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".jsonl")?;
    if stem.len() < 36 {
        return None;
    }
    let candidate = &stem[stem.len() - 36..];
    uuid::Uuid::parse_str(candidate).ok()?;
    Some(candidate.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const UUID: &str = "0192f3a4-5b6c-7d8e-9f00-112233445566";

    fn write_rollout(dir: &Path, cwd: &str) -> PathBuf {
        let path = dir.join(format!("rollout-2026-01-02T03-04-05-{UUID}.jsonl"));
        let mut f = File::create(&path).unwrap();
        writeln!(
            f,
            "{}",
            serde_json::json!({"type": "session_meta", "payload": {"id": UUID, "cwd": cwd}})
        )
        .unwrap();
        path
    }

    #[test]
    fn matches_fresh_file_with_matching_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rollout(dir.path(), "/tmp/repo");
        // spawn "before" the file was written
        let spawn_floor = 0;
        assert_eq!(
            match_rollout_file(&path, "/tmp/repo", spawn_floor),
            Some(UUID.to_string())
        );
    }

    #[test]
    fn rejects_preexisting_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rollout(dir.path(), "/tmp/repo");
        // spawn far in the future relative to the file mtime
        let spawn_floor = crate::store::now_ms() + 3_600_000;
        assert_eq!(match_rollout_file(&path, "/tmp/repo", spawn_floor), None);
    }

    #[test]
    fn rejects_cwd_mismatch_and_bad_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rollout(dir.path(), "/tmp/other");
        assert_eq!(match_rollout_file(&path, "/tmp/repo", 0), None);

        let bad = dir.path().join("notes.jsonl");
        std::fs::write(&bad, "{}").unwrap();
        assert_eq!(match_rollout_file(&bad, "/tmp/repo", 0), None);
    }

    #[test]
    fn rejects_non_meta_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join(format!("rollout-2026-01-02T03-04-05-{UUID}.jsonl"));
        std::fs::write(&path, "{\"type\":\"turn\",\"payload\":{}}\n").unwrap();
        assert_eq!(match_rollout_file(&path, "/tmp/repo", 0), None);
    }

    #[test]
    fn extracts_uuid_from_filename() {
        assert_eq!(
            extract_rollout_uuid(&format!("rollout-2026-01-02T03-04-05-{UUID}.jsonl")),
            Some(UUID.to_string())
        );
        assert_eq!(extract_rollout_uuid("rollout-short.jsonl"), None);
    }
}
