//! SQLite-backed store.
//!
//! Single process-wide connection behind a mutex; multi-statement
//! mutations (session delete, attention create-or-touch, pinned-slot
//! moves) run inside transactions. Callers on async paths keep these
//! calls short — every method is a handful of indexed statements.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

use flypad_protocol::{
    AttentionItem, AttentionSeverity, AttentionStatus, EventRecord, OutputRecord, SessionExit,
    SessionRecord, Tool, WorkspacePreset,
};

use crate::migration_runner;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session_already_exists")]
    SessionExists,

    #[error("unknown_session")]
    UnknownSession,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Filter for open attention listing.
pub enum AttentionFilter {
    Session(String),
    WorkspaceKey(String),
    Cwd(String),
    Global,
}

pub enum CreateAttentionOutcome {
    Created(i64),
    /// An open item with the same signature existed and was touched.
    Duplicate { existing_id: i64 },
}

pub struct Store {
    conn: Mutex<Connection>,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut conn = Connection::open(path)?;
        migration_runner::run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration_runner::run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn create_session(&self, rec: &SessionRecord) -> Result<(), StoreError> {
        let conn = self.conn();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                params![rec.id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::SessionExists);
        }

        conn.execute(
            "INSERT INTO sessions (id, tool, profile_id, tool_session_id, cwd, workspace_key, workspace_root, tree_path, label, pinned_slot, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                rec.id,
                rec.tool.as_str(),
                rec.profile_id,
                rec.tool_session_id,
                rec.cwd,
                rec.workspace_key,
                rec.workspace_root,
                rec.tree_path,
                rec.label,
                rec.pinned_slot,
                rec.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, tool, profile_id, tool_session_id, cwd, workspace_key, workspace_root,
                        tree_path, label, pinned_slot, created_at, updated_at, exit_code, exit_signal
                 FROM sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, tool, profile_id, tool_session_id, cwd, workspace_key, workspace_root,
                    tree_path, label, pinned_slot, created_at, updated_at, exit_code, exit_signal
             FROM sessions ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], session_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn set_tool_session_id(&self, id: &str, tool_session_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE sessions SET tool_session_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, tool_session_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn set_session_exit(&self, id: &str, exit: SessionExit) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE sessions SET exit_code = ?2, exit_signal = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, exit.code, exit.signal, now_ms()],
        )?;
        Ok(())
    }

    pub fn set_session_label(&self, id: &str, label: Option<&str>) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE sessions SET label = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, label, now_ms()],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownSession);
        }
        Ok(())
    }

    /// Assign a pinned slot, clearing any other session holding the same
    /// slot in the same workspace (falling back to same-cwd scoping when
    /// the session has no workspace key).
    pub fn set_pinned_slot(&self, id: &str, slot: Option<i64>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let scope: Option<(Option<String>, String)> = tx
            .query_row(
                "SELECT workspace_key, cwd FROM sessions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((workspace_key, cwd)) = scope else {
            return Err(StoreError::UnknownSession);
        };

        if let Some(slot) = slot {
            match &workspace_key {
                Some(key) => {
                    tx.execute(
                        "UPDATE sessions SET pinned_slot = NULL
                         WHERE workspace_key = ?1 AND pinned_slot = ?2 AND id != ?3",
                        params![key, slot, id],
                    )?;
                }
                None => {
                    tx.execute(
                        "UPDATE sessions SET pinned_slot = NULL
                         WHERE workspace_key IS NULL AND cwd = ?1 AND pinned_slot = ?2 AND id != ?3",
                        params![cwd, slot, id],
                    )?;
                }
            }
        }

        tx.execute(
            "UPDATE sessions SET pinned_slot = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, slot, now_ms()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Cascade-delete a session and everything hanging off it, in one
    /// transaction: attention actions, attention items, events, output,
    /// then the session row itself.
    pub fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM attention_actions WHERE session_id = ?1",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM attention_items WHERE session_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM events WHERE session_id = ?1", params![id])?;
        tx.execute("DELETE FROM output WHERE session_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        if changed == 0 {
            return Err(StoreError::UnknownSession);
        }
        Ok(())
    }

    /// Distinct project roots of known sessions, most recent activity first.
    pub fn recent_projects(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT COALESCE(workspace_root, cwd) AS root, MAX(updated_at) AS last
             FROM sessions GROUP BY root ORDER BY last DESC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ── Events ────────────────────────────────────────────────────────

    pub fn append_event(
        &self,
        session_id: &str,
        kind: &str,
        data: &Value,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO events (session_id, ts, kind, data) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, now_ms(), kind, data.to_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_events(
        &self,
        session_id: &str,
        after_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, ts, kind, data FROM events
             WHERE session_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![session_id, after_id.unwrap_or(0), limit],
                |row| {
                    let data: String = row.get(4)?;
                    Ok(EventRecord {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        ts: row.get(2)?,
                        kind: row.get(3)?,
                        data: serde_json::from_str(&data).unwrap_or(Value::Null),
                    })
                },
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Most recent event whose kind is in `exact` or starts with one of
    /// `prefixes`. Generic runtime events never reach digests through this.
    pub fn last_event_matching(
        &self,
        session_id: &str,
        exact: &[&str],
        prefixes: &[&str],
    ) -> Result<Option<(i64, String, i64)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, kind, ts FROM events WHERE session_id = ?1 ORDER BY id DESC LIMIT 200",
        )?;
        let rows: Vec<(i64, String, i64)> = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows.into_iter().find(|(_, kind, _)| {
            exact.contains(&kind.as_str()) || prefixes.iter().any(|p| kind.starts_with(p))
        }))
    }

    // ── Output ────────────────────────────────────────────────────────

    pub fn append_output(&self, session_id: &str, chunk: &str) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO output (session_id, ts, chunk) VALUES (?1, ?2, ?3)",
            params![session_id, now_ms(), chunk],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Page backwards through the transcript (newest first).
    pub fn list_output(
        &self,
        session_id: &str,
        before_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<OutputRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, ts, chunk FROM output
             WHERE session_id = ?1 AND id < ?2 ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![session_id, before_id.unwrap_or(i64::MAX), limit],
                |row| {
                    Ok(OutputRecord {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        ts: row.get(2)?,
                        chunk: row.get(3)?,
                    })
                },
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Latest output timestamp and a cleaned tail of recent chunks.
    pub fn output_preview(
        &self,
        session_id: &str,
        max_chars: usize,
    ) -> Result<Option<(String, i64)>, StoreError> {
        let rows = self.list_output(session_id, None, 5)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let ts = rows[0].ts;
        let mut merged = String::new();
        for row in rows.iter().rev() {
            merged.push_str(&row.chunk);
        }
        let cleaned = clean_preview(&merged, max_chars);
        if cleaned.is_empty() {
            return Ok(None);
        }
        Ok(Some((cleaned, ts)))
    }

    // ── Attention ─────────────────────────────────────────────────────

    /// Create an attention item, or touch the existing open item with the
    /// same signature (update title/body/options/updated_at, force status
    /// back to `open`).
    #[allow(clippy::too_many_arguments)]
    pub fn create_or_touch_attention(
        &self,
        session_id: &str,
        kind: &str,
        severity: AttentionSeverity,
        title: &str,
        body: &str,
        signature: &str,
        options: &[flypad_protocol::AttentionOption],
    ) -> Result<CreateAttentionOutcome, StoreError> {
        let options_json = serde_json::to_string(options).unwrap_or_else(|_| "[]".into());
        let now = now_ms();

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM attention_items
                 WHERE signature = ?1 AND status IN ('open', 'sent') LIMIT 1",
                params![signature],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            Some(existing_id) => {
                tx.execute(
                    "UPDATE attention_items
                     SET title = ?2, body = ?3, options = ?4, updated_at = ?5, status = 'open'
                     WHERE id = ?1",
                    params![existing_id, title, body, options_json, now],
                )?;
                CreateAttentionOutcome::Duplicate { existing_id }
            }
            None => {
                tx.execute(
                    "INSERT INTO attention_items (session_id, ts, updated_at, status, kind, severity, title, body, signature, options)
                     VALUES (?1, ?2, ?2, 'open', ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        session_id,
                        now,
                        kind,
                        severity.as_str(),
                        title,
                        body,
                        signature,
                        options_json
                    ],
                )?;
                CreateAttentionOutcome::Created(tx.last_insert_rowid())
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    pub fn get_attention(&self, id: i64) -> Result<Option<AttentionItem>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, session_id, ts, updated_at, status, kind, severity, title, body, signature, options
                 FROM attention_items WHERE id = ?1",
                params![id],
                attention_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_open_attention(
        &self,
        filter: &AttentionFilter,
        limit: u32,
    ) -> Result<Vec<AttentionItem>, StoreError> {
        let conn = self.conn();
        let base = "SELECT a.id, a.session_id, a.ts, a.updated_at, a.status, a.kind, a.severity, a.title, a.body, a.signature, a.options
             FROM attention_items a";
        let (sql, param): (String, Option<String>) = match filter {
            AttentionFilter::Session(sid) => (
                format!(
                    "{base} WHERE a.status IN ('open','sent') AND a.session_id = ?1
                     ORDER BY a.updated_at DESC LIMIT {limit}"
                ),
                Some(sid.clone()),
            ),
            AttentionFilter::WorkspaceKey(key) => (
                format!(
                    "{base} JOIN sessions s ON s.id = a.session_id
                     WHERE a.status IN ('open','sent') AND s.workspace_key = ?1
                     ORDER BY a.updated_at DESC LIMIT {limit}"
                ),
                Some(key.clone()),
            ),
            AttentionFilter::Cwd(cwd) => (
                format!(
                    "{base} JOIN sessions s ON s.id = a.session_id
                     WHERE a.status IN ('open','sent') AND s.cwd = ?1
                     ORDER BY a.updated_at DESC LIMIT {limit}"
                ),
                Some(cwd.clone()),
            ),
            AttentionFilter::Global => (
                format!(
                    "{base} WHERE a.status IN ('open','sent')
                     ORDER BY a.updated_at DESC LIMIT {limit}"
                ),
                None,
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = match param {
            Some(p) => stmt
                .query_map(params![p], attention_from_row)?
                .filter_map(|r| r.ok())
                .collect(),
            None => stmt
                .query_map([], attention_from_row)?
                .filter_map(|r| r.ok())
                .collect(),
        };
        Ok(rows)
    }

    pub fn set_attention_status(
        &self,
        id: i64,
        status: AttentionStatus,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE attention_items SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_ms()],
        )?;
        Ok(())
    }

    pub fn append_attention_action(
        &self,
        attention_id: i64,
        session_id: &str,
        action: &str,
        data: &Value,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO attention_actions (attention_id, session_id, ts, action, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![attention_id, session_id, now_ms(), action, data.to_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Open counts per session, for badge rendering.
    pub fn attention_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT session_id, COUNT(*) FROM attention_items
             WHERE status IN ('open','sent') GROUP BY session_id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn open_attention_count(&self, session_id: &str) -> Result<u32, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM attention_items
             WHERE session_id = ?1 AND status IN ('open','sent')",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u32)
    }

    // ── Workspace presets ─────────────────────────────────────────────

    pub fn get_preset(&self, path: &str, tool: Tool) -> Result<Option<WorkspacePreset>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT path, tool, profile_id, overrides, updated_at
                 FROM workspace_presets WHERE path = ?1 AND tool = ?2",
                params![path, tool.as_str()],
                preset_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_preset(
        &self,
        path: &str,
        tool: Tool,
        profile_id: &str,
        overrides: &Value,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO workspace_presets (path, tool, profile_id, overrides, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path, tool) DO UPDATE SET
               profile_id = ?3, overrides = ?4, updated_at = ?5",
            params![path, tool.as_str(), profile_id, overrides.to_string(), now_ms()],
        )?;
        Ok(())
    }

    pub fn list_presets(&self) -> Result<Vec<WorkspacePreset>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT path, tool, profile_id, overrides, updated_at
             FROM workspace_presets ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map([], preset_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ── Idempotency ───────────────────────────────────────────────────

    pub fn get_idempotent(
        &self,
        orchestration_id: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let conn = self.conn();
        let row: Option<String> = conn
            .query_row(
                "SELECT response FROM idempotency WHERE orchestration_id = ?1 AND key = ?2",
                params![orchestration_id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.and_then(|r| serde_json::from_str(&r).ok()))
    }

    pub fn put_idempotent(
        &self,
        orchestration_id: &str,
        key: &str,
        command_id: &str,
        payload_hash: &str,
        response: &Value,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO idempotency (orchestration_id, key, command_id, payload_hash, response, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                orchestration_id,
                key,
                command_id,
                payload_hash,
                response.to_string(),
                now_ms()
            ],
        )?;
        Ok(())
    }

    // ── Orchestrations ────────────────────────────────────────────────

    pub fn save_orchestration(
        &self,
        id: &str,
        status: &str,
        data: &Value,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        self.conn().execute(
            "INSERT INTO orchestrations (id, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET status = ?2, data = ?3, updated_at = ?4",
            params![id, status, data.to_string(), now],
        )?;
        Ok(())
    }

    pub fn load_orchestrations(&self) -> Result<Vec<(String, String, Value)>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, status, data FROM orchestrations ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map([], |row| {
                let data: String = row.get(2)?;
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    serde_json::from_str(&data).unwrap_or(Value::Null),
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let tool: String = row.get(1)?;
    let exit_code: Option<i32> = row.get(12)?;
    let exit_signal: Option<i32> = row.get(13)?;
    let exit = if exit_code.is_some() || exit_signal.is_some() {
        Some(SessionExit {
            code: exit_code,
            signal: exit_signal,
        })
    } else {
        None
    };
    Ok(SessionRecord {
        id: row.get(0)?,
        tool: Tool::parse(&tool).unwrap_or(Tool::Codex),
        profile_id: row.get(2)?,
        tool_session_id: row.get(3)?,
        cwd: row.get(4)?,
        workspace_key: row.get(5)?,
        workspace_root: row.get(6)?,
        tree_path: row.get(7)?,
        label: row.get(8)?,
        pinned_slot: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        exit,
    })
}

fn attention_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttentionItem> {
    let status: String = row.get(4)?;
    let severity: String = row.get(6)?;
    let options: String = row.get(10)?;
    Ok(AttentionItem {
        id: row.get(0)?,
        session_id: row.get(1)?,
        ts: row.get(2)?,
        updated_at: row.get(3)?,
        status: AttentionStatus::parse(&status).unwrap_or(AttentionStatus::Open),
        kind: row.get(5)?,
        severity: AttentionSeverity::parse(&severity).unwrap_or(AttentionSeverity::Info),
        title: row.get(7)?,
        body: row.get(8)?,
        signature: row.get(9)?,
        options: serde_json::from_str(&options).unwrap_or_default(),
    })
}

fn preset_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspacePreset> {
    let tool: String = row.get(1)?;
    let overrides: String = row.get(3)?;
    Ok(WorkspacePreset {
        path: row.get(0)?,
        tool: Tool::parse(&tool).unwrap_or(Tool::Codex),
        profile_id: row.get(2)?,
        overrides: serde_json::from_str(&overrides).unwrap_or(Value::Null),
        updated_at: row.get(4)?,
    })
}

/// Strip ANSI escape sequences and control characters, then keep the
/// last `max_chars` of what remains.
pub fn clean_preview(raw: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(raw.len().min(max_chars * 2));
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            // CSI / OSC sequences: skip to the final byte
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\u{7}' {
                            break;
                        }
                        if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {
                    chars.next();
                }
            }
            continue;
        }
        if c == '\r' {
            continue;
        }
        if c.is_control() && c != '\n' {
            continue;
        }
        out.push(c);
    }

    // Collapse blank runs and trim
    let lines: Vec<&str> = out
        .lines()
        .map(|l| l.trim_end())
        .filter(|l| !l.is_empty())
        .collect();
    let joined = lines.join(" · ");
    let trimmed = joined.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let skip = trimmed.chars().count() - max_chars;
    trimmed.chars().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flypad_protocol::AttentionOption;
    use serde_json::json;

    fn sample_session(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            tool: Tool::Codex,
            profile_id: "codex-default".into(),
            tool_session_id: None,
            cwd: "/tmp/project".into(),
            workspace_key: Some("wsk-1".into()),
            workspace_root: Some("/tmp/project".into()),
            tree_path: None,
            label: None,
            pinned_slot: None,
            created_at: now_ms(),
            updated_at: now_ms(),
            exit: None,
        }
    }

    #[test]
    fn create_session_rejects_duplicate_id() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&sample_session("s1")).unwrap();
        let err = store.create_session(&sample_session("s1")).unwrap_err();
        assert!(matches!(err, StoreError::SessionExists));
    }

    #[test]
    fn delete_session_cascades_all_rows() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&sample_session("s1")).unwrap();
        store.append_event("s1", "input", &json!({"data": "hi"})).unwrap();
        store.append_output("s1", "hello").unwrap();
        let outcome = store
            .create_or_touch_attention(
                "s1",
                "question",
                AttentionSeverity::Info,
                "Q",
                "body",
                "sig-1",
                &[],
            )
            .unwrap();
        let id = match outcome {
            CreateAttentionOutcome::Created(id) => id,
            _ => panic!("expected created"),
        };
        store
            .append_attention_action(id, "s1", "respond", &json!({}))
            .unwrap();

        store.delete_session("s1").unwrap();
        assert!(store.get_session("s1").unwrap().is_none());
        assert!(store.list_events("s1", None, 10).unwrap().is_empty());
        assert!(store.list_output("s1", None, 10).unwrap().is_empty());
        assert!(store.get_attention(id).unwrap().is_none());
    }

    #[test]
    fn attention_dedupe_touches_existing_open_item() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&sample_session("s1")).unwrap();

        let first = store
            .create_or_touch_attention(
                "s1",
                "permission",
                AttentionSeverity::Warn,
                "Allow?",
                "first body",
                "sig-x",
                &[AttentionOption {
                    id: "y".into(),
                    label: "Yes".into(),
                    send: "y\r".into(),
                }],
            )
            .unwrap();
        let first_id = match first {
            CreateAttentionOutcome::Created(id) => id,
            _ => panic!("expected created"),
        };

        let second = store
            .create_or_touch_attention(
                "s1",
                "permission",
                AttentionSeverity::Warn,
                "Allow? (updated)",
                "second body",
                "sig-x",
                &[],
            )
            .unwrap();
        match second {
            CreateAttentionOutcome::Duplicate { existing_id } => {
                assert_eq!(existing_id, first_id)
            }
            _ => panic!("expected duplicate"),
        }

        let item = store.get_attention(first_id).unwrap().unwrap();
        assert_eq!(item.title, "Allow? (updated)");
        assert_eq!(item.body, "second body");
        assert_eq!(item.status, AttentionStatus::Open);

        // Resolved items don't coalesce — a new row is created
        store
            .set_attention_status(first_id, AttentionStatus::Resolved)
            .unwrap();
        let third = store
            .create_or_touch_attention(
                "s1",
                "permission",
                AttentionSeverity::Warn,
                "Allow again?",
                "",
                "sig-x",
                &[],
            )
            .unwrap();
        assert!(matches!(third, CreateAttentionOutcome::Created(_)));
    }

    #[test]
    fn pinned_slot_conflicts_are_cleared() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&sample_session("s1")).unwrap();
        store.create_session(&sample_session("s2")).unwrap();

        store.set_pinned_slot("s1", Some(3)).unwrap();
        store.set_pinned_slot("s2", Some(3)).unwrap();

        assert_eq!(store.get_session("s1").unwrap().unwrap().pinned_slot, None);
        assert_eq!(
            store.get_session("s2").unwrap().unwrap().pinned_slot,
            Some(3)
        );
    }

    #[test]
    fn idempotency_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let response = json!({"ok": true, "count": {"sent": 1}});
        store
            .put_idempotent("orch-1", "k1", "diag-evidence", "abc123", &response)
            .unwrap();
        let loaded = store.get_idempotent("orch-1", "k1").unwrap().unwrap();
        assert_eq!(loaded, response);

        // Same key, different orchestration: independent
        assert!(store.get_idempotent("orch-2", "k1").unwrap().is_none());

        // First write wins
        store
            .put_idempotent("orch-1", "k1", "diag-evidence", "abc123", &json!({"ok": false}))
            .unwrap();
        assert_eq!(store.get_idempotent("orch-1", "k1").unwrap().unwrap(), response);
    }

    #[test]
    fn last_event_matching_skips_generic_kinds() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&sample_session("s1")).unwrap();
        store.append_event("s1", "inbox.respond", &json!({})).unwrap();
        store.append_event("s1", "input", &json!({})).unwrap();
        store
            .append_event("s1", "codex.native.approval.exec", &json!({}))
            .unwrap();
        store.append_event("s1", "session.meta", &json!({})).unwrap();

        let (_, kind, _) = store
            .last_event_matching(
                "s1",
                &["inbox.respond", "session.exit"],
                &["codex.native.approval."],
            )
            .unwrap()
            .unwrap();
        assert_eq!(kind, "codex.native.approval.exec");
    }

    #[test]
    fn clean_preview_strips_ansi_and_caps() {
        let raw = "\u{1b}[31mred\u{1b}[0m line\r\nnext line\n\n";
        let cleaned = clean_preview(raw, 220);
        assert_eq!(cleaned, "red line · next line");

        let long = "x".repeat(500);
        assert_eq!(clean_preview(&long, 220).chars().count(), 220);
    }
}
