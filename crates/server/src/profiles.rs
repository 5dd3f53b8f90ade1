//! Tool launch profiles.
//!
//! A profile names the binary, base args, and extra env for one way of
//! launching a tool. Binaries can be overridden per tool via
//! `FYP_CODEX_BIN` / `FYP_CLAUDE_BIN` / `FYP_OPENCODE_BIN`.

use flypad_protocol::Tool;

/// Claude credential handling mode, from `FYP_CLAUDE_AUTH_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaudeAuthMode {
    /// Keep `ANTHROPIC_API_KEY` in the child env.
    Api,
    /// Strip `ANTHROPIC_API_KEY` so the CLI uses its own login.
    Subscription,
}

impl ClaudeAuthMode {
    pub fn from_env() -> Self {
        match std::env::var("FYP_CLAUDE_AUTH_MODE").as_deref() {
            Ok("api") => ClaudeAuthMode::Api,
            _ => ClaudeAuthMode::Subscription,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolProfile {
    pub id: String,
    pub tool: Tool,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Default profile id for a tool.
pub fn default_profile_id(tool: Tool) -> String {
    format!("{}-default", tool.as_str())
}

/// Resolve a profile. Unknown ids fall back to the tool default so a
/// stale preset never blocks session creation.
pub fn resolve(tool: Tool, profile_id: Option<&str>) -> ToolProfile {
    let id = profile_id
        .map(|p| p.to_string())
        .unwrap_or_else(|| default_profile_id(tool));

    let bin_env = match tool {
        Tool::Codex => "FYP_CODEX_BIN",
        Tool::Claude => "FYP_CLAUDE_BIN",
        Tool::Opencode => "FYP_OPENCODE_BIN",
    };
    let bin = std::env::var(bin_env).unwrap_or_else(|_| tool.as_str().to_string());

    ToolProfile {
        id,
        tool,
        argv: vec![bin],
        env: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_names_follow_tool() {
        assert_eq!(default_profile_id(Tool::Codex), "codex-default");
        assert_eq!(default_profile_id(Tool::Opencode), "opencode-default");
    }

    #[test]
    fn resolve_falls_back_to_tool_binary() {
        let profile = resolve(Tool::Claude, Some("claude-custom"));
        assert_eq!(profile.id, "claude-custom");
        assert_eq!(profile.argv[0], "claude");
    }
}
