//! Agent CLI invocation: serialize agent options into the flag surface
//! of the CLI, always requesting streamed JSON on stdin and stdout.

use std::collections::BTreeMap;

pub const DEFAULT_CLI: &str = "claude";
/// Shared budget for the attach-frame decoder and the JSON parser.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Options for one agent turn, rendered into CLI flags by
/// [`AgentOptions::build_command`].
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub cli_path: Option<String>,
    /// Replaces the CLI's built-in system prompt entirely.
    pub system_prompt: Option<String>,
    /// Appended to the CLI's built-in system prompt.
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub model: Option<String>,
    pub permission_prompt_tool: Option<String>,
    pub permission_mode: Option<String>,
    pub continue_conversation: bool,
    pub resume_session_id: Option<String>,
    pub fork_session: bool,
    pub settings_file: Option<String>,
    pub add_dirs: Vec<String>,
    /// MCP server table, passed verbatim as `--mcp-config` JSON.
    pub mcp_servers: BTreeMap<String, serde_json::Value>,
    pub include_partial_messages: bool,
    pub max_thinking_tokens: Option<u32>,
    pub setting_sources: Option<Vec<String>>,
    /// Arbitrary extra flags; `None` renders a bare flag.
    pub extra_args: BTreeMap<String, Option<String>>,
    pub max_buffer_size: Option<usize>,
}

impl AgentOptions {
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size.unwrap_or(DEFAULT_MAX_BUFFER_SIZE)
    }

    pub fn build_argv(&self) -> Vec<String> {
        let mut argv = vec![
            self.cli_path.clone().unwrap_or_else(|| DEFAULT_CLI.into()),
            "--print".into(),
            "--verbose".into(),
            "--output-format".into(),
            "stream-json".into(),
        ];

        if let Some(prompt) = &self.system_prompt {
            argv.push("--system-prompt".into());
            argv.push(prompt.clone());
        } else if let Some(append) = &self.append_system_prompt {
            argv.push("--append-system-prompt".into());
            argv.push(append.clone());
        }

        if !self.allowed_tools.is_empty() {
            argv.push("--allowedTools".into());
            argv.push(self.allowed_tools.join(","));
        }
        if !self.disallowed_tools.is_empty() {
            argv.push("--disallowedTools".into());
            argv.push(self.disallowed_tools.join(","));
        }
        if let Some(turns) = self.max_turns {
            argv.push("--max-turns".into());
            argv.push(turns.to_string());
        }
        if let Some(model) = &self.model {
            argv.push("--model".into());
            argv.push(model.clone());
        }
        if let Some(tool) = &self.permission_prompt_tool {
            argv.push("--permission-prompt-tool".into());
            argv.push(tool.clone());
        }
        if let Some(mode) = &self.permission_mode {
            argv.push("--permission-mode".into());
            argv.push(mode.clone());
        }
        if self.continue_conversation {
            argv.push("--continue".into());
        }
        if let Some(session) = &self.resume_session_id {
            argv.push("--resume".into());
            argv.push(session.clone());
        }
        if self.fork_session {
            argv.push("--fork-session".into());
        }
        if let Some(settings) = &self.settings_file {
            argv.push("--settings".into());
            argv.push(settings.clone());
        }
        for dir in &self.add_dirs {
            argv.push("--add-dir".into());
            argv.push(dir.clone());
        }
        if !self.mcp_servers.is_empty() {
            let config = serde_json::json!({ "mcpServers": self.mcp_servers });
            argv.push("--mcp-config".into());
            argv.push(config.to_string());
        }
        if self.include_partial_messages {
            argv.push("--include-partial-messages".into());
        }
        if let Some(budget) = self.max_thinking_tokens {
            argv.push("--max-thinking-tokens".into());
            argv.push(budget.to_string());
        }
        if let Some(sources) = &self.setting_sources {
            argv.push("--setting-sources".into());
            argv.push(sources.join(","));
        }
        for (flag, value) in &self.extra_args {
            argv.push(format!("--{flag}"));
            if let Some(value) = value {
                argv.push(value.clone());
            }
        }

        argv.push("--input-format".into());
        argv.push("stream-json".into());
        argv
    }

    /// Shell-quoted command line for `bash -c` inside the sandbox.
    pub fn build_command(&self) -> String {
        shell_words::join(self.build_argv())
    }

    /// The single prompt message written to the CLI's stdin.
    pub fn stdin_message(prompt: &str) -> String {
        let message = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
        });
        format!("{message}\n")
    }
}
