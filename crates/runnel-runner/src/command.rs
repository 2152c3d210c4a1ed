use std::process::Stdio;

use runnel_core::{GatewayConfig, WorkspacePaths};
use tokio::process::Command;

/// A fully resolved CLI invocation: program plus argv, no shell.
///
/// The prompt is never part of argv; it is written to the child's
/// stdin by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl CliInvocation {
    /// Argv for a buffered run: core flags, permission flags, config
    /// file paths, optional `--resume`.
    pub fn buffered(
        config: &GatewayConfig,
        paths: &WorkspacePaths,
        agent: Option<&str>,
        resume: Option<&str>,
    ) -> Self {
        Self::build(config, paths, agent, resume, config.cli.core_args.clone())
    }

    /// Argv for a streaming run: identical except `--output-format
    /// json` is dropped so the CLI emits raw text as it goes.
    pub fn streaming(
        config: &GatewayConfig,
        paths: &WorkspacePaths,
        agent: Option<&str>,
        resume: Option<&str>,
    ) -> Self {
        let mut core = Vec::with_capacity(config.cli.core_args.len());
        let mut skip_value = false;
        for arg in &config.cli.core_args {
            if skip_value {
                skip_value = false;
                continue;
            }
            if arg == "--output-format" {
                skip_value = true;
                continue;
            }
            core.push(arg.clone());
        }
        Self::build(config, paths, agent, resume, core)
    }

    fn build(
        config: &GatewayConfig,
        paths: &WorkspacePaths,
        agent: Option<&str>,
        resume: Option<&str>,
        core_args: Vec<String>,
    ) -> Self {
        let settings = paths.settings_path(&config.cli.settings_path, agent);
        let mcp_config = paths.resolve_config_path(&config.cli.mcp_config_path);

        let mut args = core_args;
        args.extend(config.cli.permission_args.iter().cloned());
        args.push("--settings".to_string());
        args.push(settings.display().to_string());
        args.push("--mcp-config".to_string());
        args.push(mcp_config.display().to_string());
        if let Some(session_id) = resume {
            args.push("--resume".to_string());
            args.push(session_id.to_string());
        }

        Self {
            program: config.cli.bin.clone(),
            args,
        }
    }

    /// The tokio command: piped stdio, cwd at the workspace root.
    pub fn command(&self, paths: &WorkspacePaths) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(paths.root())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (GatewayConfig, WorkspacePaths) {
        (GatewayConfig::default(), WorkspacePaths::at("/ws"))
    }

    #[test]
    fn buffered_argv_matches_the_template() {
        let (config, paths) = fixture();
        let invocation = CliInvocation::buffered(&config, &paths, None, None);
        assert_eq!(invocation.program, "claude");
        assert_eq!(
            invocation.args,
            vec![
                "-p",
                "--output-format",
                "json",
                "--dangerously-skip-permissions",
                "--settings",
                "/ws/.claude/settings.json",
                "--mcp-config",
                "/ws/.mcp.json",
            ]
        );
    }

    #[test]
    fn agent_swaps_in_the_per_agent_settings_file() {
        let (config, paths) = fixture();
        let invocation = CliInvocation::buffered(&config, &paths, Some("news"), None);
        let settings_pos = invocation
            .args
            .iter()
            .position(|a| a == "--settings")
            .expect("--settings present");
        assert_eq!(
            invocation.args[settings_pos + 1],
            "/ws/.claude/settings_news.json"
        );
    }

    #[test]
    fn resume_appends_the_session_flag() {
        let (config, paths) = fixture();
        let invocation = CliInvocation::buffered(&config, &paths, None, Some("sess-1"));
        let tail = &invocation.args[invocation.args.len() - 2..];
        assert_eq!(tail, ["--resume", "sess-1"]);
    }

    #[test]
    fn streaming_drops_the_output_format_pair() {
        let (config, paths) = fixture();
        let invocation = CliInvocation::streaming(&config, &paths, None, Some("sess-1"));
        assert!(!invocation.args.contains(&"--output-format".to_string()));
        assert!(!invocation.args.contains(&"json".to_string()));
        assert!(invocation.args.contains(&"-p".to_string()));
        assert!(invocation.args.contains(&"--resume".to_string()));
    }
}
