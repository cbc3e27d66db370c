//! Tools the agent can call, confined to the session's working directory

pub mod glob;
pub mod grep;
pub mod guard;
pub mod list;
pub mod read;
pub mod replace;
pub mod shell;
pub mod write;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::path::{Component, Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use termpilot_agent::{ApprovalGate, ToolResult, Toolbox};
use termpilot_ai::{ToolCallRequest, ToolDefinition};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::process::ProcessRunner;

/// Directories never descended into by the filesystem walk
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target"];
const MAX_WALK_FILES: usize = 20_000;

/// A parsed tool call
#[derive(Debug, Clone)]
pub enum ToolInvocation {
    ListDirectory(list::Args),
    GlobSearch(glob::Args),
    GrepSearch(grep::Args),
    RunShellCommand(shell::Args),
    ReadFile(read::Args),
    WriteFile(write::Args),
    ReplaceInFile(replace::Args),
}

impl ToolInvocation {
    pub fn parse(name: &str, arguments: serde_json::Value) -> Result<Self, String> {
        fn args<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, String> {
            serde_json::from_value(value).map_err(|e| format!("Invalid arguments: {}", e))
        }

        match name {
            list::NAME => Ok(Self::ListDirectory(args(arguments)?)),
            glob::NAME => Ok(Self::GlobSearch(args(arguments)?)),
            grep::NAME => Ok(Self::GrepSearch(args(arguments)?)),
            shell::NAME => Ok(Self::RunShellCommand(args(arguments)?)),
            read::NAME => Ok(Self::ReadFile(args(arguments)?)),
            write::NAME => Ok(Self::WriteFile(args(arguments)?)),
            replace::NAME => Ok(Self::ReplaceInFile(args(arguments)?)),
            other => Err(format!("Tool not found: {}", other)),
        }
    }

    /// Whether the user must approve the call first
    pub fn requires_confirmation(&self) -> bool {
        match self {
            Self::ListDirectory(_) | Self::GlobSearch(_) | Self::GrepSearch(_) => false,
            Self::RunShellCommand(_)
            | Self::ReadFile(_)
            | Self::WriteFile(_)
            | Self::ReplaceInFile(_) => true,
        }
    }

    /// The path argument, `None` meaning the working directory
    fn path(&self) -> Option<&str> {
        match self {
            Self::ListDirectory(a) => a.path.as_deref(),
            Self::GlobSearch(a) => a.path.as_deref(),
            Self::GrepSearch(a) => a.path.as_deref(),
            Self::RunShellCommand(_) => None,
            Self::ReadFile(a) => Some(&a.path),
            Self::WriteFile(a) => Some(&a.path),
            Self::ReplaceInFile(a) => Some(&a.path),
        }
    }

    /// What the user is asked to approve
    pub fn describe(&self) -> String {
        match self {
            Self::ListDirectory(a) => format!("List {}", a.path.as_deref().unwrap_or(".")),
            Self::GlobSearch(a) => format!("Find files matching {}", a.pattern),
            Self::GrepSearch(a) => format!("Search for {}", a.pattern),
            Self::RunShellCommand(a) => format!("Run `{}`", a.command),
            Self::ReadFile(a) => format!("Read {}", a.path),
            Self::WriteFile(a) => format!("Write {} bytes to {}", a.content.len(), a.path),
            Self::ReplaceInFile(a) => {
                format!("Edit {} ({} replacement(s))", a.path, a.expected_replacements)
            }
        }
    }
}

/// Definitions for every tool, read-only ones first
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        list::definition(),
        glob::definition(),
        grep::definition(),
        shell::definition(),
        read::definition(),
        write::definition(),
        replace::definition(),
    ]
}

/// Tools that run without confirmation
pub fn is_read_only(name: &str) -> bool {
    matches!(name, list::NAME | glob::NAME | grep::NAME)
}

/// The tool set bound to one terminal session
pub struct Sandbox {
    cwd: Arc<RwLock<PathBuf>>,
    gate: Arc<ApprovalGate>,
    runner: ProcessRunner,
}

impl Sandbox {
    pub fn new(cwd: impl Into<PathBuf>, gate: Arc<ApprovalGate>, runner: ProcessRunner) -> Self {
        Self {
            cwd: Arc::new(RwLock::new(cwd.into())),
            gate,
            runner,
        }
    }

    pub fn cwd(&self) -> PathBuf {
        self.cwd.read().clone()
    }

    /// Follow the shell into another directory
    pub fn set_cwd(&self, cwd: impl Into<PathBuf>) {
        let cwd = cwd.into();
        tracing::debug!(cwd = %cwd.display(), "sandbox working directory changed");
        *self.cwd.write() = cwd;
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    async fn dispatch(
        &self,
        invocation: &ToolInvocation,
        target: &Path,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> ToolResult {
        match invocation {
            ToolInvocation::ListDirectory(_) => list::execute(target, cwd).await,
            ToolInvocation::GlobSearch(args) => glob::execute(args, target, cwd, cancel).await,
            ToolInvocation::GrepSearch(args) => grep::execute(args, target, cwd, cancel).await,
            ToolInvocation::RunShellCommand(args) => {
                shell::execute(&self.runner, args, target, cancel).await
            }
            ToolInvocation::ReadFile(args) => read::execute(args, target).await,
            ToolInvocation::WriteFile(args) => write::execute(args, target).await,
            ToolInvocation::ReplaceInFile(args) => replace::execute(args, target).await,
        }
    }
}

#[async_trait]
impl Toolbox for Sandbox {
    fn definitions(&self) -> Vec<ToolDefinition> {
        definitions()
    }

    async fn execute(
        &self,
        call: &ToolCallRequest,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let invocation = match ToolInvocation::parse(&call.function.name, arguments) {
            Ok(invocation) => invocation,
            Err(message) => return ToolResult::error(message),
        };

        let cwd = self.cwd();
        let target = match guard::resolve(&cwd, invocation.path().unwrap_or(".")) {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!(tool = %call.function.name, error = %e, "path rejected");
                return ToolResult::error(e.to_string());
            }
        };

        if invocation.requires_confirmation() {
            let description = invocation.describe();
            let approved = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ToolResult::error("Cancelled"),
                approved = self.gate.request(&description) => approved,
            };
            if !approved {
                tracing::debug!(tool = %call.function.name, "declined by user");
                return ToolResult::text(format!("The user declined: {}", description));
            }
            if cancel.is_cancelled() {
                return ToolResult::error("Cancelled");
            }
        }

        tracing::debug!(tool = %call.function.name, target = %target.display(), "running tool");
        self.dispatch(&invocation, &target, &cwd, &cancel).await
    }
}

/// `path` relative to `cwd` for display
pub(crate) fn display_path(path: &Path, cwd: &Path) -> String {
    match path.strip_prefix(cwd) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

/// Run git in `dir`. `None` when git is unavailable or `cancel` fired.
async fn git(dir: &Path, args: &[&str], cancel: &CancellationToken) -> Option<Output> {
    let mut command = Command::new("git");
    command
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = command.output() => match output {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::debug!(error = %e, "git unavailable");
                None
            }
        },
    }
}

async fn in_git_work_tree(dir: &Path, cancel: &CancellationToken) -> bool {
    match git(dir, &["rev-parse", "--is-inside-work-tree"], cancel).await {
        Some(output) => output.status.success() && output.stdout.trim_ascii() == b"true",
        None => false,
    }
}

/// Files under `root`, relative to it and sorted. Inside a git work tree the
/// list comes from `git ls-files`, so ignore rules apply; elsewhere it is the
/// filesystem walk. `None` when cancelled.
pub(crate) async fn list_files(root: &Path, cancel: &CancellationToken) -> Option<Vec<PathBuf>> {
    if in_git_work_tree(root, cancel).await {
        let listed = git(
            root,
            &["ls-files", "-z", "--cached", "--others", "--exclude-standard"],
            cancel,
        )
        .await;
        match listed {
            Some(output) if output.status.success() => {
                let mut files: Vec<PathBuf> = output
                    .stdout
                    .split(|b| *b == 0)
                    .filter(|raw| !raw.is_empty())
                    .map(|raw| PathBuf::from(String::from_utf8_lossy(raw).into_owned()))
                    .filter(|rel| root.join(rel).is_file())
                    .collect();
                files.sort();
                files.dedup();
                files.truncate(MAX_WALK_FILES);
                return Some(files);
            }
            Some(output) => tracing::debug!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "git ls-files failed, walking instead"
            ),
            None => {}
        }
    }
    if cancel.is_cancelled() {
        return None;
    }
    walk_files(root, cancel)
}

/// Every regular file under `root`, relative to it and sorted. `None` when
/// cancelled.
fn walk_files(root: &Path, cancel: &CancellationToken) -> Option<Vec<PathBuf>> {
    let pattern = format!("{}/**/*", ::glob::Pattern::escape(&root.to_string_lossy()));
    let entries = match ::glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(error = %e, "cannot walk directory");
            return Some(Vec::new());
        }
    };

    let mut files = Vec::new();
    for entry in entries.flatten() {
        if cancel.is_cancelled() {
            return None;
        }
        let Ok(rel) = entry.strip_prefix(root) else {
            continue;
        };
        let skipped = rel.components().any(|c| match c {
            Component::Normal(name) => SKIPPED_DIRS.iter().any(|d| name == *d),
            _ => false,
        });
        if skipped || !entry.is_file() {
            continue;
        }
        files.push(rel.to_path_buf());
        if files.len() >= MAX_WALK_FILES {
            break;
        }
    }
    files.sort();
    Some(files)
}

/// `git init` in `dir`; false when git is not installed
#[cfg(test)]
pub(crate) fn init_repo(dir: &Path) -> bool {
    std::process::Command::new("git")
        .args(["init", "-q"])
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}
