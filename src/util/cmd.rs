use std::ffi::OsStr;
use std::process::Command;

use crate::error::CommandError;

const TAIL_LINES: usize = 12;
const TAIL_BYTES: usize = 2048;

/// Keep only the last few lines of a tool's diagnostics, bounded in bytes,
/// so errors stay readable instead of swallowing megabytes of output.
pub fn tail(s: &str) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let mut start = lines.len().saturating_sub(TAIL_LINES);
    let mut joined = lines.get(start..).unwrap_or_default().join("\n");
    while joined.len() > TAIL_BYTES && start < lines.len() {
        start += 1;
        joined = lines.get(start..).unwrap_or_default().join("\n");
    }
    joined
}

/// Run an external command to completion, capturing output. Returns stdout on
/// success; any non-zero exit becomes a [`CommandError`] carrying the exit
/// code and a bounded stderr tail.
pub fn run_command<I, S>(tool: &str, args: I) -> Result<String, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().collect();
    tracing::debug!(
        tool,
        args = ?args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()).collect::<Vec<_>>(),
        "Running command"
    );

    let output = Command::new(tool)
        .args(&args)
        .output()
        .map_err(|e| CommandError {
            tool: tool.to_owned(),
            code: None,
            stderr_tail: format!("failed to execute: {e}"),
        })?;

    if !output.status.success() {
        return Err(CommandError {
            tool: tool.to_owned(),
            code: output.status.code(),
            stderr_tail: tail(&String::from_utf8_lossy(&output.stderr)),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_returns_stdout() {
        let out = run_command("sh", ["-c", "echo hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn failure_carries_code_and_stderr_tail() {
        let err = run_command("sh", ["-c", "echo oops >&2; exit 3"]).unwrap_err();
        assert_eq!(err.code, Some(3));
        assert_eq!(err.stderr_tail, "oops");
        assert!(err.to_string().contains("`sh`"));
    }

    #[test]
    fn missing_tool_is_a_spawn_error() {
        let err = run_command("definitely-not-a-real-tool", [""; 0]).unwrap_err();
        assert_eq!(err.code, None);
    }

    #[test]
    fn tail_is_bounded() {
        let long: String = (0..1000).map(|i| format!("line {i}\n")).collect();
        let t = tail(&long);
        assert!(t.len() <= 2048);
        assert!(t.ends_with("line 999"));
        assert!(!t.contains("line 0\n"));
    }
}
