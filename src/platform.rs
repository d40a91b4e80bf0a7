//! Platform collaborators - process table, termination, screenshots
//!
//! Shells out to the tools every supported OS ships with: `tasklist` and
//! `taskkill` on Windows, `ps` and `kill` elsewhere. Screenshots need
//! PowerShell and are only available on Windows.

use crate::enforcement::{EvidenceCapture, ProcessInfo, ProcessLister, ProcessTerminator, TransientError};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tokio::process::Command;

/// Process listing and termination for the local host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

#[async_trait]
impl ProcessLister for SystemProcesses {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, TransientError> {
        if cfg!(windows) {
            let stdout = run("tasklist", &["/fo", "csv", "/nh"]).await?;
            Ok(parse_tasklist(&stdout))
        } else {
            let stdout = run("ps", &["-A", "-o", "pid=,comm="]).await?;
            Ok(parse_ps(&stdout))
        }
    }
}

#[async_trait]
impl ProcessTerminator for SystemProcesses {
    async fn terminate(&self, pid: u32) -> Result<(), TransientError> {
        let pid_arg = pid.to_string();
        let result = if cfg!(windows) {
            run("taskkill", &["/PID", &pid_arg, "/F"]).await
        } else {
            run("kill", &["-9", &pid_arg]).await
        };
        result.map(|_| ()).map_err(|e| TransientError::Termination {
            pid,
            reason: e.to_string(),
        })
    }
}

/// Full-screen capture into the agent state directory
#[derive(Debug, Clone)]
pub struct ScreenCapture {
    dir: PathBuf,
}

impl ScreenCapture {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl EvidenceCapture for ScreenCapture {
    async fn capture(&self) -> Result<String, TransientError> {
        if !cfg!(windows) {
            return Err(TransientError::Unsupported("screenshot capture"));
        }

        let path = self
            .dir
            .join(format!("shot_{}.png", Utc::now().timestamp_millis()));
        let script = screenshot_script(&path.display().to_string());
        run(
            "powershell",
            &["-NoProfile", "-NonInteractive", "-Command", &script],
        )
        .await
        .map_err(|e| TransientError::Capture(e.to_string()))?;

        tokio::fs::metadata(&path)
            .await
            .map_err(|e| TransientError::Capture(format!("{}: {e}", path.display())))?;
        Ok(path.display().to_string())
    }
}

fn screenshot_script(path: &str) -> String {
    let save = format!("$bmp.Save('{}');", path.replace('\'', "''"));
    [
        "[void][Reflection.Assembly]::LoadWithPartialName('System.Windows.Forms');",
        "[void][Reflection.Assembly]::LoadWithPartialName('System.Drawing');",
        "$bounds = [System.Windows.Forms.Screen]::PrimaryScreen.Bounds;",
        "$bmp = New-Object System.Drawing.Bitmap($bounds.Width, $bounds.Height);",
        "$g = [System.Drawing.Graphics]::FromImage($bmp);",
        "$g.CopyFromScreen($bounds.Location, [System.Drawing.Point]::Empty, $bounds.Size);",
        save.as_str(),
        "$g.Dispose(); $bmp.Dispose();",
    ]
    .concat()
}

async fn run(program: &str, args: &[&str]) -> Result<String, TransientError> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TransientError::Command(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `tasklist /fo csv /nh` output.
///
/// Columns: image name, PID, session name, session#, memory usage.
pub fn parse_tasklist(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_csv_line(line);
            let name = fields.first()?.trim().to_string();
            let pid = fields.get(1)?.trim().parse().ok()?;
            (!name.is_empty()).then_some(ProcessInfo { name, pid })
        })
        .collect()
}

/// Parse `ps -A -o pid=,comm=` output
pub fn parse_ps(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (pid, command) = line.trim().split_once(char::is_whitespace)?;
            let pid = pid.parse().ok()?;
            // comm may be a full path on some systems; enforcement matches on the executable name.
            let name = command.trim().rsplit('/').next()?.to_string();
            (!name.is_empty()).then_some(ProcessInfo { name, pid })
        })
        .collect()
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
    }
    fields
}
