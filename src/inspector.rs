//! OS process inspection and signalling
//!
//! The supervisor only talks to [`ProcessInspector`]; each target OS gets
//! its own implementation behind [`SystemInspector`].

use async_trait::async_trait;
use std::io;

/// Termination strength
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM / `taskkill`
    Graceful,
    /// SIGKILL / `taskkill /F`
    Forceful,
}

#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// PIDs of live processes whose executable is `name`, excluding the
    /// gateway itself
    async fn find_pids(&self, name: &str) -> io::Result<Vec<u32>>;

    /// Whether `pid` refers to a live (non-zombie) process
    async fn is_alive(&self, pid: u32) -> bool;

    /// Signal `pid`. Returns `Ok(false)` if no such process exists.
    async fn terminate(&self, pid: u32, signal: Signal) -> io::Result<bool>;

    /// Argument vector of `pid`, `None` when the process is gone or its
    /// command line cannot be read
    async fn command_line(&self, pid: u32) -> io::Result<Option<Vec<String>>>;

    /// PIDs of `name` processes started with `flag value` (or `flag=value`)
    async fn find_pids_with_arg(&self, name: &str, flag: &str, value: &str) -> io::Result<Vec<u32>> {
        let mut matching = Vec::new();
        for pid in self.find_pids(name).await? {
            if let Some(argv) = self.command_line(pid).await? {
                if has_arg(&argv, flag, value) {
                    matching.push(pid);
                }
            }
        }
        Ok(matching)
    }
}

/// Whether `argv` carries `flag value` or `flag=value`
pub fn has_arg<S: AsRef<str>>(argv: &[S], flag: &str, value: &str) -> bool {
    argv.iter().enumerate().any(|(i, arg)| {
        let arg = arg.as_ref();
        if arg == flag {
            return argv.get(i + 1).is_some_and(|next| next.as_ref() == value);
        }
        arg.strip_prefix(flag)
            .and_then(|rest| rest.strip_prefix('='))
            .is_some_and(|v| v == value)
    })
}

/// Inspector for the host operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInspector;

#[async_trait]
impl ProcessInspector for SystemInspector {
    async fn find_pids(&self, name: &str) -> io::Result<Vec<u32>> {
        let mut pids = platform::find_pids(name).await?;
        let own = std::process::id();
        pids.retain(|&pid| pid != own);
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    async fn is_alive(&self, pid: u32) -> bool {
        pid != 0 && platform::is_alive(pid).await
    }

    async fn terminate(&self, pid: u32, signal: Signal) -> io::Result<bool> {
        if pid == 0 {
            return Ok(false);
        }
        platform::terminate(pid, signal).await
    }

    async fn command_line(&self, pid: u32) -> io::Result<Option<Vec<String>>> {
        if pid == 0 {
            return Ok(None);
        }
        platform::command_line(pid).await
    }
}

/// Base name of an executable path, without a Windows `.exe` suffix
fn exe_name(path: &str) -> &str {
    let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
    base.strip_suffix(".exe").unwrap_or(base)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> io::Result<bool> {
    let Ok(pid) = i32::try_from(pid) else {
        return Ok(false);
    };
    let sig = match signal {
        Signal::Graceful => libc::SIGTERM,
        Signal::Forceful => libc::SIGKILL,
    };
    // SAFETY: kill has no memory-safety preconditions; pid is positive so
    // it never addresses a process group.
    let result = unsafe { libc::kill(pid, sig) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{exe_name, send_signal, Signal};
    use std::io;

    /// Kernel truncates `comm` to 15 bytes
    const COMM_LEN: usize = 15;

    pub async fn find_pids(name: &str) -> io::Result<Vec<u32>> {
        let mut pids = Vec::new();
        let mut entries = tokio::fs::read_dir("/proc").await?;

        while let Some(entry) = entries.next_entry().await? {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if matches_name(pid, name).await && is_alive(pid).await {
                pids.push(pid);
            }
        }

        Ok(pids)
    }

    async fn matches_name(pid: u32, name: &str) -> bool {
        if let Ok(cmdline) = tokio::fs::read(format!("/proc/{}/cmdline", pid)).await {
            let argv0 = cmdline.split(|&b| b == 0).next().unwrap_or_default();
            if !argv0.is_empty() && exe_name(&String::from_utf8_lossy(argv0)) == name {
                return true;
            }
        }
        match tokio::fs::read_to_string(format!("/proc/{}/comm", pid)).await {
            Ok(comm) => {
                let truncated = &name.as_bytes()[..name.len().min(COMM_LEN)];
                comm.trim_end().as_bytes() == truncated
            }
            Err(_) => false,
        }
    }

    pub async fn is_alive(pid: u32) -> bool {
        let Ok(stat) = tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await else {
            return false;
        };
        // Format: "pid (comm) S ..."; comm may itself contain ')'
        let state = stat
            .rfind(')')
            .and_then(|i| stat[i + 1..].split_whitespace().next())
            .unwrap_or("");
        !matches!(state, "Z" | "X" | "x" | "")
    }

    pub async fn terminate(pid: u32, signal: Signal) -> io::Result<bool> {
        send_signal(pid, signal)
    }

    pub async fn command_line(pid: u32) -> io::Result<Option<Vec<String>>> {
        let raw = match tokio::fs::read(format!("/proc/{}/cmdline", pid)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        // Kernel threads have an empty cmdline
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            raw.split(|&b| b == 0)
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect(),
        ))
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use super::{send_signal, Signal};
    use std::io;
    use tokio::process::Command;

    pub async fn find_pids(name: &str) -> io::Result<Vec<u32>> {
        let output = Command::new("pgrep").arg("-x").arg(name).output().await?;
        // pgrep exits 1 when nothing matched
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect())
    }

    pub async fn is_alive(pid: u32) -> bool {
        let output = Command::new("ps")
            .args(["-o", "stat=", "-p", &pid.to_string()])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                let stat = String::from_utf8_lossy(&out.stdout);
                let stat = stat.trim();
                !stat.is_empty() && !stat.starts_with('Z')
            }
            _ => false,
        }
    }

    pub async fn terminate(pid: u32, signal: Signal) -> io::Result<bool> {
        send_signal(pid, signal)
    }

    /// `ps` joins argv with spaces, so arguments are split back on whitespace
    pub async fn command_line(pid: u32) -> io::Result<Option<Vec<String>>> {
        let output = Command::new("ps")
            .args(["-o", "args=", "-p", &pid.to_string()])
            .output()
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let args: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Ok((!args.is_empty()).then_some(args))
    }
}

#[cfg(windows)]
mod platform {
    use super::{exe_name, Signal};
    use std::io;
    use tokio::process::Command;

    /// Parse `tasklist /FO CSV /NH` rows into (image, pid)
    fn parse_tasklist(stdout: &str) -> Vec<(String, u32)> {
        stdout
            .lines()
            .filter_map(|line| {
                let mut cols = line.split("\",\"").map(|c| c.trim_matches('"'));
                let image = cols.next()?.to_string();
                let pid = cols.next()?.parse().ok()?;
                Some((image, pid))
            })
            .collect()
    }

    pub async fn find_pids(name: &str) -> io::Result<Vec<u32>> {
        let filter = format!("IMAGENAME eq {}.exe", name);
        let output = Command::new("tasklist")
            .args(["/FI", &filter, "/FO", "CSV", "/NH"])
            .output()
            .await?;
        Ok(parse_tasklist(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .filter(|(image, _)| exe_name(image).eq_ignore_ascii_case(name))
            .map(|(_, pid)| pid)
            .collect())
    }

    pub async fn is_alive(pid: u32) -> bool {
        let filter = format!("PID eq {}", pid);
        match Command::new("tasklist")
            .args(["/FI", &filter, "/FO", "CSV", "/NH"])
            .output()
            .await
        {
            Ok(out) => parse_tasklist(&String::from_utf8_lossy(&out.stdout))
                .iter()
                .any(|(_, p)| *p == pid),
            Err(_) => false,
        }
    }

    pub async fn terminate(pid: u32, signal: Signal) -> io::Result<bool> {
        if !is_alive(pid).await {
            return Ok(false);
        }
        let pid_arg = pid.to_string();
        let mut cmd = Command::new("taskkill");
        cmd.args(["/PID", &pid_arg, "/T"]);
        if signal == Signal::Forceful {
            cmd.arg("/F");
        }
        let status = cmd.status().await?;
        Ok(status.success())
    }

    pub async fn command_line(pid: u32) -> io::Result<Option<Vec<String>>> {
        let query = format!(
            "(Get-CimInstance Win32_Process -Filter 'ProcessId={}').CommandLine",
            pid
        );
        let output = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", &query])
            .output()
            .await?;
        let line = String::from_utf8_lossy(&output.stdout);
        let args: Vec<String> = line
            .split_whitespace()
            .map(|a| a.trim_matches('"').to_string())
            .collect();
        Ok((!args.is_empty()).then_some(args))
    }
}
