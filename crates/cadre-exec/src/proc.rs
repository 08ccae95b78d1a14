use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

/// Grace period for the group reaper after a kill.
pub const REAP_WAIT: Duration = Duration::from_secs(2);

/// Build a command whose child runs in its own process group (own session on
/// unix), detached from our stdin. Killing the group on timeout takes any
/// pipeline subprocesses down with it.
pub fn group_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    cmd
}

pub fn kill_group(child: &Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child;
    }
}

/// Size-bounded byte sink shared by stream readers.
#[derive(Debug)]
pub struct CapBuf {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CapBuf {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        let remaining = self.limit.saturating_sub(self.data.len());
        if remaining == 0 {
            if !bytes.is_empty() {
                self.truncated = true;
            }
            return;
        }
        if bytes.len() > remaining {
            self.data.extend_from_slice(&bytes[..remaining]);
            self.truncated = true;
        } else {
            self.data.extend_from_slice(bytes);
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Drain an async reader into a shared capped buffer. Keeps reading past the
/// cap so the child never blocks on a full pipe.
pub async fn drain_into<R>(mut reader: R, sink: std::sync::Arc<std::sync::Mutex<CapBuf>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().unwrap().write(&chunk[..n]),
        }
    }
}

pub struct WaitOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Wait for the child under a deadline. On timeout (or parent cancellation
/// via dropped future) the whole process group is killed and the reaper is
/// given a short bounded wait.
pub async fn wait_with_deadline(mut child: Child, timeout: Duration) -> WaitOutcome {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => WaitOutcome {
            exit_code: status.code().unwrap_or(-1),
            timed_out: false,
        },
        Ok(Err(_)) => WaitOutcome {
            exit_code: -1,
            timed_out: false,
        },
        Err(_) => {
            kill_group(&child);
            let _ = tokio::time::timeout(REAP_WAIT, child.wait()).await;
            WaitOutcome {
                exit_code: -1,
                timed_out: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_buf_stops_at_limit_and_flags_truncation() {
        let mut buf = CapBuf::new(5);
        buf.write(b"abc");
        assert!(!buf.truncated());
        buf.write(b"defg");
        assert!(buf.truncated());
        assert_eq!(buf.into_string(), "abcde");
    }
}
