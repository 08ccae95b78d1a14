use cadre_types::now_ms;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentLogLine {
    pub seq: u64,
    pub stream: LogStream,
    pub text: String,
    pub ts_ms: u64,
}

/// Bounded transcript of one supervised agent's stdio. The drain tasks
/// record every line (draining is what keeps the child's pipes from
/// filling up); once the window is full the oldest lines fall off and are
/// only counted. Readers page from the tail or resume by sequence number,
/// so the `agent/logs` RPC can pick up where a client left off.
#[derive(Debug)]
pub struct AgentLogBuffer {
    max_lines: usize,
    window: Mutex<LogWindow>,
}

#[derive(Debug, Default)]
struct LogWindow {
    next_seq: u64,
    dropped: u64,
    lines: VecDeque<AgentLogLine>,
}

impl AgentLogBuffer {
    pub fn with_capacity(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            window: Mutex::new(LogWindow::default()),
        }
    }

    pub fn record(&self, stream: LogStream, text: impl Into<String>) -> u64 {
        let mut window = self.window.lock().unwrap();
        window.next_seq += 1;
        let seq = window.next_seq;
        window.lines.push_back(AgentLogLine {
            seq,
            stream,
            text: text.into(),
            ts_ms: now_ms(),
        });
        if window.lines.len() > self.max_lines {
            window.lines.pop_front();
            window.dropped += 1;
        }
        seq
    }

    /// The most recent `last_n` lines, oldest first.
    pub fn tail(&self, last_n: usize) -> Vec<AgentLogLine> {
        let window = self.window.lock().unwrap();
        let start = window.lines.len().saturating_sub(last_n);
        window.lines.iter().skip(start).cloned().collect()
    }

    /// Lines recorded after `seq`. A client holding the last seq it saw
    /// gets exactly the gap, or everything still buffered if it fell
    /// behind the window.
    pub fn since(&self, seq: u64) -> Vec<AgentLogLine> {
        let window = self.window.lock().unwrap();
        window
            .lines
            .iter()
            .filter(|line| line.seq > seq)
            .cloned()
            .collect()
    }

    pub fn dropped_total(&self) -> u64 {
        self.window.lock().unwrap().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_the_newest_lines_and_counts_the_rest() {
        let logs = AgentLogBuffer::with_capacity(2);
        logs.record(LogStream::Stdout, "booting agent runtime");
        logs.record(LogStream::Stdout, "listening on 127.0.0.1:41123");
        logs.record(LogStream::Stderr, "panic: provider quota exhausted");

        let tail = logs.tail(10);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].text, "listening on 127.0.0.1:41123");
        assert_eq!(tail[1].stream, LogStream::Stderr);
        assert_eq!(logs.dropped_total(), 1);
    }

    #[test]
    fn clients_resume_by_sequence_number() {
        let logs = AgentLogBuffer::with_capacity(16);
        let first = logs.record(LogStream::Stdout, "turn t1 started");
        logs.record(LogStream::Stdout, "turn t1 completed");
        let last = logs.record(LogStream::Stderr, "retrying event stream");

        let gap = logs.since(first);
        assert_eq!(gap.len(), 2);
        assert_eq!(gap[1].seq, last);
        assert!(logs.since(last).is_empty());
    }

    #[test]
    fn stdout_and_stderr_interleave_in_arrival_order() {
        let logs = AgentLogBuffer::with_capacity(8);
        logs.record(LogStream::Stdout, "tool call: read_file");
        logs.record(LogStream::Stderr, "warning: slow provider response");
        logs.record(LogStream::Stdout, "tool result: 120 lines");

        let streams: Vec<LogStream> = logs.tail(8).iter().map(|l| l.stream).collect();
        assert_eq!(
            streams,
            vec![LogStream::Stdout, LogStream::Stderr, LogStream::Stdout]
        );
        // Timestamps are stamped at record time and never go backwards.
        let stamps: Vec<u64> = logs.tail(8).iter().map(|l| l.ts_ms).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
