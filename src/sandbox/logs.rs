use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Upper bound on retained lines per preview. Oldest lines fall off first.
const LOG_MAX_LINES: usize = 1000;

/// Shared handle to a preview's log ring. The dev-server line pumps and
/// the readiness poller write; status reads and the SSE stream read.
pub type SharedLogRing = Arc<Mutex<LogRing>>;

pub fn shared_ring() -> SharedLogRing {
    Arc::new(Mutex::new(LogRing::default()))
}

/// Bounded append-only log ring with monotonic sequence numbers.
///
/// Sequence numbers keep cursors stable across eviction: a reader that
/// resumes from a cursor never sees a line twice, even after old lines
/// have been dropped.
#[derive(Debug)]
pub struct LogRing {
    next_seq: u64,
    lines: VecDeque<(u64, String)>,
}

impl Default for LogRing {
    fn default() -> Self {
        Self {
            next_seq: 1,
            lines: VecDeque::new(),
        }
    }
}

impl LogRing {
    pub fn push_line(&mut self, line: impl Into<String>) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line.into()));
        while self.lines.len() > LOG_MAX_LINES {
            self.lines.pop_front();
        }
    }

    /// Most recent `limit` lines, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(start).map(|(_, l)| l.clone()).collect()
    }

    /// Lines after `cursor`, up to `limit`, plus the new cursor.
    /// A cursor of 0 means "start from the most recent `limit` lines".
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
