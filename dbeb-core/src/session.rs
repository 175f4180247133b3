//! Per-thread conversation history.
//!
//! Each thread keeps a sliding window of its most recent messages. Turns are
//! committed whole, after they finish, so a failed turn never leaves partial
//! history behind. Threads idle past the configured age are forgotten, and the
//! number of threads held is capped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{Message, Role};

const DEFAULT_IDLE: Duration = Duration::from_secs(6 * 60 * 60);
const DEFAULT_MAX_THREADS: usize = 1000;

#[derive(Debug)]
struct Thread {
    messages: Vec<Message>,
    touched: Instant,
}

impl Thread {
    fn is_idle(&self, now: Instant, idle: Duration) -> bool {
        now.duration_since(self.touched) > idle
    }
}

/// In-process history keyed by thread id.
#[derive(Debug)]
pub struct SessionStore {
    window: usize,
    idle: Duration,
    max_threads: usize,
    threads: Mutex<HashMap<String, Thread>>,
}

impl SessionStore {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            idle: DEFAULT_IDLE,
            max_threads: DEFAULT_MAX_THREADS,
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Forget threads idle for longer than `idle` and hold at most `max_threads`.
    pub fn with_limits(mut self, idle: Duration, max_threads: usize) -> Self {
        self.idle = idle;
        self.max_threads = max_threads.max(1);
        self
    }

    /// Retained messages for a thread, oldest first. Unknown or expired threads are empty.
    pub async fn history(&self, thread_id: &str) -> Vec<Message> {
        let now = Instant::now();
        let mut threads = self.threads.lock().await;
        match threads.get_mut(thread_id) {
            Some(thread) if thread.is_idle(now, self.idle) => {
                threads.remove(thread_id);
                debug!(thread_id, "Dropped idle session history");
                Vec::new()
            }
            Some(thread) => {
                thread.touched = now;
                thread.messages.clone()
            }
            None => Vec::new(),
        }
    }

    /// Append a finished turn, slide the window, and evict stale threads.
    pub async fn commit(&self, thread_id: &str, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut threads = self.threads.lock().await;
        let thread = threads.entry(thread_id.to_string()).or_insert_with(|| Thread {
            messages: Vec::new(),
            touched: now,
        });
        if thread.is_idle(now, self.idle) {
            thread.messages.clear();
        }
        thread.touched = now;
        thread.messages.extend(messages);
        let dropped = trim_window(&mut thread.messages, self.window);
        let retained = thread.messages.len();
        let evicted = self.evict(&mut threads, now);
        debug!(
            thread_id,
            retained,
            dropped,
            evicted,
            threads = threads.len(),
            "Committed turn to session history"
        );
    }

    pub async fn len(&self, thread_id: &str) -> usize {
        self.threads
            .lock()
            .await
            .get(thread_id)
            .map(|t| t.messages.len())
            .unwrap_or(0)
    }

    /// Drop idle threads, then the least recently touched beyond the cap.
    fn evict(&self, threads: &mut HashMap<String, Thread>, now: Instant) -> usize {
        let before = threads.len();
        threads.retain(|_, thread| !thread.is_idle(now, self.idle));
        if threads.len() > self.max_threads {
            let mut by_age: Vec<(Instant, String)> = threads
                .iter()
                .map(|(id, thread)| (thread.touched, id.clone()))
                .collect();
            by_age.sort();
            let excess = threads.len() - self.max_threads;
            for (_, id) in by_age.into_iter().take(excess) {
                threads.remove(&id);
            }
        }
        before - threads.len()
    }
}

/// Keep at most `window` messages, never starting on an orphaned tool result.
fn trim_window(history: &mut Vec<Message>, window: usize) -> usize {
    let mut cut = history.len().saturating_sub(window);
    while cut < history.len() && is_orphan_head(&history[cut]) {
        cut += 1;
    }
    history.drain(..cut);
    cut
}

fn is_orphan_head(message: &Message) -> bool {
    message.role == Role::Tool || message.content.is_tool_result()
}
