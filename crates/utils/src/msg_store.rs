use std::{
    collections::VecDeque,
    sync::{Arc, OnceLock, RwLock},
};

use futures::StreamExt;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::BroadcastStream;

use crate::log_msg::{LogMsg, OutputChunk, StreamKind};

const DEFAULT_HISTORY_MAX_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_HISTORY_MAX_ENTRIES: usize = 5000;

struct HistoryConfig {
    max_bytes: usize,
    max_entries: usize,
}

static HISTORY_CONFIG: OnceLock<HistoryConfig> = OnceLock::new();

fn history_config() -> &'static HistoryConfig {
    HISTORY_CONFIG.get_or_init(|| {
        let max_bytes = read_env_usize("SBX_OUTPUT_HISTORY_MAX_BYTES", DEFAULT_HISTORY_MAX_BYTES);
        let max_entries =
            read_env_usize("SBX_OUTPUT_HISTORY_MAX_ENTRIES", DEFAULT_HISTORY_MAX_ENTRIES);

        HistoryConfig {
            max_bytes: normalize_limit(max_bytes, "SBX_OUTPUT_HISTORY_MAX_BYTES"),
            max_entries: normalize_limit(max_entries, "SBX_OUTPUT_HISTORY_MAX_ENTRIES"),
        }
    })
}

fn read_env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(value) => match value.parse::<usize>() {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!("Invalid {name}='{value}': {err}. Using default {default}.");
                default
            }
        },
        Err(_) => default,
    }
}

fn normalize_limit(value: usize, name: &str) -> usize {
    if value == 0 {
        tracing::warn!("{name} set to 0. Using minimum value 1 instead.");
        1
    } else {
        value
    }
}

#[derive(Clone)]
struct StoredMsg {
    msg: LogMsg,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
    finished: bool,
}

/// Ordered output log for one command execution: bounded history plus a
/// broadcast fan-out so live subscribers see chunks as they arrive.
pub struct MsgStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<LogMsg>,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(4096);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
                finished: false,
            }),
            sender,
        }
    }

    pub fn push(&self, msg: LogMsg) {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.finished {
                // Terminal executions have an immutable log.
                return;
            }
            if matches!(msg, LogMsg::Finished) {
                inner.finished = true;
            }
            inner.push_msg(msg.clone());
        }
        let _ = self.sender.send(msg);
    }

    // Convenience
    pub fn push_stdout<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Chunk(OutputChunk::now(StreamKind::Stdout, s)));
    }

    pub fn push_stderr<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Chunk(OutputChunk::now(StreamKind::Stderr, s)));
    }

    pub fn push_system<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Chunk(OutputChunk::now(StreamKind::System, s)));
    }

    pub fn push_finished(&self) {
        self.push(LogMsg::Finished);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.read().unwrap().finished
    }

    pub fn get_receiver(&self) -> broadcast::Receiver<LogMsg> {
        self.sender.subscribe()
    }

    pub fn get_history(&self) -> Vec<LogMsg> {
        self.inner
            .read()
            .unwrap()
            .history
            .iter()
            .map(|s| s.msg.clone())
            .collect()
    }

    /// Concatenated content of every retained chunk from one stream,
    /// in arrival order.
    pub fn aggregate(&self, kind: StreamKind) -> String {
        self.inner
            .read()
            .unwrap()
            .history
            .iter()
            .filter_map(|s| match &s.msg {
                LogMsg::Chunk(chunk) if chunk.kind == kind => Some(chunk.content.as_str()),
                _ => None,
            })
            .collect()
    }

    /// History then live, as `LogMsg`. The stream ends after `Finished`.
    pub fn history_plus_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<LogMsg, std::io::Error>> {
        let finished = self.is_finished();
        let history = self.get_history();

        let hist = futures::stream::iter(history.into_iter().map(Ok::<_, std::io::Error>));

        if finished {
            Box::pin(hist)
        } else {
            let live = BroadcastStream::new(self.get_receiver())
                .filter_map(|res| async move { res.ok().map(Ok::<_, std::io::Error>) });
            Box::pin(hist.chain(live))
        }
    }

    /// Forward every message pushed into this store to `forward` until the
    /// execution finishes.
    pub fn spawn_forwarder<F>(self: Arc<Self>, mut forward: F) -> JoinHandle<()>
    where
        F: FnMut(LogMsg) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut stream = self.history_plus_stream();
            while let Some(next) = stream.next().await {
                if let Ok(msg) = next {
                    let finished = matches!(msg, LogMsg::Finished);
                    forward(msg);
                    if finished {
                        break;
                    }
                }
            }
        })
    }
}

impl Inner {
    fn push_msg(&mut self, msg: LogMsg) {
        let limits = history_config();
        let bytes = msg.approx_bytes();

        while self.history.len() >= limits.max_entries
            || self.total_bytes.saturating_add(bytes) > limits.max_bytes
        {
            if let Some(front) = self.history.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        self.history.push_back(StoredMsg { msg, bytes });
        self.total_bytes = self.total_bytes.saturating_add(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_preserves_arrival_order() {
        let store = MsgStore::new();
        store.push_stdout("A");
        store.push_stderr("warn");
        store.push_stdout("B");

        let stdout = store.aggregate(StreamKind::Stdout);
        assert_eq!(stdout, "AB");
        assert_eq!(store.aggregate(StreamKind::Stderr), "warn");
    }

    #[test]
    fn log_is_immutable_after_finished() {
        let store = MsgStore::new();
        store.push_stdout("before");
        store.push_finished();
        store.push_stdout("after");

        assert!(store.is_finished());
        assert_eq!(store.aggregate(StreamKind::Stdout), "before");
    }

    #[tokio::test]
    async fn history_plus_stream_ends_after_finished() {
        let store = Arc::new(MsgStore::new());
        store.push_stdout("hello");
        store.push_finished();

        let msgs: Vec<_> = store.history_plus_stream().collect().await;
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs.last(), Some(Ok(LogMsg::Finished))));
    }

    #[tokio::test]
    async fn forwarder_sees_history_and_live_messages() {
        let store = Arc::new(MsgStore::new());
        store.push_stdout("early");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = store.clone().spawn_forwarder(move |msg| {
            let _ = tx.send(msg);
        });

        store.push_stdout("late");
        store.push_finished();
        handle.await.unwrap();

        let mut contents = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let LogMsg::Chunk(chunk) = msg {
                contents.push(chunk.content);
            }
        }
        assert_eq!(contents, vec!["early".to_string(), "late".to_string()]);
    }
}
