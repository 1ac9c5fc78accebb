use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use tome_core::events::RunEvent;
use tome_core::ids::CorrelationToken;

const RUN_CHANNEL_CAPACITY: usize = 256;

/// Events of one run: everything published so far plus a live channel.
struct RunChannel {
    backlog: Vec<RunEvent>,
    tx: broadcast::Sender<RunEvent>,
    done: bool,
}

impl RunChannel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(RUN_CHANNEL_CAPACITY);
        Self {
            backlog: Vec::new(),
            tx,
            done: false,
        }
    }
}

/// A subscription to one run. `backlog` holds the events published before
/// the subscription; `live` continues right after them.
pub struct RunSubscription {
    pub backlog: Vec<RunEvent>,
    pub live: Option<broadcast::Receiver<RunEvent>>,
}

/// Demultiplexes the engine's event broadcast by correlation token.
///
/// Late subscribers replay the run from its first event. Finished runs are
/// kept until `retained` newer runs have finished.
pub struct EventHub {
    runs: DashMap<CorrelationToken, RunChannel>,
    finished: Mutex<VecDeque<CorrelationToken>>,
    retained: usize,
}

impl EventHub {
    pub fn new(retained: usize) -> Self {
        Self {
            runs: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retained,
        }
    }

    /// Make `token` known so subscribers can attach before its first event.
    pub fn open(&self, token: &CorrelationToken) {
        self.runs.entry(token.clone()).or_insert_with(RunChannel::new);
    }

    pub fn contains(&self, token: &CorrelationToken) -> bool {
        self.runs.contains_key(token)
    }

    pub fn publish(&self, event: RunEvent) {
        let token = event.token().clone();
        let done = event.is_done();
        {
            let mut run = self.runs.entry(token.clone()).or_insert_with(RunChannel::new);
            // No live subscribers is the common case
            let _ = run.tx.send(event.clone());
            run.backlog.push(event);
            run.done |= done;
        }
        if done {
            self.retire(token);
        }
    }

    /// Snapshot and subscribe atomically, so no event is missed or repeated.
    /// `None` for unknown tokens.
    pub fn subscribe(&self, token: &CorrelationToken) -> Option<RunSubscription> {
        let run = self.runs.get(token)?;
        Some(RunSubscription {
            backlog: run.backlog.clone(),
            live: (!run.done).then(|| run.tx.subscribe()),
        })
    }

    fn retire(&self, token: CorrelationToken) {
        let mut finished = self.finished.lock();
        finished.push_back(token);
        while finished.len() > self.retained {
            if let Some(old) = finished.pop_front() {
                self.runs.remove(&old);
            }
        }
    }
}

/// Forward every engine event into the hub until the channel closes.
pub fn create_bridge(hub: Arc<EventHub>, mut rx: broadcast::Receiver<RunEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => hub.publish(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event bridge channel closed");
                    break;
                }
            }
        }
    })
}
