use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 256;

/// Side-channel notifications. Nothing in the sync path waits for them to be
/// observed; a lagging subscriber simply misses events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    QuotaLimit {
        queries: u32,
        seconds: u32,
    },
    SyncProgress {
        completed: usize,
        failed: usize,
        total: usize,
    },
    DownloadProgress {
        id: String,
        bytes: u64,
    },
    TransformDone {
        id: String,
        local_path: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
