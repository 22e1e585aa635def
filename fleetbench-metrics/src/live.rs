use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::layout::HistogramLayout;
use crate::operation::OperationStats;
use crate::statistics::{Statistics, now_millis};

type OperationMap = DashMap<Arc<str>, Mutex<OperationStats>, ahash::RandomState>;

#[derive(Debug)]
struct Window {
    begin_ms: u64,
    operations: OperationMap,
}

impl Window {
    fn open(begin_ms: u64) -> Self {
        Self {
            begin_ms,
            operations: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }
}

/// Concurrent statistics accumulator shared by many workers.
///
/// Registrations hold the window's read lock for the duration of the update, and
/// [`snapshot`](Self::snapshot) takes the write lock, so a reset snapshot is a single exchange:
/// every registration lands either in the returned window or in the fresh one.
#[derive(Debug)]
pub struct LiveStatistics {
    layout: Option<HistogramLayout>,
    window: RwLock<Window>,
}

impl Default for LiveStatistics {
    fn default() -> Self {
        Self::new(Some(HistogramLayout::default()))
    }
}

impl LiveStatistics {
    pub fn new(layout: Option<HistogramLayout>) -> Self {
        Self {
            layout,
            window: RwLock::new(Window::open(now_millis())),
        }
    }

    pub fn layout(&self) -> Option<HistogramLayout> {
        self.layout
    }

    pub fn register_request(&self, response_time_nanos: u64, operation: &str) {
        self.record(response_time_nanos, operation, false);
    }

    pub fn register_error(&self, response_time_nanos: u64, operation: &str) {
        self.record(response_time_nanos, operation, true);
    }

    fn record(&self, response_time_nanos: u64, operation: &str, error: bool) {
        let window = self.window.read();

        if let Some(stats) = window.operations.get(operation) {
            stats.lock().record(response_time_nanos, error);
            return;
        }

        window
            .operations
            .entry(Arc::from(operation))
            .or_insert_with(|| Mutex::new(OperationStats::new(self.layout)))
            .lock()
            .record(response_time_nanos, error);
    }

    /// Point-in-time copy of the current window. With `reset`, the live window is replaced by an
    /// empty one starting now.
    pub fn snapshot(&self, reset: bool) -> Statistics {
        let mut window = self.window.write();
        let now = now_millis();

        let mut out = Statistics::new(self.layout).with_window(window.begin_ms, now);
        for entry in window.operations.iter() {
            out.insert_operation(entry.key().to_string(), entry.value().lock().clone());
        }

        if reset {
            *window = Window::open(now);
        }
        out
    }

    pub fn reset(&self) {
        let mut window = self.window.write();
        *window = Window::open(now_millis());
    }
}
