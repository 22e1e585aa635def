use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fleetbench_core::capabilities::{
    BasicOperations, Clearable, Clustered, ContinuousQuery, ContinuousQueryListener, Lifecycle,
    Queryable,
};
use fleetbench_core::query::{Condition, Query};
use fleetbench_core::{CancelSignal, Capability, CapabilityRegistry, Key, ServiceError};
use fleetbench_value::Value;
use parking_lot::RwLock;

pub const DEFAULT_BUCKET: &str = "default";

const CANCEL_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Default)]
pub struct GridStats {
    puts: Arc<AtomicU64>,
    gets: Arc<AtomicU64>,
    removes: Arc<AtomicU64>,
    events: Arc<AtomicU64>,
}

impl GridStats {
    fn inc_puts(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_gets(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_removes(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_events(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn removes(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

struct Registration {
    bucket: String,
    query: Query,
    listener: Arc<dyn ContinuousQueryListener>,
}

#[derive(Default)]
struct GridShared {
    buckets: DashMap<String, DashMap<Key, Value>>,
    registrations: RwLock<Vec<Registration>>,
    members: AtomicUsize,
    stats: GridStats,
}

/// A data grid kept in process memory. Every [`GridMember`] created from the same grid sees the
/// same buckets, so a local cluster behaves like one replicated cache.
#[derive(Clone, Default)]
pub struct InMemoryGrid {
    shared: Arc<GridShared>,
}

impl InMemoryGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member(&self, options: MemberOptions) -> Arc<GridMember> {
        Arc::new(GridMember {
            grid: self.clone(),
            options,
            running: AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> &GridStats {
        &self.shared.stats
    }

    /// Members currently set up.
    pub fn running_members(&self) -> usize {
        self.shared.members.load(Ordering::Acquire)
    }

    pub fn len(&self, bucket: Option<&str>) -> usize {
        self.shared
            .buckets
            .get(bucket.unwrap_or(DEFAULT_BUCKET))
            .map_or(0, |b| b.len())
    }

    pub fn is_empty(&self, bucket: Option<&str>) -> bool {
        self.len(bucket) == 0
    }

    pub fn listeners(&self) -> usize {
        self.shared.registrations.read().len()
    }

    fn notify(&self, bucket: &str, key: &Key, before: Option<&Value>, after: Option<&Value>) {
        let registrations = self.shared.registrations.read();
        for reg in registrations.iter().filter(|r| r.bucket == bucket) {
            let was = before.is_some_and(|v| reg.query.matches(key, v));
            match after {
                Some(v) if reg.query.matches(key, v) => {
                    if !was {
                        reg.listener.entry_joined(key, v);
                        self.shared.stats.inc_events();
                    }
                }
                _ if was => {
                    reg.listener.entry_left(key);
                    self.shared.stats.inc_events();
                }
                _ => {}
            }
        }
    }
}

/// How one member behaves; used to exercise slow and failing starts.
#[derive(Debug, Clone, Default)]
pub struct MemberOptions {
    pub start_delay: Duration,
    pub fail_on_start: bool,
    /// Capabilities left out of [`GridMember::registry`].
    pub without: Vec<Capability>,
}

pub struct GridMember {
    grid: InMemoryGrid,
    options: MemberOptions,
    running: AtomicBool,
}

impl GridMember {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Exposes every capability except those listed in [`MemberOptions::without`].
    pub fn registry(self: &Arc<Self>) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        let keep = |c: Capability| !self.options.without.contains(&c);
        if keep(Capability::Lifecycle) {
            registry = registry.with_lifecycle(self.clone());
        }
        if keep(Capability::BasicOperations) {
            registry = registry.with_basic_operations(self.clone());
        }
        if keep(Capability::Clearable) {
            registry = registry.with_clearable(self.clone());
        }
        if keep(Capability::Clustered) {
            registry = registry.with_clustered(self.clone());
        }
        if keep(Capability::Queryable) {
            registry = registry.with_queryable(self.clone());
        }
        if keep(Capability::ContinuousQuery) {
            registry = registry.with_continuous_query(self.clone());
        }
        registry
    }

    fn bucket(bucket: Option<&str>) -> &str {
        bucket.unwrap_or(DEFAULT_BUCKET)
    }
}

impl Lifecycle for GridMember {
    fn set_up(&self, cancel: &CancelSignal) -> Result<(), ServiceError> {
        let deadline = Instant::now() + self.options.start_delay;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }
            std::thread::sleep(CANCEL_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
        if self.options.fail_on_start {
            return Err(ServiceError::Operation("member refused to start".to_string()));
        }

        if !self.running.swap(true, Ordering::AcqRel) {
            self.grid.shared.members.fetch_add(1, Ordering::AcqRel);
        }
        tracing::debug!("grid member started");
        Ok(())
    }

    fn tear_down(&self) -> Result<(), ServiceError> {
        if self.running.swap(false, Ordering::AcqRel) {
            self.grid.shared.members.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::debug!("grid member stopped");
        Ok(())
    }
}

impl BasicOperations for GridMember {
    fn put(&self, bucket: Option<&str>, key: Key, value: Value) -> Result<(), ServiceError> {
        let bucket = Self::bucket(bucket);
        self.grid.shared.stats.inc_puts();
        let before = self
            .grid
            .shared
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.clone(), value.clone());
        self.grid.notify(bucket, &key, before.as_ref(), Some(&value));
        Ok(())
    }

    fn get(&self, bucket: Option<&str>, key: &Key) -> Result<Option<Value>, ServiceError> {
        self.grid.shared.stats.inc_gets();
        Ok(self
            .grid
            .shared
            .buckets
            .get(Self::bucket(bucket))
            .and_then(|b| b.get(key).map(|v| v.value().clone())))
    }

    fn remove(&self, bucket: Option<&str>, key: &Key) -> Result<Option<Value>, ServiceError> {
        let bucket = Self::bucket(bucket);
        self.grid.shared.stats.inc_removes();
        let removed = self
            .grid
            .shared
            .buckets
            .get(bucket)
            .and_then(|b| b.remove(key).map(|(_, v)| v));
        if removed.is_some() {
            self.grid.notify(bucket, key, removed.as_ref(), None);
        }
        Ok(removed)
    }
}

impl Clearable for GridMember {
    fn clear(&self, bucket: Option<&str>) -> Result<(), ServiceError> {
        let bucket = Self::bucket(bucket);
        let Some((_, entries)) = self.grid.shared.buckets.remove(bucket) else {
            return Ok(());
        };
        for (key, value) in entries {
            self.grid.notify(bucket, &key, Some(&value), None);
        }
        Ok(())
    }
}

impl Clustered for GridMember {
    fn num_members(&self) -> usize {
        self.grid.running_members()
    }
}

impl Queryable for GridMember {
    fn compile(&self, conditions: &[Condition]) -> Result<Query, ServiceError> {
        Ok(Query::new(conditions.to_vec()))
    }
}

impl ContinuousQuery for GridMember {
    fn create_continuous_query(
        &self,
        bucket: Option<&str>,
        query: Query,
        listener: Arc<dyn ContinuousQueryListener>,
    ) -> Result<(), ServiceError> {
        self.grid.shared.registrations.write().push(Registration {
            bucket: Self::bucket(bucket).to_string(),
            query,
            listener,
        });
        Ok(())
    }

    fn remove_continuous_query(
        &self,
        bucket: Option<&str>,
        listener: &Arc<dyn ContinuousQueryListener>,
    ) -> Result<(), ServiceError> {
        let bucket = Self::bucket(bucket);
        self.grid
            .shared
            .registrations
            .write()
            .retain(|r| !(r.bucket == bucket && Arc::ptr_eq(&r.listener, listener)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ContinuousQueryListener for Recorder {
        fn entry_joined(&self, key: &Key, _value: &Value) {
            self.events.lock().push(format!("+{key}"));
        }

        fn entry_left(&self, key: &Key) {
            self.events.lock().push(format!("-{key}"));
        }
    }

    fn plain(k: &str) -> Key {
        Key::Plain(k.to_string())
    }

    #[test]
    fn members_share_buckets() {
        let grid = InMemoryGrid::new();
        let a = grid.member(MemberOptions::default());
        let b = grid.member(MemberOptions::default());

        a.put(None, plain("k"), Value::I64(1))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            b.get(None, &plain("k")).unwrap_or_else(|e| panic!("{e}")),
            Some(Value::I64(1))
        );
        assert_eq!(grid.len(None), 1);
        assert!(grid.is_empty(Some("other")));
    }

    #[test]
    fn listeners_see_matching_entries_join_and_leave() {
        let grid = InMemoryGrid::new();
        let member = grid.member(MemberOptions::default());
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn ContinuousQueryListener> = recorder.clone();

        let query = member
            .compile(&[Condition::Gt { value: 10.0 }])
            .unwrap_or_else(|e| panic!("{e}"));
        member
            .create_continuous_query(None, query, listener.clone())
            .unwrap_or_else(|e| panic!("{e}"));

        let ok = |r: Result<_, ServiceError>| r.unwrap_or_else(|e| panic!("{e}"));
        ok(member.put(None, plain("a"), Value::I64(5)));
        ok(member.put(None, plain("a"), Value::I64(50)));
        ok(member.put(None, plain("a"), Value::I64(60)));
        ok(member.put(None, plain("b"), Value::I64(70)));
        ok(member.remove(None, &plain("a")).map(|_| ()));
        ok(member.clear(None));

        assert_eq!(*recorder.events.lock(), vec!["+a", "+b", "-a", "-b"]);

        ok(member.remove_continuous_query(None, &listener));
        assert_eq!(grid.listeners(), 0);
    }

    #[test]
    fn members_count_only_while_running() {
        let grid = InMemoryGrid::new();
        let a = grid.member(MemberOptions::default());
        let b = grid.member(MemberOptions::default());
        let cancel = CancelSignal::new();

        a.set_up(&cancel).unwrap_or_else(|e| panic!("{e}"));
        b.set_up(&cancel).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(a.num_members(), 2);

        b.tear_down().unwrap_or_else(|e| panic!("{e}"));
        b.tear_down().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(a.num_members(), 1);
    }

    #[test]
    fn cancelled_start_gives_up() {
        let grid = InMemoryGrid::new();
        let slow = grid.member(MemberOptions {
            start_delay: Duration::from_secs(30),
            ..MemberOptions::default()
        });
        let cancel = CancelSignal::new();
        cancel.cancel();

        assert_eq!(slow.set_up(&cancel), Err(ServiceError::Cancelled));
        assert!(!slow.is_running());
    }

    #[test]
    fn registry_omits_excluded_capabilities() {
        let grid = InMemoryGrid::new();
        let member = grid.member(MemberOptions {
            without: vec![Capability::ContinuousQuery, Capability::Clustered],
            ..MemberOptions::default()
        });
        let registry = member.registry();
        assert!(registry.has(Capability::BasicOperations));
        assert!(!registry.has(Capability::ContinuousQuery));
        assert_eq!(registry.capabilities().len(), 4);
    }
}
