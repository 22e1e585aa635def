use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetbench_metrics::{HistogramLayout, Statistics, now_millis};
use fleetbench_value::Value;
use rand::Rng;

use crate::capabilities::{BasicOperations, Capability, Key};
use crate::properties::{Properties, PropertyError};
use crate::protocol::AckPayload;

use super::{Placement, SlaveContext, StageError, StageName};

pub const GET: &str = "GET";
pub const PUT: &str = "PUT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum KeySelection {
    /// Every thread draws from the whole key space.
    Colliding,
    /// Each thread owns a disjoint slice of the key space.
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum KeyFormat {
    Plain,
    /// Keys carry their creation time; continuous-query listeners derive latency from it.
    Timestamped,
}

const KNOWN: &[&str] = &[
    "test-name",
    "iteration-name",
    "duration",
    "num-requests",
    "total-threads",
    "threads-per-slave",
    "num-entries",
    "entry-size",
    "write-percentage",
    "key-selection",
    "key-format",
    "bucket",
    "per-thread-statistics",
    "histogram",
];

/// Timed get/put load against the service, split over worker threads on every slave.
///
/// Acks carry one [`Statistics`] per worker thread with `per-thread-statistics`, otherwise a
/// single merged one per slave.
#[derive(Debug, Clone)]
pub struct BasicOperationsStage {
    pub test_name: String,
    pub iteration_name: Option<String>,
    pub duration: Option<Duration>,
    /// Requests per worker thread.
    pub num_requests: Option<u64>,
    pub total_threads: usize,
    pub threads_per_slave: Option<usize>,
    pub num_entries: u64,
    pub entry_size: usize,
    pub write_percentage: u8,
    pub key_selection: KeySelection,
    pub key_format: KeyFormat,
    pub bucket: Option<String>,
    pub per_thread_statistics: bool,
    pub histogram: bool,
}

impl BasicOperationsStage {
    pub fn from_properties(props: &Properties) -> Result<Self, StageError> {
        props.reject_unknown(KNOWN)?;

        let duration = props.duration("duration")?;
        let num_requests = props.u64("num-requests")?;
        if duration.is_none() && num_requests.is_none() {
            return Err(PropertyError::Missing("duration` or `num-requests".to_string()).into());
        }

        let write_percentage = props.u64_or("write-percentage", 20)?;
        let write_percentage = u8::try_from(write_percentage)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| PropertyError::Invalid {
                key: "write-percentage".to_string(),
                expected: "a percentage between 0 and 100",
                found: write_percentage.to_string(),
            })?;

        let num_entries = props.u64_or("num-entries", 100)?;
        if num_entries == 0 {
            return Err(PropertyError::Invalid {
                key: "num-entries".to_string(),
                expected: "a positive integer",
                found: "0".to_string(),
            }
            .into());
        }

        Ok(Self {
            test_name: props.string_or("test-name", "Test")?,
            iteration_name: props.string("iteration-name")?,
            duration,
            num_requests,
            total_threads: props.usize_or("total-threads", 1)?,
            threads_per_slave: props
                .contains("threads-per-slave")
                .then(|| props.usize_or("threads-per-slave", 1))
                .transpose()?,
            num_entries,
            entry_size: props.usize_or("entry-size", 100)?,
            write_percentage,
            key_selection: props
                .parsed("key-selection", "colliding or private")?
                .unwrap_or(KeySelection::Colliding),
            key_format: props
                .parsed("key-format", "plain or timestamped")?
                .unwrap_or(KeyFormat::Plain),
            bucket: props.string("bucket")?,
            per_thread_statistics: props.bool_or("per-thread-statistics", false)?,
            histogram: props.bool_or("histogram", true)?,
        })
    }

    /// `(first global thread id, thread count)` for the slave at `rank` of `participants`.
    pub fn threads_for(&self, rank: usize, participants: usize) -> (usize, usize) {
        if let Some(n) = self.threads_per_slave {
            return (rank * n, n);
        }
        let participants = participants.max(1);
        let base = self.total_threads / participants;
        let extra = self.total_threads % participants;
        let count = base + usize::from(rank < extra);
        (rank * base + rank.min(extra), count)
    }

    fn global_threads(&self, participants: usize) -> usize {
        match self.threads_per_slave {
            Some(n) => n * participants.max(1),
            None => self.total_threads,
        }
    }

    pub(super) async fn execute(
        self,
        ctx: &SlaveContext,
        placement: Placement,
    ) -> Result<Option<AckPayload>, StageError> {
        let Some(service) = ctx.capabilities.basic_operations() else {
            return Ok(ctx.skip(StageName::BasicOperations, Capability::BasicOperations));
        };
        ctx.ensure_running()?;

        let (first_thread, threads) = self.threads_for(placement.rank, placement.participants);
        tracing::info!(
            slave = ctx.slave_index,
            test = %self.test_name,
            threads,
            first_thread,
            duration = ?self.duration,
            num_requests = ?self.num_requests,
            "starting load"
        );

        let plan = Arc::new(WorkerPlan {
            global_threads: self.global_threads(placement.participants),
            value: Value::string("x".repeat(self.entry_size)),
            layout: self.histogram.then(HistogramLayout::default),
            stage: self.clone(),
        });

        let deadline = self.duration.map(|d| Instant::now() + d);
        let workers: Vec<_> = (first_thread..first_thread + threads)
            .map(|thread| {
                let plan = plan.clone();
                let service = service.clone();
                tokio::task::spawn_blocking(move || {
                    let gate = WorkerGate::new(deadline, plan.stage.num_requests);
                    plan.run(service.as_ref(), thread, gate)
                })
            })
            .collect();

        let mut per_thread = Vec::with_capacity(threads);
        for joined in futures::future::join_all(workers).await {
            per_thread.push(joined?);
        }

        let requests: u64 = per_thread
            .iter()
            .flat_map(|s| s.operations().map(|(_, o)| o.requests()))
            .sum();
        let errors: u64 = per_thread
            .iter()
            .flat_map(|s| s.operations().map(|(_, o)| o.errors()))
            .sum();
        tracing::info!(
            slave = ctx.slave_index,
            test = %self.test_name,
            requests,
            errors,
            "load finished"
        );

        let stats = if self.per_thread_statistics || per_thread.is_empty() {
            per_thread
        } else {
            Statistics::merge_all(&per_thread)?.into_iter().collect()
        };
        Ok(Some(AckPayload::Statistics(stats)))
    }
}

#[derive(Debug)]
struct WorkerPlan {
    stage: BasicOperationsStage,
    global_threads: usize,
    value: Value,
    layout: Option<HistogramLayout>,
}

impl WorkerPlan {
    fn run(&self, service: &dyn BasicOperations, thread: usize, mut gate: WorkerGate) -> Statistics {
        let mut rng = rand::thread_rng();
        let bucket = self.stage.bucket.as_deref();
        let begin = now_millis();
        let mut stats = Statistics::new(self.layout);
        let mut reported_error = false;

        while gate.next() {
            let key = self.key(&mut rng, thread);
            let write = rng.gen_range(0..100u8) < self.stage.write_percentage;

            let started = Instant::now();
            let (operation, outcome) = if write {
                (PUT, service.put(bucket, key, self.value.clone()))
            } else {
                (GET, service.get(bucket, &key).map(|_| ()))
            };
            let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

            match outcome {
                Ok(()) => stats.register_request(nanos, operation),
                Err(err) => {
                    if !reported_error {
                        tracing::warn!(thread, operation, error = %err, "request failed");
                        reported_error = true;
                    }
                    stats.register_error(nanos, operation);
                }
            }
        }

        stats.with_window(begin, now_millis())
    }

    fn key(&self, rng: &mut impl Rng, thread: usize) -> Key {
        let entries = self.stage.num_entries;
        let id = match self.stage.key_selection {
            KeySelection::Colliding => rng.gen_range(0..entries),
            KeySelection::Private => {
                let per_thread = (entries / self.global_threads.max(1) as u64).max(1);
                thread as u64 * per_thread + rng.gen_range(0..per_thread)
            }
        };

        match self.stage.key_format {
            KeyFormat::Plain => Key::Plain(format!("key_{id}")),
            KeyFormat::Timestamped => Key::Timestamped {
                id,
                timestamp_ms: now_millis(),
            },
        }
    }
}

/// Decides whether a worker issues another request: stops at the deadline or after its request
/// budget, whichever comes first.
#[derive(Debug)]
struct WorkerGate {
    deadline: Option<Instant>,
    remaining: Option<u64>,
}

impl WorkerGate {
    fn new(deadline: Option<Instant>, requests: Option<u64>) -> Self {
        Self {
            deadline,
            remaining: requests,
        }
    }

    fn next(&mut self) -> bool {
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return false;
            }
            *remaining -= 1;
        }
        // Skip timekeeping entirely in request-count mode.
        match self.deadline {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(pairs: &[(&str, Value)]) -> BasicOperationsStage {
        let props: Properties = pairs.iter().map(|(k, v)| (*k, v.clone())).collect();
        BasicOperationsStage::from_properties(&props).unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn total_threads_are_spread_over_slaves() {
        let s = stage(&[
            ("num-requests", Value::I64(1)),
            ("totalThreads", Value::I64(5)),
        ]);
        assert_eq!(s.threads_for(0, 2), (0, 3));
        assert_eq!(s.threads_for(1, 2), (3, 2));
        assert_eq!(s.threads_for(2, 3), (4, 1));

        let s = stage(&[
            ("num-requests", Value::I64(1)),
            ("total-threads", Value::I64(1)),
        ]);
        assert_eq!(s.threads_for(1, 2), (1, 0));
    }

    #[test]
    fn threads_per_slave_overrides_total() {
        let s = stage(&[
            ("duration", Value::string("1s")),
            ("threads-per-slave", Value::I64(4)),
        ]);
        assert_eq!(s.threads_for(2, 3), (8, 4));
        assert_eq!(s.global_threads(3), 12);
    }

    #[test]
    fn rejects_incomplete_or_invalid_configuration() {
        let props = |pairs: &[(&str, Value)]| -> Properties {
            pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        assert!(BasicOperationsStage::from_properties(&props(&[])).is_err());
        assert!(
            BasicOperationsStage::from_properties(&props(&[
                ("num-requests", Value::I64(1)),
                ("write-percentage", Value::I64(101)),
            ]))
            .is_err()
        );
        assert!(
            BasicOperationsStage::from_properties(&props(&[
                ("num-requests", Value::I64(1)),
                ("key-selection", Value::string("shared")),
            ]))
            .is_err()
        );
    }

    #[test]
    fn gate_honours_request_budget() {
        let mut gate = WorkerGate::new(None, Some(3));
        let issued = std::iter::from_fn(|| gate.next().then_some(())).count();
        assert_eq!(issued, 3);

        let mut expired = WorkerGate::new(Some(Instant::now()), None);
        assert!(!expired.next());
    }

    #[test]
    fn private_keys_stay_in_thread_slice() {
        let s = stage(&[
            ("num-requests", Value::I64(1)),
            ("total-threads", Value::I64(4)),
            ("num-entries", Value::I64(40)),
            ("key-selection", Value::string("private")),
        ]);
        let plan = WorkerPlan {
            global_threads: 4,
            value: Value::Null,
            layout: None,
            stage: s,
        };
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            match plan.key(&mut rng, 2) {
                Key::Plain(k) => {
                    let id: u64 = k
                        .trim_start_matches("key_")
                        .parse()
                        .unwrap_or_else(|e| panic!("{e}"));
                    assert!((20..30).contains(&id), "key {id} outside slice");
                }
                other => panic!("unexpected key {other:?}"),
            }
        }
    }
}
