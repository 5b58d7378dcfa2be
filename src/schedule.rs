//! Scheduling of symbolization work.
//!
//! Frames not covered by the [`SymbolTable`] are resolved to their
//! backend targets, grouped per target file, and symbolized on a
//! bounded pool of worker threads. Results flow back to the calling
//! thread, which is the only one recording them.

use std::collections::HashMap;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::thread;

use crossbeam_channel::unbounded;

use crate::backend::Adapter;
use crate::backend::AddressResults;
use crate::cache::CacheKey;
use crate::cache::SymbolTable;
use crate::failure::FailureKind;
use crate::failure::FailureRecord;
use crate::log::debug;
use crate::log::info;
use crate::parse::Frame;
use crate::resolve::ResolvedTarget;
use crate::resolve::Resolver;
use crate::SymbolInfo;


/// The failure reason for addresses the backend knows nothing about.
const NO_SYMBOL_INFO: &str = "no symbol information found";


/// A cache key together with the build ID it was looked up with.
#[derive(Clone, Debug)]
struct Request {
    key: CacheKey,
    build_id: Option<String>,
}


/// The work for a single backend target file.
#[derive(Debug)]
struct Group {
    target: ResolvedTarget,
    /// Distinct addresses, in first-seen order.
    addrs: Vec<String>,
    /// The requests interested in each address.
    requests: HashMap<String, Vec<Request>>,
}


/// The result of a [`Scheduler::schedule`] run.
#[derive(Clone, Debug, Default)]
pub struct ScheduleOutcome {
    /// The freshly produced results.
    pub fresh: HashMap<CacheKey, SymbolInfo>,
    /// Unknown results standing in for addresses the backend failed on.
    /// They are only valid for the current run and not meant to be
    /// persisted, so that a later run retries them.
    pub degraded: HashMap<CacheKey, SymbolInfo>,
    /// The number of backend targets symbolized.
    pub binaries: usize,
    /// The failures encountered, including those of frames covered by
    /// the table that still lack symbol information.
    pub failures: Vec<FailureRecord>,
}


/// A scheduler of symbolization work onto a pool of worker threads.
#[derive(Clone, Debug)]
pub struct Scheduler {
    workers: NonZeroUsize,
}

impl Scheduler {
    /// Create a new `Scheduler` using up to `workers` threads.
    ///
    /// A count of zero selects the available parallelism.
    pub fn new(workers: usize) -> Self {
        let workers = NonZeroUsize::new(workers).unwrap_or_else(default_workers);
        Self { workers }
    }

    /// The maximum number of worker threads used.
    #[inline]
    pub fn workers(&self) -> usize {
        self.workers.get()
    }

    /// Symbolize all `frames` not yet covered by `table`.
    ///
    /// This method does not fail. Objects for which no debug binary
    /// could be found are symbolized using their binary and reported
    /// as failures, as are addresses the backend could not handle.
    #[cfg_attr(feature = "tracing", crate::log::instrument(skip_all))]
    pub fn schedule<'frame, I>(
        &self,
        frames: I,
        resolver: &mut Resolver,
        adapter: &Adapter,
        table: &SymbolTable,
    ) -> ScheduleOutcome
    where
        I: IntoIterator<Item = &'frame Frame>,
    {
        let (cached, requests) = collect_requests(frames, table);
        let mut failures = Vec::new();
        let () = report_cached(&cached, resolver, table, &mut failures);

        if requests.is_empty() {
            debug!("all frames are covered by cached results");
            return ScheduleOutcome {
                failures,
                ..Default::default()
            }
        }

        let groups = group_requests(requests, resolver, &mut failures);
        let binaries = groups.len();
        info!(
            "symbolizing {} address(es) in {binaries} binary(ies)",
            groups.iter().map(|group| group.addrs.len()).sum::<usize>(),
        );

        let mut fresh = HashMap::new();
        let mut degraded = HashMap::new();
        let mut done = 0;
        let () = self.run(&groups, adapter, |group, results| {
            let AddressResults { symbols, failure } = results;
            done += 1;
            info!(
                "[{done}/{binaries}] symbolized {} address(es) in {}",
                group.addrs.len(),
                group.target.backend_target().display()
            );

            for addr in &group.addrs {
                let info = symbols.get(addr).cloned().unwrap_or_default();
                let requests = group.requests.get(addr).map(Vec::as_slice).unwrap_or(&[]);
                for request in requests {
                    if !info.is_unknown() {
                        let _prev = fresh.insert(request.key.clone(), info.clone());
                        continue
                    }

                    let reason = match &failure {
                        Some(reason) => {
                            let _prev = degraded.insert(request.key.clone(), info.clone());
                            reason.clone()
                        }
                        None => {
                            let _prev = fresh.insert(request.key.clone(), info.clone());
                            NO_SYMBOL_INFO.to_string()
                        }
                    };
                    let () = failures.push(FailureRecord {
                        object_path: request.key.object_path.clone(),
                        offset: Some(request.key.offset.clone()),
                        build_id: request.build_id.clone(),
                        resolved_target: Some(group.target.backend_target().to_path_buf()),
                        kind: FailureKind::Backend,
                        reason,
                    });
                }
            }
        });

        ScheduleOutcome {
            fresh,
            degraded,
            binaries,
            failures,
        }
    }

    /// Run `groups` on the worker pool, handing each result to `sink` on
    /// the calling thread.
    fn run<F>(&self, groups: &[Group], adapter: &Adapter, mut sink: F)
    where
        F: FnMut(&Group, AddressResults),
    {
        let nthreads = self.workers.get().min(groups.len());
        if nthreads <= 1 {
            for group in groups {
                let results = adapter.resolve_addresses(&group.target, &group.addrs);
                let () = sink(group, results);
            }
            return
        }

        thread::scope(|s| {
            let (job_tx, job_rx) = unbounded::<&Group>();
            let (result_tx, result_rx) = unbounded::<(&Group, AddressResults)>();

            for _ in 0..nthreads {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let _handle = s.spawn(move || {
                    while let Ok(group) = job_rx.recv() {
                        let results = adapter.resolve_addresses(&group.target, &group.addrs);
                        if result_tx.send((group, results)).is_err() {
                            break
                        }
                    }
                });
            }
            // Workers hold the only remaining senders, so the result
            // channel disconnects once all of them are done.
            drop(result_tx);

            for group in groups {
                // The receiving end is alive as long as this scope is.
                let _result = job_tx.send(group);
            }
            drop(job_tx);

            while let Ok((group, results)) = result_rx.recv() {
                let () = sink(group, results);
            }
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}


fn default_workers() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

/// Collect the distinct requests among `frames`, in first-seen order,
/// split into those covered by `table` and the misses.
fn collect_requests<'frame, I>(frames: I, table: &SymbolTable) -> (Vec<Request>, Vec<Request>)
where
    I: IntoIterator<Item = &'frame Frame>,
{
    let mut seen = HashSet::new();
    frames
        .into_iter()
        .filter_map(|frame| {
            let key = CacheKey::for_frame(frame)?;
            if !seen.insert(key.clone()) {
                return None
            }
            Some(Request {
                key,
                build_id: frame.build_id.clone(),
            })
        })
        .partition(|request| table.contains(&request.key))
}

/// Record failures for `requests` answered by `table`: objects still
/// lacking a debug binary and results without symbol information.
fn report_cached(
    requests: &[Request],
    resolver: &mut Resolver,
    table: &SymbolTable,
    failures: &mut Vec<FailureRecord>,
) {
    for request in requests {
        let target = resolver.resolve(&request.key.object_path, request.build_id.as_deref());
        let resolved_target = Some(target.backend_target().to_path_buf());
        if let Some(reason) = target.failure_reason() {
            let () = failures.push(FailureRecord {
                object_path: request.key.object_path.clone(),
                offset: Some(request.key.offset.clone()),
                build_id: target.build_id.clone(),
                resolved_target: resolved_target.clone(),
                kind: FailureKind::Resolution,
                reason,
            });
        }

        if table.get(&request.key).is_some_and(SymbolInfo::is_unknown) {
            let () = failures.push(FailureRecord {
                object_path: request.key.object_path.clone(),
                offset: Some(request.key.offset.clone()),
                build_id: request.build_id.clone(),
                resolved_target,
                kind: FailureKind::Backend,
                reason: format!("{NO_SYMBOL_INFO} (cached)"),
            });
        }
    }
}

/// Resolve the objects of `requests` and group them by backend target
/// file, preserving first-seen order.
fn group_requests(
    requests: Vec<Request>,
    resolver: &mut Resolver,
    failures: &mut Vec<FailureRecord>,
) -> Vec<Group> {
    let mut groups = Vec::<Group>::new();
    let mut group_idx = HashMap::<PathBuf, usize>::new();

    for request in requests {
        let target = resolver.resolve(&request.key.object_path, request.build_id.as_deref());
        if let Some(reason) = target.failure_reason() {
            let () = failures.push(FailureRecord {
                object_path: request.key.object_path.clone(),
                offset: Some(request.key.offset.clone()),
                build_id: target.build_id.clone(),
                resolved_target: Some(target.backend_target().to_path_buf()),
                kind: FailureKind::Resolution,
                reason,
            });
        }

        let file = target.backend_target().to_path_buf();
        let idx = *group_idx.entry(file).or_insert_with(|| {
            let () = groups.push(Group {
                target: target.clone(),
                addrs: Vec::new(),
                requests: HashMap::new(),
            });
            groups.len() - 1
        });

        let group = &mut groups[idx];
        let addr = request.key.offset.clone();
        let requests = group.requests.entry(addr.clone()).or_insert_with(|| {
            let () = group.addrs.push(addr);
            Vec::new()
        });
        let () = requests.push(request);
    }
    groups
}
