//! Batch orchestration.
//!
//! [`run_batch`] is the single entry point. A coordinator either fits the
//! grid on a local thread pool or serves it to remote workers over TCP; a
//! worker connects to a coordinator and fits whatever it is handed. Every
//! model is an independent job, and outcomes are re-associated with their
//! spec by grid index, never by completion order. One failing fit never
//! aborts the batch.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::engine::CancelToken;
use crate::error::{DdmError, Result};
use crate::runner::{ModelResult, ModelRunner};
use crate::spec::ModelSpec;
use crate::summary::format_group_stats;

/// Environment variables consulted for the process rank, in order.
pub const RANK_VARS: [&str; 3] = ["DDMGRID_RANK", "OMPI_COMM_WORLD_RANK", "PMI_RANK"];

const POLL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Role and configuration
// ---------------------------------------------------------------------------

/// Which side of the dispatch boundary this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Worker,
}

impl Role {
    /// Rank 0 coordinates; every other rank works.
    pub fn from_rank(rank: usize) -> Self {
        if rank == 0 {
            Self::Coordinator
        } else {
            Self::Worker
        }
    }

    /// Role from the first rank variable `lookup` can resolve.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        RANK_VARS
            .into_iter()
            .find_map(|var| lookup(var).and_then(|v| v.trim().parse::<usize>().ok()))
            .map_or(Self::Coordinator, Self::from_rank)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }
}

impl std::str::FromStr for Role {
    type Err = DdmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coordinator" | "controller" => Ok(Self::Coordinator),
            "worker" => Ok(Self::Worker),
            other => Err(DdmError::Dispatch(format!("unknown role '{other}'"))),
        }
    }
}

/// Batch-level settings shared by both roles.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub samples: usize,
    pub burn: usize,
    pub resume: bool,
    /// Threads used by the local pool.
    pub workers: usize,
    /// Coordinator: serve jobs on this address instead of running locally.
    pub listen: Option<String>,
    /// Worker: coordinator address.
    pub connect: Option<String>,
    /// How long a worker keeps retrying its first connection.
    pub connect_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            samples: 10_000,
            burn: 5_000,
            resume: false,
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            listen: None,
            connect: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of one grid entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Position of the spec in the grid.
    pub index: usize,
    pub name: String,
    pub result: std::result::Result<ModelResult, String>,
}

impl JobOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    fn failed(index: usize, name: &str, reason: impl Into<String>) -> Self {
        Self {
            index,
            name: name.to_string(),
            result: Err(reason.into()),
        }
    }
}

fn run_job(
    runner: &ModelRunner,
    index: usize,
    spec: &ModelSpec,
    samples: usize,
    burn: usize,
    resume: bool,
    cancel: &CancelToken,
) -> JobOutcome {
    let run = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        runner.run(spec, samples, burn, resume, cancel)
    }));
    let result = match run {
        Ok(Ok(r)) => Ok(r),
        Ok(Err(e)) if e.is_construction_error() => {
            log::warn!("[{index}] {} rejected before sampling: {e}", spec.name);
            Err(format!("rejected before sampling: {e}"))
        }
        Ok(Err(e)) => {
            log::warn!("[{index}] {} failed: {e}", spec.name);
            Err(e.to_string())
        }
        Err(_) => {
            log::error!("[{index}] {} panicked", spec.name);
            Err("sampling thread panicked".to_string())
        }
    };
    JobOutcome {
        index,
        name: spec.name.clone(),
        result,
    }
}

// ---------------------------------------------------------------------------
// Local pool
// ---------------------------------------------------------------------------

/// Fits a grid on scoped threads in this process.
#[derive(Debug, Clone, Copy)]
pub struct LocalPool {
    workers: usize,
}

impl LocalPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Fit every spec; outcomes come back in grid order.
    pub fn run(
        &self,
        runner: &ModelRunner,
        specs: &[ModelSpec],
        config: &BatchConfig,
        cancel: &CancelToken,
    ) -> Vec<JobOutcome> {
        let queue = Mutex::new((0..specs.len()).collect::<VecDeque<usize>>());
        let threads = self.workers.min(specs.len());
        log::info!("fitting {} models on {threads} threads", specs.len());

        let mut outcomes: Vec<JobOutcome> = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let queue = &queue;
                    s.spawn(move || {
                        let mut done = Vec::new();
                        loop {
                            let next = lock(queue).pop_front();
                            let Some(i) = next else { break };
                            done.push(run_job(
                                runner,
                                i,
                                &specs[i],
                                config.samples,
                                config.burn,
                                config.resume,
                                cancel,
                            ));
                        }
                        done
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_default())
                .collect()
        });

        // A thread lost to a panic outside run_job leaves holes.
        for (i, spec) in specs.iter().enumerate() {
            if !outcomes.iter().any(|o| o.index == i) {
                outcomes.push(JobOutcome::failed(i, &spec.name, "worker thread lost"));
            }
        }
        outcomes.sort_by_key(|o| o.index);
        outcomes
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// TCP dispatch
// ---------------------------------------------------------------------------

/// Line-delimited JSON messages exchanged between coordinator and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Message {
    Ready,
    Job {
        index: usize,
        name: String,
        samples: usize,
        burn: usize,
        resume: bool,
    },
    Outcome {
        outcome: JobOutcome,
    },
    Shutdown,
}

fn send(stream: &mut TcpStream, msg: &Message) -> Result<()> {
    let mut line =
        serde_json::to_string(msg).map_err(|e| DdmError::Dispatch(format!("encode: {e}")))?;
    line.push('\n');
    stream
        .write_all(line.as_bytes())
        .map_err(|e| DdmError::io("dispatch send", e))
}

/// `None` on a closed connection.
fn receive(reader: &mut impl BufRead) -> Result<Option<Message>> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|e| DdmError::io("dispatch receive", e))?;
    if n == 0 {
        return Ok(None);
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| DdmError::Dispatch(format!("malformed message: {e}")))
}

#[derive(Default)]
struct DispatchState {
    pending: VecDeque<usize>,
    outcomes: Vec<Option<JobOutcome>>,
    done: usize,
    streams: Vec<TcpStream>,
}

impl DispatchState {
    fn all_done(&self) -> bool {
        self.done == self.outcomes.len()
    }

    fn record(&mut self, outcome: JobOutcome) {
        let slot = &mut self.outcomes[outcome.index];
        if slot.is_none() {
            self.done += 1;
        }
        *slot = Some(outcome);
    }
}

/// Serves a grid to remote workers.
pub struct TcpCoordinator {
    listener: TcpListener,
}

impl TcpCoordinator {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| DdmError::io("binding coordinator", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| DdmError::io("configuring coordinator socket", e))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| DdmError::io("coordinator address", e))
    }

    /// Hand out every spec and collect the outcomes in grid order.
    ///
    /// Jobs held by a worker that disconnects are requeued. On cancellation
    /// all connections are closed and unfinished jobs are reported as
    /// failed.
    pub fn run(
        &self,
        specs: &[ModelSpec],
        config: &BatchConfig,
        cancel: &CancelToken,
    ) -> Result<Vec<JobOutcome>> {
        let state = Mutex::new(DispatchState {
            pending: (0..specs.len()).collect(),
            outcomes: vec![None; specs.len()],
            ..Default::default()
        });
        log::info!(
            "serving {} models on {}",
            specs.len(),
            self.local_addr()?
        );

        thread::scope(|s| -> Result<()> {
            while !lock(&state).all_done() {
                if cancel.is_cancelled() {
                    for stream in lock(&state).streams.drain(..) {
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                    break;
                }
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        log::info!("worker connected from {peer}");
                        stream
                            .set_nonblocking(false)
                            .map_err(|e| DdmError::io("configuring worker socket", e))?;
                        if let Ok(clone) = stream.try_clone() {
                            lock(&state).streams.push(clone);
                        }
                        let state = &state;
                        s.spawn(move || {
                            if let Err(e) = serve_worker(stream, specs, config, state, cancel) {
                                log::warn!("worker {peer}: {e}");
                            }
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(POLL),
                    Err(e) => return Err(DdmError::io("accepting worker", e)),
                }
            }
            Ok(())
        })?;

        // Workers still queued on the socket get an immediate shutdown.
        while let Ok((mut stream, _)) = self.listener.accept() {
            let _ = stream.set_nonblocking(false);
            let _ = send(&mut stream, &Message::Shutdown);
        }

        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .outcomes
            .into_iter()
            .enumerate()
            .map(|(i, o)| o.unwrap_or_else(|| JobOutcome::failed(i, &specs[i].name, "cancelled")))
            .collect())
    }
}

fn serve_worker(
    mut stream: TcpStream,
    specs: &[ModelSpec],
    config: &BatchConfig,
    state: &Mutex<DispatchState>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut reader = BufReader::new(
        stream
            .try_clone()
            .map_err(|e| DdmError::io("cloning worker socket", e))?,
    );
    let mut current: Option<usize> = None;

    let result = (|| -> Result<()> {
        loop {
            match receive(&mut reader)? {
                None => return Ok(()),
                Some(Message::Ready) => {}
                Some(Message::Outcome { outcome }) => {
                    if current != Some(outcome.index) {
                        return Err(DdmError::Dispatch(format!(
                            "unexpected outcome for job {}",
                            outcome.index
                        )));
                    }
                    log::info!(
                        "[{}] {} {}",
                        outcome.index,
                        outcome.name,
                        if outcome.is_ok() { "done" } else { "failed" }
                    );
                    lock(state).record(outcome);
                    current = None;
                }
                Some(other) => {
                    return Err(DdmError::Dispatch(format!("unexpected message {other:?}")));
                }
            }

            let next = loop {
                let mut st = lock(state);
                if let Some(i) = st.pending.pop_front() {
                    break Some(i);
                }
                if st.all_done() || cancel.is_cancelled() {
                    break None;
                }
                drop(st);
                thread::sleep(POLL);
            };
            match next {
                Some(index) => {
                    current = Some(index);
                    send(
                        &mut stream,
                        &Message::Job {
                            index,
                            name: specs[index].name.clone(),
                            samples: config.samples,
                            burn: config.burn,
                            resume: config.resume,
                        },
                    )?;
                }
                None => {
                    send(&mut stream, &Message::Shutdown)?;
                    return Ok(());
                }
            }
        }
    })();

    if let Some(index) = current {
        log::warn!("requeueing job {index} from a lost worker");
        lock(state).pending.push_back(index);
    }
    result
}

fn connect(addr: &str, timeout: Duration, cancel: &CancelToken) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline && !cancel.is_cancelled() => {
                log::debug!("coordinator {addr} not reachable yet: {e}");
                thread::sleep(POLL * 4);
            }
            Err(e) => return Err(DdmError::io(format!("connecting to {addr}"), e)),
        }
    }
}

/// Fit jobs handed out by the coordinator at `addr` until told to stop.
///
/// `specs` must be the same grid the coordinator serves; a job whose name
/// does not match the local grid is reported back as failed.
pub fn tcp_worker(
    addr: &str,
    runner: &ModelRunner,
    specs: &[ModelSpec],
    config: &BatchConfig,
    cancel: &CancelToken,
) -> Result<Vec<JobOutcome>> {
    let mut stream = connect(addr, config.connect_timeout, cancel)?;
    let mut reader = BufReader::new(
        stream
            .try_clone()
            .map_err(|e| DdmError::io("cloning coordinator socket", e))?,
    );
    send(&mut stream, &Message::Ready)?;

    let mut ran = Vec::new();
    loop {
        match receive(&mut reader)? {
            None | Some(Message::Shutdown) => break,
            Some(Message::Job {
                index,
                name,
                samples,
                burn,
                resume,
            }) => {
                let outcome = match specs.get(index) {
                    Some(spec) if spec.name == name => {
                        log::info!("[{index}] fitting {name}");
                        run_job(runner, index, spec, samples, burn, resume, cancel)
                    }
                    _ => JobOutcome::failed(
                        index,
                        &name,
                        format!("job {index} ({name}) is not in this worker's grid"),
                    ),
                };
                send(
                    &mut stream,
                    &Message::Outcome {
                        outcome: outcome.clone(),
                    },
                )?;
                ran.push(outcome);
            }
            Some(other) => {
                return Err(DdmError::Dispatch(format!("unexpected message {other:?}")));
            }
        }
    }
    Ok(ran)
}

// ---------------------------------------------------------------------------
// Entry point and reporting
// ---------------------------------------------------------------------------

/// Run a grid in the given role.
///
/// A coordinator returns one outcome per spec, in grid order. A worker
/// returns the outcomes of the jobs it ran.
pub fn run_batch(
    role: Role,
    specs: &[ModelSpec],
    runner: &ModelRunner,
    config: &BatchConfig,
    cancel: &CancelToken,
) -> Result<Vec<JobOutcome>> {
    match role {
        Role::Coordinator => match &config.listen {
            Some(addr) => TcpCoordinator::bind(addr.as_str())?.run(specs, config, cancel),
            None => Ok(LocalPool::new(config.workers).run(runner, specs, config, cancel)),
        },
        Role::Worker => {
            let addr = config.connect.as_deref().ok_or_else(|| {
                DdmError::Dispatch("worker role needs a coordinator address".into())
            })?;
            tcp_worker(addr, runner, specs, config, cancel)
        }
    }
}

/// Per-model summary tables followed by a failure list.
pub fn format_report(outcomes: &[JobOutcome]) -> String {
    let mut out = String::new();
    for outcome in outcomes {
        if let Ok(r) = &outcome.result {
            let _ = writeln!(out, "== [{}] {}", outcome.index, outcome.name);
            let _ = writeln!(
                out,
                "DIC: {:.4}  logp: {:.4}  trials: {} (excluded {})",
                r.dic, r.logp, r.n_trials, r.excluded_trials
            );
            out.push_str(&format_group_stats(&r.stats));
            out.push('\n');
        }
    }
    let failed: Vec<&JobOutcome> = outcomes.iter().filter(|o| !o.is_ok()).collect();
    let _ = writeln!(
        out,
        "{} of {} models fitted",
        outcomes.len() - failed.len(),
        outcomes.len()
    );
    for o in failed {
        if let Err(reason) = &o.result {
            let _ = writeln!(out, "  FAILED [{}] {}: {reason}", o.index, o.name);
        }
    }
    out
}
