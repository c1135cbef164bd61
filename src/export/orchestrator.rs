use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use super::config::ExportConfiguration;
use super::job::{ExportJob, JobEvent, JobId, JobProgress, JobStatus, OutputRef};
use super::precompute::{Dataset, FrameCache, FrameRecord, Precomputer, PROGRESS_STRIDE};
use super::renderer::{JobControl, RenderJob, Renderer};
use crate::error::{Error, Result};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);
const CANCELLED: &str = "cancelled";

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// How long finished jobs stay queryable.
    pub grace_period: Duration,
    pub progress_stride: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            progress_stride: PROGRESS_STRIDE,
        }
    }
}

/// One export. `dataset.generation` keys the frame cache, so it must change
/// whenever the series, tracks or mapping change.
pub struct ExportRequest {
    pub label: String,
    pub config: ExportConfiguration,
    pub dataset: Arc<Dataset>,
    pub renderer: Box<dyn Renderer>,
}

enum Command {
    Run(JobId, ExportRequest),
    Shutdown,
}

struct JobEntry {
    job: ExportJob,
    cancel: Arc<AtomicBool>,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct Shared {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    subscribers: Mutex<Vec<Sender<JobEvent>>>,
    cache: FrameCache,
}

impl Shared {
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        // A panicking collaborator must not take the job table down with it.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn broadcast(&self, event: JobEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Stamps terminal transitions and sends the job's event. Callers hold
    /// the table lock, so no event can follow a job's terminal event.
    fn publish(&self, entry: &mut JobEntry) {
        if entry.job.is_terminal() && entry.finished_at.is_none() {
            entry.job.completed_at = Some(SystemTime::now());
            entry.finished_at = Some(Instant::now());
        }
        self.broadcast(JobEvent::from_job(&entry.job));
    }

    /// Applies `f` to a live job. Returns false if the job is unknown or
    /// already terminal, in which case nothing changes.
    fn update(&self, id: JobId, f: impl FnOnce(&mut ExportJob)) -> bool {
        let mut jobs = self.jobs();
        match jobs.get_mut(&id) {
            Some(entry) if !entry.job.is_terminal() => {
                f(&mut entry.job);
                self.publish(entry);
                true
            }
            _ => false,
        }
    }

    fn cancel(&self, id: JobId) -> bool {
        let mut jobs = self.jobs();
        let Some(entry) = jobs.get_mut(&id) else {
            return false;
        };
        if entry.job.is_terminal() {
            return false;
        }
        entry.cancel.store(true, Ordering::Release);
        let was = entry.job.status;
        entry.job.status = JobStatus::Failed;
        entry.job.error = Some(CANCELLED.to_string());
        entry.job.progress = JobProgress::new(JobStatus::Failed, entry.job.progress.fraction, CANCELLED);
        self.publish(entry);
        log::info!("{} cancelled while {}", id, was);
        true
    }

    fn report(&self, id: JobId, fraction: f32, message: &str, frames: Option<(usize, usize)>) {
        self.update(id, |job| {
            let mut progress = JobProgress::new(job.status, fraction, message);
            if let Some((current, total)) = frames {
                progress = progress.with_frames(current, total);
            }
            job.progress = progress;
        });
    }

    /// Moves a live job into `phase`; a cancelled job stops here.
    fn phase(&self, id: JobId, phase: JobStatus, message: &str) -> Result<()> {
        let entered = self.update(id, |job| {
            job.status = phase;
            job.progress = JobProgress::new(phase, 0.0, message);
        });
        if entered {
            log::info!("{}: {}", id, message);
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    fn sweep(&self, grace: Duration) {
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|_, entry| entry.finished_at.map_or(true, |at| at.elapsed() < grace));
        let removed = before - jobs.len();
        if removed > 0 {
            log::debug!("Dropped {} finished job records", removed);
        }
    }
}

fn run_job(shared: &Arc<Shared>, id: JobId, mut request: ExportRequest, config: &OrchestratorConfig) {
    let cancel = match shared.jobs().get(&id) {
        Some(entry) if !entry.job.is_terminal() => Arc::clone(&entry.cancel),
        _ => {
            log::info!("{} was cancelled while queued, skipping", id);
            return;
        }
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| process(shared, id, &mut request, &cancel, config)))
        .unwrap_or_else(|payload| {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("renderer panicked: {}", reason))
        });

    match result {
        Ok(output) => {
            let shown = output.to_string();
            let completed = shared.update(id, |job| {
                job.status = JobStatus::Complete;
                job.progress = JobProgress::new(JobStatus::Complete, 1.0, "export complete");
                job.output_ref = Some(output);
            });
            if completed {
                log::info!("{} complete: {}", id, shown);
            } else {
                request.renderer.abort();
            }
        }
        Err(err) => {
            request.renderer.abort();
            let message = format!("{:#}", err);
            let recorded = shared.update(id, |job| {
                job.progress = JobProgress::new(JobStatus::Failed, job.progress.fraction, message.clone());
                job.status = JobStatus::Failed;
                job.error = Some(message.clone());
            });
            if recorded {
                log::error!("{} failed: {}", id, message);
            } else {
                log::info!("{} stopped after cancellation", id);
            }
        }
    }
}

fn process(
    shared: &Arc<Shared>,
    id: JobId,
    request: &mut ExportRequest,
    cancel: &Arc<AtomicBool>,
    config: &OrchestratorConfig,
) -> anyhow::Result<OutputRef> {
    let checkpoint = || -> Result<()> {
        if cancel.load(Ordering::Acquire) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    };

    shared.phase(id, JobStatus::Preparing, "validating configuration")?;
    request.config.validate()?;
    checkpoint()?;

    shared.phase(id, JobStatus::Analyzing, "precomputing frames")?;
    let dataset = Arc::clone(&request.dataset);
    let frames = match shared.cache.get(dataset.generation, &request.config) {
        Some(frames) => {
            log::info!("{}: reusing {} precomputed frames", id, frames.len());
            frames
        }
        None => {
            let total = request.config.total_frames();
            let computed = Precomputer::new(&dataset.series, &dataset.midi, dataset.mapping.as_ref())
                .with_stride(config.progress_stride)
                .run(
                    &request.config,
                    &mut |fraction| {
                        let done = (fraction * total as f32).round() as usize;
                        shared.report(id, fraction, "precomputing frames", Some((done, total)));
                    },
                    cancel,
                )?;
            checkpoint()?;
            shared.cache.insert(dataset.generation, &request.config, computed)
        }
    };
    checkpoint()?;

    let weak = Arc::downgrade(shared);
    let job = RenderJob {
        id,
        config: request.config.clone(),
        frames,
        index: dataset.index.clone(),
        control: JobControl::new(Arc::clone(cancel), move |fraction, message, frames| {
            if let Some(shared) = weak.upgrade() {
                shared.report(id, fraction, message, frames);
            }
        }),
    };

    shared.phase(id, JobStatus::Rendering, "rendering frames")?;
    request.renderer.render(&job)?;
    checkpoint()?;

    shared.phase(id, JobStatus::Encoding, "encoding output")?;
    let output = request.renderer.encode(&job)?;
    checkpoint()?;
    Ok(output)
}

fn worker_loop(shared: Arc<Shared>, commands: Receiver<Command>, config: OrchestratorConfig) {
    loop {
        match commands.recv_timeout(SWEEP_INTERVAL) {
            Ok(Command::Run(id, request)) => run_job(&shared, id, request, &config),
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        shared.sweep(config.grace_period);
    }
    log::debug!("Export worker stopped");
}

/// Single-flight export queue. One worker thread consumes a FIFO channel, so
/// at most one job ever holds the render slot no matter how many threads
/// enqueue.
pub struct Orchestrator {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    next_id: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let (commands, rx) = crossbeam_channel::unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("export-worker".into())
            .spawn(move || worker_loop(worker_shared, rx, config))?;
        Ok(Self {
            shared,
            commands,
            next_id: AtomicU64::new(1),
            worker: Some(worker),
        })
    }

    /// Queues an export. Invalid configurations are rejected here and never
    /// reach the queue.
    pub fn enqueue(&self, request: ExportRequest) -> Result<JobId> {
        request.config.validate()?;
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut jobs = self.shared.jobs();
            let mut entry = JobEntry {
                job: ExportJob::new(id, request.label.clone()),
                cancel: Arc::new(AtomicBool::new(false)),
                finished_at: None,
            };
            self.shared.publish(&mut entry);
            jobs.insert(id, entry);
        }
        log::info!(
            "{} queued: {} ({} frames, renderer {})",
            id,
            request.label,
            request.config.total_frames(),
            request.renderer.name()
        );

        if self.commands.send(Command::Run(id, request)).is_err() {
            self.shared.update(id, |job| {
                job.status = JobStatus::Failed;
                job.error = Some("export worker is not running".into());
            });
            return Err(Error::JobFailed("export worker is not running".into()));
        }
        Ok(id)
    }

    /// Snapshot of a job, or None once it is unknown or garbage-collected.
    pub fn get_status(&self, id: JobId) -> Option<ExportJob> {
        self.shared.jobs().get(&id).map(|entry| entry.job.clone())
    }

    /// Cancels a queued or running job. The running step stops at its next
    /// frame boundary. Returns false for unknown or finished jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        self.shared.cancel(id)
    }

    /// Jobs that have not reached a terminal state, oldest first.
    pub fn active_jobs(&self) -> Vec<ExportJob> {
        let mut jobs: Vec<ExportJob> = self
            .shared
            .jobs()
            .values()
            .filter(|entry| !entry.job.is_terminal())
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub fn subscribe(&self) -> Receiver<JobEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        rx
    }

    /// A frame from the most recent precomputation.
    pub fn frame(&self, frame_number: usize) -> Option<FrameRecord> {
        self.shared.cache.frame(frame_number)
    }

    /// Drops precomputed frames, e.g. after the dataset is replaced.
    pub fn clear_cache(&self) {
        self.shared.cache.clear();
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let pending: Vec<JobId> = self.active_jobs().iter().map(|job| job.id).collect();
        for id in pending {
            self.shared.cancel(id);
        }
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Export worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::midi::{MidiNoteEvent, MidiTrack};
    use crate::audio::series::FeatureSeries;
    use crate::export::mapping::{NoMapping, VisualMapping};
    use crate::features::index::{FeatureIndex, MAX_FEATURES};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::collections::{BTreeMap, HashSet};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    const DEADLINE: Duration = Duration::from_secs(10);

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < DEADLINE, "timed out waiting for condition");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn dataset(with_midi: bool) -> Arc<Dataset> {
        let series = vec![
            FeatureSeries::new("drums", "rms", vec![0.0, 1.0]),
            FeatureSeries::new("bass", "rms", vec![0.5, 0.5]),
        ];
        let midi = if with_midi {
            vec![MidiTrack::new(
                "lead",
                vec![MidiNoteEvent {
                    pitch: 60,
                    velocity: 1.0,
                    start_time: 0.0,
                    duration: 0.5,
                    track_id: String::new(),
                }],
            )]
        } else {
            Vec::new()
        };
        let index = FeatureIndex::from_series(&series, MAX_FEATURES).unwrap();
        Arc::new(Dataset {
            series,
            midi,
            index,
            mapping: Arc::new(NoMapping),
            generation: if with_midi { 1 } else { 2 },
        })
    }

    fn config(fps: u32) -> ExportConfiguration {
        ExportConfiguration {
            fps,
            duration_seconds: 1.0,
            ..Default::default()
        }
    }

    /// Completes immediately.
    struct InstantRenderer;

    impl Renderer for InstantRenderer {
        fn name(&self) -> &str {
            "instant"
        }

        fn render(&mut self, job: &RenderJob) -> anyhow::Result<()> {
            for frame in job.frames.iter() {
                job.control.checkpoint()?;
                job.control.report_frame(frame.frame_number + 1, job.frames.len());
            }
            Ok(())
        }

        fn encode(&mut self, job: &RenderJob) -> anyhow::Result<OutputRef> {
            Ok(OutputRef(PathBuf::from(format!("{}.out", job.id))))
        }
    }

    /// Blocks in `render` until the gate sender is dropped or signalled.
    struct GateRenderer {
        entered: Sender<()>,
        gate: Receiver<()>,
    }

    impl Renderer for GateRenderer {
        fn name(&self) -> &str {
            "gate"
        }

        fn render(&mut self, job: &RenderJob) -> anyhow::Result<()> {
            let _ = self.entered.send(());
            loop {
                job.control.checkpoint()?;
                match self.gate.recv_timeout(Duration::from_millis(5)) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => return Ok(()),
                }
            }
        }

        fn encode(&mut self, _job: &RenderJob) -> anyhow::Result<OutputRef> {
            Ok(OutputRef(PathBuf::from("gated.out")))
        }
    }

    struct FailingRenderer;

    impl Renderer for FailingRenderer {
        fn name(&self) -> &str {
            "failing"
        }

        fn render(&mut self, _job: &RenderJob) -> anyhow::Result<()> {
            anyhow::bail!("device lost")
        }

        fn encode(&mut self, _job: &RenderJob) -> anyhow::Result<OutputRef> {
            unreachable!("encode after failed render")
        }
    }

    struct PanickingRenderer;

    impl Renderer for PanickingRenderer {
        fn name(&self) -> &str {
            "panicking"
        }

        fn render(&mut self, _job: &RenderJob) -> anyhow::Result<()> {
            panic!("shader exploded")
        }

        fn encode(&mut self, _job: &RenderJob) -> anyhow::Result<OutputRef> {
            unreachable!()
        }
    }

    /// Blocks every frame's mapping until the gate opens, pinning the job in
    /// `analyzing`.
    struct GateMapping {
        entered: Sender<()>,
        gate: Receiver<()>,
    }

    impl VisualMapping for GateMapping {
        fn map(
            &self,
            _features: &BTreeMap<String, f32>,
            _midi: &crate::export::precompute::MidiState,
        ) -> BTreeMap<String, serde_json::Value> {
            let _ = self.entered.try_send(());
            let _ = self.gate.recv();
            BTreeMap::new()
        }
    }

    fn request(label: &str, renderer: Box<dyn Renderer>) -> ExportRequest {
        ExportRequest {
            label: label.into(),
            config: config(10),
            dataset: dataset(true),
            renderer,
        }
    }

    fn status(orch: &Orchestrator, id: JobId) -> JobStatus {
        orch.get_status(id).map(|j| j.status).unwrap_or(JobStatus::Failed)
    }

    #[test]
    fn job_runs_through_every_phase() {
        let orch = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let events = orch.subscribe();
        let id = orch.enqueue(request("clip", Box::new(InstantRenderer))).unwrap();
        wait_for(|| status(&orch, id) == JobStatus::Complete);

        let job = orch.get_status(id).unwrap();
        assert_eq!(job.output_ref, Some(OutputRef(PathBuf::from("export-1.out"))));
        assert!(job.completed_at.is_some());
        assert_eq!(job.progress.fraction, 1.0);

        let mut phases: Vec<JobStatus> = events.try_iter().map(|e| e.status).collect();
        phases.dedup();
        assert_eq!(
            phases,
            vec![
                JobStatus::Queued,
                JobStatus::Preparing,
                JobStatus::Analyzing,
                JobStatus::Rendering,
                JobStatus::Encoding,
                JobStatus::Complete,
            ]
        );
        assert_eq!(orch.frame(9).unwrap().frame_number, 9);
    }

    #[test]
    fn second_job_waits_for_the_first() {
        let orch = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let (entered_tx, entered_rx) = bounded(1);
        let (gate_tx, gate_rx) = bounded(0);
        let first = orch
            .enqueue(request(
                "first",
                Box::new(GateRenderer {
                    entered: entered_tx,
                    gate: gate_rx,
                }),
            ))
            .unwrap();
        entered_rx.recv_timeout(DEADLINE).unwrap();
        let second = orch.enqueue(request("second", Box::new(InstantRenderer))).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(status(&orch, first), JobStatus::Rendering);
        assert_eq!(status(&orch, second), JobStatus::Queued);
        assert_eq!(orch.active_jobs().len(), 2);

        drop(gate_tx);
        wait_for(|| status(&orch, second) == JobStatus::Complete);
        assert_eq!(status(&orch, first), JobStatus::Complete);
        assert!(orch.active_jobs().is_empty());
    }

    #[test]
    fn cancel_during_analysis_stops_all_events() {
        let orch = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let events = orch.subscribe();
        let (entered_tx, entered_rx) = bounded(1);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let mut req = request("slow", Box::new(InstantRenderer));
        req.dataset = Arc::new(Dataset {
            mapping: Arc::new(GateMapping {
                entered: entered_tx,
                gate: gate_rx,
            }),
            generation: 3,
            ..(*dataset(true)).clone()
        });
        let id = orch.enqueue(req).unwrap();

        entered_rx.recv_timeout(DEADLINE).unwrap();
        assert_eq!(status(&orch, id), JobStatus::Analyzing);
        assert!(orch.cancel(id));
        let job = orch.get_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("cancelled"));
        assert!(!orch.cancel(id));

        drop(gate_tx);
        // FIFO: once this one completes the cancelled job has fully unwound
        let marker = orch.enqueue(request("marker", Box::new(InstantRenderer))).unwrap();
        wait_for(|| status(&orch, marker) == JobStatus::Complete);

        let for_job: Vec<JobEvent> = events.try_iter().filter(|e| e.job_id == id).collect();
        let last = for_job.last().unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert_eq!(last.error.as_deref(), Some("cancelled"));
        let terminal_at = for_job.iter().position(|e| e.status.is_terminal()).unwrap();
        assert_eq!(terminal_at, for_job.len() - 1);
        assert_eq!(orch.get_status(id).unwrap().error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn cancelled_queued_job_is_skipped() {
        let orch = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let (entered_tx, entered_rx) = bounded(1);
        let (gate_tx, gate_rx) = bounded(0);
        let first = orch
            .enqueue(request(
                "first",
                Box::new(GateRenderer {
                    entered: entered_tx,
                    gate: gate_rx,
                }),
            ))
            .unwrap();
        entered_rx.recv_timeout(DEADLINE).unwrap();
        let second = orch.enqueue(request("second", Box::new(FailingRenderer))).unwrap();
        assert!(orch.cancel(second));

        drop(gate_tx);
        wait_for(|| status(&orch, first) == JobStatus::Complete);
        let third = orch.enqueue(request("third", Box::new(InstantRenderer))).unwrap();
        wait_for(|| status(&orch, third) == JobStatus::Complete);
        // never reached the renderer, so the error is still the cancellation
        assert_eq!(orch.get_status(second).unwrap().error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn failures_do_not_stop_the_worker() {
        let orch = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let failed = orch.enqueue(request("bad", Box::new(FailingRenderer))).unwrap();
        let panicked = orch.enqueue(request("worse", Box::new(PanickingRenderer))).unwrap();
        let mut missing = request("no-midi", Box::new(InstantRenderer));
        missing.dataset = dataset(false);
        let missing = orch.enqueue(missing).unwrap();
        let good = orch.enqueue(request("good", Box::new(InstantRenderer))).unwrap();

        wait_for(|| status(&orch, good) == JobStatus::Complete);
        let failed = orch.get_status(failed).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("device lost"));
        assert!(orch.get_status(panicked).unwrap().error.unwrap().contains("shader exploded"));
        assert!(orch.get_status(missing).unwrap().error.unwrap().contains("missing data"));
    }

    #[test]
    fn invalid_configuration_never_enters_the_queue() {
        let orch = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let mut req = request("bad", Box::new(InstantRenderer));
        req.config.fps = 0;
        assert!(matches!(orch.enqueue(req), Err(Error::ConfigurationInvalid(_))));
        assert!(orch.active_jobs().is_empty());
    }

    #[test]
    fn finished_jobs_are_collected_after_grace_period() {
        let orch = Orchestrator::new(OrchestratorConfig {
            grace_period: Duration::from_millis(20),
            ..Default::default()
        })
        .unwrap();
        let id = orch.enqueue(request("clip", Box::new(InstantRenderer))).unwrap();
        wait_for(|| orch.get_status(id).is_none());
        assert!(!orch.cancel(id));
        assert!(!orch.cancel(JobId(999)));
    }

    /// Counts overlapping jobs between the start of `render` and the end of
    /// `encode`.
    struct CountingRenderer {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Renderer for CountingRenderer {
        fn name(&self) -> &str {
            "counting"
        }

        fn render(&mut self, job: &RenderJob) -> anyhow::Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            job.control.checkpoint()?;
            Ok(())
        }

        fn encode(&mut self, job: &RenderJob) -> anyhow::Result<OutputRef> {
            thread::sleep(Duration::from_millis(1));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(OutputRef(PathBuf::from(format!("{}.out", job.id))))
        }
    }

    #[test]
    fn concurrent_producers_share_one_render_slot() {
        const PRODUCERS: usize = 4;
        const JOBS_EACH: usize = 5;

        let orch = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let ids: Vec<JobId> = thread::scope(|scope| {
            let handles: Vec<_> = (0..PRODUCERS)
                .map(|p| {
                    let orch = &orch;
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    scope.spawn(move || {
                        (0..JOBS_EACH)
                            .map(|j| {
                                let renderer = Box::new(CountingRenderer {
                                    in_flight: Arc::clone(&in_flight),
                                    peak: Arc::clone(&peak),
                                });
                                orch.enqueue(request(&format!("p{}-{}", p, j), renderer)).unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(ids.len(), PRODUCERS * JOBS_EACH);
        let unique: HashSet<JobId> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());

        wait_for(|| ids.iter().all(|&id| status(&orch, id) == JobStatus::Complete));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
        assert!(orch.active_jobs().is_empty());
    }
}
