use crossbeam_channel::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::audio::midi::MidiTrack;
use crate::audio::series::FeatureSeries;
use crate::error::{Error, Result};
use crate::export::config::ExportConfiguration;
use crate::export::job::{ExportJob, JobEvent, JobId};
use crate::export::mapping::VisualMapping;
use crate::export::orchestrator::{ExportRequest, Orchestrator, OrchestratorConfig};
use crate::export::precompute::{Dataset, FrameRecord};
use crate::export::renderer::Renderer;
use crate::features::index::{FeatureIndex, MAX_FEATURES};
use crate::features::packer::{FeaturePacker, PackedFeatureBuffer, PackerConfig, TimeSync};

#[derive(Clone, Debug, Default)]
pub struct StudioConfig {
    pub packer: PackerConfig,
    pub orchestrator: OrchestratorConfig,
}

/// The inbound surface: load data, configure, and run exports against
/// whatever dataset is current when the export is enqueued.
///
/// Loaded data is never mutated in place. Every load or mapping change swaps
/// in a new `Dataset` with a fresh generation, so a running export keeps
/// reading the snapshot it started with. Each swap is built and installed
/// under the dataset write lock.
pub struct Studio {
    dataset: RwLock<Arc<Dataset>>,
    export_config: RwLock<Option<ExportConfiguration>>,
    packer: Mutex<FeaturePacker>,
    packed: RwLock<Arc<PackedFeatureBuffer>>,
    orchestrator: Orchestrator,
}

fn read<T: ?Sized>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T: ?Sized>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl Studio {
    pub fn new(config: StudioConfig) -> Result<Self> {
        let packer = FeaturePacker::new(config.packer);
        let packed = Arc::new(packer.buffer().clone());
        Ok(Self {
            dataset: RwLock::new(Arc::new(Dataset::default())),
            export_config: RwLock::new(None),
            packer: Mutex::new(packer),
            packed: RwLock::new(packed),
            orchestrator: Orchestrator::new(config.orchestrator)?,
        })
    }

    fn packer(&self) -> MutexGuard<'_, FeaturePacker> {
        self.packer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn capacity(&self) -> usize {
        self.packer().config().max_features.min(MAX_FEATURES)
    }

    /// Replaces the analysis data, rebuilds the index and repacks the live
    /// texture. On `CapacityExceeded` nothing changes.
    pub fn load_analysis(&self, series: Vec<FeatureSeries>) -> Result<FeatureIndex> {
        let capacity = self.capacity();
        let mut current = write(&self.dataset);
        let index = FeatureIndex::from_series(&series, capacity)?;
        let packed = Arc::new(self.packer().repack(&series, &index).clone());
        *write(&self.packed) = packed;

        let next = Dataset {
            series,
            midi: current.midi.clone(),
            index: index.clone(),
            mapping: Arc::clone(&current.mapping),
            generation: 0,
        };
        let dataset = install(&mut current, next);
        log::info!(
            "Analysis loaded: {} features (generation {})",
            index.len(),
            dataset.generation
        );
        Ok(index)
    }

    pub fn load_midi(&self, mut tracks: Vec<MidiTrack>) {
        for track in &mut tracks {
            track.normalize();
        }
        let notes: usize = tracks.iter().map(|t| t.notes.len()).sum();
        let mut current = write(&self.dataset);
        let next = Dataset {
            series: current.series.clone(),
            midi: tracks,
            index: current.index.clone(),
            mapping: Arc::clone(&current.mapping),
            generation: 0,
        };
        let dataset = install(&mut current, next);
        log::info!(
            "MIDI loaded: {} tracks, {} notes (generation {})",
            dataset.midi.len(),
            notes,
            dataset.generation
        );
    }

    /// Mapping output is part of every frame record, so a new mapping
    /// invalidates previously precomputed frames.
    pub fn set_mapping(&self, mapping: Arc<dyn VisualMapping>) {
        let mut current = write(&self.dataset);
        let next = Dataset {
            mapping,
            ..Dataset::clone(&**current)
        };
        let dataset = install(&mut current, next);
        log::debug!("Visual mapping replaced (generation {})", dataset.generation);
    }

    /// Validates and stores the configuration used by subsequent exports.
    pub fn configure(&self, config: ExportConfiguration) -> Result<()> {
        config.validate()?;
        log::info!(
            "Export configured: {}x{} @ {}fps, {:.2}s, {}",
            config.width,
            config.height,
            config.fps,
            config.duration_seconds,
            config.format
        );
        *write(&self.export_config) = Some(config);
        Ok(())
    }

    pub fn export_config(&self) -> Option<ExportConfiguration> {
        read(&self.export_config).clone()
    }

    pub fn enqueue_export(&self, label: impl Into<String>, renderer: Box<dyn Renderer>) -> Result<JobId> {
        let config = self
            .export_config()
            .ok_or_else(|| Error::invalid("export is not configured"))?;
        self.orchestrator.enqueue(ExportRequest {
            label: label.into(),
            config,
            dataset: self.dataset(),
            renderer,
        })
    }

    pub fn get_job_status(&self, id: JobId) -> Option<ExportJob> {
        self.orchestrator.get_status(id)
    }

    pub fn cancel_export(&self, id: JobId) -> bool {
        self.orchestrator.cancel(id)
    }

    pub fn active_jobs(&self) -> Vec<ExportJob> {
        self.orchestrator.active_jobs()
    }

    pub fn subscribe(&self) -> Receiver<JobEvent> {
        self.orchestrator.subscribe()
    }

    /// A frame of the most recent precomputation.
    pub fn frame(&self, frame_number: usize) -> Option<FrameRecord> {
        self.orchestrator.frame(frame_number)
    }

    pub fn dataset(&self) -> Arc<Dataset> {
        Arc::clone(&read(&self.dataset))
    }

    pub fn feature_index(&self) -> FeatureIndex {
        read(&self.dataset).index.clone()
    }

    pub fn packed_buffer(&self) -> Arc<PackedFeatureBuffer> {
        Arc::clone(&read(&self.packed))
    }

    /// Live path: call once per render tick, before submitting the frame.
    pub fn update_time(&self, current_time: f32, duration: f32) -> TimeSync {
        self.packer().update_time(current_time, duration)
    }
}

/// Tags `next` with the following generation and makes it current.
fn install(current: &mut Arc<Dataset>, mut next: Dataset) -> Arc<Dataset> {
    next.generation = current.generation + 1;
    *current = Arc::new(next);
    Arc::clone(current)
}
