//! The process-wide pipeline and the lock that serialises access to it.
//!
//! [`PipelineManager`] owns the only loaded pipeline. Every use goes through
//! its lock: loading, scheduler swaps, and sampling passes. A pass runs on the
//! blocking pool while holding the lock, so a caller that disconnects after
//! dispatch does not release the pipeline early.
//!
//! The tier is chosen when the pipeline is first loaded and kept until
//! [`PipelineManager::reload`]; later changes in free device memory do not
//! cause a reload.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::profile::{select_profile, validate_tiers};
use crate::scheduler::{self, SchedulerDescriptor};
use crate::{
    DeviceMap, EaselError, Loader, ModelLike, ModelProfile, ResourceProbe, ResourceSnapshot,
    Result,
};

/// Admission limits for callers waiting on the pipeline. Unset means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueLimits {
    /// Callers allowed to wait while the pipeline is held.
    pub max_waiting: Option<usize>,
    /// Longest a caller waits for the pipeline before giving up.
    pub max_wait_secs: Option<f64>,
}

impl QueueLimits {
    fn max_wait(&self) -> Option<Duration> {
        self.max_wait_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineStatus {
    Unloaded,
    Loading {
        profile: ModelProfile,
    },
    Ready {
        profile: ModelProfile,
        scheduler: &'static str,
    },
    Failed {
        code: &'static str,
        reason: String,
    },
    ShutDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ready: bool,
    pub status: PipelineStatus,
    /// The loaded (or loading) profile.
    pub profile: Option<ModelProfile>,
    pub active_scheduler: &'static str,
    pub busy: bool,
    pub waiting: usize,
    pub loads: usize,
}

/// A load failure, replayed to every caller until an explicit reload.
#[derive(Debug, Clone)]
enum LoadFailure {
    Resource(String),
    Model { model_id: String, reason: String },
}

impl LoadFailure {
    fn to_error(&self) -> EaselError {
        match self {
            LoadFailure::Resource(reason) => EaselError::ResourceUnavailable(reason.clone()),
            LoadFailure::Model { model_id, reason } => EaselError::ModelLoad {
                model_id: model_id.clone(),
                reason: reason.clone(),
            },
        }
    }
}

struct Slot {
    model: Option<Box<dyn ModelLike>>,
    profile: Option<ModelProfile>,
    /// Scheduler in effect outside of per-request overrides.
    active: &'static SchedulerDescriptor,
    failure: Option<LoadFailure>,
    shut_down: bool,
}

/// Clears the busy flag when the holder of the pipeline lets go.
struct BusyFlag(Arc<AtomicBool>);

impl BusyFlag {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(Arc::clone(flag))
    }
}

impl Drop for BusyFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Counts a caller as waiting until it obtains the pipeline or gives up.
struct WaitTicket(Arc<AtomicUsize>);

impl WaitTicket {
    /// Joins the queue, returning the ticket and the number of callers
    /// waiting including this one.
    fn join(waiting: &Arc<AtomicUsize>) -> (Self, usize) {
        let position = waiting.fetch_add(1, Ordering::SeqCst) + 1;
        (Self(Arc::clone(waiting)), position)
    }
}

impl Drop for WaitTicket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive hold on the pipeline slot.
struct Held {
    slot: OwnedMutexGuard<Slot>,
    _busy: BusyFlag,
}

pub struct PipelineManager {
    probe: Arc<dyn ResourceProbe>,
    loader: Arc<dyn Loader>,
    profiles: Vec<ModelProfile>,
    device_map: DeviceMap,
    limits: QueueLimits,
    slot: Arc<Mutex<Slot>>,
    status: RwLock<PipelineStatus>,
    active: RwLock<&'static SchedulerDescriptor>,
    busy: Arc<AtomicBool>,
    waiting: Arc<AtomicUsize>,
    acquisitions: AtomicUsize,
    loads: AtomicUsize,
}

impl PipelineManager {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        loader: Arc<dyn Loader>,
        profiles: Vec<ModelProfile>,
        device_map: DeviceMap,
        default_scheduler: &'static SchedulerDescriptor,
        limits: QueueLimits,
    ) -> Result<Self> {
        validate_tiers(&profiles)?;
        Ok(Self {
            probe,
            loader,
            profiles,
            device_map,
            limits,
            slot: Arc::new(Mutex::new(Slot {
                model: None,
                profile: None,
                active: default_scheduler,
                failure: None,
                shut_down: false,
            })),
            status: RwLock::new(PipelineStatus::Unloaded),
            active: RwLock::new(default_scheduler),
            busy: Arc::new(AtomicBool::new(false)),
            waiting: Arc::new(AtomicUsize::new(0)),
            acquisitions: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        })
    }

    pub fn profiles(&self) -> &[ModelProfile] {
        &self.profiles
    }

    pub fn device_map(&self) -> DeviceMap {
        self.device_map
    }

    /// Probes the device and returns the profile its memory maps to.
    pub fn select(&self) -> Result<ModelProfile> {
        let snapshot = self.probe.snapshot()?;
        self.profile_for(&snapshot)
    }

    fn profile_for(&self, snapshot: &ResourceSnapshot) -> Result<ModelProfile> {
        let profile = select_profile(&self.profiles, snapshot.total_memory)
            .cloned()
            .ok_or_else(|| {
                EaselError::ResourceUnavailable(format!(
                    "no tier covers {:.1} GiB",
                    snapshot.total_gib()
                ))
            })?;
        info!(
            device = %snapshot.device_name,
            total_gib = snapshot.total_gib(),
            free_bytes = snapshot.free_memory(),
            tier = %profile.tier,
            model = %profile.model_id,
            precision = %profile.precision,
            "selected model profile"
        );
        Ok(profile)
    }

    async fn acquire(&self) -> Result<Held> {
        let slot = match Arc::clone(&self.slot).try_lock_owned() {
            Ok(slot) => slot,
            Err(_) => {
                let (_ticket, position) = WaitTicket::join(&self.waiting);
                if let Some(max) = self.limits.max_waiting {
                    if position > max {
                        return Err(EaselError::Busy(format!(
                            "{max} callers already waiting for the pipeline"
                        )));
                    }
                }
                debug!(position, "waiting for pipeline");
                let lock = Arc::clone(&self.slot).lock_owned();
                match self.limits.max_wait() {
                    Some(limit) => tokio::time::timeout(limit, lock).await.map_err(|_| {
                        EaselError::Busy(format!("pipeline not free within {limit:?}"))
                    })?,
                    None => lock.await,
                }
            }
        };
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Held {
            slot,
            _busy: BusyFlag::raise(&self.busy),
        })
    }

    /// Loads the pipeline unless it already is. Concurrent callers queue on
    /// the lock and all observe the one pipeline the first of them built.
    pub async fn ensure_loaded(&self) -> Result<ModelProfile> {
        let mut held = self.acquire().await?;
        self.load_locked(&mut held.slot).await
    }

    async fn load_locked(&self, slot: &mut Slot) -> Result<ModelProfile> {
        if slot.shut_down {
            return Err(EaselError::ResourceUnavailable("pipeline is shut down".into()));
        }
        if let (Some(_), Some(profile)) = (&slot.model, &slot.profile) {
            return Ok(profile.clone());
        }
        if let Some(failure) = &slot.failure {
            return Err(failure.to_error());
        }

        let profile = match self.select() {
            Ok(profile) => profile,
            Err(e) => {
                let failure = match e {
                    EaselError::ResourceUnavailable(reason) => LoadFailure::Resource(reason),
                    other => LoadFailure::Resource(other.to_string()),
                };
                return Err(self.record_failure(slot, failure));
            }
        };

        self.set_status(PipelineStatus::Loading {
            profile: profile.clone(),
        });
        let started = Instant::now();
        info!(model = %profile.model_id, tier = %profile.tier, device = %self.device_map, "loading pipeline");

        match self.loader.load(&profile, self.device_map, slot.active).await {
            Ok(model) => {
                self.loads.fetch_add(1, Ordering::SeqCst);
                info!(
                    model = %profile.model_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    scheduler = slot.active.name,
                    "pipeline ready"
                );
                slot.model = Some(model);
                slot.profile = Some(profile.clone());
                self.set_status(PipelineStatus::Ready {
                    profile: profile.clone(),
                    scheduler: slot.active.name,
                });
                Ok(profile)
            }
            Err(e) => {
                let failure = LoadFailure::Model {
                    model_id: profile.model_id.clone(),
                    reason: format!("{e:#}"),
                };
                Err(self.record_failure(slot, failure))
            }
        }
    }

    fn record_failure(&self, slot: &mut Slot, failure: LoadFailure) -> EaselError {
        let err = failure.to_error();
        error!(code = err.code(), error = %err, "pipeline unavailable until reload");
        self.set_status(PipelineStatus::Failed {
            code: err.code(),
            reason: err.to_string(),
        });
        slot.failure = Some(failure);
        err
    }

    /// Runs `f` against the loaded pipeline, loading it first if needed.
    ///
    /// `scheduler` overrides the active scheduler for this pass only; the
    /// active one is back in place before the lock is released, whether or
    /// not `f` succeeds.
    pub async fn with_pipeline<T, F>(
        &self,
        scheduler: Option<&'static SchedulerDescriptor>,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn ModelLike) -> anyhow::Result<T> + Send + 'static,
    {
        let mut held = self.acquire().await?;
        self.load_locked(&mut held.slot).await?;

        let pass = tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
            let mut held = held;
            let active = held.slot.active;
            let wanted = scheduler.unwrap_or(active);
            let model = held
                .slot
                .model
                .as_deref_mut()
                .ok_or_else(|| anyhow!("pipeline is not loaded"))?;

            if model.scheduler() != wanted {
                model.set_scheduler(wanted)?;
                debug!(scheduler = wanted.name, "scheduler override applied");
            }
            let result = f(model);
            let restored = if model.scheduler() != active {
                model.set_scheduler(active)
            } else {
                Ok(())
            };
            let value = result?;
            restored?;
            Ok(value)
        });

        match pass.await {
            Ok(result) => result.map_err(EaselError::generation),
            Err(e) => Err(EaselError::InternalGeneration(format!(
                "sampling pass aborted: {e}"
            ))),
        }
    }

    /// Makes `name` the active scheduler. The name is resolved before the
    /// pipeline is acquired, so an unknown name never waits on or blocks it.
    pub async fn apply_scheduler(&self, name: &str) -> Result<&'static SchedulerDescriptor> {
        let descriptor = scheduler::resolve(name)?;
        let mut held = self.acquire().await?;
        let slot = &mut *held.slot;
        if let Some(model) = slot.model.as_deref_mut() {
            model
                .set_scheduler(descriptor)
                .map_err(EaselError::generation)?;
        }
        slot.active = descriptor;
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = descriptor;
        if let Some(profile) = &slot.profile {
            if slot.model.is_some() {
                self.set_status(PipelineStatus::Ready {
                    profile: profile.clone(),
                    scheduler: descriptor.name,
                });
            }
        }
        info!(scheduler = descriptor.name, "active scheduler changed");
        Ok(descriptor)
    }

    /// Drops the pipeline, clears any recorded failure, re-probes the device
    /// and loads whatever tier it now maps to.
    pub async fn reload(&self) -> Result<ModelProfile> {
        let mut held = self.acquire().await?;
        let slot = &mut *held.slot;
        if let Some(profile) = slot.profile.take() {
            info!(model = %profile.model_id, "unloading pipeline for reload");
        }
        slot.model = None;
        slot.failure = None;
        slot.shut_down = false;
        self.set_status(PipelineStatus::Unloaded);
        self.load_locked(slot).await
    }

    /// Releases the pipeline. Later use fails until [`Self::reload`].
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        slot.model = None;
        slot.profile = None;
        slot.shut_down = true;
        self.set_status(PipelineStatus::ShutDown);
        info!("pipeline shut down");
    }

    fn set_status(&self, status: PipelineStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Last observed lifecycle state. Never waits for the pipeline.
    pub fn status(&self) -> PipelineStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active_scheduler(&self) -> &'static SchedulerDescriptor {
        *self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn health(&self) -> HealthReport {
        let status = self.status();
        let profile = match &status {
            PipelineStatus::Loading { profile } | PipelineStatus::Ready { profile, .. } => {
                Some(profile.clone())
            }
            _ => None,
        };
        HealthReport {
            ready: matches!(status, PipelineStatus::Ready { .. }),
            status,
            profile,
            active_scheduler: self.active_scheduler().name,
            busy: self.is_busy(),
            waiting: self.waiting(),
            loads: self.load_count(),
        }
    }

    /// True while any caller holds the pipeline.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Times the pipeline has been acquired.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Pipelines constructed over the process lifetime.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}
