use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

use crate::{
    DeviceMap, Loader, ModelLike, ModelProfile, RerenderParams, SamplingParams,
    SchedulerDescriptor, SuperResolution,
};

/// One sampling pass as the mock saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub prompt: String,
    pub scheduler_at_start: &'static str,
    pub scheduler_at_end: &'static str,
    pub width: usize,
    pub height: usize,
    pub seed: Option<u64>,
    pub rerender: bool,
}

/// Observations shared by a [`MockLoader`] and every model it builds.
#[derive(Debug, Default)]
pub struct MockState {
    load_attempts: AtomicUsize,
    loads: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    runs: Mutex<Vec<RunRecord>>,
    loaded: Mutex<Vec<ModelProfile>>,
}

impl MockState {
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Most passes ever running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Profiles passed to successful loads, in order.
    pub fn loaded_profiles(&self) -> Vec<ModelProfile> {
        self.loaded.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

/// Builds [`MockModel`]s; can be slowed down or made to fail.
pub struct MockLoader {
    state: Arc<MockState>,
    load_delay: Duration,
    pass_time: Duration,
    fail_on: Option<String>,
    rejected_scheduler: Option<&'static str>,
    fail_loads: AtomicBool,
}

impl Default for MockLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLoader {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            load_delay: Duration::ZERO,
            pass_time: Duration::ZERO,
            fail_on: None,
            rejected_scheduler: None,
            fail_loads: AtomicBool::new(false),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// How long every pass blocks its thread.
    pub fn with_pass_time(mut self, pass_time: Duration) -> Self {
        self.pass_time = pass_time;
        self
    }

    /// Passes whose prompt contains `needle` fail.
    pub fn failing_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_on = Some(needle.into());
        self
    }

    /// Models refuse to switch to the scheduler called `name`.
    pub fn rejecting_scheduler(mut self, name: &'static str) -> Self {
        self.rejected_scheduler = Some(name);
        self
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Loader for MockLoader {
    async fn load(
        &self,
        profile: &ModelProfile,
        _device_map: DeviceMap,
        scheduler: &'static SchedulerDescriptor,
    ) -> Result<Box<dyn ModelLike>> {
        self.state.load_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            bail!("out of memory while loading {}", profile.model_id);
        }
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut loaded) = self.state.loaded.lock() {
            loaded.push(profile.clone());
        }
        Ok(Box::new(MockModel {
            state: Arc::clone(&self.state),
            scheduler,
            pass_time: self.pass_time,
            fail_on: self.fail_on.clone(),
            rejected_scheduler: self.rejected_scheduler,
        }))
    }
}

/// Renders solid images and records every pass.
pub struct MockModel {
    state: Arc<MockState>,
    scheduler: &'static SchedulerDescriptor,
    pass_time: Duration,
    fail_on: Option<String>,
    rejected_scheduler: Option<&'static str>,
}

impl MockModel {
    fn pass<F>(&mut self, params: &SamplingParams, rerender: bool, render: F) -> Result<DynamicImage>
    where
        F: FnOnce() -> DynamicImage,
    {
        let in_flight = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let scheduler_at_start = self.scheduler.name;
        if !self.pass_time.is_zero() {
            std::thread::sleep(self.pass_time);
        }
        let failed = self
            .fail_on
            .as_deref()
            .is_some_and(|needle| params.prompt.contains(needle));
        let image = (!failed).then(render);

        if let Ok(mut runs) = self.state.runs.lock() {
            runs.push(RunRecord {
                prompt: params.prompt.clone(),
                scheduler_at_start,
                scheduler_at_end: self.scheduler.name,
                width: params.width,
                height: params.height,
                seed: params.seed,
                rerender,
            });
        }
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        match image {
            Some(image) => Ok(image),
            None => bail!("numerical failure while sampling '{}'", params.prompt),
        }
    }
}

impl ModelLike for MockModel {
    fn scheduler(&self) -> &'static SchedulerDescriptor {
        self.scheduler
    }

    fn set_scheduler(&mut self, scheduler: &'static SchedulerDescriptor) -> Result<()> {
        if self.rejected_scheduler == Some(scheduler.name) {
            bail!("{} is not supported by this model", scheduler.name);
        }
        self.scheduler = scheduler;
        Ok(())
    }

    fn run(&mut self, params: &SamplingParams) -> Result<DynamicImage> {
        let shade = (params.prompt.len() % 256) as u8;
        let (width, height) = (params.width as u32, params.height as u32);
        self.pass(params, false, || {
            DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([shade, 64, 128])))
        })
    }

    fn rerender(&mut self, source: &DynamicImage, params: &RerenderParams) -> Result<DynamicImage> {
        let sampling = &params.sampling;
        let (width, height) = (sampling.width as u32, sampling.height as u32);
        self.pass(sampling, true, || {
            source.resize_exact(width, height, FilterType::Nearest)
        })
    }
}

/// Nearest-neighbour enlargement by a fixed factor.
pub struct MockSuperResolution {
    scale: u32,
    calls: AtomicUsize,
}

impl MockSuperResolution {
    pub fn new(scale: u32) -> Self {
        Self {
            scale,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SuperResolution for MockSuperResolution {
    fn name(&self) -> &str {
        "mock"
    }

    fn scale(&self) -> u32 {
        self.scale
    }

    fn upscale(&self, image: &DynamicImage) -> Result<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(image.resize_exact(
            image.width() * self.scale,
            image.height() * self.scale,
            FilterType::Nearest,
        ))
    }
}
