use anyhow::Result;
use async_trait::async_trait;

use crate::{DeviceMap, ModelLike, ModelProfile, SchedulerDescriptor};

/// Builds a pipeline for a profile. Expensive: downloads or maps weights and
/// moves them onto the device.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(
        &self,
        profile: &ModelProfile,
        device_map: DeviceMap,
        scheduler: &'static SchedulerDescriptor,
    ) -> Result<Box<dyn ModelLike>>;
}
