use std::process::Command;
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use crate::{DeviceMap, EaselError, Result};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Point-in-time view of one accelerator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub device_name: String,
    /// Bytes.
    pub total_memory: u64,
    /// Bytes.
    pub used_memory: u64,
}

impl ResourceSnapshot {
    pub fn new(device_name: impl Into<String>, total_memory: u64, used_memory: u64) -> Self {
        Self {
            device_name: device_name.into(),
            total_memory,
            used_memory,
        }
    }

    /// Snapshot of a device with `gib` GiB of memory and nothing in use.
    pub fn with_gib(device_name: impl Into<String>, gib: f64) -> Self {
        Self::new(device_name, (gib * GIB as f64) as u64, 0)
    }

    pub fn total_gib(&self) -> f64 {
        self.total_memory as f64 / GIB as f64
    }

    pub fn free_memory(&self) -> u64 {
        self.total_memory.saturating_sub(self.used_memory)
    }
}

/// A pure query, asked again on every selection decision since another
/// process sharing the device can change what is in use.
pub trait ResourceProbe: Send + Sync {
    fn snapshot(&self) -> Result<ResourceSnapshot>;
}

/// Queries an NVIDIA device through `nvidia-smi`.
pub struct NvidiaSmiProbe {
    ordinal: usize,
    program: String,
}

impl NvidiaSmiProbe {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            program: "nvidia-smi".to_string(),
        }
    }

    /// Parses one `name, memory.total, memory.used` csv row (MiB, no units).
    fn parse(stdout: &str) -> Result<ResourceSnapshot> {
        let line = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| EaselError::ResourceUnavailable("nvidia-smi reported no devices".into()))?;

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [name, total, used] = fields.as_slice() else {
            return Err(EaselError::ResourceUnavailable(format!(
                "unexpected nvidia-smi output: {line}"
            )));
        };
        let mib = |value: &str| {
            value.parse::<u64>().map(|v| v * MIB).map_err(|_| {
                EaselError::ResourceUnavailable(format!("unexpected memory value '{value}'"))
            })
        };
        Ok(ResourceSnapshot::new(*name, mib(*total)?, mib(*used)?))
    }
}

impl ResourceProbe for NvidiaSmiProbe {
    fn snapshot(&self) -> Result<ResourceSnapshot> {
        let output = Command::new(&self.program)
            .args([
                "--query-gpu=name,memory.total,memory.used",
                "--format=csv,noheader,nounits",
            ])
            .arg(format!("--id={}", self.ordinal))
            .output()
            .map_err(|e| EaselError::ResourceUnavailable(format!("cannot run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EaselError::ResourceUnavailable(format!(
                "no accelerator at ordinal {}: {}",
                self.ordinal,
                stderr.trim()
            )));
        }

        let snapshot = Self::parse(&String::from_utf8_lossy(&output.stdout))?;
        debug!(
            device = %snapshot.device_name,
            total_gib = snapshot.total_gib(),
            used_bytes = snapshot.used_memory,
            "probed accelerator"
        );
        Ok(snapshot)
    }
}

/// Host fallback for forced-CPU runs: reports no device memory, which maps
/// onto the smallest tier.
pub struct HostProbe;

impl ResourceProbe for HostProbe {
    fn snapshot(&self) -> Result<ResourceSnapshot> {
        Ok(ResourceSnapshot::new("cpu", 0, 0))
    }
}

/// Reports a configured snapshot. Backs `--assume-memory-gb` and tests.
pub struct FixedProbe {
    snapshot: Mutex<ResourceSnapshot>,
}

impl FixedProbe {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn gib(gib: f64) -> Self {
        Self::new(ResourceSnapshot::with_gib("assumed", gib))
    }

    /// Replaces the reported snapshot, e.g. to simulate memory shrinking.
    pub fn set(&self, snapshot: ResourceSnapshot) {
        if let Ok(mut current) = self.snapshot.lock() {
            *current = snapshot;
        }
    }
}

impl ResourceProbe for FixedProbe {
    fn snapshot(&self) -> Result<ResourceSnapshot> {
        self.snapshot
            .lock()
            .map(|s| s.clone())
            .map_err(|_| EaselError::ResourceUnavailable("probe state poisoned".into()))
    }
}

/// Picks the probe for a device map; an explicit memory figure wins.
pub fn probe_for(device_map: DeviceMap, assume_memory_gib: Option<f64>) -> Box<dyn ResourceProbe> {
    match (assume_memory_gib, device_map.ordinal()) {
        (Some(gib), _) => Box::new(FixedProbe::gib(gib)),
        (None, None) => Box::new(HostProbe),
        (None, Some(ordinal)) => Box::new(NvidiaSmiProbe::new(ordinal)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_row() {
        let snapshot =
            NvidiaSmiProbe::parse("NVIDIA A100-SXM4-80GB, 81920, 1024\n").unwrap();
        assert_eq!(snapshot.device_name, "NVIDIA A100-SXM4-80GB");
        assert_eq!(snapshot.total_memory, 80 * GIB);
        assert_eq!(snapshot.used_memory, 1024 * MIB);
        assert_eq!(snapshot.free_memory(), 80 * GIB - 1024 * MIB);
    }

    #[test]
    fn rejects_malformed_rows() {
        assert!(matches!(
            NvidiaSmiProbe::parse(""),
            Err(EaselError::ResourceUnavailable(_))
        ));
        assert!(matches!(
            NvidiaSmiProbe::parse("GPU, lots, 0"),
            Err(EaselError::ResourceUnavailable(_))
        ));
        assert!(NvidiaSmiProbe::parse("only-a-name").is_err());
    }

    #[test]
    fn missing_tool_is_resource_unavailable() {
        let probe = NvidiaSmiProbe {
            ordinal: 0,
            program: "definitely-not-a-real-nvidia-smi".into(),
        };
        assert!(matches!(
            probe.snapshot(),
            Err(EaselError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn fixed_probe_can_be_updated() {
        let probe = FixedProbe::gib(16.0);
        assert_eq!(probe.snapshot().unwrap().total_memory, 16 * GIB);
        probe.set(ResourceSnapshot::with_gib("bigger", 80.0));
        assert_eq!(probe.snapshot().unwrap().total_gib(), 80.0);
    }
}
