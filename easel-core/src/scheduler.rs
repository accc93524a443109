use serde::Serialize;

use crate::{EaselError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestepSpacing {
    Leading,
    Linspace,
    Trailing,
}

/// Construction parameters of a sampling algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum SchedulerParams {
    Ddim { spacing: TimestepSpacing },
    EulerAncestral { spacing: TimestepSpacing },
    UniPc { solver_order: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SchedulerDescriptor {
    pub name: &'static str,
    #[serde(flatten)]
    pub params: SchedulerParams,
}

/// Every entry is realised by each pipeline family: noise-prediction
/// pipelines use the matching candle scheduler, flow-matching pipelines the
/// flow sampler with the same spacing or order.
pub static SCHEDULERS: &[SchedulerDescriptor] = &[
    SchedulerDescriptor {
        name: "DDIM",
        params: SchedulerParams::Ddim {
            spacing: TimestepSpacing::Leading,
        },
    },
    SchedulerDescriptor {
        name: "DDIMLinspace",
        params: SchedulerParams::Ddim {
            spacing: TimestepSpacing::Linspace,
        },
    },
    SchedulerDescriptor {
        name: "DDIMTrailing",
        params: SchedulerParams::Ddim {
            spacing: TimestepSpacing::Trailing,
        },
    },
    SchedulerDescriptor {
        name: "EulerAncestral",
        params: SchedulerParams::EulerAncestral {
            spacing: TimestepSpacing::Leading,
        },
    },
    SchedulerDescriptor {
        name: "EulerAncestralTrailing",
        params: SchedulerParams::EulerAncestral {
            spacing: TimestepSpacing::Trailing,
        },
    },
    SchedulerDescriptor {
        name: "UniPC",
        params: SchedulerParams::UniPc { solver_order: 2 },
    },
    SchedulerDescriptor {
        name: "UniPCOrder3",
        params: SchedulerParams::UniPc { solver_order: 3 },
    },
];

pub const DEFAULT_SCHEDULER: &str = "DDIM";

/// Registered names in registry order.
pub fn list_schedulers() -> Vec<&'static str> {
    SCHEDULERS.iter().map(|s| s.name).collect()
}

/// Looks a name up, ignoring ASCII case.
pub fn resolve(name: &str) -> Result<&'static SchedulerDescriptor> {
    let name = name.trim();
    SCHEDULERS
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| EaselError::SchedulerNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn every_listed_name_resolves() {
        for name in list_schedulers() {
            assert_eq!(resolve(name).unwrap().name, name);
        }
    }

    #[test]
    fn names_are_unique_ignoring_case() {
        let lowered: HashSet<String> = list_schedulers()
            .iter()
            .map(|n| n.to_ascii_lowercase())
            .collect();
        assert_eq!(lowered.len(), SCHEDULERS.len());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(resolve("unipc").unwrap().name, "UniPC");
        assert_eq!(resolve(" ddimtrailing ").unwrap().name, "DDIMTrailing");
    }

    #[test]
    fn unknown_names_are_rejected() {
        match resolve("Karras") {
            Err(EaselError::SchedulerNotFound(name)) => assert_eq!(name, "Karras"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn default_is_registered() {
        resolve(DEFAULT_SCHEDULER).unwrap();
    }
}
