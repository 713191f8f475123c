//! Resource quantities for nodes and pods.
//!
//! A [`Resources`] value describes either what a node can allocate or what a
//! pod requests/limits. The scheduler works entirely in these units.

use serde::{Deserialize, Serialize};

/// A bundle of resource quantities.
///
/// All fields are absolute amounts; zero means "none requested" on a pod and
/// "nothing allocatable" on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// CPU in millicores (1000 = one core).
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes.
    #[serde(default)]
    pub mem_bytes: u64,
    /// Scratch storage in bytes.
    #[serde(default)]
    pub storage_bytes: u64,
    /// Number of pod slots.
    #[serde(default)]
    pub pods: u32,
}

impl Resources {
    /// A zero quantity.
    pub const ZERO: Self = Self {
        cpu_millis: 0,
        mem_bytes: 0,
        storage_bytes: 0,
        pods: 0,
    };

    /// Construct from cpu/memory, the two quantities pods usually request.
    #[must_use]
    pub const fn cpu_mem(cpu_millis: u64, mem_bytes: u64) -> Self {
        Self {
            cpu_millis,
            mem_bytes,
            storage_bytes: 0,
            pods: 0,
        }
    }

    /// Whether `self` fits inside `available` on every axis.
    #[must_use]
    pub const fn fits_within(&self, available: &Self) -> bool {
        self.cpu_millis <= available.cpu_millis
            && self.mem_bytes <= available.mem_bytes
            && self.storage_bytes <= available.storage_bytes
            && self.pods <= available.pods
    }

    /// Component-wise saturating addition.
    #[must_use]
    pub const fn saturating_add(&self, other: &Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            mem_bytes: self.mem_bytes.saturating_add(other.mem_bytes),
            storage_bytes: self.storage_bytes.saturating_add(other.storage_bytes),
            pods: self.pods.saturating_add(other.pods),
        }
    }

    /// Component-wise saturating subtraction.
    #[must_use]
    pub const fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            mem_bytes: self.mem_bytes.saturating_sub(other.mem_bytes),
            storage_bytes: self.storage_bytes.saturating_sub(other.storage_bytes),
            pods: self.pods.saturating_sub(other.pods),
        }
    }

    /// Fraction of `allocatable` that `self` consumes, averaged over the
    /// cpu and memory axes. Used by the least-loaded scoring term.
    ///
    /// Returns a value in `[0.0, 1.0]`; a zero allocatable axis counts as
    /// fully used.
    #[must_use]
    pub fn utilization_of(&self, allocatable: &Self) -> f64 {
        fn axis(used: u64, alloc: u64) -> f64 {
            if alloc == 0 {
                1.0
            } else {
                #[allow(clippy::cast_precision_loss)]
                let frac = used as f64 / alloc as f64;
                frac.min(1.0)
            }
        }
        let cpu = axis(self.cpu_millis, allocatable.cpu_millis);
        let mem = axis(self.mem_bytes, allocatable.mem_bytes);
        (cpu + mem) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_all_axes() {
        let node = Resources {
            cpu_millis: 4000,
            mem_bytes: 8 << 30,
            storage_bytes: 100 << 30,
            pods: 10,
        };
        let small = Resources::cpu_mem(500, 512 << 20);
        assert!(small.fits_within(&node));

        let too_much_cpu = Resources::cpu_mem(5000, 512 << 20);
        assert!(!too_much_cpu.fits_within(&node));
    }

    #[test]
    fn pods_axis_counts() {
        let node = Resources {
            pods: 1,
            ..Resources::ZERO
        };
        let one_pod = Resources {
            pods: 1,
            ..Resources::ZERO
        };
        let two_pods = Resources {
            pods: 2,
            ..Resources::ZERO
        };
        assert!(one_pod.fits_within(&node));
        assert!(!two_pods.fits_within(&node));
    }

    #[test]
    fn saturating_arithmetic() {
        let a = Resources::cpu_mem(100, 200);
        let b = Resources::cpu_mem(50, 300);
        assert_eq!(a.saturating_add(&b), Resources::cpu_mem(150, 500));
        assert_eq!(a.saturating_sub(&b), Resources::cpu_mem(50, 0));
    }

    #[test]
    fn utilization_bounds() {
        let alloc = Resources::cpu_mem(1000, 1000);
        assert!((Resources::ZERO.utilization_of(&alloc) - 0.0).abs() < f64::EPSILON);
        assert!((Resources::cpu_mem(1000, 1000).utilization_of(&alloc) - 1.0).abs() < f64::EPSILON);
        let half = Resources::cpu_mem(500, 500).utilization_of(&alloc);
        assert!((half - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn utilization_zero_allocatable_is_full() {
        let used = Resources::cpu_mem(1, 1);
        assert!((used.utilization_of(&Resources::ZERO) - 1.0).abs() < f64::EPSILON);
    }
}
