// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Command submission core for the NVIDIA Tegra host1x GPU engines.
//!
//! This crate implements the part of the Tegra DRM driver that sits between the ioctl surface and
//! the host1x channels: buffer object reservation, fence dependency tracking, the GART address
//! space allocator with its eviction cache, the command stream firewall and the job
//! pin/relocation engine. Hardware access goes through [`hw::Host1xHardware`], for which
//! [`hw::sim`] provides a software host.

pub mod channel;
pub mod client;
pub mod debug;
pub mod driver;
pub mod fence;
pub mod file;
pub mod firewall;
pub mod gem;
pub mod hw;
pub mod job;
pub mod mmu;
pub mod reservation;
pub mod submit;
pub mod syncpt;
pub mod uapi;
pub mod util;

use kernel::prelude::*;

/// Driver parameters, the equivalent of the module parameters of the kernel driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Params {
    /// Debug flags, see [`debug::DebugFlags`].
    pub debug_flags: u64,
    /// Scan command stream content on a kernel-owned copy before submission.
    pub firewall: bool,
    /// Map buffers into the GART only while they are pinned.
    pub dynamic_iommu_mapping: bool,
    /// Start of the GART aperture.
    pub iova_start: u64,
    /// Size of the GART aperture in bytes.
    pub iova_size: u64,
    /// Job timeout used when a submission does not ask for a shorter one.
    pub default_timeout_ms: u32,
    /// Upper bound for the timeout requested by a submission.
    pub max_submit_timeout_ms: u32,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            debug_flags: 0,
            firewall: true,
            dynamic_iommu_mapping: true,
            iova_start: 0x5800_0000,
            iova_size: 32 << 20,
            default_timeout_ms: 10000,
            max_submit_timeout_ms: 10000,
        }
    }
}

fn parse_u64(val: &str) -> Result<u64> {
    let val = val.trim();
    let parsed = match val.strip_prefix("0x").or_else(|| val.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => val.parse(),
    };
    parsed.map_err(|_| EINVAL)
}

fn parse_bool(val: &str) -> Result<bool> {
    match val.trim() {
        "1" | "y" | "Y" | "true" | "on" => Ok(true),
        "0" | "n" | "N" | "false" | "off" => Ok(false),
        _ => Err(EINVAL),
    }
}

impl Params {
    /// Returns the default parameters, overridden by any `TEGRA_*` environment variables.
    pub fn from_env() -> Result<Params> {
        Params::from_lookup(|key| std::env::var(key).ok())
    }

    /// Returns the default parameters, overridden by the values `lookup` returns.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Params> {
        let mut params = Params::default();

        if let Some(v) = lookup("TEGRA_DEBUG_FLAGS") {
            params.debug_flags = parse_u64(&v)?;
        }
        if let Some(v) = lookup("TEGRA_FIREWALL") {
            params.firewall = parse_bool(&v)?;
        }
        if let Some(v) = lookup("TEGRA_DYNAMIC_IOMMU_MAPPING") {
            params.dynamic_iommu_mapping = parse_bool(&v)?;
        }
        if let Some(v) = lookup("TEGRA_IOVA_START") {
            params.iova_start = parse_u64(&v)?;
        }
        if let Some(v) = lookup("TEGRA_IOVA_SIZE") {
            params.iova_size = parse_u64(&v)?;
        }
        if let Some(v) = lookup("TEGRA_DEFAULT_TIMEOUT_MS") {
            params.default_timeout_ms = u32::try_from(parse_u64(&v)?)?;
        }
        if let Some(v) = lookup("TEGRA_MAX_SUBMIT_TIMEOUT_MS") {
            params.max_submit_timeout_ms = u32::try_from(parse_u64(&v)?)?;
        }

        params.validate()?;
        Ok(params)
    }

    /// Checks that the parameters describe a usable configuration.
    pub fn validate(&self) -> Result {
        let page = kernel::PAGE_SIZE as u64;
        if self.iova_size == 0 || self.iova_size % page != 0 || self.iova_start % page != 0 {
            return Err(EINVAL);
        }
        if self.iova_start.checked_add(self.iova_size).is_none() {
            return Err(EINVAL);
        }
        if self.default_timeout_ms == 0 {
            return Err(EINVAL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let p = Params::from_lookup(lookup(&[])).unwrap();
        assert_eq!(p, Params::default());
        assert!(p.firewall);
        assert_eq!(p.default_timeout_ms, 10000);
    }

    #[test]
    fn overrides() {
        let p = Params::from_lookup(lookup(&[
            ("TEGRA_DEBUG_FLAGS", "0x13"),
            ("TEGRA_FIREWALL", "n"),
            ("TEGRA_IOVA_SIZE", "0x100000"),
        ]))
        .unwrap();
        assert_eq!(p.debug_flags, 0x13);
        assert!(!p.firewall);
        assert_eq!(p.iova_size, 0x10_0000);
    }

    #[test]
    fn malformed() {
        assert_eq!(
            Params::from_lookup(lookup(&[("TEGRA_FIREWALL", "maybe")])),
            Err(EINVAL)
        );
        assert_eq!(
            Params::from_lookup(lookup(&[("TEGRA_IOVA_SIZE", "0x123")])),
            Err(EINVAL)
        );
        assert_eq!(
            Params::from_lookup(lookup(&[("TEGRA_DEFAULT_TIMEOUT_MS", "0x100000000")])),
            Err(EINVAL)
        );
    }
}
