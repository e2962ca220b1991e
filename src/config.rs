//! Allocation configuration: parses the comma-separated per-device model
//! count strings and device/VRAM lists from §6.
//!
//! Config *loading* (file formats, env vars) is out of scope per spec §1;
//! this module only owns the parsing/validation of the format once some
//! other layer has produced the raw strings — the same "format parsing
//! lives in core, format sourcing lives outside" split the teacher's
//! `CliArgs` keeps against its own config loader.

use crate::device::Device;
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `max_vram_usage_percent` bounds, per §6.
pub const MIN_VRAM_USAGE_PERCENT: u8 = 1;
pub const MAX_VRAM_USAGE_PERCENT: u8 = 100;
pub const DEFAULT_VRAM_USAGE_PERCENT: u8 = 85;

#[derive(Debug, Clone)]
pub enum ConfigError {
    MismatchedListLengths { devices: usize, vram: usize },
    InvalidVramPercent(u8),
    ParseInt { field: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MismatchedListLengths { devices, vram } => {
                write!(f, "device id list has {} entries but VRAM list has {}", devices, vram)
            }
            Self::InvalidVramPercent(p) => write!(
                f,
                "max_vram_usage_percent {} out of range [{}, {}]",
                p, MIN_VRAM_USAGE_PERCENT, MAX_VRAM_USAGE_PERCENT
            ),
            Self::ParseInt { field, value } => write!(f, "could not parse {} as an integer: {:?}", field, value),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parses `device_ids`/`vram_bytes` parallel comma-separated lists (e.g.
/// `"0,1"` / `"17179869184,8589934592"`) into [`Device`]s, plus the
/// per-(stage, mode) model-count allocation strings (e.g. `"2,0"` = 2 on
/// device 0, 0 on device 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    pub max_vram_usage_percent: u8,
    device_ids: Vec<u32>,
    vram_bytes: Vec<u64>,
    /// Raw per-(stage, mode) allocation strings, as configured. The global
    /// orchestrator's admission algorithm consults these via
    /// `configured_workers` as the sizing input when present, capped by
    /// live VRAM availability; with nothing configured for a given
    /// `(stage, mode)` it falls back to sizing purely from VRAM.
    allocation_strings: HashMap<(Stage, bool), String>,
}

impl AllocationConfig {
    pub fn new(device_ids: &str, vram_bytes: &str, max_vram_usage_percent: u8) -> Result<Self, ConfigError> {
        if !(MIN_VRAM_USAGE_PERCENT..=MAX_VRAM_USAGE_PERCENT).contains(&max_vram_usage_percent) {
            return Err(ConfigError::InvalidVramPercent(max_vram_usage_percent));
        }

        let device_ids = parse_csv_list::<u32>(device_ids, "device_ids")?;
        let vram_bytes = parse_csv_list::<u64>(vram_bytes, "vram_bytes")?;
        if device_ids.len() != vram_bytes.len() {
            return Err(ConfigError::MismatchedListLengths {
                devices: device_ids.len(),
                vram: vram_bytes.len(),
            });
        }

        Ok(Self {
            max_vram_usage_percent,
            device_ids,
            vram_bytes,
            allocation_strings: HashMap::new(),
        })
    }

    /// Records the configured per-device model-count string for `(stage,
    /// solo_mode)`, e.g. `set_allocation(Stage::Tagging, false, "8,0")`.
    pub fn set_allocation(&mut self, stage: Stage, solo_mode: bool, counts: impl Into<String>) {
        self.allocation_strings.insert((stage, solo_mode), counts.into());
    }

    /// Parses the configured allocation string for `(stage, solo_mode)`
    /// into per-device model counts, aligned against `device_ids` by
    /// position.
    pub fn model_counts(&self, stage: Stage, solo_mode: bool) -> Result<Vec<(u32, u32)>, ConfigError> {
        let Some(raw) = self.allocation_strings.get(&(stage, solo_mode)) else {
            return Ok(self.device_ids.iter().map(|&id| (id, 0)).collect());
        };
        let counts = parse_csv_list::<u32>(raw, "allocation_string")?;
        Ok(self.device_ids.iter().copied().zip(counts).collect())
    }

    /// Same lookup as [`Self::model_counts`], but returns `None` when no
    /// allocation string was configured for `(stage, solo_mode)` at all,
    /// rather than defaulting every device to zero — callers use this to
    /// tell "deliberately configured to zero" apart from "not configured,
    /// fall back to VRAM-driven sizing".
    pub fn configured_workers(&self, stage: Stage, solo_mode: bool) -> Result<Option<HashMap<u32, u32>>, ConfigError> {
        let Some(raw) = self.allocation_strings.get(&(stage, solo_mode)) else {
            return Ok(None);
        };
        let counts = parse_csv_list::<u32>(raw, "allocation_string")?;
        Ok(Some(self.device_ids.iter().copied().zip(counts).collect()))
    }

    pub fn devices(&self) -> Vec<Device> {
        self.device_ids
            .iter()
            .zip(&self.vram_bytes)
            .map(|(&id, &bytes)| Device::new(id, bytes, self.max_vram_usage_percent))
            .collect()
    }
}

fn parse_csv_list<T>(raw: &str, field: &'static str) -> Result<Vec<T>, ConfigError>
where
    T: std::str::FromStr,
{
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|part| {
            part.trim().parse::<T>().map_err(|_| ConfigError::ParseInt {
                field,
                value: part.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_parallel_device_and_vram_lists() {
        let cfg = AllocationConfig::new("0,1", "17179869184,8589934592", 85).unwrap();
        let devices = cfg.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].id, 1);
    }

    #[test]
    fn rejects_mismatched_list_lengths() {
        let err = AllocationConfig::new("0,1,2", "17179869184", 85).unwrap_err();
        assert!(matches!(err, ConfigError::MismatchedListLengths { .. }));
    }

    #[test]
    fn rejects_out_of_range_vram_percent() {
        assert!(AllocationConfig::new("0", "1", 0).is_err());
        assert!(AllocationConfig::new("0", "1", 101).is_err());
        assert!(AllocationConfig::new("0", "1", 85).is_ok());
    }

    #[test]
    fn model_counts_aligns_by_position() {
        let mut cfg = AllocationConfig::new("0,1", "17179869184,8589934592", 85).unwrap();
        cfg.set_allocation(Stage::Tagging, false, "8,0");
        let counts = cfg.model_counts(Stage::Tagging, false).unwrap();
        assert_eq!(counts, vec![(0, 8), (1, 0)]);
    }

    #[test]
    fn missing_allocation_defaults_to_zero_everywhere() {
        let cfg = AllocationConfig::new("0,1", "17179869184,8589934592", 85).unwrap();
        let counts = cfg.model_counts(Stage::Captioning, true).unwrap();
        assert_eq!(counts, vec![(0, 0), (1, 0)]);
    }

    #[test]
    fn configured_workers_distinguishes_unset_from_zero() {
        let mut cfg = AllocationConfig::new("0,1", "17179869184,8589934592", 85).unwrap();
        assert!(cfg.configured_workers(Stage::Tagging, false).unwrap().is_none());

        cfg.set_allocation(Stage::Tagging, false, "0,4");
        let counts = cfg.configured_workers(Stage::Tagging, false).unwrap().unwrap();
        assert_eq!(counts.get(&0), Some(&0));
        assert_eq!(counts.get(&1), Some(&4));
    }
}
