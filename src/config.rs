use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::NesError;

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sample_rate: u32,
    /// 1 or 2. The APU is mono; stereo duplicates each sample.
    pub channels: u16,
    /// Ring buffer capacity per channel.
    pub audio_buffer_samples: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            audio_buffer_samples: 4096,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let cfg: Config = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.channels, 1 | 2) {
            return Err(NesError::InvalidChannelConfig(self.channels).into());
        }
        if self.sample_rate == 0 {
            anyhow::bail!("sample_rate must be non-zero");
        }
        Ok(())
    }
}
