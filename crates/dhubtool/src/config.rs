//! RON description of the device a program runs against.
use dhub::error::FaultKind;
use eyre_pretty::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Data preloaded into DRAM before running.
#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub addr: u32,
    /// File to load, relative to the config file.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Inline bytes, placed after the file contents if both are given.
    #[serde(default)]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub enum Fault {
    Timeout,
    ErrorResponse,
}

impl From<Fault> for FaultKind {
    fn from(value: Fault) -> Self {
        match value {
            Fault::Timeout => Self::Timeout,
            Fault::ErrorResponse => Self::ErrorResponse,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Semaphore {
    pub id: u8,
    #[serde(default)]
    pub depth: Option<u16>,
    /// Initial count, pushed after configuring the depth.
    #[serde(default)]
    pub count: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub hub: dhub::config::Config,
    pub bridge: bcm::Config,
    pub images: Vec<Image>,
    pub semaphores: Vec<Semaphore>,
    /// Device register values, as (address, value).
    pub registers: Vec<(u32, u32)>,
    /// Device registers answering with a bus fault.
    pub faults: Vec<(u32, Fault)>,
    /// Channels started before running. Defaults to the bridge's channels.
    pub start: Option<Vec<u8>>,
    #[serde(skip)]
    pub root: PathBuf,
}

impl ToolConfig {
    pub fn open(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).context("reading device config")?;
        let mut config: Self = ron::from_str(&text).context("parsing device config")?;
        config.root = path.parent().map(Path::to_path_buf).unwrap_or_default();

        Ok(config)
    }

    pub fn image_bytes(&self, image: &Image) -> Result<Vec<u8>> {
        let mut bytes = match &image.path {
            Some(path) => std::fs::read(self.root.join(path))
                .context(format!("reading DRAM image {}", path.display()))?,
            None => Vec::new(),
        };

        bytes.extend_from_slice(&image.bytes);
        Ok(bytes)
    }

    /// Channels to start: the configured list, or the channels the bridge uses.
    pub fn started_channels(&self) -> Vec<u8> {
        match &self.start {
            Some(channels) => channels.clone(),
            None => {
                let mut channels = vec![self.bridge.read_channel, self.bridge.write_channel];
                channels.extend(self.bridge.program_channel);
                channels.dedup();
                channels
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_partial_config() {
        let text = r#"(
            bridge: (program_channel: Some(2)),
            images: [(addr: 0x1000, bytes: [1, 2, 3])],
            semaphores: [(id: 3, depth: Some(4), count: 1)],
            registers: [(0x40, 0xCAFE)],
            faults: [(0x44, Timeout)],
        )"#;

        let config: ToolConfig = ron::from_str(text).unwrap();
        assert_eq!(config.bridge.program_channel, Some(2));
        assert_eq!(config.bridge.tcm_len, 512);
        assert_eq!(config.hub.channels.len(), 16);
        assert_eq!(config.image_bytes(&config.images[0]).unwrap(), vec![1, 2, 3]);
        assert_eq!(config.started_channels(), vec![0, 1, 2]);
        assert_eq!(FaultKind::from(config.faults[0].1), FaultKind::Timeout);
    }
}
