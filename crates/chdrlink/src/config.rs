use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use chdr_ctrl::{CtrlEndpoint, CtrlEndpointConfig, CtrlError, CtrlportPolicy};
use chdr_packet::{ChdrFormat, ChdrWidth, Endianness};
use chdr_stream::AlignConfig;
use chdr_transport::{LinkParams, TransportError, UdpLink};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing::level_filters::LevelFilter;

/// Errors from loading a configuration or opening what it describes.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Ctrl(#[from] CtrlError),
}

/// Byte order of link words as written in a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl From<ByteOrder> for Endianness {
    fn from(order: ByteOrder) -> Self {
        match order {
            ByteOrder::Little => Endianness::Little,
            ByteOrder::Big => Endianness::Big,
        }
    }
}

/// Frame pool and socket sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkSection {
    pub num_recv_frames: usize,
    pub recv_frame_size: usize,
    pub num_send_frames: usize,
    pub send_frame_size: usize,
    pub recv_buff_size: Option<usize>,
    pub send_buff_size: Option<usize>,
}

impl Default for LinkSection {
    fn default() -> Self {
        let params = LinkParams::default();
        Self {
            num_recv_frames: params.num_recv_frames,
            recv_frame_size: params.recv_frame_size,
            num_send_frames: params.num_send_frames,
            send_frame_size: params.send_frame_size,
            recv_buff_size: params.recv_buff_size,
            send_buff_size: params.send_buff_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlignSection {
    pub ignore_seq_errors: bool,
    pub failure_threshold: usize,
}

impl Default for AlignSection {
    fn default() -> Self {
        let config = AlignConfig::default();
        Self {
            ignore_seq_errors: config.ignore_seq_errors,
            failure_threshold: config.failure_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CtrlSection {
    /// Receive thread pause when idle, in microseconds.
    pub idle_sleep_us: u64,
    /// Ctrlport buffer and ACK timeout, in milliseconds.
    pub timeout_ms: u64,
    pub force_acks: bool,
}

impl Default for CtrlSection {
    fn default() -> Self {
        let config = CtrlEndpointConfig::default();
        Self {
            idle_sleep_us: config.idle_sleep.as_micros() as u64,
            timeout_ms: config.default_policy.timeout.as_millis() as u64,
            force_acks: config.default_policy.force_acks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Diagnostics output, read by `init_logging` when the `logging` feature
/// is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Print the module path of each event.
    pub with_target: bool,
}

/// Everything needed to talk to one remote CHDR endpoint.
///
/// Every field has a default, so `{}` is a valid config:
///
/// ```json
/// {
///   "width_bits": 64,
///   "byte_order": "little",
///   "local_epid": 1,
///   "remote_epid": 2,
///   "remote_addr": "192.168.10.2:49153",
///   "link": { "num_recv_frames": 32, "recv_frame_size": 8000 },
///   "align": { "failure_threshold": 1000 },
///   "ctrl": { "timeout_ms": 1000, "force_acks": false },
///   "log": { "format": "json", "level": "info" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChdrLinkConfig {
    pub width_bits: usize,
    pub byte_order: ByteOrder,
    pub local_epid: u16,
    pub remote_epid: u16,
    pub remote_addr: Option<SocketAddr>,
    pub link: LinkSection,
    pub align: AlignSection,
    pub ctrl: CtrlSection,
    pub log: LogSection,
}

impl Default for ChdrLinkConfig {
    fn default() -> Self {
        Self {
            width_bits: ChdrWidth::default().bits(),
            byte_order: ByteOrder::default(),
            local_epid: 1,
            remote_epid: 2,
            remote_addr: None,
            link: LinkSection::default(),
            align: AlignSection::default(),
            ctrl: CtrlSection::default(),
            log: LogSection::default(),
        }
    }
}

impl ChdrLinkConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.format()?;
        self.link_params()
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.align.failure_threshold == 0 {
            return Err(ConfigError::Invalid("align.failure_threshold must be non-zero".to_string()));
        }
        if self.ctrl.timeout_ms == 0 {
            return Err(ConfigError::Invalid("ctrl.timeout_ms must be non-zero".to_string()));
        }
        if self.local_epid == self.remote_epid {
            return Err(ConfigError::Invalid(format!(
                "local and remote endpoint IDs are both {}",
                self.local_epid
            )));
        }
        Ok(())
    }

    pub fn format(&self) -> Result<ChdrFormat, ConfigError> {
        let width = ChdrWidth::from_bits(self.width_bits)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(ChdrFormat::new(width, self.byte_order.into()))
    }

    pub fn link_params(&self) -> LinkParams {
        LinkParams {
            num_recv_frames: self.link.num_recv_frames,
            recv_frame_size: self.link.recv_frame_size,
            num_send_frames: self.link.num_send_frames,
            send_frame_size: self.link.send_frame_size,
            recv_buff_size: self.link.recv_buff_size,
            send_buff_size: self.link.send_buff_size,
        }
    }

    pub fn align_config(&self) -> AlignConfig {
        AlignConfig {
            ignore_seq_errors: self.align.ignore_seq_errors,
            failure_threshold: self.align.failure_threshold,
        }
    }

    pub fn ctrl_config(&self) -> CtrlEndpointConfig {
        CtrlEndpointConfig {
            idle_sleep: Duration::from_micros(self.ctrl.idle_sleep_us),
            default_policy: CtrlportPolicy {
                timeout: Duration::from_millis(self.ctrl.timeout_ms),
                force_acks: self.ctrl.force_acks,
            },
        }
    }

    /// Connect a UDP link pair to `remote_addr` and start a control
    /// endpoint on it.
    pub fn open_udp_ctrl_endpoint(&self) -> Result<CtrlEndpoint, ConfigError> {
        let remote = self
            .remote_addr
            .ok_or_else(|| ConfigError::Invalid("remote_addr is required for UDP".to_string()))?;
        let format = self.format()?;
        let (send_link, recv_link) = UdpLink::connect(remote, &self.link_params())?;
        let ep = CtrlEndpoint::new(
            send_link,
            recv_link,
            format,
            self.local_epid,
            self.remote_epid,
            self.ctrl_config(),
        )?;
        info!(%remote, local_epid = self.local_epid, remote_epid = self.remote_epid, "opened control endpoint");
        Ok(ep)
    }
}
