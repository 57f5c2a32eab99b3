//! RideBlueprint - Config Loader 的输出
//!
//! 描述一次完整骑行：要连接的设备、骑行限制、重连策略、观看端服务与记录器。

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{Capability, DeviceAddress, DeviceSpec, TimeBase};

/// 配置版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// 完整骑行配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RideBlueprint {
    #[serde(default)]
    pub version: ConfigVersion,

    #[validate(nested)]
    pub ride: RideConfig,

    #[validate(length(min = 1, message = "at least one device is required"), nested)]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorder: Option<RecorderConfig>,
}

impl RideBlueprint {
    pub fn device_specs(&self) -> Vec<DeviceSpec> {
        self.devices.iter().map(DeviceConfig::spec).collect()
    }
}

/// 骑行限制
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RideConfig {
    /// 计划骑行时长，同时也是图表窗口
    #[validate(range(exclusive_min = 0.0, max = 1440.0))]
    pub duration_minutes: f64,

    /// Overall discovery/connect timeout for `start_listening`
    #[serde(default = "default_connect_timeout")]
    #[validate(range(exclusive_min = 0.0))]
    pub connect_timeout_secs: f64,

    /// Clock used by outgoing sample frames
    #[serde(default)]
    pub time_base: TimeBase,
}

impl RideConfig {
    pub fn duration_limit_secs(&self) -> f64 {
        self.duration_minutes * 60.0
    }
}

fn default_connect_timeout() -> f64 {
    10.0
}

/// 单个设备配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeviceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub address: DeviceAddress,

    pub capability: Capability,

    /// Behaviour when the ride runs against the simulator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub simulation: Option<SimulationConfig>,
}

impl DeviceConfig {
    pub fn spec(&self) -> DeviceSpec {
        DeviceSpec {
            address: self.address.clone(),
            capability: self.capability,
            name: self.name.clone(),
        }
    }
}

/// 模拟器中单个设备的脚本化行为
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct SimulationConfig {
    /// 设备可被发现前的延迟
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub appear_after_secs: f64,

    /// 设备始终不可发现
    #[serde(default)]
    pub never_appears: bool,

    /// 产生这么多读数后断开连接
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_after_readings: Option<u64>,

    /// 断开后拒绝的重连次数
    #[serde(default)]
    pub refuse_reconnects: u32,

    /// 每秒读数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(exclusive_min = 0.0, max = 100.0))]
    pub rate_hz: Option<f64>,
}

/// 意外断开后的重连策略
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_secs")]
    #[validate(range(exclusive_min = 0.0))]
    pub backoff_secs: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> f64 {
    2.0
}

/// Viewer-facing WebSocket server
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Replay frames sent between cooperative yields
    #[serde(default = "default_replay_chunk")]
    #[validate(range(min = 1))]
    pub replay_chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            replay_chunk_size: default_replay_chunk(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_replay_chunk() -> usize {
    10
}

/// Where completed rides are written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub output_dir: String,
}
