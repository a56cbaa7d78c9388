use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use compact_str::CompactString;
use serde::Deserialize;

use crate::error::MuxError;

pub const CONFIG_VERSION: u32 = 1;

/// Per-stream queue capacity when the config does not set one.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// What `enqueue` does when a stream's queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Reject the message with `QueueFull` and count the drop.
    #[default]
    Drop,
    /// Block the producer until space frees or the stream is torn down.
    Block,
}

/// What `register` does when the tag is already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateTagPolicy {
    #[default]
    Reject,
    /// Tear the old stream down and register a fresh one under the same tag.
    Replace,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MuxConfigInput {
    pub version: u32,
    pub queue: QueueConfigInput,
    pub registry: RegistryConfigInput,
    pub dispatch: DispatchConfigInput,
    pub streams: Vec<StreamConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfigInput {
    pub capacity: Option<usize>,
    pub backpressure: Option<BackpressurePolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfigInput {
    pub duplicate_tag: Option<DuplicateTagPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchConfigInput {
    pub drain_grace_ms: Option<u64>,
    pub idle_wait_ms: Option<u64>,
    pub stats_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamConfigInput {
    pub tag: String,
    pub weight: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub backpressure: BackpressurePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            backpressure: BackpressurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// How long shutdown keeps draining before it gives up.
    pub drain_grace: Duration,
    /// Upper bound on a single idle wait; control messages wake it earlier.
    pub idle_wait: Duration,
    /// How often the runtime publishes stream snapshots.
    pub stats_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_millis(5000),
            idle_wait: Duration::from_millis(100),
            stats_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub tag: CompactString,
    pub weight: u32,
}

impl StreamConfig {
    pub fn new(tag: &str, weight: u32) -> Self {
        Self {
            tag: CompactString::from(tag),
            weight,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub version: u32,
    pub queue: QueueConfig,
    pub duplicate_tag: DuplicateTagPolicy,
    pub dispatch: DispatchConfig,
    pub streams: Vec<StreamConfig>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            queue: QueueConfig::default(),
            duplicate_tag: DuplicateTagPolicy::default(),
            dispatch: DispatchConfig::default(),
            streams: default_streams(),
        }
    }
}

/// Accelerometer first: it carries the control-relevant signal.
fn default_streams() -> Vec<StreamConfig> {
    vec![StreamConfig::new("accel", 256), StreamConfig::new("gyro", 128)]
}

/// Checks a raw weight from config or CLI and narrows it to the registry's type.
pub fn validate_weight(tag: &str, weight: i64) -> Result<u32, MuxError> {
    match u32::try_from(weight) {
        Ok(w) if w > 0 => Ok(w),
        _ => Err(MuxError::InvalidWeight {
            tag: tag.to_string(),
            weight,
        }),
    }
}

impl MuxConfigInput {
    pub fn resolve(self) -> Result<MuxConfig, MuxError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(MuxError::Config(format!(
                "unsupported config version {}",
                version
            )));
        }

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            capacity: self
                .queue
                .capacity
                .unwrap_or(queue_defaults.capacity)
                .max(1),
            backpressure: self
                .queue
                .backpressure
                .unwrap_or(queue_defaults.backpressure),
        };

        let dispatch_defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            drain_grace: self
                .dispatch
                .drain_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(dispatch_defaults.drain_grace),
            idle_wait: self
                .dispatch
                .idle_wait_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(dispatch_defaults.idle_wait),
            stats_interval: self
                .dispatch
                .stats_interval_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(dispatch_defaults.stats_interval),
        };

        // Duplicate tags are passed through untouched: the registry's
        // duplicate policy decides what happens to them.
        let mut streams = Vec::new();
        let mut seen = HashSet::new();
        for stream in self.streams {
            let tag = stream.tag.trim();
            if tag.is_empty() {
                continue;
            }
            let weight = validate_weight(tag, stream.weight)?;
            if !seen.insert(tag.to_string()) {
                tracing::debug!(tag, "duplicate stream tag in config");
            }
            streams.push(StreamConfig::new(tag, weight));
        }
        if streams.is_empty() {
            streams = default_streams();
        }

        Ok(MuxConfig {
            version,
            queue,
            duplicate_tag: self.registry.duplicate_tag.unwrap_or_default(),
            dispatch,
            streams,
        })
    }
}

impl MuxConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, MuxError> {
        if input.trim().is_empty() {
            return Ok(MuxConfig::default());
        }
        let parsed: MuxConfigInput = toml::from_str(input)
            .map_err(|e| MuxError::Config(format!("invalid config TOML: {}", e)))?;
        parsed.resolve()
    }

    pub fn from_file(path: &Path) -> Result<Self, MuxError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MuxError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }
}
