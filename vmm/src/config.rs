/// VMM configuration: guest layout, console, feed service and port map
use serde::Deserialize;
use sparkler_feeds::http::{DEFAULT_BASE_URL, DEFAULT_USER_AGENT};
use sparkler_feeds::Feed;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Port of the console device.
pub const CONSOLE_PORT: u16 = 0x3f8;
/// Port of the social-post feed.
pub const POST_PORT: u16 = 0x100;

const WEATHER_CITIES: [(u16, &str); 6] = [
    (0x101, "Chennai"),
    (0x102, "New Delhi"),
    (0x103, "London"),
    (0x104, "Chicago"),
    (0x105, "San Francisco"),
    (0x106, "New York"),
];

const AIR_QUALITY_CITIES: [(u16, &str, &str); 6] = [
    (0x201, "IN", "Chennai"),
    (0x202, "IN", "Delhi"),
    (0x203, "GB", "London"),
    (0x204, "US", "Chicago-Naperville-Joliet"),
    (0x205, "US", "San Francisco-Oakland-Fremont"),
    (0x206, "US", "New York-Northern New Jersey-Long Island"),
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("port 0x{0:x} is bound more than once")]
    DuplicatePort(u16),
}

/// Top-level VMM configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmmConfig {
    /// Flat binary loaded at `guest_base`
    pub guest_image: PathBuf,
    /// Guest physical address of the image and of the first instruction
    pub guest_base: u64,
    /// Guest memory size in bytes
    pub mem_size: usize,
    pub console: ConsoleConfig,
    pub feeds: FeedsConfig,
    pub ports: Vec<PortBinding>,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            guest_image: PathBuf::from("monitor"),
            guest_base: 0x1000,
            mem_size: 0x8000,
            console: ConsoleConfig::default(),
            feeds: FeedsConfig::default(),
            ports: default_ports(),
        }
    }
}

impl VmmConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for binding in &self.ports {
            if !seen.insert(binding.port) {
                return Err(ConfigError::DuplicatePort(binding.port));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Echo console input back to the terminal while reading
    pub echo: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self { echo: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedsConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Per-request timeout; unset means a fetch may block forever
    pub timeout_secs: Option<u64>,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: None,
        }
    }
}

/// One entry of the port map
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortBinding {
    pub port: u16,
    pub device: DeviceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Console,
    Stream(Feed),
}

fn default_ports() -> Vec<PortBinding> {
    let mut ports = vec![
        PortBinding {
            port: CONSOLE_PORT,
            device: DeviceKind::Console,
        },
        PortBinding {
            port: POST_PORT,
            device: DeviceKind::Stream(Feed::Post),
        },
    ];
    ports.extend(WEATHER_CITIES.iter().map(|&(port, city)| PortBinding {
        port,
        device: DeviceKind::Stream(Feed::weather(city)),
    }));
    ports.extend(
        AIR_QUALITY_CITIES
            .iter()
            .map(|&(port, country, city)| PortBinding {
                port,
                device: DeviceKind::Stream(Feed::air_quality(country, city)),
            }),
    );
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(config: &VmmConfig, port: u16) -> Option<&DeviceKind> {
        config
            .ports
            .iter()
            .find(|b| b.port == port)
            .map(|b| &b.device)
    }

    #[test]
    fn test_vmm_config_default() {
        let config = VmmConfig::default();
        assert_eq!(config.guest_image, PathBuf::from("monitor"));
        assert_eq!(config.guest_base, 0x1000);
        assert_eq!(config.mem_size, 0x8000);
        assert!(config.console.echo);
        assert_eq!(config.feeds.timeout_secs, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_port_map() {
        let config = VmmConfig::default();
        assert_eq!(config.ports.len(), 14);
        assert_eq!(binding(&config, 0x3f8), Some(&DeviceKind::Console));
        assert_eq!(
            binding(&config, 0x100),
            Some(&DeviceKind::Stream(Feed::Post))
        );
        assert_eq!(
            binding(&config, 0x102),
            Some(&DeviceKind::Stream(Feed::weather("New Delhi")))
        );
        assert_eq!(
            binding(&config, 0x203),
            Some(&DeviceKind::Stream(Feed::air_quality("GB", "London")))
        );
        assert_eq!(binding(&config, 0x107), None);
        assert_eq!(binding(&config, 0x200), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: VmmConfig =
            serde_json::from_str(r#"{"guest_image": "guest.bin", "console": {"echo": false}}"#)
                .unwrap();
        assert_eq!(config.guest_image, PathBuf::from("guest.bin"));
        assert!(!config.console.echo);
        assert_eq!(config.mem_size, 0x8000);
        assert_eq!(config.ports.len(), 14);
    }

    #[test]
    fn test_custom_port_map() {
        let config: VmmConfig = serde_json::from_str(
            r#"{
                "ports": [
                    {"port": 1016, "device": "console"},
                    {"port": 768, "device": {"stream": {"feed": "weather", "city": "Oslo"}}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.ports.len(), 2);
        assert_eq!(binding(&config, 0x3f8), Some(&DeviceKind::Console));
        assert_eq!(
            binding(&config, 0x300),
            Some(&DeviceKind::Stream(Feed::weather("Oslo")))
        );
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let mut config = VmmConfig::default();
        config.ports.push(PortBinding {
            port: 0x101,
            device: DeviceKind::Console,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePort(0x101))
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let result = VmmConfig::from_file(Path::new("/nonexistent/sparkler.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
