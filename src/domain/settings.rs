use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "shell_racing_controller".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Link Settings
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_write_interval_ms")]
    pub write_interval_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_bus_capacity: usize,

    // Discovery Settings
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_name_filters")]
    pub name_filters: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,

    // Input Settings
    #[serde(default)]
    pub gamepad_slot: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            write_interval_ms: default_write_interval_ms(),
            event_bus_capacity: default_event_capacity(),
            scan_timeout_secs: default_scan_timeout_secs(),
            name_filters: default_name_filters(),
            last_connected_address: None,
            gamepad_slot: 0,
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    45
}
fn default_write_interval_ms() -> u64 {
    100
}
fn default_event_capacity() -> usize {
    256
}
fn default_scan_timeout_secs() -> u64 {
    3
}

/// Advertised names of the supported cars (matched case-insensitively).
const CAR_NAMES: &[&str] = &[
    "12CILINDRI",
    "SL-12Cilindri",
    "296GT3",
    "296 GT3",
    "296GTB",
    "296 GTB",
    "330P",
    "330 P 1965",
    "330P4",
    "330 P4",
    "488EVO",
    "488 Challenge Evo",
    "488GTE",
    "488 GTE",
    "499P",
    "499 P",
    "512S",
    "512 S 1970",
    "DaytonaSP3",
    "Daytona SP3",
    "F175",
    "F1-75",
    "FXXK",
    "FXX-K EVO",
    "PUROSANGUE",
    "SF1000",
    "SF23",
    "SF-23",
    "SF24",
    "SF-24",
    "SF90SPIDER",
    "SF90 Spider",
    "ShellCar",
    "Shell Car",
];

fn default_name_filters() -> Vec<String> {
    CAR_NAMES.iter().map(|name| name.to_string()).collect()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::open(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file
    /// is missing or unreadable.
    pub fn open(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ShellRacingController");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_address(&mut self, address: &str) -> anyhow::Result<()> {
        if self.settings.last_connected_address.as_deref() != Some(address) {
            self.settings.last_connected_address = Some(address.to_string());
            self.save()?;
        }
        Ok(())
    }
}
