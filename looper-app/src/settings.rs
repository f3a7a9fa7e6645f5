//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use looper_core::{
    audio::HostOptions,
    engine::{DEFAULT_SCOPE_LEN, DEFAULT_SPARE_LOOP_SLOTS},
    metadata::{DEFAULT_BUFFER_MARGIN_FRAMES, DEFAULT_MIN_LOOP_DURATION_MS},
    scene::{DEFAULT_MAX_LOOPS, DEFAULT_N_SCENES},
    EngineConfig, RolloverPolicy,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_GUI_INTERVAL_MS: u64 = 125;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub buffer_size: Option<u32>,
    pub n_scenes: usize,
    pub max_loops_per_scene: usize,
    pub monitor_inputs: bool,
    pub auto_scene_change: bool,
    pub auto_unmute: bool,
    pub rollover_policy: RolloverPolicy,
    /// 0 selects the engine default.
    pub record_buffer_frames: usize,
    pub min_loop_duration_ms: u32,
    pub buffer_margin_frames: usize,
    pub spare_loop_slots: usize,
    /// Display tick: how often events are drained and peaks scanned.
    pub gui_interval_ms: u64,
    pub scope_len: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            buffer_size: None,
            n_scenes: DEFAULT_N_SCENES,
            max_loops_per_scene: DEFAULT_MAX_LOOPS,
            monitor_inputs: true,
            auto_scene_change: false,
            auto_unmute: false,
            rollover_policy: RolloverPolicy::Reset,
            record_buffer_frames: 0,
            min_loop_duration_ms: DEFAULT_MIN_LOOP_DURATION_MS,
            buffer_margin_frames: DEFAULT_BUFFER_MARGIN_FRAMES,
            spare_loop_slots: DEFAULT_SPARE_LOOP_SLOTS,
            gui_interval_ms: DEFAULT_GUI_INTERVAL_MS,
            scope_len: DEFAULT_SCOPE_LEN,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.input_device = normalize_device_name(self.input_device.take());
        self.output_device = normalize_device_name(self.output_device.take());
        self.buffer_size = self.buffer_size.filter(|frames| *frames > 0).map(|f| f.min(8192));
        self.n_scenes = self.n_scenes.clamp(1, 16);
        self.max_loops_per_scene = self.max_loops_per_scene.clamp(1, 64);
        self.min_loop_duration_ms = self.min_loop_duration_ms.clamp(10, 60_000);
        self.buffer_margin_frames = self.buffer_margin_frames.min(1 << 16);
        self.spare_loop_slots = self.spare_loop_slots.min(16);
        self.gui_interval_ms = self.gui_interval_ms.clamp(10, 2_000);
        self.scope_len = self.scope_len.clamp(1, 1_000);
    }

    /// Let `LOOPER_*` environment variables override the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("LOOPER_MONITOR_INPUTS").and_then(|v| parse_flag(&v)) {
            self.monitor_inputs = v;
        }
        if let Some(v) = lookup("LOOPER_AUTO_SCENE_CHANGE").and_then(|v| parse_flag(&v)) {
            self.auto_scene_change = v;
        }
        if let Some(v) = lookup("LOOPER_RECORD_BUFFER_FRAMES").and_then(|v| v.trim().parse().ok()) {
            self.record_buffer_frames = v;
        }
        if let Some(v) = lookup("LOOPER_INPUT_DEVICE") {
            self.input_device = Some(v);
        }
        if let Some(v) = lookup("LOOPER_OUTPUT_DEVICE") {
            self.output_device = Some(v);
        }
        if let Some(v) = lookup("LOOPER_BUFFER_SIZE").and_then(|v| v.trim().parse().ok()) {
            self.buffer_size = Some(v);
        }
        self.normalize();
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            n_scenes: self.n_scenes,
            max_loops_per_scene: self.max_loops_per_scene,
            monitor_inputs: self.monitor_inputs,
            auto_scene_change: self.auto_scene_change,
            auto_unmute: self.auto_unmute,
            rollover_policy: self.rollover_policy,
            record_buffer_frames: self.record_buffer_frames,
            min_loop_duration_ms: self.min_loop_duration_ms,
            buffer_margin_frames: self.buffer_margin_frames,
            spare_loop_slots: self.spare_loop_slots,
            scope_len: self.scope_len,
            ..EngineConfig::default()
        }
    }

    pub fn host_options(&self) -> HostOptions {
        HostOptions {
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
            buffer_size: self.buffer_size,
        }
    }
}

fn normalize_device_name(raw: Option<String>) -> Option<String> {
    raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Looper")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("looper")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let raw = r#"{ "nScenes": 5, "rolloverPolicy": "wrap", "inputDevice": "  " }"#;
        let mut settings: AppSettings = serde_json::from_str(raw).unwrap();
        settings.normalize();

        assert_eq!(settings.n_scenes, 5);
        assert_eq!(settings.rollover_policy, RolloverPolicy::Wrap);
        assert_eq!(settings.input_device, None);
        assert_eq!(settings.gui_interval_ms, DEFAULT_GUI_INTERVAL_MS);
        assert!(settings.monitor_inputs);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut settings = AppSettings {
            n_scenes: 0,
            max_loops_per_scene: 1_000,
            buffer_size: Some(0),
            gui_interval_ms: 0,
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.n_scenes, 1);
        assert_eq!(settings.max_loops_per_scene, 64);
        assert_eq!(settings.buffer_size, None);
        assert_eq!(settings.gui_interval_ms, 10);
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = [
            ("LOOPER_MONITOR_INPUTS", "off"),
            ("LOOPER_AUTO_SCENE_CHANGE", "1"),
            ("LOOPER_RECORD_BUFFER_FRAMES", "65536"),
            ("LOOPER_OUTPUT_DEVICE", " Built-in Output "),
            ("LOOPER_BUFFER_SIZE", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut settings = AppSettings::default();
        settings.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert!(!settings.monitor_inputs);
        assert!(settings.auto_scene_change);
        assert_eq!(settings.record_buffer_frames, 65_536);
        assert_eq!(settings.output_device.as_deref(), Some("Built-in Output"));
        assert_eq!(settings.buffer_size, None);
        assert_eq!(settings.engine_config().record_buffer_frames, 65_536);
        assert!(!settings.engine_config().monitor_inputs);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = std::env::temp_dir().join(format!("looper-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            n_scenes: 4,
            auto_unmute: true,
            output_device: Some("Interface".into()),
            ..AppSettings::default()
        };

        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(dir);
    }
}
