use crate::logger::{error, Component};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    // Model selection
    pub models: ModelSettings,

    // Sampling and streaming
    pub generation: GenerationSettings,

    // Backend resource policy
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub active_profile_id: String,
    pub models_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_tokens: usize,
    /// Publish the streaming buffer every N tokens. Updating on every token
    /// costs roughly 15% throughput.
    pub display_every_n_tokens: usize,
    /// Fixed sampler seed; wall-clock seeded per call when unset.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub working_set_ceiling_bytes: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            models: ModelSettings::default(),
            generation: GenerationSettings::default(),
            backend: BackendSettings::default(),
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            active_profile_id: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string(),
            models_dir: None,
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            max_tokens: 8000,
            display_every_n_tokens: 10,
            seed: None,
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            working_set_ceiling_bytes: 20 * 1024 * 1024,
        }
    }
}

pub struct SettingsManager {
    settings_path: PathBuf,
    settings: AppSettings,
}

impl SettingsManager {
    pub fn new(config_dir: &Path) -> Result<Self, String> {
        let settings_path = config_dir.join("settings.json");

        // Load settings or create default
        let settings = match fs::read_to_string(&settings_path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                error(
                    Component::Settings,
                    &format!("Failed to parse settings.json: {}, using defaults", e),
                );
                AppSettings::default()
            }),
            Err(_) => {
                let default_settings = AppSettings::default();

                // Save default settings
                if let Ok(json) = serde_json::to_string_pretty(&default_settings) {
                    let _ = fs::write(&settings_path, json);
                }

                default_settings
            }
        };

        Ok(Self {
            settings_path,
            settings,
        })
    }

    pub fn get(&self) -> &AppSettings {
        &self.settings
    }

    pub fn update<F>(&mut self, updater: F) -> Result<(), String>
    where
        F: FnOnce(&mut AppSettings),
    {
        updater(&mut self.settings);
        self.save()
    }

    pub fn save(&self) -> Result<(), String> {
        let json = serde_json::to_string_pretty(&self.settings)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(&self.settings_path, json)
            .map_err(|e| format!("Failed to save settings: {}", e))?;

        Ok(())
    }

    pub fn reload(&mut self) -> Result<(), String> {
        match fs::read_to_string(&self.settings_path) {
            Ok(contents) => {
                self.settings = serde_json::from_str(&contents)
                    .map_err(|e| format!("Failed to parse settings: {}", e))?;
                Ok(())
            }
            Err(e) => Err(format!("Failed to read settings: {}", e)),
        }
    }
}
