use crate::backend::BackendError;
use crate::logger::{info, Component};
use crate::registry::ModelProfile;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where to find a model's weights and tokenizer on the Hugging Face hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSource {
    pub id: String,
    pub name: String,
    pub size_mb: u32,
    pub weight_urls: Vec<String>,
    pub weight_filenames: Vec<String>,
    pub tokenizer_url: String,
}

impl ModelSource {
    /// Sources with known weight layouts.
    pub fn catalog() -> Vec<Self> {
        vec![
            ModelSource {
                id: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string(),
                name: "TinyLlama 1.1B Chat".to_string(),
                size_mb: 2200,
                weight_urls: vec![
                    "https://huggingface.co/TinyLlama/TinyLlama-1.1B-Chat-v1.0/resolve/main/model.safetensors".to_string(),
                ],
                weight_filenames: vec!["tinyllama-1.1b.safetensors".to_string()],
                tokenizer_url: "https://huggingface.co/TinyLlama/TinyLlama-1.1B-Chat-v1.0/resolve/main/tokenizer.json".to_string(),
            },
            ModelSource {
                id: "meta-llama/Meta-Llama-3-8B-Instruct".to_string(),
                name: "Llama 3 8B Instruct".to_string(),
                size_mb: 16000,
                weight_urls: (1..=4)
                    .map(|i| format!(
                        "https://huggingface.co/meta-llama/Meta-Llama-3-8B-Instruct/resolve/main/model-0000{i}-of-00004.safetensors"
                    ))
                    .collect(),
                weight_filenames: (1..=4)
                    .map(|i| format!("llama-3-8b-instruct-0000{i}-of-00004.safetensors"))
                    .collect(),
                tokenizer_url: "https://huggingface.co/meta-llama/Meta-Llama-3-8B-Instruct/resolve/main/tokenizer.json".to_string(),
            },
        ]
    }

    /// Resolve a profile to a source, synthesizing the standard hub layout
    /// for ids the catalog does not know.
    pub fn for_profile(profile: &ModelProfile) -> Self {
        Self::catalog()
            .into_iter()
            .find(|source| source.id == profile.id)
            .unwrap_or_else(|| Self::from_hub_id(&profile.id))
    }

    pub fn from_hub_id(id: &str) -> Self {
        let name = id.rsplit('/').next().unwrap_or(id).to_string();
        ModelSource {
            id: id.to_string(),
            name,
            size_mb: 0,
            weight_urls: vec![format!(
                "https://huggingface.co/{id}/resolve/main/model.safetensors"
            )],
            weight_filenames: vec![format!("{}.safetensors", sanitize(id))],
            tokenizer_url: format!("https://huggingface.co/{id}/resolve/main/tokenizer.json"),
        }
    }
}

/// Local paths of a fully fetched model.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub weights: Vec<PathBuf>,
    pub tokenizer: PathBuf,
}

/// Downloads model weights and tokenizers into a local cache directory,
/// reporting fractional progress.
pub struct ModelFetcher {
    models_dir: PathBuf,
}

impl ModelFetcher {
    pub fn new(models_dir: PathBuf) -> Self {
        Self { models_dir }
    }

    pub fn default_models_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("quill")
            .join("models")
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Download whatever is missing for a profile and return the local
    /// paths. Files already present are reused without touching the
    /// network.
    pub async fn ensure_downloaded(
        &self,
        profile: &ModelProfile,
        on_progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<ModelPaths, BackendError> {
        let source = ModelSource::for_profile(profile);
        fs::create_dir_all(&self.models_dir)
            .map_err(|e| BackendError::Fetch(format!("cannot create models dir: {e}")))?;

        let total_files = source.weight_urls.len().max(1);
        let mut weights = Vec::with_capacity(total_files);
        for (index, (url, filename)) in source
            .weight_urls
            .iter()
            .zip(source.weight_filenames.iter())
            .enumerate()
        {
            let dest = self.models_dir.join(filename);
            if dest.exists() {
                info(
                    Component::Models,
                    &format!("Weight file already cached: {filename}"),
                );
            } else {
                self.download_file(url, &dest, &|fraction| {
                    on_progress((index as f32 + fraction) / total_files as f32)
                })
                .await?;
            }
            weights.push(dest);
        }

        let tokenizer = self
            .models_dir
            .join(format!("{}_tokenizer.json", sanitize(&source.id)));
        if !tokenizer.exists() {
            info(Component::Models, "Downloading tokenizer...");
            self.download_file(&source.tokenizer_url, &tokenizer, &|_| {})
                .await?;
        }

        on_progress(1.0);
        Ok(ModelPaths { weights, tokenizer })
    }

    async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<(), BackendError> {
        info(Component::Models, &format!("Downloading from: {url}"));

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::Fetch(e.to_string()))?;

        let response = client
            .get(url)
            .header("User-Agent", "Quill/0.1")
            .send()
            .await
            .map_err(|e| BackendError::Fetch(format!("failed to start download: {e}")))?;

        if !response.status().is_success() {
            return Err(BackendError::Fetch(format!(
                "download failed with status: {}",
                response.status()
            )));
        }

        let total_size = response.content_length().unwrap_or(0);
        if total_size > 0 {
            info(
                Component::Models,
                &format!("File size: {} MB", total_size / (1024 * 1024)),
            );
        }

        // Interrupted downloads land in the .part file, never at `dest`.
        let partial = dest.with_extension("part");
        let mut file = fs::File::create(&partial)
            .map_err(|e| BackendError::Fetch(format!("cannot create {partial:?}: {e}")))?;

        let mut downloaded = 0u64;
        let mut last_percent = 0u32;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BackendError::Fetch(format!("download failed: {e}")))?;
            file.write_all(&chunk)
                .map_err(|e| BackendError::Fetch(format!("write failed: {e}")))?;
            downloaded += chunk.len() as u64;

            if total_size > 0 {
                let fraction = downloaded as f32 / total_size as f32;
                let percent = (fraction * 100.0) as u32;
                if percent > last_percent {
                    on_progress(fraction);
                    if percent >= last_percent + 5 {
                        info(
                            Component::Models,
                            &format!(
                                "Download progress: {percent}% ({} MB / {} MB)",
                                downloaded / (1024 * 1024),
                                total_size / (1024 * 1024)
                            ),
                        );
                    }
                    last_percent = percent;
                }
            }
        }

        file.sync_all()
            .map_err(|e| BackendError::Fetch(format!("sync failed: {e}")))?;
        drop(file);
        fs::rename(&partial, dest)
            .map_err(|e| BackendError::Fetch(format!("cannot finalize {dest:?}: {e}")))?;

        info(Component::Models, "Download completed successfully");
        Ok(())
    }
}

fn sanitize(id: &str) -> String {
    id.replace('/', "_")
}
