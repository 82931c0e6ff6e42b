use anyhow::{Context, Result};
use hf_hub::api::tokio::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::config::ModelSource;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";

/// Local paths of everything needed to materialize a model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub generation_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    pub fn all(&self) -> impl Iterator<Item = &PathBuf> {
        [&self.config, &self.tokenizer]
            .into_iter()
            .chain(self.tokenizer_config.iter())
            .chain(self.generation_config.iter())
            .chain(self.weights.iter())
    }
}

#[derive(Debug, Deserialize)]
struct WeightsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Shard file names referenced by a `model.safetensors.index.json`, de-duplicated
/// and sorted.
pub fn weight_files_from_index(json: &str) -> Result<Vec<String>> {
    let index: WeightsIndex =
        serde_json::from_str(json).context("failed to parse safetensors index")?;
    let files: BTreeSet<String> = index.weight_map.into_values().collect();
    if files.is_empty() {
        anyhow::bail!("safetensors index does not reference any weight files");
    }
    Ok(files.into_iter().collect())
}

/// Resolves `source` to local files, downloading from the Hugging Face hub unless
/// the model id names an existing directory.
pub async fn fetch(source: &ModelSource) -> Result<ModelFiles> {
    let local = Path::new(&source.model_id);
    if local.is_dir() {
        tracing::info!(path = %local.display(), "Using local model directory");
        return from_dir(local);
    }

    tracing::info!(
        model = %source.model_id,
        revision = %source.revision,
        "Fetching model files from Hugging Face hub"
    );

    let mut builder = ApiBuilder::new().with_progress(false);
    if let Some(token) = &source.hf_token {
        builder = builder.with_token(Some(token.clone()));
    }
    let api = builder.build().context("Failed to build Hugging Face hub client")?;
    let repo = api.repo(Repo::with_revision(
        source.model_id.clone(),
        RepoType::Model,
        source.revision.clone(),
    ));

    let config = get(&repo, CONFIG_FILE).await?;
    let tokenizer = get(&repo, TOKENIZER_FILE).await?;
    let tokenizer_config = get_optional(&repo, TOKENIZER_CONFIG_FILE).await;
    let generation_config = get_optional(&repo, GENERATION_CONFIG_FILE).await;

    let weights = match get_optional(&repo, WEIGHTS_INDEX_FILE).await {
        Some(index_path) => {
            let index = tokio::fs::read_to_string(&index_path)
                .await
                .with_context(|| format!("Failed to read {}", index_path.display()))?;
            let names = weight_files_from_index(&index)?;
            tracing::info!(shards = names.len(), "Downloading sharded weights");
            let mut paths = Vec::with_capacity(names.len());
            for name in &names {
                paths.push(get(&repo, name).await?);
            }
            paths
        }
        None => vec![get(&repo, SINGLE_WEIGHTS_FILE).await?],
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config,
        generation_config,
        weights,
    })
}

async fn get(repo: &ApiRepo, file: &str) -> Result<PathBuf> {
    tracing::debug!(file, "Fetching");
    repo.get(file)
        .await
        .with_context(|| format!("Failed to download {file}"))
}

async fn get_optional(repo: &ApiRepo, file: &str) -> Option<PathBuf> {
    match repo.get(file).await {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::debug!(file, error = %e, "Optional model file not available");
            None
        }
    }
}

pub fn from_dir(dir: &Path) -> Result<ModelFiles> {
    let required = |name: &str| -> Result<PathBuf> {
        let path = dir.join(name);
        if !path.is_file() {
            anyhow::bail!("{} is missing from {}", name, dir.display());
        }
        Ok(path)
    };
    let optional = |name: &str| Some(dir.join(name)).filter(|p| p.is_file());

    let weights = match optional(WEIGHTS_INDEX_FILE) {
        Some(index_path) => {
            let index = std::fs::read_to_string(&index_path)
                .with_context(|| format!("Failed to read {}", index_path.display()))?;
            weight_files_from_index(&index)?
                .iter()
                .map(|name| required(name.as_str()))
                .collect::<Result<Vec<_>>>()?
        }
        None => vec![required(SINGLE_WEIGHTS_FILE)?],
    };

    Ok(ModelFiles {
        config: required(CONFIG_FILE)?,
        tokenizer: required(TOKENIZER_FILE)?,
        tokenizer_config: optional(TOKENIZER_CONFIG_FILE),
        generation_config: optional(GENERATION_CONFIG_FILE),
        weights,
    })
}
