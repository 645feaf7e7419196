use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use sdlf_core::storage::ObjectStore;
use sdlf_core::{
    DatasetConfig, JobDetails, JobStatus, PipelineError, PipelineStage, ProcessedKeys, Transform,
    TransformError, TransformOutput, TransformRequest,
};

pub const COPY_TRANSFORM: &str = "copy";

/// Transform implementations by the name dataset configs refer to them with.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in transforms.
    pub fn with_builtins(storage: Arc<dyn ObjectStore>) -> Self {
        let mut registry = Self::new();
        registry.register(COPY_TRANSFORM, Arc::new(CopyTransform::new(storage)));
        registry
    }

    pub fn register(&mut self, name: &str, transform: Arc<dyn Transform>) {
        self.transforms.insert(name.to_owned(), transform);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.transforms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn for_stage(
        &self,
        config: &DatasetConfig,
        stage: PipelineStage,
    ) -> Result<Arc<dyn Transform>, PipelineError> {
        let name = config.transform_name(stage);
        self.transforms.get(name).cloned().ok_or_else(|| {
            PipelineError::Lookup(format!(
                "{} {stage} transform {name} is not registered",
                config.name()
            ))
        })
    }

    /// Checks every dataset binds a registered transform for every stage, reporting all
    /// unbound ones at once.
    pub fn validate(&self, datasets: &[DatasetConfig]) -> Result<(), PipelineError> {
        let missing: Vec<String> = datasets
            .iter()
            .flat_map(|config| PipelineStage::ALL.map(|stage| (config, stage)))
            .filter(|(config, stage)| !self.transforms.contains_key(config.transform_name(*stage)))
            .map(|(config, stage)| {
                format!("{} {stage} -> {}", config.name(), config.transform_name(stage))
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Lookup(format!(
                "unregistered transforms: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Copies every key into the next zone under the dataset prefix. StageA writes
/// `pre-stage/{team}/{dataset}/...` keys to the stage bucket; StageB writes one run folder
/// `post-stage/{team}/{dataset}/{run}/` to the analytics bucket and reports it as a job.
pub struct CopyTransform {
    storage: Arc<dyn ObjectStore>,
}

impl CopyTransform {
    pub fn new(storage: Arc<dyn ObjectStore>) -> Self {
        Self { storage }
    }

    async fn copy(
        &self,
        request: &TransformRequest,
        key: &str,
        target: &str,
    ) -> Result<(), TransformError> {
        self.storage
            .copy(&request.bucket, key, &request.output_bucket, target)
            .await?;
        Ok(())
    }

    /// Key path below the dataset prefix, falling back to the whole key.
    fn relative_key<'a>(key: &'a str, team: &str, dataset: &str, zone: Option<&str>) -> &'a str {
        let prefix = match zone {
            Some(zone) => format!("{zone}/{team}/{dataset}/"),
            None => format!("{team}/{dataset}/"),
        };
        key.strip_prefix(prefix.as_str()).unwrap_or(key)
    }
}

#[async_trait]
impl Transform for CopyTransform {
    async fn transform_object(
        &self,
        request: &TransformRequest,
    ) -> Result<TransformOutput, TransformError> {
        let (team, dataset) = (&request.team, &request.dataset);
        match request.stage {
            PipelineStage::StageA => {
                let mut processed = Vec::with_capacity(request.keys.len());
                for key in &request.keys {
                    let relative = Self::relative_key(key, team, dataset, None);
                    let target = format!("pre-stage/{team}/{dataset}/{relative}");
                    self.copy(request, key, &target).await?;
                    processed.push(target);
                }
                Ok(TransformOutput {
                    processed_keys: ProcessedKeys::Keys(processed),
                    job_details: None,
                })
            }
            PipelineStage::StageB => {
                let run = Uuid::now_v7().to_string();
                let prefix = format!("post-stage/{team}/{dataset}/{run}/");
                for key in &request.keys {
                    let relative = Self::relative_key(key, team, dataset, Some("pre-stage"));
                    self.copy(request, key, &format!("{prefix}{relative}"))
                        .await?;
                }
                Ok(TransformOutput {
                    processed_keys: ProcessedKeys::Prefix(prefix),
                    job_details: Some(JobDetails {
                        job_name: format!("{}-{team}-{dataset}-copy", request.resource_prefix),
                        job_run_id: run,
                        job_status: JobStatus::Succeeded,
                        tables: vec![],
                    }),
                })
            }
        }
    }
}
