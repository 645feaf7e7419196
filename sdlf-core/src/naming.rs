use std::collections::BTreeMap;

use crate::PipelineStage;

/// Kinds of per-stage resources resolved by naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageResource {
    Queue,
    DeadLetterQueue,
    StateMachine,
}

impl StageResource {
    pub const ALL: [StageResource; 3] = [
        StageResource::Queue,
        StageResource::DeadLetterQueue,
        StageResource::StateMachine,
    ];

    fn parameter_suffix(&self) -> &'static str {
        match self {
            StageResource::Queue => "Queue",
            StageResource::DeadLetterQueue => "DLQ",
            StageResource::StateMachine => "StateMachine",
        }
    }
}

/// Resource names for one (team, pipeline, stage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResources {
    pub queue: String,
    pub dead_letter_queue: String,
    pub workflow: String,
}

impl StageResources {
    pub fn get(&self, resource: StageResource) -> &str {
        match resource {
            StageResource::Queue => &self.queue,
            StageResource::DeadLetterQueue => &self.dead_letter_queue,
            StageResource::StateMachine => &self.workflow,
        }
    }
}

/// Resolves stage queue, DLQ and workflow names from the deployment's resource prefix.
/// All names are pure functions of their inputs, so producers and consumers agree without
/// a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNaming {
    prefix: String,
}

impl ResourceNaming {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue(&self, team: &str, pipeline: &str, stage: PipelineStage) -> String {
        format!(
            "{}-{team}-{pipeline}-queue-{}.fifo",
            self.prefix,
            stage.letter()
        )
    }

    pub fn dead_letter_queue(&self, team: &str, pipeline: &str, stage: PipelineStage) -> String {
        format!(
            "{}-{team}-{pipeline}-dlq-{}.fifo",
            self.prefix,
            stage.letter()
        )
    }

    pub fn workflow(&self, team: &str, pipeline: &str, stage: PipelineStage) -> String {
        format!("{}-{team}-{pipeline}-sm-{}", self.prefix, stage.letter())
    }

    pub fn stage_resources(&self, team: &str, pipeline: &str, stage: PipelineStage) -> StageResources {
        StageResources {
            queue: self.queue(team, pipeline, stage),
            dead_letter_queue: self.dead_letter_queue(team, pipeline, stage),
            workflow: self.workflow(team, pipeline, stage),
        }
    }

    /// Parameter store path under which a deployment publishes a stage resource,
    /// e.g. `/prefix/SDLF/adtech/datasetA/StageAQueue`.
    pub fn parameter_path(
        &self,
        team: &str,
        dataset: &str,
        stage: PipelineStage,
        resource: StageResource,
    ) -> String {
        format!(
            "/{}/SDLF/{team}/{dataset}/{stage}{}",
            self.prefix,
            resource.parameter_suffix()
        )
    }

    /// Every stage resource of a dataset, keyed by its parameter path.
    pub fn parameters(&self, team: &str, dataset: &str, pipeline: &str) -> BTreeMap<String, String> {
        let mut parameters = BTreeMap::new();
        for stage in PipelineStage::ALL {
            let resources = self.stage_resources(team, pipeline, stage);
            for resource in StageResource::ALL {
                parameters.insert(
                    self.parameter_path(team, dataset, stage, resource),
                    resources.get(resource).to_owned(),
                );
            }
        }
        parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_convention() {
        let naming = ResourceNaming::new("prefix");
        assert_eq!(
            naming.queue("adtech", "insights", PipelineStage::StageA),
            "prefix-adtech-insights-queue-a.fifo"
        );
        assert_eq!(
            naming.dead_letter_queue("adtech", "insights", PipelineStage::StageB),
            "prefix-adtech-insights-dlq-b.fifo"
        );
        assert_eq!(
            naming.workflow("adtech", "insights", PipelineStage::StageB),
            "prefix-adtech-insights-sm-b"
        );
    }

    #[test]
    fn parameter_paths() {
        let naming = ResourceNaming::new("prefix");
        assert_eq!(
            naming.parameter_path(
                "adtech",
                "datasetA",
                PipelineStage::StageA,
                StageResource::Queue
            ),
            "/prefix/SDLF/adtech/datasetA/StageAQueue"
        );
        assert_eq!(
            naming.parameter_path(
                "adtech",
                "datasetA",
                PipelineStage::StageB,
                StageResource::StateMachine
            ),
            "/prefix/SDLF/adtech/datasetA/StageBStateMachine"
        );
    }

    #[test]
    fn parameters_cover_every_stage_resource() {
        let parameters = ResourceNaming::new("prefix").parameters("adtech", "datasetA", "insights");
        assert_eq!(parameters.len(), 6);
        assert_eq!(
            parameters["/prefix/SDLF/adtech/datasetA/StageADLQ"],
            "prefix-adtech-insights-dlq-a.fifo"
        );
        assert_eq!(
            parameters["/prefix/SDLF/adtech/datasetA/StageBStateMachine"],
            "prefix-adtech-insights-sm-b"
        );
    }
}
