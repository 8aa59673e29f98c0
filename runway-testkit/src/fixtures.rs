use runway::{
    JobConfig, ModelReference, Provider, RunConfig, RunId, RunKind, RunParameters,
};

/// Fluent builder for [`RunConfig`] with test-friendly defaults: a prompt
/// run against `stub:echo` with default parameters.
#[derive(Clone, Debug)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            config: RunConfig {
                id: RunId::from(id),
                name: format!("run {id}"),
                kind: RunKind::Prompt,
                model: ModelReference::new("stub:echo", Provider::Local),
                parameters: RunParameters::default(),
                prompt_text: format!("prompt for {id}"),
                context_text: None,
                attached_file_refs: Vec::new(),
                requested_metrics: Default::default(),
            },
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    pub fn kind(mut self, kind: RunKind) -> Self {
        self.config.kind = kind;
        self
    }

    pub fn model(mut self, id: &str, provider: Provider) -> Self {
        self.config.model = ModelReference::new(id, provider);
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt_text = prompt.into();
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.config.context_text = Some(context.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.parameters.max_tokens = max_tokens;
        self
    }

    pub fn parameters(mut self, parameters: RunParameters) -> Self {
        self.config.parameters = parameters;
        self
    }

    pub fn attach(mut self, file_ref: &str) -> Self {
        self.config.attached_file_refs.push(file_ref.to_string());
        self
    }

    pub fn metric(mut self, metric: &str) -> Self {
        self.config.requested_metrics.insert(metric.to_string());
        self
    }

    pub fn build(self) -> RunConfig {
        self.config
    }
}

/// A job named `name` with default runs for each id.
pub fn job_with_runs(name: &str, ids: &[&str]) -> JobConfig {
    ids.iter().fold(JobConfig::new(name), |job, id| {
        job.with_run(RunConfigBuilder::new(id).build())
    })
}
