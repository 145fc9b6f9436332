use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{CheckOutcome, Launch, Processor, relax_request};
use crate::chain::Step;
use crate::chain_config::ChainConfig;
use crate::engine::Engine;
use crate::errors::StepError;

/// Runs the engine synchronously; nothing is ever left running.
pub struct LocalProcessor {
    engine: Arc<dyn Engine>,
}

impl LocalProcessor {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    async fn relax(
        &self,
        step: &Step,
        config: &ChainConfig,
        incremental: bool,
    ) -> Result<Launch, StepError> {
        let request = relax_request(step, config, incremental)?;
        info!(step = %step.id, optimizations = request.optimizations, "Relaxing");
        let quality = self
            .engine
            .relax(&request)
            .await
            .map_err(StepError::Engine)?;
        Ok(Launch::Finished { quality })
    }
}

#[async_trait]
impl Processor for LocalProcessor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn is_running(&self, _step: &Step) -> bool {
        false
    }

    async fn relax_from_scratch(
        &self,
        step: &Step,
        config: &ChainConfig,
    ) -> Result<Launch, StepError> {
        self.relax(step, config, false).await
    }

    async fn relax_incremental(
        &self,
        step: &Step,
        config: &ChainConfig,
    ) -> Result<Launch, StepError> {
        self.relax(step, config, true).await
    }

    async fn merge_incremental(
        &self,
        step: &Step,
        master: &Path,
        addition: &Path,
    ) -> Result<(), StepError> {
        let output = step.primary_output()?;
        info!(step = %step.id, master = %master.display(), "Merging");
        self.engine
            .merge(master, addition, &output)
            .await
            .map_err(StepError::Engine)
    }

    async fn check(&self, _step: &mut Step, _config: &ChainConfig) -> CheckOutcome {
        CheckOutcome::Unchanged
    }

    fn reconcile(&self, step: &mut Step) -> bool {
        step.batch.take().is_some()
    }
}
