//! Explicit owner of configuration and cancellation for a set of runs.
//!
//! There is no global state: create a [`PipelineContext`], derive sources,
//! builders and materializers from it, and call [`PipelineContext::shutdown`]
//! when done. Shutting down cancels any run still holding one of its tokens.

use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::config::{ColflowConfig, load_config};
use crate::error::Result;
use crate::graph::PipelineBuilder;
use crate::materialize::Materializer;
use crate::reader::TypedReader;
use crate::schema::Schema;
use crate::source::PartitionSource;

#[derive(Debug)]
pub struct PipelineContext {
    config: ColflowConfig,
    cancellation: CancellationToken,
}

impl PipelineContext {
    /// Validate `config` and take ownership of it.
    pub fn new(config: ColflowConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            max_concurrent = config.execution.max_concurrent_partitions,
            failure_mode = ?config.execution.failure_mode,
            "pipeline context created"
        );
        Ok(Self {
            config,
            cancellation: CancellationToken::new(),
        })
    }

    /// Build a context from the layered config sources for `workspace`.
    pub fn from_workspace(workspace: Option<&Path>) -> Result<Self> {
        Self::new(load_config(workspace, None)?)
    }

    pub fn config(&self) -> &ColflowConfig {
        &self.config
    }

    pub fn source(&self, pattern: &str, schema: Schema) -> Result<PartitionSource> {
        PartitionSource::discover(pattern, schema)
    }

    pub fn reader(&self) -> TypedReader {
        TypedReader::new(self.config.read.clone())
    }

    pub fn builder(&self, schema: Schema) -> PipelineBuilder {
        PipelineBuilder::new(schema)
    }

    /// A materializer whose runs stop when this context is cancelled.
    pub fn materializer(&self) -> Materializer {
        Materializer::new(&self.config).with_cancellation(self.cancellation.child_token())
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Tear the context down, cancelling outstanding work.
    pub fn shutdown(self) {
        self.cancellation.cancel();
        tracing::debug!("pipeline context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates() {
        let mut config = ColflowConfig::default();
        config.execution.max_concurrent_partitions = 0;
        assert!(PipelineContext::new(config).is_err());
    }

    #[test]
    fn test_cancel_reaches_materializers() {
        let ctx = PipelineContext::new(ColflowConfig::default()).unwrap();
        let materializer = ctx.materializer();
        assert!(!materializer.cancellation_token().is_cancelled());
        ctx.cancel();
        assert!(materializer.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_shutdown_cancels_children() {
        let ctx = PipelineContext::new(ColflowConfig::default()).unwrap();
        let token = ctx.materializer().cancellation_token();
        ctx.shutdown();
        assert!(token.is_cancelled());
    }
}
