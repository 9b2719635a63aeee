//! Mock stage collaborator for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::cache::CachedFileRecord;
use crate::stage::{StageError, StageUnitProcessor, UnitContext};

/// Mock processor producing one output per unit.
///
/// Outputs are named after the processor. For summary units, one output is
/// produced per index present in the inputs, named by the summary.
#[derive(Debug)]
pub struct MockUnitProcessor {
    name: String,
    delay: Option<Duration>,
    fail: AtomicBool,
    panic_next: AtomicBool,
    calls: AtomicUsize,
    last_input_count: AtomicUsize,
}

impl MockUnitProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: None,
            fail: AtomicBool::new(false),
            panic_next: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            last_input_count: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Panic on the next call only.
    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_input_count(&self) -> usize {
        self.last_input_count.load(Ordering::SeqCst)
    }

    fn output_names(&self, inputs: &[CachedFileRecord], ctx: &UnitContext) -> Vec<String> {
        match &ctx.summary {
            Some(summary) => ctx
                .indices
                .iter()
                .filter(|index| inputs.iter().any(|r| &r.data_name == *index))
                .map(|index| summary.output_data_name(index))
                .collect(),
            None => vec![self.name.clone()],
        }
    }
}

#[async_trait]
impl StageUnitProcessor for MockUnitProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        inputs: &[CachedFileRecord],
        ctx: &UnitContext,
    ) -> Result<Vec<CachedFileRecord>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_input_count.store(inputs.len(), Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("mock '{}' panic", self.name);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StageError::Failed(format!("mock '{}' failure", self.name)));
        }

        tokio::fs::create_dir_all(&ctx.output_dir).await?;
        let mut outputs = Vec::new();
        for data_name in self.output_names(inputs, ctx) {
            let path = ctx.output_dir.join(format!("{}.out", data_name.replace(':', "_")));
            tokio::fs::write(&path, data_name.as_bytes()).await?;
            outputs.push(ctx.output_record(data_name, path));
        }
        Ok(outputs)
    }
}
