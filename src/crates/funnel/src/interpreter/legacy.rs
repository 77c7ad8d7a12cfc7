//! Legacy linear campaigns
//!
//! A flat list of steps driven by `current_step_index`. Steps share the node
//! handlers with graph campaigns; branching kinds are rejected at parse time.

use super::{Cursor, Interpreter, RunContext, RunOutcome, Step};
use crate::db::models::ExecutionRecord;
use crate::db::repositories::ExecutionRepository;
use crate::error::Result;
use crate::graph::NodeKind;
use tracing::debug;

impl Interpreter {
    pub(crate) async fn run_linear(
        &self,
        ctx: &mut RunContext,
        steps: &[NodeKind],
        record: &ExecutionRecord,
    ) -> Result<RunOutcome> {
        let mut index = record.current_step_index.unwrap_or(0).max(0) as usize;

        while let Some(step) = steps.get(index) {
            if let Some(outcome) = self.check_budget(ctx) {
                return Ok(outcome);
            }
            debug!(execution_id = %ctx.record_id, step = index, kind = step.name(), "Executing step");

            match self.execute(ctx, step).await? {
                Step::Continue(_) => {}
                Step::Delay(delay) => {
                    let next = index + 1;
                    if next >= steps.len() {
                        return Ok(RunOutcome::Finished);
                    }
                    if let Some(outcome) = self.delay(ctx, delay, None, Some(next)).await? {
                        return Ok(outcome);
                    }
                }
                Step::WaitUntil(at) => {
                    let now = self.clock.now();
                    ExecutionRepository::suspend(&self.pool, &ctx.record_id, None, Some(index as i64), at, now).await?;
                    return Ok(RunOutcome::Suspended {
                        resume: Cursor::Step(index),
                        resume_at: at,
                    });
                }
                Step::Stop => return Ok(RunOutcome::Finished),
                Step::Fail(reason) => return Ok(RunOutcome::Failed { reason }),
            }

            index += 1;
            ExecutionRepository::advance_step(&self.pool, &ctx.record_id, index as i64, self.clock.now()).await?;
        }

        Ok(RunOutcome::Finished)
    }
}
