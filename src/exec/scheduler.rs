//! Generation driver: steps a module's ranks through prepare, the policy-
//! scheduled compute iterations, and reduce.
//!
//! Gang policies use rank collectives to keep iterations in lockstep, so a
//! failing or cancelled rank must keep participating in the agreement
//! rounds until the loop converges; bailing out early would strand the
//! other ranks in a collective.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::core::message::{ExecStage, MessageKind, ModuleId};
use crate::exec::module::{
    BlockTask, Compute, ComputeContext, Emitted, ModuleRuntime, ModuleState, ReducePolicy,
    SchedulingPolicy,
};
use crate::{Error, Result};

impl<C: Compute> ModuleRuntime<C> {
    /// Run one execution generation. Failures are isolated: the runtime
    /// returns to `Ready` whatever happened, and the error describes what
    /// this generation lost.
    pub(crate) async fn execute_generation(&mut self, generation: i32) -> Result<()> {
        self.generation = generation;
        self.advance(ModuleState::Preparing)?;

        let outcome = self.run_generation(generation).await;

        // Failure paths may leave the machine mid-generation.
        self.state = ModuleState::Ready;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        outcome
    }

    async fn run_generation(&mut self, generation: i32) -> Result<()> {
        let (ctx, mut rx) = self.context(generation);

        let prepared = match AssertUnwindSafe(self.compute.prepare(&ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::warn!(module = %self.id, "prepare failed: {err}");
                false
            }
            Err(_) => {
                return Err(Error::Panicked(format!(
                    "prepare of module {}",
                    self.id
                )))
            }
        };
        self.flush_emitted(&mut rx).await?;

        // No rank computes before every rank finished preparing.
        if !self.comm.all_agree(prepared).await {
            return Err(Error::Compute(format!(
                "generation {generation} aborted: prepare failed on a rank"
            )));
        }

        self.advance(ModuleState::Computing)?;
        let mut tasks: VecDeque<BlockTask> = self.drain_tasks(generation).into();
        if self.inputs.is_empty() {
            // Source modules get one empty work item per participating rank.
            tasks.push_back(BlockTask::empty(generation));
        }

        let mut failed: Option<Error> = None;
        let mut max_timestep = -1;

        match self.scheduling {
            SchedulingPolicy::Single => {
                if self.comm.rank() == 0 {
                    while let Some(task) = tasks.pop_front() {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        max_timestep = max_timestep.max(task.timestep);
                        if let Err(err) = self.invoke_compute(&ctx, &task, &mut rx).await {
                            failed = Some(err);
                            break;
                        }
                    }
                }
            }
            SchedulingPolicy::Gang | SchedulingPolicy::LazyGang => loop {
                if self.cancel.is_cancelled() || failed.is_some() {
                    tasks.clear();
                }
                let has_local = !tasks.is_empty();
                if !self.comm.any_rank(has_local).await {
                    break;
                }
                if self.cancel.is_cancelled() || failed.is_some() {
                    // Sit the iteration out but keep answering collectives.
                    continue;
                }
                let task = match (tasks.pop_front(), self.scheduling) {
                    (Some(task), _) => task,
                    // A gang rank without input still steps, its siblings
                    // may run collectives inside compute.
                    (None, SchedulingPolicy::Gang) => BlockTask::empty(generation),
                    (None, _) => continue,
                };
                max_timestep = max_timestep.max(task.timestep);
                if let Err(err) = self.invoke_compute(&ctx, &task, &mut rx).await {
                    failed = Some(err);
                }
                if self.comm.rank() == 0 {
                    self.post(
                        MessageKind::ExecutionProgress {
                            module: self.id,
                            stage: ExecStage::Iteration,
                        },
                        ModuleId::LOCAL_HUB,
                        None,
                    )
                    .await?;
                }
            },
        }

        self.advance(ModuleState::Reducing)?;
        // Reduce runs on all ranks or none; a failed generation skips it.
        let healthy = !self.cancel.is_cancelled() && failed.is_none();
        if self.comm.all_agree(healthy).await {
            match self.reduce_policy {
                ReducePolicy::Never => {}
                ReducePolicy::OverAll => {
                    if let Err(err) = self.invoke_reduce(&ctx, -1, &mut rx).await {
                        failed = Some(err);
                    }
                }
                ReducePolicy::PerTimestep => {
                    let last = self.comm.max_i32(max_timestep).await;
                    for timestep in 0..=last {
                        if let Err(err) = self.invoke_reduce(&ctx, timestep, &mut rx).await {
                            failed = Some(err);
                            break;
                        }
                    }
                }
            }
        }
        self.flush_emitted(&mut rx).await?;
        self.advance(ModuleState::Ready)?;

        match failed {
            Some(err) => Err(err),
            None if self.cancel.is_cancelled() => {
                tracing::info!(module = %self.id, "generation {generation} cancelled");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn invoke_compute(
        &mut self,
        ctx: &ComputeContext,
        task: &BlockTask,
        rx: &mut UnboundedReceiver<Emitted>,
    ) -> Result<()> {
        let outcome = AssertUnwindSafe(self.compute.compute(ctx, task))
            .catch_unwind()
            .await;
        self.flush_emitted(rx).await?;
        match outcome {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(Error::Compute(format!(
                "module {} aborted generation {}",
                self.id, task.generation
            ))),
            Ok(Err(err)) => Err(Error::Compute(err.to_string())),
            Err(_) => Err(Error::Panicked(format!(
                "compute of module {}",
                self.id
            ))),
        }
    }

    async fn invoke_reduce(
        &mut self,
        ctx: &ComputeContext,
        timestep: i32,
        rx: &mut UnboundedReceiver<Emitted>,
    ) -> Result<()> {
        let outcome = AssertUnwindSafe(self.compute.reduce(ctx, timestep))
            .catch_unwind()
            .await;
        self.flush_emitted(rx).await?;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Error::Compute(err.to_string())),
            Err(_) => Err(Error::Panicked(format!(
                "reduce of module {}",
                self.id
            ))),
        }
    }
}
