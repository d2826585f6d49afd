//!
//! The instrumentation task.
//!
//! A deferred mutation plan over a cloned lifted representation: an
//! ordered map from target machine instructions to the hook invocations to
//! materialize strictly before them. The task never mutates machine IR
//! itself; the queue is value-moved into the code generator when the
//! mutator returns.
//!

use std::sync::Arc;

use indexmap::IndexMap;

use lyra_backend::Register;

use crate::error::Error;
use crate::error::Result;
use crate::instrumentation::module::InstrumentationModuleRegistry;
use crate::lifter::InstRef;
use crate::lifter::LiftedRepresentation;

///
/// One positional hook argument.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookArgument {
    /// An integer constant, passed through as an IR constant.
    Constant(i64),
    /// A concrete physical register whose dispatch-time value the hook
    /// receives.
    Register(Register),
}

///
/// One queued hook invocation.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInvocation {
    /// The hook function name, resolved through the registry.
    pub hook_name: String,
    /// The positional arguments.
    pub args: Vec<HookArgument>,
}

///
/// The deferred mutation plan of one instrumentation run.
///
pub struct InstrumentationTask {
    /// The cloned representation being mutated.
    representation: LiftedRepresentation,
    /// The registry supplying the hooks.
    registry: Arc<InstrumentationModuleRegistry>,
    /// Target instruction to its invocations, in enqueue order.
    queue: IndexMap<InstRef, Vec<HookInvocation>>,
}

impl InstrumentationTask {
    ///
    /// A shortcut constructor over a cloned representation.
    ///
    pub(crate) fn new(
        representation: LiftedRepresentation,
        registry: Arc<InstrumentationModuleRegistry>,
    ) -> Self {
        Self {
            representation,
            registry,
            queue: IndexMap::new(),
        }
    }

    ///
    /// The representation under mutation.
    ///
    pub fn representation(&self) -> &LiftedRepresentation {
        &self.representation
    }

    ///
    /// The mutable representation; direct edits take effect immediately,
    /// unlike hook insertions.
    ///
    pub fn representation_mut(&mut self) -> &mut LiftedRepresentation {
        &mut self.representation
    }

    ///
    /// Queues a hook invocation strictly before a machine instruction.
    ///
    /// There is deliberately no post-insertion variant: splicing after a
    /// basic block's terminator would break the block invariant.
    ///
    /// `hook_handle` is the tool's shadow host pointer; invocations queued
    /// for the same instruction materialize in enqueue order.
    ///
    pub fn insert_hook_before(
        &mut self,
        target: &InstRef,
        hook_handle: u64,
        args: Vec<HookArgument>,
    ) -> Result<()> {
        if !self.representation.contains(target) {
            return Err(Error::lowering(format!(
                "instruction {target:?} does not belong to the task's representation"
            )));
        }
        let hook_name = self.registry.hook_name(hook_handle)?;
        self.queue
            .entry(target.clone())
            .or_default()
            .push(HookInvocation { hook_name, args });
        Ok(())
    }

    ///
    /// The queued invocations, read-only.
    ///
    pub fn queue(&self) -> &IndexMap<InstRef, Vec<HookInvocation>> {
        &self.queue
    }

    ///
    /// Decomposes the task into the mutated representation and the queue.
    ///
    pub(crate) fn into_parts(
        self,
    ) -> (LiftedRepresentation, IndexMap<InstRef, Vec<HookInvocation>>) {
        (self.representation, self.queue)
    }
}
