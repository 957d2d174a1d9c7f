//! Per-thread interpreter state.

use super::value::Ref;

/// Operand stack depth bound.
pub(crate) const MAX_STACK_DEPTH: usize = 512;
/// Call frame depth bound.
pub(crate) const MAX_RECURSION: usize = 128;
/// Mark stack depth bound.
pub(crate) const MAX_MARK_DEPTH: usize = 128;

/// One function activation.
pub(crate) struct Frame {
    /// The function value being executed.
    pub func: Ref,
    /// Hash-based activation record for this call.
    pub locals: Ref,
    /// Instruction pointer into the code object's opcode stream.
    pub ip: usize,
    /// Operand stack depth at frame entry; RETURN truncates back to it.
    pub bp: usize,
    /// Mark stack depth at frame entry.
    pub mark_base: usize,
}

/// A context: the stacks and error state one host thread executes against.
/// Contexts live in the runtime so every thread's stacks stay visible to the
/// collector; hosts hold them by index through `runtime::Context`.
pub(crate) struct Ctx {
    pub op_stack: Vec<Ref>,
    pub f_stack: Vec<Frame>,
    /// Saved operand stack depths for loop bookkeeping (MARK/UNMARK/BREAK).
    pub mark_stack: Vec<usize>,
    /// GC-findable slots for references created since the last dispatch;
    /// cleared at the top of every instruction.
    pub temps: Vec<Ref>,
    /// Value carried by an in-flight `die`, kept rooted during unwinding.
    pub die_arg: Ref,
    pub in_use: bool,
    /// Sub-invocation chain, so roots cover the whole parent/child stack.
    pub parent: Option<usize>,
    pub child: Option<usize>,
}

impl Ctx {
    pub(crate) fn new() -> Ctx {
        Ctx {
            op_stack: Vec::with_capacity(64),
            f_stack: Vec::with_capacity(16),
            mark_stack: Vec::new(),
            temps: Vec::new(),
            die_arg: Ref::nil(),
            in_use: false,
            parent: None,
            child: None,
        }
    }

    /// Clear all state before reuse from the free list.
    pub(crate) fn reset(&mut self) {
        self.op_stack.clear();
        self.f_stack.clear();
        self.mark_stack.clear();
        self.temps.clear();
        self.die_arg = Ref::nil();
        self.parent = None;
        self.child = None;
    }
}
