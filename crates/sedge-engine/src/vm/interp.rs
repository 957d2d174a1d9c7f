//! The bytecode interpreter.
//!
//! `Vm` is the in-lock execution facade: it owns the runtime lock guard for
//! the duration of one host entry into the VM, dispatches opcodes against a
//! context's operand/frame/mark stacks, and runs the safepoint protocol
//! between instructions. Host callbacks receive `&mut Vm` and may allocate,
//! raise errors, and re-enter the VM through a child context.

use super::context::{Frame, MAX_MARK_DEPTH, MAX_RECURSION, MAX_STACK_DEPTH};
use super::runtime::{Globals, Runtime};
use super::value::{Kind, Ref};
use super::{Fail, VmRes};
use crate::compiler::opcode::Op;
use crate::{Error, TraceFrame};
use parking_lot::MutexGuard;

/// Member lookup recursion bound through `parents` chains.
const MAX_PARENTS: usize = 200;

/// Parse a byte string as a number the way the language coerces scalars:
/// optional sign, fraction, exponent. Words like `inf` do not count.
pub(crate) fn parse_num(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?.trim();
    if s.is_empty() {
        return None;
    }
    if !s
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'+' | b'-' | b'.' | b'e' | b'E'))
    {
        return None;
    }
    s.parse::<f64>().ok()
}

/// Format a number as string data: integral values print without a decimal
/// point.
pub(crate) fn fmt_num(n: f64) -> String {
    if n.is_finite() && n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// The executing machine: runtime handle, lock guard, and current context.
pub struct Vm<'rt> {
    rt: &'rt Runtime,
    g: MutexGuard<'rt, Globals>,
    ctx: usize,
}

impl Drop for Vm<'_> {
    fn drop(&mut self) {
        self.g.n_threads -= 1;
        // If everyone else is already parked at the rendezvous, our exit
        // makes them the whole population: run the collection they wait on.
        if self.g.bottleneck && self.g.n_threads > 0 && self.g.wait_count == self.g.n_threads {
            self.g.collect();
            self.g.wait_count = 0;
            self.g.bottleneck = false;
            self.g.gc_epoch = self.g.gc_epoch.wrapping_add(1);
            self.rt.gc_cv.notify_all();
        }
    }
}

impl<'rt> Vm<'rt> {
    /// Enter the VM on a context: take the lock, join the executing-thread
    /// count, and pass the entry safepoint.
    pub(crate) fn enter(rt: &'rt Runtime, ctx: usize) -> Vm<'rt> {
        let mut g = rt.state.lock();
        g.n_threads += 1;
        let mut vm = Vm { rt, g, ctx };
        vm.safepoint();
        vm
    }

    pub(crate) fn globals_mut(&mut self) -> &mut Globals {
        &mut self.g
    }

    /// Root a reference in the context's temps so it survives collection
    /// until the context next dispatches an instruction.
    pub(crate) fn root_temp(&mut self, r: Ref) {
        let c = self.ctx;
        self.g.contexts[c].temps.push(r);
    }

    pub(crate) fn frame_depth(&self) -> usize {
        self.g.contexts[self.ctx].f_stack.len()
    }

    // ------------------------------------------------------------------
    // Safepoint / bottleneck
    // ------------------------------------------------------------------

    /// Checked between instructions, on API entry, and before blocking
    /// primitives: when a collection is pending, rendezvous with every
    /// other executing context.
    #[inline]
    fn safepoint(&mut self) {
        if self.g.heap.need_gc || self.g.bottleneck {
            self.bottleneck();
        }
    }

    #[cold]
    fn bottleneck(&mut self) {
        self.g.bottleneck = true;
        self.g.wait_count += 1;
        if self.g.wait_count == self.g.n_threads {
            // Last arriver: everyone else is parked, collect alone.
            self.g.collect();
            self.g.wait_count = 0;
            self.g.bottleneck = false;
            self.g.gc_epoch = self.g.gc_epoch.wrapping_add(1);
            self.rt.gc_cv.notify_all();
        } else {
            let epoch = self.g.gc_epoch;
            while self.g.gc_epoch == epoch {
                self.rt.gc_cv.wait(&mut self.g);
            }
        }
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    fn capture_trace(&self) -> Vec<(Ref, u16)> {
        let ctx = &self.g.contexts[self.ctx];
        let mut out = Vec::new();
        for fr in ctx.f_stack.iter().rev() {
            let code = self.g.heap.code(self.g.heap.func(fr.func).code);
            out.push((code.src_file, code.line_for_ip(fr.ip.saturating_sub(1))));
        }
        out
    }

    fn make_fail(&mut self, message: String, die_arg: Ref) -> Fail {
        let trace = self.capture_trace();
        // Keep the die argument rooted while the unwind is in flight.
        let c = self.ctx;
        self.g.contexts[c].die_arg = die_arg;
        Fail {
            message,
            die_arg,
            trace,
        }
    }

    /// Raise a runtime error from the current context. The trace is
    /// captured at the raise point, deepest frame first.
    pub fn error<T>(&mut self, msg: impl Into<String>) -> VmRes<T> {
        Err(self.make_fail(msg.into(), Ref::nil()))
    }

    /// Raise a script-level `die(x)`, carrying the value.
    pub fn die(&mut self, val: Ref) -> Fail {
        let message = if val.is_kind(Kind::Str) {
            self.str_text(val)
        } else {
            "script died".to_string()
        };
        self.make_fail(message, val)
    }

    /// Convert an in-flight failure to the host error type, resolving
    /// source-file references into strings.
    pub(crate) fn fail_to_error(&mut self, f: Fail) -> Error {
        let trace = f
            .trace
            .iter()
            .map(|&(file, line)| TraceFrame {
                file: if file.is_kind(Kind::Str) {
                    self.str_text(file)
                } else {
                    "<unknown>".to_string()
                },
                line: line as u32,
            })
            .collect();
        Error::Runtime {
            message: f.message,
            trace,
        }
    }

    // ------------------------------------------------------------------
    // Operand stack
    // ------------------------------------------------------------------

    fn push(&mut self, v: Ref) -> VmRes<()> {
        let c = self.ctx;
        if self.g.contexts[c].op_stack.len() >= MAX_STACK_DEPTH {
            return self.error("stack overflow");
        }
        self.g.contexts[c].op_stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> VmRes<Ref> {
        let c = self.ctx;
        match self.g.contexts[c].op_stack.pop() {
            Some(v) => Ok(v),
            None => self.error("BUG: stack underflow"),
        }
    }

    /// Value `depth` slots below the top.
    fn peek(&mut self, depth: usize) -> VmRes<Ref> {
        let c = self.ctx;
        let stack = &self.g.contexts[c].op_stack;
        if depth >= stack.len() {
            return self.error("BUG: stack underflow");
        }
        Ok(stack[stack.len() - 1 - depth])
    }

    fn set_top(&mut self, depth: usize, v: Ref) {
        let c = self.ctx;
        let len = self.g.contexts[self.ctx].op_stack.len();
        self.g.contexts[c].op_stack[len - 1 - depth] = v;
    }

    // ------------------------------------------------------------------
    // Coercions and equality
    // ------------------------------------------------------------------

    /// Numeric coercion: numbers as-is, numeric strings parsed; everything
    /// else is a runtime error.
    fn numify(&mut self, r: Ref) -> VmRes<f64> {
        if let Some(n) = r.as_num() {
            return Ok(n);
        }
        if r.is_nil() {
            return self.error("nil used in numeric context");
        }
        if r.is_kind(Kind::Str) {
            match parse_num(self.g.heap.string(r).bytes()) {
                Some(n) => Ok(n),
                None => self.error("non-numeric string in numeric context"),
            }
        } else {
            self.error("non-scalar used in numeric context")
        }
    }

    /// Truth test: nil and the end sentinel are false, numbers by value,
    /// strings by their numeric value when they have one (empty is false),
    /// anything else is an error.
    fn boolify(&mut self, r: Ref) -> VmRes<bool> {
        if let Some(n) = r.as_num() {
            return Ok(n != 0.0);
        }
        if r.is_nil() || r.is_end() {
            return Ok(false);
        }
        if r.is_kind(Kind::Str) {
            let s = self.g.heap.string(r);
            if s.is_empty() {
                return Ok(false);
            }
            return Ok(match parse_num(s.bytes()) {
                Some(n) => n != 0.0,
                None => true,
            });
        }
        self.error("non-scalar used in boolean context")
    }

    /// String coercion for concatenation: strings as-is, numbers formatted.
    fn stringify(&mut self, r: Ref) -> VmRes<Vec<u8>> {
        if r.is_kind(Kind::Str) {
            return Ok(self.g.heap.string(r).bytes().to_vec());
        }
        if let Some(n) = r.as_num() {
            return Ok(fmt_num(n).into_bytes());
        }
        self.error("non-scalar used in string context")
    }

    /// Script equality: identity short-circuits, numbers by value, scalar
    /// mixes through numeric coercion, strings by bytes.
    fn ref_equal(&mut self, a: Ref, b: Ref) -> bool {
        if a.bits() == b.bits() {
            return true;
        }
        if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
            return x == y;
        }
        let scalar = |r: Ref| r.is_num() || r.is_kind(Kind::Str);
        if !scalar(a) || !scalar(b) {
            return false;
        }
        if a.is_kind(Kind::Str) && b.is_kind(Kind::Str) {
            let sa = self.g.heap.string(a).bytes();
            let sb = self.g.heap.string(b).bytes();
            return sa == sb;
        }
        // One number, one string: compare numerically when the string has
        // a numeric value.
        let num_of = |vm: &Vm<'_>, r: Ref| {
            r.as_num()
                .or_else(|| parse_num(vm.g.heap.string(r).bytes()))
        };
        match (num_of(self, a), num_of(self, b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    fn str_text(&self, r: Ref) -> String {
        String::from_utf8_lossy(self.g.heap.string(r).bytes()).into_owned()
    }

    fn sym_text(&self, sym: Ref) -> String {
        if sym.is_kind(Kind::Str) {
            self.str_text(sym)
        } else {
            "<sym>".to_string()
        }
    }

    // ------------------------------------------------------------------
    // Members and containers
    // ------------------------------------------------------------------

    /// Member lookup with `parents`-vector inheritance.
    fn get_member(&mut self, obj: Ref, sym: Ref, depth: usize) -> VmRes<Option<Ref>> {
        if depth > MAX_PARENTS {
            return self.error("too many parents");
        }
        match obj.kind() {
            Some(Kind::Hash) => {
                if let Some(v) = self.g.heap.hash_get(obj, sym) {
                    return Ok(Some(v));
                }
                let parents_sym = self.g.parents_sym;
                if let Some(parents) = self.g.heap.hash_get(obj, parents_sym) {
                    if parents.is_kind(Kind::Vec) {
                        let list = self.g.heap.vector(parents).elems.clone();
                        for p in list {
                            if let Some(v) = self.get_member(p, sym, depth + 1)? {
                                return Ok(Some(v));
                            }
                        }
                    }
                }
                Ok(None)
            }
            Some(Kind::Ghost) => {
                let (hook, data) = {
                    let gh = self.g.heap.ghost(obj);
                    (gh.ty.get_member, gh.data)
                };
                match hook {
                    Some(h) => h(self, data, sym),
                    None => self.error("ghost has no members"),
                }
            }
            _ if obj.is_nil() => self.error("member access on nil"),
            _ => self.error("member access on non-object"),
        }
    }

    fn set_member(&mut self, obj: Ref, sym: Ref, val: Ref) -> VmRes<()> {
        match obj.kind() {
            Some(Kind::Hash) => {
                self.g.heap.hash_set(obj, sym, val);
                Ok(())
            }
            Some(Kind::Ghost) => {
                let (hook, data) = {
                    let gh = self.g.heap.ghost(obj);
                    (gh.ty.set_member, gh.data)
                };
                match hook {
                    Some(h) => {
                        if h(self, data, sym, val)? {
                            Ok(())
                        } else {
                            let name = self.sym_text(sym);
                            self.error(format!("no settable ghost member: {}", name))
                        }
                    }
                    None => self.error("ghost has no settable members"),
                }
            }
            _ if obj.is_nil() => self.error("member access on nil"),
            _ => self.error("member access on non-object"),
        }
    }

    fn vec_index(&mut self, len: usize, idx: Ref) -> VmRes<usize> {
        let n = self.numify(idx)? as i64;
        let i = if n < 0 { n + len as i64 } else { n };
        if i < 0 || i >= len as i64 {
            return self.error(format!("index {} out of bounds", n));
        }
        Ok(i as usize)
    }

    fn container_get(&mut self, cont: Ref, idx: Ref) -> VmRes<Ref> {
        match cont.kind() {
            Some(Kind::Vec) => {
                let len = self.g.heap.vector(cont).elems.len();
                let i = self.vec_index(len, idx)?;
                Ok(self.g.heap.vector(cont).elems[i])
            }
            Some(Kind::Str) => {
                let len = self.g.heap.string(cont).len();
                let i = self.vec_index(len, idx)?;
                Ok(Ref::num(self.g.heap.string(cont).bytes()[i] as f64))
            }
            Some(Kind::Hash) => match self.g.heap.hash_get(cont, idx) {
                Some(v) => Ok(v),
                None => self.error("undefined value in container"),
            },
            _ => self.error("index into non-container"),
        }
    }

    fn container_set(&mut self, cont: Ref, idx: Ref, val: Ref) -> VmRes<()> {
        match cont.kind() {
            Some(Kind::Vec) => {
                let len = self.g.heap.vector(cont).elems.len();
                let i = self.vec_index(len, idx)?;
                self.g.heap.vector_mut(cont).elems[i] = val;
                Ok(())
            }
            Some(Kind::Hash) => {
                self.g.heap.hash_set(cont, idx, val);
                Ok(())
            }
            _ => self.error("insert into non-container"),
        }
    }

    // ------------------------------------------------------------------
    // Symbol lookup through the activation record and closure chain
    // ------------------------------------------------------------------

    fn scope_chain(&self) -> (Ref, Ref) {
        let fr = self.g.contexts[self.ctx]
            .f_stack
            .last()
            .expect("scope lookup outside any frame");
        (fr.locals, fr.func)
    }

    fn lookup_sym(&mut self, sym: Ref) -> Option<Ref> {
        let (locals, mut func) = self.scope_chain();
        if let Some(v) = self.g.heap.hash_sym_get(locals, sym) {
            return Some(v);
        }
        while func.is_kind(Kind::Func) {
            let (ns, next) = {
                let fo = self.g.heap.func(func);
                (fo.namespace, fo.next)
            };
            if ns.is_kind(Kind::Hash) {
                if let Some(v) = self.g.heap.hash_sym_get(ns, sym) {
                    return Some(v);
                }
            }
            func = next;
        }
        None
    }

    /// Assignment without `var`: store where the symbol is found on the
    /// scope chain, or in the local record when it is new.
    fn set_symbol(&mut self, sym: Ref, val: Ref) {
        let (locals, mut func) = self.scope_chain();
        if self.g.heap.hash_sym_get(locals, sym).is_some() {
            self.g.heap.hash_set(locals, sym, val);
            return;
        }
        while func.is_kind(Kind::Func) {
            let (ns, next) = {
                let fo = self.g.heap.func(func);
                (fo.namespace, fo.next)
            };
            if ns.is_kind(Kind::Hash) && self.g.heap.hash_sym_get(ns, sym).is_some() {
                self.g.heap.hash_set(ns, sym, val);
                return;
            }
            func = next;
        }
        self.g.heap.hash_set(locals, sym, val);
    }

    fn hash_pairs(&self, h: Ref) -> Vec<(Ref, Ref)> {
        let mut out = Vec::new();
        if let Some(rec) = &self.g.heap.hashes.get(h.index()).rec {
            for c in 0..rec.tab.len() {
                let e = rec.tab[c];
                if e >= 0 {
                    out.push((rec.ents[e as usize].key, rec.ents[e as usize].val));
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Begin a call with the operands already on the stack:
    /// `[f, a1..an]`, or `[obj, f, a1..an]` for a method call. For a host
    /// callback the call completes inline and `Some(result)` is returned
    /// with the result also pushed; for a script function a frame is pushed
    /// and `None` returned.
    fn setup_call(&mut self, nargs: usize, mcall: bool, named: Option<Ref>) -> VmRes<Option<Ref>> {
        let c = self.ctx;
        let top = self.g.contexts[c].op_stack.len();
        if top < nargs + 1 + mcall as usize {
            return self.error("BUG: stack underflow");
        }
        let fpos = top - nargs - 1;
        let f = self.g.contexts[c].op_stack[fpos];
        let me = if mcall {
            self.g.contexts[c].op_stack[fpos - 1]
        } else {
            Ref::nil()
        };

        match f.kind() {
            Some(Kind::CCode) => {
                let cf = self.g.heap.ccode(f).func;
                // argv stays rooted on the operand stack for the whole call.
                let args: Vec<Ref> =
                    self.g.contexts[c].op_stack[top - nargs..].to_vec();
                let result = cf(self, me, &args)?;
                let newtop = fpos - mcall as usize;
                self.g.contexts[c].op_stack.truncate(newtop);
                self.push(result)?;
                Ok(Some(result))
            }
            Some(Kind::Func) => {
                if self.g.contexts[c].f_stack.len() >= MAX_RECURSION {
                    return self.error("call stack overflow");
                }
                let code_ref = self.g.heap.func(f).code;
                let (syms, opts, rest_sym, implicit) = {
                    let co = self.g.heap.code(code_ref);
                    (
                        co.arg_syms.to_vec(),
                        co.opt_args.to_vec(),
                        co.rest_sym,
                        co.implicit_args,
                    )
                };
                let args: Vec<Ref> =
                    self.g.contexts[c].op_stack[top - nargs..].to_vec();
                let locals = self.g.heap.new_hash();
                self.root_temp(locals);

                let mut used = 0usize;
                for &sym in &syms {
                    if used >= args.len() {
                        return self.error("too few function args");
                    }
                    self.g.heap.hash_new_sym(locals, sym, args[used]);
                    used += 1;
                }
                for &(sym, cidx) in &opts {
                    let val = if used < args.len() {
                        let v = args[used];
                        used += 1;
                        v
                    } else {
                        let co = self.g.heap.code(code_ref);
                        co.consts
                            .get(cidx as usize)
                            .copied()
                            .unwrap_or_else(Ref::nil)
                    };
                    self.g.heap.hash_new_sym(locals, sym, val);
                }
                if !rest_sym.is_nil() {
                    let rest = self.g.heap.new_vec(args[used..].to_vec());
                    self.g.heap.hash_new_sym(locals, rest_sym, rest);
                    used = args.len();
                } else if implicit {
                    let all = self.g.heap.new_vec(args.clone());
                    let arg_sym = self.g.arg_sym;
                    self.g.heap.hash_new_sym(locals, arg_sym, all);
                    used = args.len();
                }
                if used < args.len() {
                    return self.error("too many function args");
                }
                if mcall {
                    let me_sym = self.g.me_sym;
                    self.g.heap.hash_new_sym(locals, me_sym, me);
                }
                if let Some(h) = named {
                    for (k, v) in self.hash_pairs(h) {
                        self.g.heap.hash_set(locals, k, v);
                    }
                }

                let mark_base = self.g.contexts[c].mark_stack.len();
                self.g.contexts[c].f_stack.push(Frame {
                    func: f,
                    locals,
                    ip: 0,
                    bp: fpos - mcall as usize,
                    mark_base,
                });
                Ok(None)
            }
            _ => self.error("function/method call on uncallable object"),
        }
    }

    /// Call a value in the current context (which must not already hold the
    /// stack the caller cares about: errors unwind to the entry depths).
    pub(crate) fn invoke_here(&mut self, f: Ref, me: Ref, args: &[Ref]) -> VmRes<Ref> {
        let c = self.ctx;
        let op_base = self.g.contexts[c].op_stack.len();
        let frame_base = self.g.contexts[c].f_stack.len();
        let mark_base = self.g.contexts[c].mark_stack.len();

        let mcall = !me.is_nil();
        let res = (|| {
            if mcall {
                self.push(me)?;
            }
            self.push(f)?;
            for &a in args {
                self.push(a)?;
            }
            match self.setup_call(args.len(), mcall, None)? {
                Some(_) => self.pop(),
                None => self.run(frame_base),
            }
        })();

        if res.is_err() {
            let ctx = &mut self.g.contexts[c];
            ctx.op_stack.truncate(op_base);
            ctx.f_stack.truncate(frame_base);
            ctx.mark_stack.truncate(mark_base);
        }
        res
    }

    /// Re-entrant sub-invocation from a host callback: runs in a fresh
    /// child context linked under the current one, so GC roots cover the
    /// whole parent/child chain.
    pub fn call_value(&mut self, f: Ref, me: Ref, args: &[Ref]) -> VmRes<Ref> {
        let parent = self.ctx;
        let child = self.g.acquire_ctx();
        self.g.contexts[child].parent = Some(parent);
        self.g.contexts[parent].child = Some(child);
        self.ctx = child;
        let res = self.invoke_here(f, me, args);
        self.ctx = parent;
        self.g.contexts[parent].child = None;
        match &res {
            Ok(v) => self.root_temp(*v),
            Err(fail) => {
                // Keep the die argument rooted in the surviving context.
                self.g.contexts[parent].die_arg = fail.die_arg;
            }
        }
        self.g.release_ctx(child);
        res
    }

    // ------------------------------------------------------------------
    // The dispatch loop
    // ------------------------------------------------------------------

    fn run(&mut self, base: usize) -> VmRes<Ref> {
        let c = self.ctx;
        loop {
            self.safepoint();
            self.g.contexts[c].temps.clear();

            if self.g.contexts[c].f_stack.is_empty() {
                return self.error("BUG: execution without a frame");
            }
            let (code_ref, ip) = {
                let fr = self.g.contexts[c].f_stack.last().expect("checked above");
                (self.g.heap.func(fr.func).code, fr.ip)
            };
            let (word, imm) = {
                let code = self.g.heap.code(code_ref);
                if ip >= code.ops.len() {
                    return self.error("BUG: instruction pointer out of range");
                }
                (code.ops[ip], code.ops.get(ip + 1).copied().unwrap_or(0))
            };
            let op = match Op::from_word(word) {
                Some(op) => op,
                None => return self.error("BUG: invalid opcode"),
            };
            self.g.contexts[c]
                .f_stack
                .last_mut()
                .expect("frame checked above")
                .ip = ip + 1 + op.imms();

            match op {
                Op::Not => {
                    let v = self.pop()?;
                    let b = self.boolify(v)?;
                    self.push(Ref::num(if b { 0.0 } else { 1.0 }))?;
                }
                Op::Mul | Op::Plus | Op::Minus | Op::Div => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let x = self.numify(a)?;
                    let y = self.numify(b)?;
                    let r = match op {
                        Op::Mul => x * y,
                        Op::Plus => x + y,
                        Op::Minus => x - y,
                        _ => {
                            if y == 0.0 {
                                return self.error("divide by zero");
                            }
                            x / y
                        }
                    };
                    self.push(Ref::num(r))?;
                }
                Op::Neg => {
                    let v = self.pop()?;
                    let n = self.numify(v)?;
                    self.push(Ref::num(-n))?;
                }
                Op::Cat => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let mut bytes = self.stringify(a)?;
                    bytes.extend_from_slice(&self.stringify(b)?);
                    let s = self.g.heap.new_str(&bytes);
                    self.push(s)?;
                }
                Op::BitAnd | Op::BitOr | Op::BitXor => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let x = self.numify(a)? as i32;
                    let y = self.numify(b)? as i32;
                    let r = match op {
                        Op::BitAnd => x & y,
                        Op::BitOr => x | y,
                        _ => x ^ y,
                    };
                    self.push(Ref::num(r as f64))?;
                }
                Op::BitNeg => {
                    let v = self.pop()?;
                    let x = self.numify(v)? as i32;
                    self.push(Ref::num(!x as f64))?;
                }
                Op::Lt | Op::Lte | Op::Gt | Op::Gte => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let x = self.numify(a)?;
                    let y = self.numify(b)?;
                    let r = match op {
                        Op::Lt => x < y,
                        Op::Lte => x <= y,
                        Op::Gt => x > y,
                        _ => x >= y,
                    };
                    self.push(Ref::num(if r { 1.0 } else { 0.0 }))?;
                }
                Op::Eq | Op::Neq => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let eq = self.ref_equal(a, b);
                    let r = if op == Op::Eq { eq } else { !eq };
                    self.push(Ref::num(if r { 1.0 } else { 0.0 }))?;
                }
                Op::Each => {
                    let ctr_ref = self.peek(0)?;
                    let vec = self.peek(1)?;
                    if !vec.is_kind(Kind::Vec) {
                        return self.error("foreach enumeration of non-vector");
                    }
                    let ctr = match ctr_ref.as_num() {
                        Some(n) => n as usize,
                        None => return self.error("BUG: bad loop counter"),
                    };
                    let len = self.g.heap.vector(vec).elems.len();
                    if ctr < len {
                        let item = if imm == 1 {
                            Ref::num(ctr as f64)
                        } else {
                            self.g.heap.vector(vec).elems[ctr]
                        };
                        self.set_top(0, Ref::num((ctr + 1) as f64));
                        self.push(item)?;
                    } else {
                        self.push(Ref::end_token())?;
                    }
                }
                Op::Jmp | Op::JmpLoop => {
                    self.g.contexts[c]
                        .f_stack
                        .last_mut()
                        .expect("frame exists")
                        .ip = imm as usize;
                }
                Op::JifNot => {
                    let v = self.peek(0)?;
                    if !self.boolify(v)? {
                        self.g.contexts[c]
                            .f_stack
                            .last_mut()
                            .expect("frame exists")
                            .ip = imm as usize;
                    }
                }
                Op::JifNotPop => {
                    let v = self.pop()?;
                    if !self.boolify(v)? {
                        self.g.contexts[c]
                            .f_stack
                            .last_mut()
                            .expect("frame exists")
                            .ip = imm as usize;
                    }
                }
                Op::JifTrue => {
                    let v = self.peek(0)?;
                    if self.boolify(v)? {
                        self.g.contexts[c]
                            .f_stack
                            .last_mut()
                            .expect("frame exists")
                            .ip = imm as usize;
                    }
                }
                Op::JifEnd => {
                    if self.peek(0)?.is_end() {
                        self.pop()?;
                        self.g.contexts[c]
                            .f_stack
                            .last_mut()
                            .expect("frame exists")
                            .ip = imm as usize;
                    }
                }
                Op::Fcall => {
                    self.setup_call(imm as usize, false, None)?;
                }
                Op::Mcall => {
                    self.setup_call(imm as usize, true, None)?;
                }
                Op::FcallH => {
                    let h = self.pop()?;
                    if !h.is_kind(Kind::Hash) {
                        return self.error("BUG: named arguments without a hash");
                    }
                    self.setup_call(imm as usize, false, Some(h))?;
                }
                Op::McallH => {
                    let h = self.pop()?;
                    if !h.is_kind(Kind::Hash) {
                        return self.error("BUG: named arguments without a hash");
                    }
                    self.setup_call(imm as usize, true, Some(h))?;
                }
                Op::Return => {
                    let v = self.pop()?;
                    let fr = self.g.contexts[c]
                        .f_stack
                        .pop()
                        .expect("frame checked at dispatch");
                    let ctx = &mut self.g.contexts[c];
                    ctx.op_stack.truncate(fr.bp);
                    ctx.mark_stack.truncate(fr.mark_base);
                    ctx.die_arg = Ref::nil();
                    if ctx.f_stack.len() == base {
                        return Ok(v);
                    }
                    self.push(v)?;
                }
                Op::PushConst => {
                    let r = self.const_at(code_ref, imm)?;
                    if r.is_kind(Kind::Code) {
                        // A code constant evaluates to a closure over the
                        // current frame.
                        let (locals, func) = self.scope_chain();
                        let bound = self.g.heap.new_func(r, locals, func);
                        self.push(bound)?;
                    } else {
                        self.push(r)?;
                    }
                }
                Op::PushOne => self.push(Ref::num(1.0))?,
                Op::PushZero => self.push(Ref::num(0.0))?,
                Op::PushNil => self.push(Ref::nil())?,
                Op::PushEnd => self.push(Ref::end_token())?,
                Op::Pop => {
                    self.pop()?;
                }
                Op::Dup => {
                    let v = self.peek(0)?;
                    self.push(v)?;
                }
                Op::Dup2 => {
                    let a = self.peek(1)?;
                    let b = self.peek(0)?;
                    self.push(a)?;
                    self.push(b)?;
                }
                Op::Xchg => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(b)?;
                    self.push(a)?;
                }
                Op::Xchg2 => {
                    let z = self.pop()?;
                    let y = self.pop()?;
                    let x = self.pop()?;
                    self.push(y)?;
                    self.push(z)?;
                    self.push(x)?;
                }
                Op::Insert => {
                    let val = self.pop()?;
                    let idx = self.pop()?;
                    let cont = self.pop()?;
                    self.container_set(cont, idx, val)?;
                    self.push(val)?;
                }
                Op::Extract => {
                    let idx = self.peek(0)?;
                    let cont = self.peek(1)?;
                    let v = self.container_get(cont, idx)?;
                    self.push(v)?;
                }
                Op::Index => {
                    let idx = self.pop()?;
                    let cont = self.pop()?;
                    let v = self.container_get(cont, idx)?;
                    self.push(v)?;
                }
                Op::Member => {
                    let sym = self.const_at(code_ref, imm)?;
                    let obj = self.pop()?;
                    match self.get_member(obj, sym, 0)? {
                        Some(v) => self.push(v)?,
                        None => {
                            let name = self.sym_text(sym);
                            return self.error(format!("No such member: {}", name));
                        }
                    }
                }
                Op::SetMember => {
                    let sym = self.const_at(code_ref, imm)?;
                    let val = self.pop()?;
                    let obj = self.pop()?;
                    self.set_member(obj, sym, val)?;
                    self.push(val)?;
                }
                Op::Local => {
                    let sym = self.const_at(code_ref, imm)?;
                    match self.lookup_sym(sym) {
                        Some(v) => self.push(v)?,
                        None => {
                            let name = self.sym_text(sym);
                            return self.error(format!("undefined symbol: {}", name));
                        }
                    }
                }
                Op::SetLocal => {
                    let sym = self.const_at(code_ref, imm)?;
                    let val = self.peek(0)?;
                    let (locals, _) = self.scope_chain();
                    self.g.heap.hash_set(locals, sym, val);
                }
                Op::SetSym => {
                    let sym = self.const_at(code_ref, imm)?;
                    let val = self.peek(0)?;
                    self.set_symbol(sym, val);
                }
                Op::NewVec => {
                    let v = self.g.heap.new_vec(Vec::new());
                    self.push(v)?;
                }
                Op::Vappend => {
                    let elem = self.pop()?;
                    let vec = self.peek(0)?;
                    if !vec.is_kind(Kind::Vec) {
                        return self.error("BUG: append to non-vector");
                    }
                    self.g.heap.vector_mut(vec).elems.push(elem);
                }
                Op::NewHash => {
                    let h = self.g.heap.new_hash();
                    self.push(h)?;
                }
                Op::Happend => {
                    let val = self.pop()?;
                    let key = self.pop()?;
                    let h = self.peek(0)?;
                    if !h.is_kind(Kind::Hash) {
                        return self.error("BUG: append to non-hash");
                    }
                    self.g.heap.hash_set(h, key, val);
                }
                Op::Mark => {
                    let depth = self.g.contexts[c].op_stack.len();
                    if self.g.contexts[c].mark_stack.len() >= MAX_MARK_DEPTH {
                        return self.error("mark stack overflow");
                    }
                    self.g.contexts[c].mark_stack.push(depth);
                }
                Op::Unmark => {
                    if self.g.contexts[c].mark_stack.pop().is_none() {
                        return self.error("BUG: mark stack underflow");
                    }
                }
                Op::Break => {
                    let m = self.g.contexts[c].mark_stack.last().copied();
                    let m = match m {
                        Some(m) => m,
                        None => return self.error("BUG: mark stack underflow"),
                    };
                    self.g.contexts[c].op_stack.truncate(m);
                }
                Op::Break2 => {
                    let m = match self.g.contexts[c].mark_stack.pop() {
                        Some(m) => m,
                        None => return self.error("BUG: mark stack underflow"),
                    };
                    self.g.contexts[c].op_stack.truncate(m);
                }
                Op::Unpack => {
                    let v = self.pop()?;
                    if !v.is_kind(Kind::Vec) {
                        return self.error("multi-assignment from non-vector");
                    }
                    let n = imm as usize;
                    let elems = self.g.heap.vector(v).elems.clone();
                    if elems.len() < n {
                        return self.error("not enough elements in multi-assignment");
                    }
                    for &e in elems.iter().take(n) {
                        self.push(e)?;
                    }
                }
                Op::Slice => {
                    let idx = self.pop()?;
                    let src = self.peek(0)?;
                    let res = self.peek(1)?;
                    if !src.is_kind(Kind::Vec) || !res.is_kind(Kind::Vec) {
                        return self.error("slice of non-vector");
                    }
                    let len = self.g.heap.vector(src).elems.len();
                    let i = self.vec_index(len, idx)?;
                    let elem = self.g.heap.vector(src).elems[i];
                    self.g.heap.vector_mut(res).elems.push(elem);
                }
                Op::Slice2 => {
                    let hi = self.pop()?;
                    let lo = self.pop()?;
                    let src = self.peek(0)?;
                    let res = self.peek(1)?;
                    if !src.is_kind(Kind::Vec) || !res.is_kind(Kind::Vec) {
                        return self.error("slice of non-vector");
                    }
                    let len = self.g.heap.vector(src).elems.len();
                    let start = if lo.is_nil() {
                        0
                    } else {
                        self.vec_index(len, lo)?
                    };
                    let end = if hi.is_nil() {
                        len.saturating_sub(1)
                    } else {
                        self.vec_index(len, hi)?
                    };
                    let mut i = start;
                    while i <= end && i < len {
                        let elem = self.g.heap.vector(src).elems[i];
                        self.g.heap.vector_mut(res).elems.push(elem);
                        i += 1;
                    }
                }
            }
        }
    }

    fn const_at(&mut self, code_ref: Ref, idx: u16) -> VmRes<Ref> {
        let code = self.g.heap.code(code_ref);
        match code.consts.get(idx as usize) {
            Some(&r) => Ok(r),
            None => self.error("BUG: constant index out of range"),
        }
    }

    // ------------------------------------------------------------------
    // Surface for host callbacks
    // ------------------------------------------------------------------

    /// Allocate a string, rooted through the context's temps.
    pub fn new_string(&mut self, bytes: &[u8]) -> Ref {
        let s = self.g.heap.new_str(bytes);
        self.root_temp(s);
        s
    }

    /// Allocate a vector from elements, rooted through temps.
    pub fn new_vector_from(&mut self, elems: Vec<Ref>) -> Ref {
        let v = self.g.heap.new_vec(elems);
        self.root_temp(v);
        v
    }

    /// Allocate a hash, rooted through temps.
    pub fn new_hash(&mut self) -> Ref {
        let h = self.g.heap.new_hash();
        self.root_temp(h);
        h
    }

    /// Intern a symbol.
    pub fn intern(&mut self, name: &[u8]) -> Ref {
        let sym = self.g.intern(name);
        self.root_temp(sym);
        sym
    }

    /// Numeric coercion, nil on failure.
    pub fn num_value(&mut self, r: Ref) -> Option<f64> {
        if let Some(n) = r.as_num() {
            return Some(n);
        }
        if r.is_kind(Kind::Str) {
            parse_num(self.g.heap.string(r).bytes())
        } else {
            None
        }
    }

    /// String bytes of a string value.
    pub fn string_bytes(&self, r: Ref) -> Option<Vec<u8>> {
        if r.is_kind(Kind::Str) {
            Some(self.g.heap.string(r).bytes().to_vec())
        } else {
            None
        }
    }

    /// Scalar-to-string coercion as the concatenation operator performs it.
    pub fn display_bytes(&mut self, r: Ref) -> VmRes<Vec<u8>> {
        self.stringify(r)
    }

    /// Hash accessors for callbacks.
    pub fn hash_member(&mut self, h: Ref, key: Ref) -> Option<Ref> {
        if h.is_kind(Kind::Hash) {
            self.g.heap.hash_get(h, key)
        } else {
            None
        }
    }

    /// Set a hash member.
    pub fn hash_insert(&mut self, h: Ref, key: Ref, val: Ref) {
        if h.is_kind(Kind::Hash) {
            self.g.heap.hash_set(h, key, val);
        }
    }

    /// Delete a hash member.
    pub fn hash_remove(&mut self, h: Ref, key: Ref) {
        if h.is_kind(Kind::Hash) {
            self.g.heap.hash_delete(h, key);
        }
    }

    /// Live entry count of a hash.
    pub fn hash_len(&self, h: Ref) -> usize {
        if h.is_kind(Kind::Hash) {
            self.g.heap.hash_size(h)
        } else {
            0
        }
    }

    /// Keys of a hash.
    pub fn hash_key_list(&self, h: Ref) -> Vec<Ref> {
        if h.is_kind(Kind::Hash) {
            self.g.heap.hash_keys(h)
        } else {
            Vec::new()
        }
    }

    /// Vector length.
    pub fn vector_len(&self, v: Ref) -> Option<usize> {
        if v.is_kind(Kind::Vec) {
            Some(self.g.heap.vector(v).elems.len())
        } else {
            None
        }
    }

    /// Vector element.
    pub fn vector_get(&self, v: Ref, i: usize) -> Option<Ref> {
        if v.is_kind(Kind::Vec) {
            self.g.heap.vector(v).elems.get(i).copied()
        } else {
            None
        }
    }

    /// Append to a vector.
    pub fn vector_push(&mut self, v: Ref, elem: Ref) {
        if v.is_kind(Kind::Vec) {
            self.g.heap.vector_mut(v).elems.push(elem);
        }
    }

    /// String length of a string value.
    pub fn string_len(&self, r: Ref) -> Option<usize> {
        if r.is_kind(Kind::Str) {
            Some(self.g.heap.string(r).len())
        } else {
            None
        }
    }

    /// Type name as reported by `typeof`.
    pub fn type_name(&self, r: Ref) -> &'static str {
        match r.kind() {
            None => {
                if r.is_nil() || r.is_end() {
                    "nil"
                } else {
                    "scalar"
                }
            }
            Some(Kind::Str) => "scalar",
            Some(Kind::Vec) => "vector",
            Some(Kind::Hash) => "hash",
            Some(Kind::Func) | Some(Kind::CCode) => "func",
            Some(Kind::Code) => "code",
            Some(Kind::Ghost) => "ghost",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_num_forms() {
        assert_eq!(parse_num(b"42"), Some(42.0));
        assert_eq!(parse_num(b" 1.5 "), Some(1.5));
        assert_eq!(parse_num(b"-2e3"), Some(-2000.0));
        assert_eq!(parse_num(b""), None);
        assert_eq!(parse_num(b"abc"), None);
        assert_eq!(parse_num(b"inf"), None);
        assert_eq!(parse_num(b"1x"), None);
    }

    #[test]
    fn fmt_num_forms() {
        assert_eq!(fmt_num(6.0), "6");
        assert_eq!(fmt_num(-3.0), "-3");
        assert_eq!(fmt_num(1.5), "1.5");
        assert_eq!(fmt_num(0.0), "0");
    }
}
