//! The runtime object and the host embedding surface.
//!
//! All process-wide state (pools, symbol table, pinned objects, contexts)
//! lives in one `Globals` behind the runtime lock; every interpreter step
//! runs with the lock held, and the GC rendezvous condvar lives beside it.
//! Contexts are stored here rather than on host stacks so the collector can
//! see every thread's roots.

use crate::compiler::codegen;
use crate::parser;
use crate::vm::context::Ctx;
use crate::vm::heap::{FuncDef, GhostType, Heap};
use crate::vm::interp::Vm;
use crate::vm::value::{Kind, Ref};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Process-wide interpreter state, all behind the runtime lock.
pub(crate) struct Globals {
    pub heap: Heap,

    // Bottleneck rendezvous state.
    /// Set when a collection has been requested; every executing context
    /// parks at its next safepoint until the last arriver collects.
    pub bottleneck: bool,
    /// Host threads currently inside a VM entry point.
    pub n_threads: usize,
    /// Threads parked at the rendezvous.
    pub wait_count: usize,
    /// Bumped after each collection to release parked waiters.
    pub gc_epoch: u64,
    /// Total collections run.
    pub collections: usize,

    /// Process symbol table: interned string -> itself.
    pub symbols: Ref,
    pub me_sym: Ref,
    pub arg_sym: Ref,
    pub parents_sym: Ref,

    /// Host-pinned objects (vector, append-only).
    pub save: Ref,
    /// Host-pinned objects under numeric keys.
    pub save_hash: Ref,
    pub next_gc_key: i32,

    pub contexts: Vec<Ctx>,
    pub free_ctx: Vec<usize>,
}

impl Globals {
    pub(crate) fn new() -> Globals {
        let mut heap = Heap::new();
        let symbols = heap.new_hash();
        let save = heap.new_vec(Vec::new());
        let save_hash = heap.new_hash();
        let mut g = Globals {
            heap,
            bottleneck: false,
            n_threads: 0,
            wait_count: 0,
            gc_epoch: 0,
            collections: 0,
            symbols,
            me_sym: Ref::nil(),
            arg_sym: Ref::nil(),
            parents_sym: Ref::nil(),
            save,
            save_hash,
            next_gc_key: 0,
            contexts: Vec::new(),
            free_ctx: Vec::new(),
        };
        g.me_sym = g.intern(b"me");
        g.arg_sym = g.intern(b"arg");
        g.parents_sym = g.intern(b"parents");
        g
    }

    /// Intern a byte string: equal bytes always yield the identical string
    /// object, so interned symbols compare by pointer.
    pub(crate) fn intern(&mut self, name: &[u8]) -> Ref {
        let probe = self.heap.new_str(name);
        if let Some(existing) = self.heap.hash_get(self.symbols, probe) {
            existing
        } else {
            self.heap.hash_set(self.symbols, probe, probe);
            probe
        }
    }

    /// Pull a context from the free list, or create one.
    pub(crate) fn acquire_ctx(&mut self) -> usize {
        let id = match self.free_ctx.pop() {
            Some(id) => id,
            None => {
                self.contexts.push(Ctx::new());
                self.contexts.len() - 1
            }
        };
        self.contexts[id].reset();
        self.contexts[id].in_use = true;
        id
    }

    pub(crate) fn release_ctx(&mut self, id: usize) {
        self.contexts[id].reset();
        self.contexts[id].in_use = false;
        self.free_ctx.push(id);
    }
}

/// The runtime: global state plus the GC rendezvous condvar. Create one per
/// process (or per isolated embedding) and share it across host threads.
///
/// Every method takes the runtime lock. Host callbacks already run with the
/// lock held and must go through the `Vm` they receive, never back through
/// `Runtime` methods.
pub struct Runtime {
    pub(crate) state: Mutex<Globals>,
    pub(crate) gc_cv: Condvar,
}

/// A host-held context handle. A context is bound to at most one host
/// thread at a time; dropping it returns the context to the free list.
pub struct Context {
    rt: Arc<Runtime>,
    pub(crate) id: usize,
}

impl Drop for Context {
    fn drop(&mut self) {
        self.rt.state.lock().release_ctx(self.id);
    }
}

/// Live-object counts per pool, plus the collection counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live_strings: usize,
    pub live_vectors: usize,
    pub live_hashes: usize,
    pub live_codes: usize,
    pub live_funcs: usize,
    pub live_ccodes: usize,
    pub live_ghosts: usize,
    pub collections: usize,
}

impl Runtime {
    /// Create a runtime. Teardown happens when the last `Arc` drops; there
    /// is no implicit static construction.
    pub fn new() -> Arc<Runtime> {
        Arc::new(Runtime {
            state: Mutex::new(Globals::new()),
            gc_cv: Condvar::new(),
        })
    }

    /// Create (or reuse from the free list) a context.
    pub fn new_context(self: &Arc<Self>) -> Context {
        let id = self.state.lock().acquire_ctx();
        Context {
            rt: Arc::clone(self),
            id,
        }
    }

    /// Parse and generate code for a source buffer. Returns the code object
    /// or a parse error with its source line. The result is reachable
    /// through the context's temps until the context next executes; pin it
    /// with [`Runtime::save`] if it must outlive that.
    pub fn compile(&self, ctx: &Context, file: &str, src: &str) -> Result<Ref> {
        let parse_err = |f: parser::ParseFault| Error::Parse {
            message: f.message,
            file: file.to_string(),
            line: f.line,
        };
        let tree = parser::parse(src).map_err(parse_err)?;
        let mut vm = Vm::enter(self, ctx.id);
        let code = codegen::generate(vm.globals_mut(), file, &tree).map_err(parse_err)?;
        vm.root_temp(code);
        Ok(code)
    }

    /// Bind a code object to a namespace hash, yielding a function value.
    pub fn bind(&self, ctx: &Context, code: Ref, namespace: Ref) -> Result<Ref> {
        if !code.is_kind(Kind::Code) {
            return Err(Error::Runtime {
                message: "bind of a non-code object".to_string(),
                trace: Vec::new(),
            });
        }
        let mut vm = Vm::enter(self, ctx.id);
        let f = vm
            .globals_mut()
            .heap
            .new_func(code, namespace, Ref::nil());
        vm.root_temp(f);
        Ok(f)
    }

    /// Call a function value with positional arguments.
    pub fn call(&self, ctx: &Context, f: Ref, args: &[Ref]) -> Result<Ref> {
        self.call_with(ctx, f, Ref::nil(), args)
    }

    /// Call with `me` bound, as a method call would.
    pub fn call_method(&self, ctx: &Context, f: Ref, me: Ref, args: &[Ref]) -> Result<Ref> {
        self.call_with(ctx, f, me, args)
    }

    fn call_with(&self, ctx: &Context, f: Ref, me: Ref, args: &[Ref]) -> Result<Ref> {
        let mut vm = Vm::enter(self, ctx.id);
        let res = if vm.frame_depth() == 0 {
            vm.invoke_here(f, me, args)
        } else {
            // The context is mid-execution (a host callback re-entering the
            // VM): run in a child context linked under it.
            vm.call_value(f, me, args)
        };
        match res {
            Ok(v) => {
                vm.root_temp(v);
                Ok(v)
            }
            Err(fail) => Err(vm.fail_to_error(fail)),
        }
    }

    /// Build a namespace hash with the base builtins installed.
    pub fn std_namespace(&self, ctx: &Context) -> Ref {
        let mut vm = Vm::enter(self, ctx.id);
        let ns = super::builtin::namespace(&mut vm);
        vm.root_temp(ns);
        ns
    }

    /// Build a hash of host callbacks from a table.
    pub fn gen_lib(&self, ctx: &Context, funcs: &'static [FuncDef]) -> Ref {
        let mut vm = Vm::enter(self, ctx.id);
        let ns = vm.globals_mut().heap.new_hash();
        vm.root_temp(ns);
        for def in funcs {
            let g = vm.globals_mut();
            let cc = g.heap.new_ccode(def.name, def.func);
            let sym = g.intern(def.name.as_bytes());
            g.heap.hash_set(ns, sym, cc);
        }
        ns
    }

    /// Bind `name` to `val` in a namespace hash under the interned symbol.
    pub fn add_sym(&self, ctx: &Context, ns: Ref, name: &str, val: Ref) {
        let mut vm = Vm::enter(self, ctx.id);
        let g = vm.globals_mut();
        let sym = g.intern(name.as_bytes());
        g.heap.hash_set(ns, sym, val);
    }

    /// Pin an object for the life of the runtime.
    pub fn save(&self, r: Ref) {
        let mut g = self.state.lock();
        let save = g.save;
        if r.obj().is_some() {
            g.heap.vector_mut(save).elems.push(r);
        }
    }

    /// Pin an object under a fresh key; release with [`Runtime::gc_release`].
    pub fn gc_save(&self, r: Ref) -> f64 {
        let mut g = self.state.lock();
        let key = g.next_gc_key;
        g.next_gc_key += 1;
        let save_hash = g.save_hash;
        g.heap.hash_set(save_hash, Ref::num(key as f64), r);
        key as f64
    }

    /// Drop a keyed pin.
    pub fn gc_release(&self, key: f64) {
        let mut g = self.state.lock();
        let save_hash = g.save_hash;
        g.heap.hash_delete(save_hash, Ref::num(key));
    }

    /// Force a collection cycle, rendezvousing with any executing contexts.
    pub fn collect_now(&self) {
        let mut g = self.state.lock();
        g.n_threads += 1;
        g.heap.need_gc = true;
        // Participate in the bottleneck like any executing thread would.
        g.bottleneck = true;
        g.wait_count += 1;
        if g.wait_count == g.n_threads {
            g.collect();
            g.wait_count = 0;
            g.bottleneck = false;
            g.gc_epoch = g.gc_epoch.wrapping_add(1);
            self.gc_cv.notify_all();
        } else {
            let epoch = g.gc_epoch;
            while g.gc_epoch == epoch {
                self.gc_cv.wait(&mut g);
            }
        }
        g.n_threads -= 1;
    }

    /// Live-object counts.
    pub fn stats(&self) -> HeapStats {
        let g = self.state.lock();
        HeapStats {
            live_strings: g.heap.strs.live(),
            live_vectors: g.heap.vecs.live(),
            live_hashes: g.heap.hashes.live(),
            live_codes: g.heap.codes.live(),
            live_funcs: g.heap.funcs.live(),
            live_ccodes: g.heap.ccodes.live(),
            live_ghosts: g.heap.ghosts.live(),
            collections: g.collections,
        }
    }

    /// Intern a symbol.
    pub fn intern(&self, ctx: &Context, name: &str) -> Ref {
        let mut vm = Vm::enter(self, ctx.id);
        let sym = vm.globals_mut().intern(name.as_bytes());
        vm.root_temp(sym);
        sym
    }

    /// Allocate a string.
    pub fn new_string(&self, ctx: &Context, bytes: &[u8]) -> Ref {
        let mut vm = Vm::enter(self, ctx.id);
        let s = vm.globals_mut().heap.new_str(bytes);
        vm.root_temp(s);
        s
    }

    /// Allocate an empty vector.
    pub fn new_vector(&self, ctx: &Context) -> Ref {
        let mut vm = Vm::enter(self, ctx.id);
        let v = vm.globals_mut().heap.new_vec(Vec::new());
        vm.root_temp(v);
        v
    }

    /// Allocate an empty hash.
    pub fn new_hash(&self, ctx: &Context) -> Ref {
        let mut vm = Vm::enter(self, ctx.id);
        let h = vm.globals_mut().heap.new_hash();
        vm.root_temp(h);
        h
    }

    /// Append to a vector value.
    pub fn vector_append(&self, v: Ref, elem: Ref) {
        let mut g = self.state.lock();
        if v.is_kind(Kind::Vec) {
            g.heap.vector_mut(v).elems.push(elem);
        }
    }

    /// Element of a vector value.
    pub fn vector_get(&self, v: Ref, i: usize) -> Option<Ref> {
        let g = self.state.lock();
        if v.is_kind(Kind::Vec) {
            g.heap.vector(v).elems.get(i).copied()
        } else {
            None
        }
    }

    /// Length of a vector value.
    pub fn vector_len(&self, v: Ref) -> Option<usize> {
        let g = self.state.lock();
        if v.is_kind(Kind::Vec) {
            Some(g.heap.vector(v).elems.len())
        } else {
            None
        }
    }

    /// Set a key in a hash value.
    pub fn hash_set(&self, h: Ref, key: Ref, val: Ref) {
        let mut g = self.state.lock();
        if h.is_kind(Kind::Hash) {
            g.heap.hash_set(h, key, val);
        }
    }

    /// Look up a key in a hash value.
    pub fn hash_get(&self, h: Ref, key: Ref) -> Option<Ref> {
        let mut g = self.state.lock();
        if h.is_kind(Kind::Hash) {
            g.heap.hash_get(h, key)
        } else {
            None
        }
    }

    /// Bytes of a string value.
    pub fn string_bytes(&self, r: Ref) -> Option<Vec<u8>> {
        let g = self.state.lock();
        if r.is_kind(Kind::Str) {
            Some(g.heap.string(r).bytes().to_vec())
        } else {
            None
        }
    }

    /// String value as UTF-8 text, lossily.
    pub fn string_text(&self, r: Ref) -> Option<String> {
        self.string_bytes(r)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// Numeric coercion: numbers pass through, numeric strings parse.
    pub fn num_value(&self, r: Ref) -> Option<f64> {
        if let Some(n) = r.as_num() {
            return Some(n);
        }
        let g = self.state.lock();
        if r.is_kind(Kind::Str) {
            super::interp::parse_num(g.heap.string(r).bytes())
        } else {
            None
        }
    }

    /// Wrap a host pointer in a ghost of the given type. The runtime calls
    /// the type's destructor when the ghost becomes unreachable.
    pub fn new_ghost(&self, ctx: &Context, ty: Arc<GhostType>, data: *mut ()) -> Ref {
        let mut vm = Vm::enter(self, ctx.id);
        let g = vm.globals_mut().heap.new_ghost(ty, data);
        vm.root_temp(g);
        g
    }

    /// Disassemble a code object, one instruction per line.
    pub fn disassemble(&self, code: Ref) -> Option<String> {
        let g = self.state.lock();
        if code.is_kind(Kind::Code) {
            Some(crate::compiler::debug::disassemble(&g.heap, code))
        } else {
            None
        }
    }

    /// The payload of a ghost, when it is of the given type.
    pub fn ghost_payload(&self, r: Ref, ty: &Arc<GhostType>) -> Option<*mut ()> {
        let g = self.state.lock();
        if r.is_kind(Kind::Ghost) {
            let ghost = g.heap.ghost(r);
            if Arc::ptr_eq(&ghost.ty, ty) {
                return Some(ghost.data);
            }
        }
        None
    }
}
