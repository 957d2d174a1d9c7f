//! Stop-the-world mark/sweep collection.
//!
//! Roots are every in-use context (operand stack, frame stack, temps,
//! die-arg) plus the process-wide symbol table, save vector, save hash, and
//! the interned `me`/`arg`/`parents` symbols. Marking runs an explicit
//! worklist over the typed pools; sweeping runs the type-specific cleanup
//! (ghost destructors) and refills the free lists.
//!
//! Collection itself never fails. It only runs with every executing context
//! quiesced at the bottleneck rendezvous, so no per-object locking is
//! needed.

use super::heap::Heap;
use super::runtime::Globals;
use super::value::{Kind, Ref};

impl Globals {
    /// Run one full collection. Caller must hold exclusive access with all
    /// other executing contexts parked (the bottleneck guarantees this).
    pub(crate) fn collect(&mut self) {
        self.heap.strs.clear_marks();
        self.heap.vecs.clear_marks();
        self.heap.hashes.clear_marks();
        self.heap.codes.clear_marks();
        self.heap.funcs.clear_marks();
        self.heap.ccodes.clear_marks();
        self.heap.ghosts.clear_marks();

        let mut work: Vec<Ref> = Vec::with_capacity(128);
        work.push(self.symbols);
        work.push(self.save);
        work.push(self.save_hash);
        work.push(self.me_sym);
        work.push(self.arg_sym);
        work.push(self.parents_sym);
        for ctx in &self.contexts {
            if !ctx.in_use {
                continue;
            }
            work.extend_from_slice(&ctx.op_stack);
            for fr in &ctx.f_stack {
                work.push(fr.func);
                work.push(fr.locals);
            }
            work.extend_from_slice(&ctx.temps);
            work.push(ctx.die_arg);
        }
        mark(&mut self.heap, work);

        self.heap.strs.sweep(|_| {});
        self.heap.vecs.sweep(|_| {});
        self.heap.hashes.sweep(|_| {});
        self.heap.codes.sweep(|_| {});
        self.heap.funcs.sweep(|_| {});
        self.heap.ccodes.sweep(|_| {});
        self.heap.ghosts.sweep(|g| {
            if let Some(destroy) = g.ty.destroy {
                destroy(g.data);
            }
        });

        self.heap.alloc_count = 0;
        self.heap.need_gc = false;
        self.collections += 1;
    }
}

/// Depth-first marking over an explicit worklist.
fn mark(heap: &mut Heap, mut work: Vec<Ref>) {
    while let Some(r) = work.pop() {
        let (kind, i) = match r.obj() {
            Some(pair) => pair,
            None => continue, // numbers, nil, the end sentinel
        };
        match kind {
            Kind::Str => {
                heap.strs.set_mark(i);
            }
            Kind::Vec => {
                if heap.vecs.is_marked(i) {
                    continue;
                }
                heap.vecs.set_mark(i);
                work.extend_from_slice(&heap.vecs.get(i).elems);
            }
            Kind::Hash => {
                if heap.hashes.is_marked(i) {
                    continue;
                }
                heap.hashes.set_mark(i);
                if let Some(rec) = &heap.hashes.get(i).rec {
                    // Only used cells are traversed; tombstoned entries are
                    // unreachable from the table.
                    for c in 0..rec.tab.len() {
                        let e = rec.tab[c];
                        if e >= 0 {
                            work.push(rec.ents[e as usize].key);
                            work.push(rec.ents[e as usize].val);
                        }
                    }
                }
            }
            Kind::Code => {
                if heap.codes.is_marked(i) {
                    continue;
                }
                heap.codes.set_mark(i);
                let code = heap.codes.get(i);
                work.extend_from_slice(&code.consts);
                work.extend_from_slice(&code.arg_syms);
                for &(sym, _) in code.opt_args.iter() {
                    work.push(sym);
                }
                work.push(code.rest_sym);
                work.push(code.src_file);
            }
            Kind::Func => {
                if heap.funcs.is_marked(i) {
                    continue;
                }
                heap.funcs.set_mark(i);
                let f = heap.funcs.get(i);
                work.push(f.code);
                work.push(f.namespace);
                work.push(f.next);
            }
            Kind::CCode => {
                heap.ccodes.set_mark(i);
            }
            Kind::Ghost => {
                // The payload is opaque; nothing inside is traced.
                heap.ghosts.set_mark(i);
            }
        }
    }
}
