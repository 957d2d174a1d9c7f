//! Base builtin functions.
//!
//! The minimal library every namespace gets: container utilities, type
//! inspection, `die` for raising script errors, and `call` for invoking a
//! function with an error trap. Everything here goes through the same
//! C-callback ABI host libraries use.

use super::heap::FuncDef;
use super::interp::Vm;
use super::value::{Kind, Ref};
use super::VmRes;

fn arg(args: &[Ref], i: usize) -> Ref {
    args.get(i).copied().unwrap_or_else(Ref::nil)
}

/// `size(x)`: byte length of a string, element count of a vector, entry
/// count of a hash.
fn f_size(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let x = arg(args, 0);
    if let Some(n) = vm.string_len(x) {
        return Ok(Ref::num(n as f64));
    }
    if let Some(n) = vm.vector_len(x) {
        return Ok(Ref::num(n as f64));
    }
    if x.is_kind(Kind::Hash) {
        return Ok(Ref::num(vm.hash_len(x) as f64));
    }
    vm.error("object has no size()")
}

/// `keys(hash)`: vector of the live keys.
fn f_keys(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let h = arg(args, 0);
    if !h.is_kind(Kind::Hash) {
        return vm.error("keys() called on non-hash");
    }
    let keys = vm.hash_key_list(h);
    Ok(vm.new_vector_from(keys))
}

/// `append(vector, elements...)`: append and return the vector.
fn f_append(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let v = arg(args, 0);
    if !v.is_kind(Kind::Vec) {
        return vm.error("append() called on non-vector");
    }
    for &e in &args[1..] {
        vm.vector_push(v, e);
    }
    Ok(v)
}

/// `contains(hash, key)`: 1 when the key is present.
fn f_contains(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let h = arg(args, 0);
    if !h.is_kind(Kind::Hash) {
        return vm.error("contains() called on non-hash");
    }
    let hit = vm.hash_member(h, arg(args, 1)).is_some();
    Ok(Ref::num(if hit { 1.0 } else { 0.0 }))
}

/// `delete(hash, key)`: remove the key, return the hash.
fn f_delete(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let h = arg(args, 0);
    if !h.is_kind(Kind::Hash) {
        return vm.error("delete() called on non-hash");
    }
    vm.hash_remove(h, arg(args, 1));
    Ok(h)
}

/// `typeof(x)`: type name as a string.
fn f_typeof(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let name = vm.type_name(arg(args, 0));
    Ok(vm.new_string(name.as_bytes()))
}

/// `num(x)`: numeric value, or nil when the coercion fails.
fn f_num(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    Ok(match vm.num_value(arg(args, 0)) {
        Some(n) => Ref::num(n),
        None => Ref::nil(),
    })
}

/// `die(x)`: raise, carrying the argument to the nearest trap.
fn f_die(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    Err(vm.die(arg(args, 0)))
}

/// `call(fn, args?, me?, err?)`: invoke through a sub-context. With an
/// error vector, failures are trapped: the vector receives the message
/// followed by (file, line) pairs deepest-first, and the call yields nil.
fn f_call(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let f = arg(args, 0);
    let call_args: Vec<Ref> = match arg(args, 1) {
        v if v.is_kind(Kind::Vec) => {
            let n = vm.vector_len(v).unwrap_or(0);
            (0..n).filter_map(|i| vm.vector_get(v, i)).collect()
        }
        _ => Vec::new(),
    };
    let me = arg(args, 2);
    let err_slot = arg(args, 3);

    match vm.call_value(f, me, &call_args) {
        Ok(v) => Ok(v),
        Err(fail) => {
            if !err_slot.is_kind(Kind::Vec) {
                return Err(fail);
            }
            let msg = vm.new_string(fail.message.as_bytes());
            vm.vector_push(err_slot, msg);
            for &(file, line) in &fail.trace {
                vm.vector_push(err_slot, file);
                vm.vector_push(err_slot, Ref::num(line as f64));
            }
            Ok(Ref::nil())
        }
    }
}

/// The base builtin table.
pub const FUNCS: &[FuncDef] = &[
    FuncDef {
        name: "size",
        func: f_size,
    },
    FuncDef {
        name: "keys",
        func: f_keys,
    },
    FuncDef {
        name: "append",
        func: f_append,
    },
    FuncDef {
        name: "contains",
        func: f_contains,
    },
    FuncDef {
        name: "delete",
        func: f_delete,
    },
    FuncDef {
        name: "typeof",
        func: f_typeof,
    },
    FuncDef {
        name: "num",
        func: f_num,
    },
    FuncDef {
        name: "die",
        func: f_die,
    },
    FuncDef {
        name: "call",
        func: f_call,
    },
];

/// Build a namespace hash with the base builtins bound under interned
/// symbols.
pub(crate) fn namespace(vm: &mut Vm<'_>) -> Ref {
    let ns = vm.new_hash();
    for def in FUNCS {
        let g = vm.globals_mut();
        let cc = g.heap.new_ccode(def.name, def.func);
        let sym = g.intern(def.name.as_bytes());
        g.heap.hash_set(ns, sym, cc);
    }
    ns
}
