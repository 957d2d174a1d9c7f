//! Host embedding surface: callback tables, VM re-entry from native code,
//! ghosts, pinning, and disassembly.

use sedge_engine::vm::VmRes;
use sedge_engine::{Error, FuncDef, GhostType, Ref, Runtime, Vm};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn host_invoke(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    if args.is_empty() {
        return vm.error("host_invoke needs a function");
    }
    vm.call_value(args[0], Ref::nil(), &args[1..])
}

static HOST_FUNCS: &[FuncDef] = &[FuncDef {
    name: "host_invoke",
    func: host_invoke,
}];

fn run_with_host(src: &str) -> (Arc<Runtime>, Result<Ref, Error>) {
    let rt = Runtime::new();
    let ctx = rt.new_context();
    let res = (|| {
        let code = rt.compile(&ctx, "host.sg", src)?;
        rt.save(code);
        let ns = rt.std_namespace(&ctx);
        rt.save(ns);
        let lib = rt.gen_lib(&ctx, HOST_FUNCS);
        rt.save(lib);
        let hi = rt
            .hash_get(lib, rt.intern(&ctx, "host_invoke"))
            .expect("callback installed");
        rt.add_sym(&ctx, ns, "host_invoke", hi);
        let f = rt.bind(&ctx, code, ns)?;
        rt.save(f);
        rt.call(&ctx, f, &[])
    })();
    (rt, res)
}

#[test]
fn native_callback_reenters_the_vm() {
    let src = "var double = func(x) { return x * 2; };
               return host_invoke(double, 21);";
    let (_rt, res) = run_with_host(src);
    assert_eq!(res.unwrap().as_num(), Some(42.0));
}

#[test]
fn error_unwinds_through_native_reentry() {
    // A host callback enters the VM, the script dies; the host sees the
    // message and a traceback listing the script frame.
    let src = "var g = func { die(\"boom\"); };\nreturn host_invoke(g);";
    let (_rt, res) = run_with_host(src);
    let err = res.unwrap_err();
    match &err {
        Error::Runtime { message, trace } => {
            assert!(message.contains("boom"));
            assert!(!trace.is_empty());
            assert_eq!(trace[0].file, "host.sg");
            assert_eq!(trace[0].line, 1);
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
    assert!(err.traceback().contains("at host.sg, line 1"));
}

#[test]
fn functions_are_callable_with_host_arguments() {
    let rt = Runtime::new();
    let ctx = rt.new_context();
    let code = rt
        .compile(&ctx, "args.sg", "var f = func(a, b) { return a ~ b; }; return f;")
        .unwrap();
    rt.save(code);
    let ns = rt.std_namespace(&ctx);
    rt.save(ns);
    let top = rt.bind(&ctx, code, ns).unwrap();
    rt.save(top);
    let f = rt.call(&ctx, top, &[]).unwrap();
    rt.save(f);

    let a = rt.new_string(&ctx, b"4");
    rt.save(a);
    let v = rt.call(&ctx, f, &[a, Ref::num(2.0)]).unwrap();
    assert_eq!(rt.string_text(v), Some("42".to_string()));
}

static DESTROYED: AtomicUsize = AtomicUsize::new(0);

fn count_destroy(_payload: *mut ()) {
    DESTROYED.fetch_add(1, Ordering::SeqCst);
}

fn ghost_get(vm: &mut Vm<'_>, _payload: *mut (), field: Ref) -> VmRes<Option<Ref>> {
    match vm.string_bytes(field).as_deref() {
        Some(b"answer") => Ok(Some(Ref::num(42.0))),
        _ => Ok(None),
    }
}

#[test]
fn ghosts_carry_type_and_payload() {
    let rt = Runtime::new();
    let ctx = rt.new_context();
    let ty = Arc::new(GhostType {
        name: "widget",
        destroy: None,
        get_member: Some(ghost_get),
        set_member: None,
    });
    let other_ty = Arc::new(GhostType {
        name: "other",
        destroy: None,
        get_member: None,
        set_member: None,
    });

    let payload = Box::into_raw(Box::new(7u32)) as *mut ();
    let g = rt.new_ghost(&ctx, Arc::clone(&ty), payload);
    rt.save(g);

    assert_eq!(rt.ghost_payload(g, &ty), Some(payload));
    assert_eq!(rt.ghost_payload(g, &other_ty), None);

    // typeof and member access from script.
    let code = rt
        .compile(&ctx, "g.sg", "var f = func(x) { return typeof(x) ~ \":\" ~ x.answer; }; return f;")
        .unwrap();
    rt.save(code);
    let ns = rt.std_namespace(&ctx);
    rt.save(ns);
    let top = rt.bind(&ctx, code, ns).unwrap();
    rt.save(top);
    let f = rt.call(&ctx, top, &[]).unwrap();
    rt.save(f);
    let v = rt.call(&ctx, f, &[g]).unwrap();
    assert_eq!(rt.string_text(v), Some("ghost:42".to_string()));

    unsafe { drop(Box::from_raw(payload as *mut u32)) };
}

#[test]
fn ghost_destructor_runs_when_unreachable() {
    let rt = Runtime::new();
    let ctx = rt.new_context();
    let ty = Arc::new(GhostType {
        name: "counter",
        destroy: Some(count_destroy),
        get_member: None,
        set_member: None,
    });
    let before = DESTROYED.load(Ordering::SeqCst);
    let _g = rt.new_ghost(&ctx, ty, std::ptr::null_mut());
    // The ghost is reachable only through the context's temps; releasing
    // the context makes it garbage.
    drop(ctx);
    rt.collect_now();
    assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 1);
}

#[test]
fn keyed_pins_hold_and_release() {
    let rt = Runtime::new();
    let ctx = rt.new_context();
    let s = rt.new_string(&ctx, b"pinned payload bytes");
    let key = rt.gc_save(s);
    drop(ctx);

    rt.collect_now();
    assert_eq!(rt.string_bytes(s), Some(b"pinned payload bytes".to_vec()));

    rt.gc_release(key);
    let live_before = rt.stats().live_strings;
    rt.collect_now();
    assert!(rt.stats().live_strings < live_before);
}

#[test]
fn disassembly_round_trip() {
    let rt = Runtime::new();
    let ctx = rt.new_context();
    let code = rt.compile(&ctx, "dis.sg", "var a = 3; return a * -2;").unwrap();
    rt.save(code);
    let text = rt.disassemble(code).expect("code object disassembles");
    assert!(text.contains("Mul"));
    assert!(text.contains("Neg"));
    assert!(text.contains("Return"));
    assert!(text.contains("SetLocal"));
    assert!(!text.contains("???"));

    // And the same code object still executes to the expected value.
    let ns = rt.std_namespace(&ctx);
    rt.save(ns);
    let f = rt.bind(&ctx, code, ns).unwrap();
    rt.save(f);
    assert_eq!(rt.call(&ctx, f, &[]).unwrap().as_num(), Some(-6.0));
}

#[test]
fn contexts_recycle_through_the_free_list() {
    let rt = Runtime::new();
    for _ in 0..32 {
        let ctx = rt.new_context();
        let code = rt.compile(&ctx, "r.sg", "return 1;").unwrap();
        rt.save(code);
        let ns = rt.std_namespace(&ctx);
        rt.save(ns);
        let f = rt.bind(&ctx, code, ns).unwrap();
        rt.save(f);
        assert_eq!(rt.call(&ctx, f, &[]).unwrap().as_num(), Some(1.0));
    }
}
