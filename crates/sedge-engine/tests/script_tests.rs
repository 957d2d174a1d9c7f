//! End-to-end language tests: compile, bind against the base namespace, and
//! call, checking results and error behavior.

use sedge_engine::{Error, Ref, Runtime};
use std::sync::Arc;

fn run(src: &str) -> (Arc<Runtime>, Result<Ref, Error>) {
    let rt = Runtime::new();
    let ctx = rt.new_context();
    let res = (|| {
        let code = rt.compile(&ctx, "test.sg", src)?;
        rt.save(code);
        let ns = rt.std_namespace(&ctx);
        rt.save(ns);
        let f = rt.bind(&ctx, code, ns)?;
        rt.save(f);
        let v = rt.call(&ctx, f, &[])?;
        rt.save(v);
        Ok(v)
    })();
    (rt, res)
}

fn num(src: &str) -> f64 {
    let (_rt, res) = run(src);
    res.expect("script should succeed")
        .as_num()
        .expect("numeric result")
}

fn text(src: &str) -> String {
    let (rt, res) = run(src);
    rt.string_text(res.expect("script should succeed"))
        .expect("string result")
}

fn fail(src: &str) -> Error {
    run(src).1.expect_err("script should fail")
}

#[test]
fn arithmetic_precedence_with_unary_minus() {
    assert_eq!(num("var a = 3; return a * -2;"), -6.0);
    assert_eq!(num("return 2 + 3 * 4;"), 14.0);
    assert_eq!(num("return (2 + 3) * 4;"), 20.0);
    assert_eq!(num("return 10 - 2 - 3;"), 5.0);
}

#[test]
fn string_concatenation() {
    assert_eq!(text(r#"return "foo" ~ "bar";"#), "foobar");
    // Adjacent literals concatenate in the lexer.
    assert_eq!(text(r#"return "a" "b";"#), "ab");
    assert_eq!(text(r#"return "n=" ~ 6;"#), "n=6");
    assert_eq!(text(r#"return 1.5 ~ "!";"#), "1.5!");
}

#[test]
fn concat_is_tighter_than_additive() {
    // 1 - 2 ~ 3 groups as 1 - (2 ~ 3) = 1 - 23.
    assert_eq!(num("return 1 - 2 ~ 3;"), -22.0);
    // ~ shares the * / level, left to right: (2 * 3) ~ "x".
    assert_eq!(text(r#"return 2 * 3 ~ "x";"#), "6x");
}

#[test]
fn relational_and_equality_are_one_level() {
    // 2 == 1 < 2 groups as (2 == 1) < 2 = 0 < 2.
    assert_eq!(num("return 2 == 1 < 2;"), 1.0);
    assert_eq!(num("return 1 < 2 == 1;"), 1.0);
}

#[test]
fn closure_captures_outer_scope() {
    let src = "var f = func(n) { return func(x) { return x + n; }; };
               var g = f(10);
               return g(5);";
    assert_eq!(num(src), 15.0);
}

#[test]
fn nested_closures() {
    let src = "var f = func(a) { return func(b) { return func(c) { return a + b + c; }; }; };
               return f(1)(2)(3);";
    assert_eq!(num(src), 6.0);
}

#[test]
fn scalar_coercions() {
    assert_eq!(num(r#"return "2" * 3;"#), 6.0);
    assert_eq!(num(r#"return 1 + "1.5";"#), 2.5);
    assert_eq!(num(r#"return "2" == 2;"#), 1.0);
}

#[test]
fn booleans_and_logic() {
    assert_eq!(num("return !0;"), 1.0);
    assert_eq!(num("return !3;"), 0.0);
    assert_eq!(num("return true + true;"), 2.0);
    assert_eq!(num("return 0 or 5;"), 5.0);
    assert_eq!(num("return 2 and 3;"), 3.0);
    assert_eq!(num("return 0 and 3;"), 0.0);
    // Short-circuit keeps the right side unevaluated.
    let (_rt, res) = run("var h = nil; return h and h.x;");
    assert!(res.unwrap().is_nil());
}

#[test]
fn ternary_and_null_operators() {
    assert_eq!(num("return 1 ? 2 : 3;"), 2.0);
    assert_eq!(num("return 0 ? 2 : 3;"), 3.0);
    assert_eq!(num("return nil ?? 7;"), 7.0);
    assert_eq!(num("var a = 5; return a ?? 7;"), 5.0);
    assert_eq!(num("var h = {x: 3}; return h?.x;"), 3.0);
    let (_rt, res) = run("var h = nil; return h?.x;");
    assert!(res.unwrap().is_nil());
}

#[test]
fn bitwise_operators() {
    assert_eq!(num("return 12 & 10;"), 8.0);
    assert_eq!(num("return 12 | 10;"), 14.0);
    assert_eq!(num("return 12 ^ 10;"), 6.0);
    assert_eq!(num("return ~0;"), -1.0);
    assert_eq!(num("return 5 - ~2;"), 8.0);
}

#[test]
fn if_elsif_else() {
    let src = "var x = 2;
               if (x == 1) { return 10; }
               elsif (x == 2) { return 20; }
               else { return 30; }";
    assert_eq!(num(src), 20.0);
}

#[test]
fn loops() {
    assert_eq!(
        num("var i = 0; var s = 0; while (i < 5) { s += i; i += 1; } return s;"),
        10.0
    );
    assert_eq!(
        num("var s = 0; for (var i = 0; i < 4; i += 1) { s += i; } return s;"),
        6.0
    );
    assert_eq!(
        num("var s = 0; foreach (var e; [1, 2, 3]) { s += e; } return s;"),
        6.0
    );
    assert_eq!(
        num("var s = 0; forindex (var i; [9, 9, 9]) { s += i; } return s;"),
        3.0
    );
}

#[test]
fn break_and_continue() {
    let src = "var s = 0;
               for (var i = 0; i < 10; i += 1) {
                   if (i == 3) { continue; }
                   if (i == 6) { break; }
                   s += i;
               }
               return s;";
    assert_eq!(num(src), 12.0);
}

#[test]
fn labeled_break_crosses_loops() {
    let src = "var s = 0;
               for (var i = 0; i < 3; i += 1) outer: {
                   foreach (var e; [1, 2, 3]) {
                       if (e == 2) { break outer; }
                       s += e;
                   }
               }
               return s;";
    assert_eq!(num(src), 1.0);
}

#[test]
fn return_unwinds_loop_state() {
    assert_eq!(num("for (;;) { return 5; }"), 5.0);
    assert_eq!(num("foreach (var e; [7, 8]) { return e; } return 0;"), 7.0);
}

#[test]
fn vectors() {
    assert_eq!(num("var v = [1, 2, 3]; return v[1];"), 2.0);
    assert_eq!(num("var v = [1, 2, 3]; return v[-1];"), 3.0);
    assert_eq!(num("var v = [1]; append(v, 2, 3); return size(v);"), 3.0);
    assert_eq!(num("var v = [1, 2]; v[0] = 9; return v[0] + v[1];"), 11.0);
}

#[test]
fn vector_slices() {
    assert_eq!(
        num("var v = [10, 20, 30, 40]; var s = v[1:2]; return s[0] + s[1];"),
        50.0
    );
    assert_eq!(num("var v = [10, 20, 30, 40]; return size(v[2:]);"), 2.0);
    assert_eq!(num("var v = [10, 20, 30, 40]; return size(v[:1]);"), 2.0);
    assert_eq!(
        num("var v = [10, 20, 30, 40]; var s = v[0, 2:3]; return size(s);"),
        3.0
    );
}

#[test]
fn string_indexing_yields_bytes() {
    assert_eq!(num(r#"return "A"[0];"#), 65.0);
    assert_eq!(num(r#"return "AB"[-1];"#), 66.0);
}

#[test]
fn hashes() {
    assert_eq!(num(r#"var h = {a: 1, b: 2}; return h.a + h["b"];"#), 3.0);
    assert_eq!(
        num(r#"var h = {}; h.x = 1; h["y"] = 2; delete(h, "x"); return size(h) + contains(h, "y") * 10;"#),
        11.0
    );
    assert_eq!(num("var h = {}; h[0] = 5; h[-0.0] += 1; return h[0];"), 6.0);
}

#[test]
fn hash_growth_and_shrink_from_script() {
    let src = "var h = {};
               for (var i = 0; i < 200; i += 1) { h[i] = i * 2; }
               for (var i = 0; i < 150; i += 1) { delete(h, i); }
               var ok = 1;
               for (var i = 150; i < 200; i += 1) {
                   if (h[i] != i * 2) { ok = 0; }
               }
               return ok and size(h) == 50;";
    assert_eq!(num(src), 1.0);
}

#[test]
fn method_calls_bind_me() {
    assert_eq!(
        num("var o = {v: 42, get: func { return me.v; }}; return o.get();"),
        42.0
    );
}

#[test]
fn member_lookup_through_parents() {
    let src = "var base = {get: func { return me.v; }};
               var o = {v: 7, parents: [base]};
               return o.get();";
    assert_eq!(num(src), 7.0);
}

#[test]
fn multi_assignment() {
    assert_eq!(num("(a, b) = [3, 4]; return a + b;"), 7.0);
    assert_eq!(
        num("var v = [0, 0]; (v[0], v[1]) = [5, 6]; return v[0] * 10 + v[1];"),
        56.0
    );
}

#[test]
fn function_arguments() {
    // Optional arguments with constant defaults.
    assert_eq!(
        num("var f = func(a, b = 10) { return a + b; }; return f(1) + f(1, 2);"),
        14.0
    );
    // Rest parameter.
    assert_eq!(
        num("var f = func(a, rest...) { return size(rest); }; return f(1, 2, 3);"),
        2.0
    );
    // No parameter list binds the implicit arg vector.
    assert_eq!(num("var f = func { return arg[0] + arg[1]; }; return f(3, 4);"), 7.0);
    // Named arguments merge into the activation record.
    assert_eq!(
        num("var f = func(a, b = 0) { return a - b; }; return f(10, b: 4);"),
        6.0
    );
}

#[test]
fn function_body_value_is_the_last_expression() {
    assert_eq!(num("var f = func { 42; }; return f();"), 42.0);
    let (_rt, res) = run("var f = func {}; return f();");
    assert!(res.unwrap().is_nil());
}

#[test]
fn recursion() {
    let src = "var fact = func(n) { return n <= 1 ? 1 : n * fact(n - 1); };
               return fact(6);";
    assert_eq!(num(src), 720.0);
}

#[test]
fn comma_expression_yields_right_side() {
    assert_eq!(num("return 1, 2;"), 2.0);
}

#[test]
fn die_is_trapped_by_call() {
    let src = r#"var err = [];
                 var r = call(func { die("boom"); }, [], nil, err);
                 return err[0];"#;
    assert_eq!(text(src), "boom");

    let src = r#"var err = [];
                 return call(func { die("x"); }, [], nil, err) == nil;"#;
    assert_eq!(num(src), 1.0);
}

#[test]
fn call_passes_arguments() {
    assert_eq!(
        num("return call(func(a, b) { return a + b; }, [2, 3]);"),
        5.0
    );
}

#[test]
fn typeof_names() {
    assert_eq!(text("return typeof([]);"), "vector");
    assert_eq!(text("return typeof({});"), "hash");
    assert_eq!(text(r#"return typeof("");"#), "scalar");
    assert_eq!(text("return typeof(0);"), "scalar");
    assert_eq!(text("return typeof(nil);"), "nil");
    assert_eq!(text("return typeof(func {});"), "func");
}

#[test]
fn num_builtin() {
    assert_eq!(num(r#"return num("42") + 1;"#), 43.0);
    assert_eq!(num(r#"return num("x") == nil;"#), 1.0);
}

#[test]
fn runtime_errors() {
    assert!(fail("return x;").to_string().contains("undefined symbol: x"));
    assert!(fail("return 1 / 0;").to_string().contains("divide by zero"));
    assert!(fail("var v = [1]; return v[5];")
        .to_string()
        .contains("out of bounds"));
    assert!(fail("var h = {}; return h.missing;")
        .to_string()
        .contains("No such member"));
    assert!(fail("return [] + 1;").to_string().contains("numeric"));
    assert!(fail("var f = func(a) { return a; }; return f();")
        .to_string()
        .contains("too few function args"));
    assert!(fail("var f = func(a) { return a; }; return f(1, 2);")
        .to_string()
        .contains("too many function args"));
    assert!(fail("return nil.x;").to_string().contains("member access on nil"));
}

#[test]
fn frame_overflow_is_an_error_not_a_crash() {
    let err = fail("var f = func { return f(); }; return f();");
    assert!(err.to_string().contains("call stack overflow"));
}

#[test]
fn operand_stack_overflow_is_an_error_not_a_crash() {
    // Right-nested additions hold one operand per nesting level.
    let mut src = String::from("return ");
    src.push_str(&"1 + (".repeat(600));
    src.push('1');
    src.push_str(&")".repeat(600));
    src.push(';');
    let (_rt, res) = run(&src);
    assert!(res.unwrap_err().to_string().contains("stack overflow"));
}

#[test]
fn mark_stack_overflow_is_an_error_not_a_crash() {
    let mut src = String::new();
    for i in 0..130 {
        src.push_str(&format!("foreach (var x{}; [1]) {{\n", i));
    }
    src.push_str("var y = 1;\n");
    for _ in 0..130 {
        src.push('}');
    }
    let (_rt, res) = run(&src);
    assert!(res
        .unwrap_err()
        .to_string()
        .contains("mark stack overflow"));
}

#[test]
fn die_with_non_string_value() {
    let err = fail("die({code: 42});");
    assert!(err.to_string().contains("script died"));
}

#[test]
fn runtime_error_traces_carry_lines() {
    let (_rt, res) = run("var a = 1;\nvar b = 2;\nreturn c;\n");
    match res.unwrap_err() {
        Error::Runtime { trace, .. } => {
            assert!(!trace.is_empty());
            assert_eq!(trace[0].file, "test.sg");
            assert_eq!(trace[0].line, 3);
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn traceback_renders_frames() {
    let src = "var inner = func { die(\"deep\"); };\nvar outer = func { return inner(); };\nreturn outer();\n";
    let err = fail(src);
    let tb = err.traceback();
    assert!(tb.contains("deep"));
    assert!(tb.contains("at test.sg, line 1"));
    assert!(tb.contains("called from: test.sg"));
}

#[test]
fn parse_errors() {
    match fail("var x = (1 + ;") {
        Error::Parse { file, line, .. } => {
            assert_eq!(file, "test.sg");
            assert_eq!(line, 1);
        }
        other => panic!("expected parse error, got {:?}", other),
    }
    assert!(fail("\"unterminated")
        .to_string()
        .contains("unterminated string"));
    assert!(fail("a + ;").to_string().contains("missing operand"));
    assert!(fail("(a;").to_string().contains("bracket"));
}

#[test]
fn var_scoping_between_closure_and_local() {
    // `var` declares locally; plain assignment writes through the chain.
    let src = "var x = 1;
               var set = func { x = 5; };
               var shadow = func { var x = 9; return x; };
               set();
               return x * 10 + shadow();";
    assert_eq!(num(src), 59.0);
}

#[test]
fn character_and_numeric_literals() {
    assert_eq!(num("return `A`;"), 65.0);
    assert_eq!(num("return 0x10 + 0o10 + 10;"), 34.0);
    assert_eq!(num("return .5 + 1.5e1;"), 15.5);
}

#[test]
fn comments_are_ignored()  {
    assert_eq!(num("# leading comment\nreturn 1; # trailing"), 1.0);
}
