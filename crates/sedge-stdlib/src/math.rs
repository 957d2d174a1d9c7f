//! Numeric functions.
//!
//! Every function validates its arguments as numeric and raises a runtime
//! error for NaN or infinite results rather than returning them. That is a
//! policy of this library, not of the VM, which transmits NaN freely.

use sedge_engine::{Context, FuncDef, Ref, Runtime, Vm};
use sedge_engine::vm::VmRes;

fn numeric_arg(vm: &mut Vm<'_>, args: &[Ref], i: usize, fname: &str) -> VmRes<f64> {
    let r = args.get(i).copied().unwrap_or_else(Ref::nil);
    match vm.num_value(r) {
        Some(n) => Ok(n),
        None => vm.error(format!("non numeric argument to {}()", fname)),
    }
}

/// Reject NaN and infinity by exponent pattern; assumes IEEE 754 doubles.
fn validate(vm: &mut Vm<'_>, n: f64, fname: &str) -> VmRes<Ref> {
    if (n.to_bits() >> 52) & 0x7ff != 0x7ff {
        Ok(Ref::num(n))
    } else {
        vm.error(format!("floating point error in math.{}()", fname))
    }
}

fn f_sin(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "sin")?;
    validate(vm, a.sin(), "sin")
}

fn f_cos(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "cos")?;
    validate(vm, a.cos(), "cos")
}

fn f_exp(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "exp")?;
    validate(vm, a.exp(), "exp")
}

fn f_ln(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "ln")?;
    validate(vm, a.ln(), "ln")
}

fn f_sqrt(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "sqrt")?;
    validate(vm, a.sqrt(), "sqrt")
}

fn f_atan2(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "atan2")?;
    let b = numeric_arg(vm, args, 1, "atan2")?;
    validate(vm, a.atan2(b), "atan2")
}

fn f_floor(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "floor")?;
    validate(vm, a.floor(), "floor")
}

fn f_ceil(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "ceil")?;
    validate(vm, a.ceil(), "ceil")
}

fn f_mod(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "mod")?;
    let b = numeric_arg(vm, args, 1, "mod")?;
    validate(vm, a % b, "mod")
}

fn f_clamp(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "clamp")?;
    let mut b = numeric_arg(vm, args, 1, "clamp")?;
    let x = numeric_arg(vm, args, 2, "clamp")?;
    if a < b {
        b = a;
    }
    if b > x {
        b = x;
    }
    validate(vm, b, "clamp")
}

fn f_periodic(vm: &mut Vm<'_>, _me: Ref, args: &[Ref]) -> VmRes<Ref> {
    let a = numeric_arg(vm, args, 0, "periodic")?;
    let b = numeric_arg(vm, args, 1, "periodic")?;
    let mut x = numeric_arg(vm, args, 2, "periodic")?;
    let range = b - a;
    x -= range * ((x - a) / range).floor();
    // Roundoff can push the result just outside the interval.
    if x <= a {
        x = a;
    }
    if b <= x {
        x = b;
    }
    validate(vm, x, "periodic")
}

/// The math callback table.
pub const FUNCS: &[FuncDef] = &[
    FuncDef {
        name: "sin",
        func: f_sin,
    },
    FuncDef {
        name: "cos",
        func: f_cos,
    },
    FuncDef {
        name: "exp",
        func: f_exp,
    },
    FuncDef {
        name: "ln",
        func: f_ln,
    },
    FuncDef {
        name: "sqrt",
        func: f_sqrt,
    },
    FuncDef {
        name: "atan2",
        func: f_atan2,
    },
    FuncDef {
        name: "floor",
        func: f_floor,
    },
    FuncDef {
        name: "ceil",
        func: f_ceil,
    },
    FuncDef {
        name: "mod",
        func: f_mod,
    },
    FuncDef {
        name: "clamp",
        func: f_clamp,
    },
    FuncDef {
        name: "periodic",
        func: f_periodic,
    },
];

/// Build the `math` namespace hash: the function table plus the constants
/// `pi` and `e`.
pub fn namespace(rt: &Runtime, ctx: &Context) -> Ref {
    let ns = rt.gen_lib(ctx, FUNCS);
    rt.add_sym(ctx, ns, "pi", Ref::num(std::f64::consts::PI));
    rt.add_sym(ctx, ns, "e", Ref::num(std::f64::consts::E));
    ns
}
