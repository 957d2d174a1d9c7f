//! The code generator.
//!
//! Walks the token tree emitting 16-bit opcode words into a code object:
//! deduplicated constants (numbers by bit pattern, strings by bytes,
//! interned symbols by identity), an argument descriptor, and an (ip, line)
//! table. Variable access compiles to `Local`/`SetSym`/`SetLocal` with the
//! interned symbol as a constant; the interpreter walks the activation
//! record and closure chain at run time. Loops keep a compile-time stack of
//! frames carrying break/continue patch lists and an optional label.

use super::opcode::Op;
use crate::parser::token::{Node, Tok};
use crate::parser::ParseFault;
use crate::vm::runtime::Globals;
use crate::vm::value::Ref;
use rustc_hash::FxHashMap;

/// Generate the top-level code object for a parsed source tree.
pub(crate) fn generate(g: &mut Globals, file: &str, tree: &Node) -> Result<Ref, ParseFault> {
    let src_file = g.heap.new_str(file.as_bytes());
    let mut gen = Gen::new(g, src_file);
    gen.gen_block(&tree.children, true)?;
    gen.emit(Op::Return, tree.line());
    gen.finish(Vec::new(), Vec::new(), Ref::nil(), false)
}

fn fault<T>(msg: &str, line: u32) -> Result<T, ParseFault> {
    Err(ParseFault::new(msg, line))
}

#[derive(Hash, PartialEq, Eq)]
enum CKey {
    /// Number constants, keyed by canonical bit pattern.
    Num(u64),
    /// Uninterned string constants, keyed by bytes.
    Str(Vec<u8>),
    /// Interned symbols and nil, keyed by identity.
    Bits(u64),
}

struct LoopRec {
    label: Option<Vec<u8>>,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

struct Gen<'g> {
    g: &'g mut Globals,
    src_file: Ref,
    ops: Vec<u16>,
    consts: Vec<Ref>,
    cmap: FxHashMap<CKey, u16>,
    line_ips: Vec<(u16, u16)>,
    last_line: u32,
    loops: Vec<LoopRec>,
}

impl<'g> Gen<'g> {
    fn new(g: &'g mut Globals, src_file: Ref) -> Gen<'g> {
        Gen {
            g,
            src_file,
            ops: Vec::new(),
            consts: Vec::new(),
            cmap: FxHashMap::default(),
            line_ips: Vec::new(),
            last_line: 0,
            loops: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn note_line(&mut self, line: u32) {
        if line != self.last_line && line != 0 {
            self.line_ips.push((self.ops.len() as u16, line as u16));
            self.last_line = line;
        }
    }

    fn emit(&mut self, op: Op, line: u32) {
        self.note_line(line);
        self.ops.push(op as u16);
    }

    fn emit1(&mut self, op: Op, arg: u16, line: u32) {
        self.emit(op, line);
        self.ops.push(arg);
    }

    fn here(&self) -> usize {
        self.ops.len()
    }

    /// Emit a jump with a placeholder target; returns the patch position.
    fn emit_jump(&mut self, op: Op, line: u32) -> usize {
        self.emit(op, line);
        self.ops.push(0);
        self.ops.len() - 1
    }

    fn patch(&mut self, pos: usize, target: usize) {
        self.ops[pos] = target as u16;
    }

    fn patch_here(&mut self, pos: usize) {
        let target = self.here();
        self.patch(pos, target);
    }

    // ------------------------------------------------------------------
    // Constants
    // ------------------------------------------------------------------

    fn push_const(&mut self, r: Ref, line: u32) -> Result<u16, ParseFault> {
        if self.consts.len() > u16::MAX as usize {
            return fault("too many constants", line);
        }
        self.consts.push(r);
        Ok((self.consts.len() - 1) as u16)
    }

    fn keyed_const(&mut self, key: CKey, r: Ref, line: u32) -> Result<u16, ParseFault> {
        if let Some(&idx) = self.cmap.get(&key) {
            return Ok(idx);
        }
        let idx = self.push_const(r, line)?;
        self.cmap.insert(key, idx);
        Ok(idx)
    }

    fn num_const(&mut self, n: f64, line: u32) -> Result<u16, ParseFault> {
        let r = Ref::num(n);
        self.keyed_const(CKey::Num(r.bits()), r, line)
    }

    fn str_const(&mut self, bytes: &[u8], line: u32) -> Result<u16, ParseFault> {
        if let Some(&idx) = self.cmap.get(&CKey::Str(bytes.to_vec())) {
            return Ok(idx);
        }
        let r = self.g.heap.new_str(bytes);
        self.keyed_const(CKey::Str(bytes.to_vec()), r, line)
    }

    fn sym_const(&mut self, bytes: &[u8], line: u32) -> Result<u16, ParseFault> {
        let sym = self.g.intern(bytes);
        self.keyed_const(CKey::Bits(sym.bits()), sym, line)
    }

    fn nil_const(&mut self, line: u32) -> Result<u16, ParseFault> {
        self.keyed_const(CKey::Bits(Ref::nil().bits()), Ref::nil(), line)
    }

    /// Constant index for a default-argument value; only literal forms.
    fn const_of_literal(&mut self, n: &Node) -> Result<u16, ParseFault> {
        match n.tok() {
            Tok::Literal => match &n.token.str_ {
                Some(bytes) => {
                    let b = bytes.clone();
                    self.str_const(&b, n.line())
                }
                None => self.num_const(n.token.num, n.line()),
            },
            Tok::Nil => self.nil_const(n.line()),
            Tok::Neg if n.children.len() == 1
                && n.children[0].tok() == Tok::Literal
                && n.children[0].token.str_.is_none() =>
            {
                self.num_const(-n.children[0].token.num, n.line())
            }
            _ => fault("default arguments must be constants", n.line()),
        }
    }

    // ------------------------------------------------------------------
    // Statements and blocks
    // ------------------------------------------------------------------

    fn is_control(tok: Tok) -> bool {
        matches!(
            tok,
            Tok::If | Tok::While | Tok::For | Tok::Foreach | Tok::Forindex
        )
    }

    /// A block is an expression sequence; each statement's value is popped
    /// except, when `keep_last`, the final one (the function result).
    fn gen_block(&mut self, stmts: &[Node], keep_last: bool) -> Result<(), ParseFault> {
        if stmts.is_empty() {
            if keep_last {
                self.emit(Op::PushNil, self.last_line);
            }
            return Ok(());
        }
        let last = stmts.len() - 1;
        for (i, s) in stmts.iter().enumerate() {
            let is_last = i == last;
            match s.tok() {
                t if Self::is_control(t) => {
                    self.gen_control(s)?;
                    if is_last && keep_last {
                        self.emit(Op::PushNil, s.line());
                    }
                }
                Tok::Return => {
                    if let Some(e) = s.children.first() {
                        self.gen_expr(e)?;
                    } else {
                        self.emit(Op::PushNil, s.line());
                    }
                    self.emit(Op::Return, s.line());
                }
                Tok::Break => self.gen_break(s, true)?,
                Tok::Continue => self.gen_break(s, false)?,
                _ => {
                    self.gen_expr(s)?;
                    if !(is_last && keep_last) {
                        self.emit(Op::Pop, s.line());
                    }
                }
            }
        }
        Ok(())
    }

    fn gen_control(&mut self, n: &Node) -> Result<(), ParseFault> {
        match n.tok() {
            Tok::If => self.gen_if(n),
            Tok::While => self.gen_while(n),
            Tok::For => self.gen_for(n),
            Tok::Foreach => self.gen_foreach(n, false),
            Tok::Forindex => self.gen_foreach(n, true),
            _ => fault("parse error", n.line()),
        }
    }

    fn gen_if(&mut self, n: &Node) -> Result<(), ParseFault> {
        let line = n.line();
        self.gen_expr(&n.children[0])?;
        let p_else = self.emit_jump(Op::JifNotPop, line);
        self.gen_block(&n.children[1].children, false)?;
        if let Some(rest) = n.children.get(2) {
            let p_end = self.emit_jump(Op::Jmp, line);
            self.patch_here(p_else);
            match rest.tok() {
                Tok::If => self.gen_if(rest)?,
                Tok::Block => self.gen_block(&rest.children, false)?,
                _ => return fault("parse error in else clause", rest.line()),
            }
            self.patch_here(p_end);
        } else {
            self.patch_here(p_else);
        }
        Ok(())
    }

    fn push_loop(&mut self, n: &Node) {
        self.loops.push(LoopRec {
            label: n.token.str_.clone(),
            breaks: Vec::new(),
            continues: Vec::new(),
        });
    }

    fn pop_loop(&mut self, break_target: usize, continue_target: usize) {
        let rec = self.loops.pop().expect("loop stack is balanced");
        for p in rec.breaks {
            self.patch(p, break_target);
        }
        for p in rec.continues {
            self.patch(p, continue_target);
        }
    }

    fn gen_while(&mut self, n: &Node) -> Result<(), ParseFault> {
        let line = n.line();
        self.emit(Op::Mark, line);
        let test = self.here();
        self.gen_expr(&n.children[0])?;
        let p_end = self.emit_jump(Op::JifNotPop, line);
        self.push_loop(n);
        self.gen_block(&n.children[1].children, false)?;
        self.emit1(Op::JmpLoop, test as u16, line);
        let end = self.here();
        self.patch(p_end, end);
        self.pop_loop(end, test);
        self.emit(Op::Unmark, line);
        Ok(())
    }

    fn gen_for(&mut self, n: &Node) -> Result<(), ParseFault> {
        let line = n.line();
        let init = &n.children[0];
        let cond = &n.children[1];
        let update = &n.children[2];
        let body = &n.children[3];

        if init.tok() != Tok::Empty {
            self.gen_expr(init)?;
            self.emit(Op::Pop, init.line());
        }
        self.emit(Op::Mark, line);
        let test = self.here();
        if cond.tok() == Tok::Empty {
            self.emit(Op::PushOne, line);
        } else {
            self.gen_expr(cond)?;
        }
        let p_end = self.emit_jump(Op::JifNotPop, line);
        self.push_loop(n);
        self.gen_block(&body.children, false)?;
        let cont = self.here();
        if update.tok() != Tok::Empty {
            self.gen_expr(update)?;
            self.emit(Op::Pop, update.line());
        }
        self.emit1(Op::JmpLoop, test as u16, line);
        let end = self.here();
        self.patch(p_end, end);
        self.pop_loop(end, cont);
        self.emit(Op::Unmark, line);
        Ok(())
    }

    /// `foreach` iterates elements, `forindex` indices. The vector and a
    /// hidden cursor live on the operand stack below the loop's mark;
    /// `EACH` advances the cursor and `BREAK2` plus two pops clean up.
    fn gen_foreach(&mut self, n: &Node, use_index: bool) -> Result<(), ParseFault> {
        let line = n.line();
        let var = &n.children[0];
        self.gen_expr(&n.children[1])?;
        self.emit(Op::PushZero, line);
        self.emit(Op::Mark, line);
        let each = self.here();
        self.emit1(Op::Each, if use_index { 1 } else { 0 }, line);
        let p_end = self.emit_jump(Op::JifEnd, line);
        match var.tok() {
            Tok::Symbol => {
                let s = self.sym_const(&var.bytes().to_vec(), var.line())?;
                self.emit1(Op::SetSym, s, var.line());
            }
            Tok::Var if var.children.len() == 1 && var.children[0].tok() == Tok::Symbol => {
                let s = self.sym_const(&var.children[0].bytes().to_vec(), var.line())?;
                self.emit1(Op::SetLocal, s, var.line());
            }
            _ => return fault("bad foreach variable", var.line()),
        }
        self.emit(Op::Pop, line);
        self.push_loop(n);
        self.gen_block(&n.children[2].children, false)?;
        self.emit1(Op::JmpLoop, each as u16, line);
        let end = self.here();
        self.patch(p_end, end);
        self.pop_loop(end, each);
        self.emit(Op::Break2, line);
        self.emit(Op::Pop, line);
        self.emit(Op::Pop, line);
        Ok(())
    }

    /// `break`/`continue`, optionally labeled. Marks of crossed loops are
    /// discarded before the jump; the target loop's own cleanup runs at its
    /// end sequence.
    fn gen_break(&mut self, n: &Node, is_break: bool) -> Result<(), ParseFault> {
        let line = n.line();
        let idx = match n.token.str_.as_deref() {
            None => match self.loops.len().checked_sub(1) {
                Some(i) => i,
                None => return fault("break/continue outside of loop", line),
            },
            Some(label) => match self
                .loops
                .iter()
                .rposition(|r| r.label.as_deref() == Some(label))
            {
                Some(i) => i,
                None => return fault("no loop with that label", line),
            },
        };
        let crossed = self.loops.len() - 1 - idx;
        for _ in 0..crossed {
            self.emit(Op::Unmark, line);
        }
        self.emit(Op::Break, line);
        let p = self.emit_jump(Op::Jmp, line);
        if is_break {
            self.loops[idx].breaks.push(p);
        } else {
            self.loops[idx].continues.push(p);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn gen_expr(&mut self, n: &Node) -> Result<(), ParseFault> {
        let line = n.line();
        self.note_line(line);
        match n.tok() {
            Tok::Literal => match &n.token.str_ {
                Some(bytes) => {
                    let b = bytes.clone();
                    let idx = self.str_const(&b, line)?;
                    self.emit1(Op::PushConst, idx, line);
                }
                None => {
                    let v = n.token.num;
                    if v == 1.0 {
                        self.emit(Op::PushOne, line);
                    } else if v == 0.0 && v.is_sign_positive() {
                        self.emit(Op::PushZero, line);
                    } else {
                        let idx = self.num_const(v, line)?;
                        self.emit1(Op::PushConst, idx, line);
                    }
                }
            },
            Tok::Nil => self.emit(Op::PushNil, line),
            Tok::Empty => self.emit(Op::PushNil, line),
            Tok::Symbol => {
                let s = self.sym_const(&n.bytes().to_vec(), line)?;
                self.emit1(Op::Local, s, line);
            }
            Tok::Var => {
                if n.children.len() != 1 || n.children[0].tok() != Tok::Symbol {
                    return fault("bad variable declaration", line);
                }
                let s = self.sym_const(&n.children[0].bytes().to_vec(), line)?;
                self.emit(Op::PushNil, line);
                self.emit1(Op::SetLocal, s, line);
            }
            Tok::Assign => self.gen_assign(n)?,
            Tok::PlusEq => self.gen_compound(n, Op::Plus)?,
            Tok::MinusEq => self.gen_compound(n, Op::Minus)?,
            Tok::MulEq => self.gen_compound(n, Op::Mul)?,
            Tok::DivEq => self.gen_compound(n, Op::Div)?,
            Tok::CatEq => self.gen_compound(n, Op::Cat)?,
            Tok::BitAndEq => self.gen_compound(n, Op::BitAnd)?,
            Tok::BitOrEq => self.gen_compound(n, Op::BitOr)?,
            Tok::BitXorEq => self.gen_compound(n, Op::BitXor)?,
            Tok::And => {
                self.gen_expr(&n.children[0])?;
                let p = self.emit_jump(Op::JifNot, line);
                self.emit(Op::Pop, line);
                self.gen_expr(&n.children[1])?;
                self.patch_here(p);
            }
            Tok::Or => {
                self.gen_expr(&n.children[0])?;
                let p = self.emit_jump(Op::JifTrue, line);
                self.emit(Op::Pop, line);
                self.gen_expr(&n.children[1])?;
                self.patch_here(p);
            }
            Tok::Not => {
                self.gen_expr(&n.children[0])?;
                self.emit(Op::Not, line);
            }
            Tok::Neg => {
                self.gen_expr(&n.children[0])?;
                self.emit(Op::Neg, line);
            }
            Tok::BitNeg => {
                self.gen_expr(&n.children[0])?;
                self.emit(Op::BitNeg, line);
            }
            Tok::Mul
            | Tok::Div
            | Tok::Plus
            | Tok::Minus
            | Tok::Cat
            | Tok::BitAnd
            | Tok::BitOr
            | Tok::BitXor
            | Tok::Lt
            | Tok::Lte
            | Tok::Gt
            | Tok::Gte
            | Tok::Eq
            | Tok::Neq => {
                self.gen_expr(&n.children[0])?;
                self.gen_expr(&n.children[1])?;
                let op = match n.tok() {
                    Tok::Mul => Op::Mul,
                    Tok::Div => Op::Div,
                    Tok::Plus => Op::Plus,
                    Tok::Minus => Op::Minus,
                    Tok::Cat => Op::Cat,
                    Tok::BitAnd => Op::BitAnd,
                    Tok::BitOr => Op::BitOr,
                    Tok::BitXor => Op::BitXor,
                    Tok::Lt => Op::Lt,
                    Tok::Lte => Op::Lte,
                    Tok::Gt => Op::Gt,
                    Tok::Gte => Op::Gte,
                    Tok::Eq => Op::Eq,
                    _ => Op::Neq,
                };
                self.emit(op, line);
            }
            Tok::Question => {
                if n.children.len() != 2 || n.children[1].tok() != Tok::Colon {
                    return fault("bad ternary expression", line);
                }
                self.gen_expr(&n.children[0])?;
                let p_else = self.emit_jump(Op::JifNotPop, line);
                self.gen_expr(&n.children[1].children[0])?;
                let p_end = self.emit_jump(Op::Jmp, line);
                self.patch_here(p_else);
                self.gen_expr(&n.children[1].children[1])?;
                self.patch_here(p_end);
            }
            Tok::NullChain => {
                // a ?? b: keep a unless it is nil.
                self.gen_expr(&n.children[0])?;
                self.emit(Op::Dup, line);
                self.emit(Op::PushNil, line);
                self.emit(Op::Eq, line);
                let p_keep = self.emit_jump(Op::JifNotPop, line);
                self.emit(Op::Pop, line);
                self.gen_expr(&n.children[1])?;
                self.patch_here(p_keep);
            }
            Tok::Dot => {
                let sym = self.member_sym(n)?;
                self.gen_expr(&n.children[0])?;
                self.emit1(Op::Member, sym, line);
            }
            Tok::NullAccess => {
                // a?.b: nil when a is nil, member access otherwise.
                let sym = self.member_sym(n)?;
                self.gen_expr(&n.children[0])?;
                self.emit(Op::Dup, line);
                self.emit(Op::PushNil, line);
                self.emit(Op::Eq, line);
                let p_access = self.emit_jump(Op::JifNotPop, line);
                let p_end = self.emit_jump(Op::Jmp, line);
                self.patch_here(p_access);
                self.emit1(Op::Member, sym, line);
                self.patch_here(p_end);
            }
            Tok::Call => self.gen_call(n)?,
            Tok::Idx => self.gen_idx(n)?,
            Tok::VecLit => {
                self.emit(Op::NewVec, line);
                for e in &n.children {
                    self.gen_expr(e)?;
                    self.emit(Op::Vappend, e.line());
                }
            }
            Tok::HashLit => {
                self.emit(Op::NewHash, line);
                for pair in &n.children {
                    if pair.tok() != Tok::Colon || pair.children.len() != 2 {
                        return fault("bad hash literal entry", pair.line());
                    }
                    let key = &pair.children[0];
                    match key.tok() {
                        Tok::Symbol => {
                            let s = self.sym_const(&key.bytes().to_vec(), key.line())?;
                            self.emit1(Op::PushConst, s, key.line());
                        }
                        Tok::Literal => match &key.token.str_ {
                            Some(bytes) => {
                                let b = bytes.clone();
                                let s = self.str_const(&b, key.line())?;
                                self.emit1(Op::PushConst, s, key.line());
                            }
                            None => {
                                let s = self.num_const(key.token.num, key.line())?;
                                self.emit1(Op::PushConst, s, key.line());
                            }
                        },
                        _ => return fault("invalid hash key", key.line()),
                    }
                    self.gen_expr(&pair.children[1])?;
                    self.emit(Op::Happend, pair.line());
                }
            }
            Tok::Func => self.gen_func_literal(n)?,
            Tok::Comma => {
                self.gen_expr(&n.children[0])?;
                self.emit(Op::Pop, line);
                self.gen_expr(&n.children[1])?;
            }
            _ => return fault("parse error in expression", line),
        }
        Ok(())
    }

    fn member_sym(&mut self, n: &Node) -> Result<u16, ParseFault> {
        if n.children.len() != 2 || n.children[1].tok() != Tok::Symbol {
            return fault("parse error in member access", n.line());
        }
        self.sym_const(&n.children[1].bytes().to_vec(), n.line())
    }

    fn gen_assign(&mut self, n: &Node) -> Result<(), ParseFault> {
        let line = n.line();
        let lhs = &n.children[0];
        match lhs.tok() {
            Tok::Symbol => {
                let s = self.sym_const(&lhs.bytes().to_vec(), lhs.line())?;
                self.gen_expr(&n.children[1])?;
                self.emit1(Op::SetSym, s, line);
            }
            Tok::Var => {
                if lhs.children.len() != 1 || lhs.children[0].tok() != Tok::Symbol {
                    return fault("bad variable declaration", lhs.line());
                }
                let s = self.sym_const(&lhs.children[0].bytes().to_vec(), lhs.line())?;
                self.gen_expr(&n.children[1])?;
                self.emit1(Op::SetLocal, s, line);
            }
            Tok::Dot => {
                let sym = self.member_sym(lhs)?;
                self.gen_expr(&lhs.children[0])?;
                self.gen_expr(&n.children[1])?;
                self.emit1(Op::SetMember, sym, line);
            }
            Tok::Idx => {
                if lhs.children.len() != 2 || lhs.children[1].tok() == Tok::Colon {
                    return fault("bad lvalue", lhs.line());
                }
                self.gen_expr(&lhs.children[0])?;
                self.gen_expr(&lhs.children[1])?;
                self.gen_expr(&n.children[1])?;
                self.emit(Op::Insert, line);
            }
            Tok::List => {
                let targets = &lhs.children;
                self.gen_expr(&n.children[1])?;
                self.emit1(Op::Unpack, targets.len() as u16, line);
                for t in targets.iter().rev() {
                    self.gen_set_target(t)?;
                    self.emit(Op::Pop, t.line());
                }
                self.emit(Op::PushNil, line);
            }
            _ => return fault("bad lvalue", lhs.line()),
        }
        Ok(())
    }

    /// Store the value on top of the stack into a multi-assignment target,
    /// leaving the value for the caller to pop.
    fn gen_set_target(&mut self, t: &Node) -> Result<(), ParseFault> {
        let line = t.line();
        match t.tok() {
            Tok::Symbol => {
                let s = self.sym_const(&t.bytes().to_vec(), line)?;
                self.emit1(Op::SetSym, s, line);
            }
            Tok::Var => {
                if t.children.len() != 1 || t.children[0].tok() != Tok::Symbol {
                    return fault("bad variable declaration", line);
                }
                let s = self.sym_const(&t.children[0].bytes().to_vec(), line)?;
                self.emit1(Op::SetLocal, s, line);
            }
            Tok::Dot => {
                let sym = self.member_sym(t)?;
                self.gen_expr(&t.children[0])?;
                self.emit(Op::Xchg, line);
                self.emit1(Op::SetMember, sym, line);
            }
            Tok::Idx => {
                if t.children.len() != 2 || t.children[1].tok() == Tok::Colon {
                    return fault("bad lvalue", line);
                }
                self.gen_expr(&t.children[0])?;
                self.gen_expr(&t.children[1])?;
                self.emit(Op::Xchg2, line);
                self.emit(Op::Insert, line);
            }
            _ => return fault("bad lvalue", line),
        }
        Ok(())
    }

    fn gen_compound(&mut self, n: &Node, op: Op) -> Result<(), ParseFault> {
        let line = n.line();
        let lhs = &n.children[0];
        match lhs.tok() {
            Tok::Symbol => {
                let s = self.sym_const(&lhs.bytes().to_vec(), lhs.line())?;
                self.emit1(Op::Local, s, line);
                self.gen_expr(&n.children[1])?;
                self.emit(op, line);
                self.emit1(Op::SetSym, s, line);
            }
            Tok::Dot => {
                let sym = self.member_sym(lhs)?;
                self.gen_expr(&lhs.children[0])?;
                self.emit(Op::Dup, line);
                self.emit1(Op::Member, sym, line);
                self.gen_expr(&n.children[1])?;
                self.emit(op, line);
                self.emit1(Op::SetMember, sym, line);
            }
            Tok::Idx => {
                if lhs.children.len() != 2 || lhs.children[1].tok() == Tok::Colon {
                    return fault("bad lvalue", lhs.line());
                }
                self.gen_expr(&lhs.children[0])?;
                self.gen_expr(&lhs.children[1])?;
                self.emit(Op::Extract, line);
                self.gen_expr(&n.children[1])?;
                self.emit(op, line);
                self.emit(Op::Insert, line);
            }
            _ => return fault("bad lvalue", lhs.line()),
        }
        Ok(())
    }

    fn gen_call(&mut self, n: &Node) -> Result<(), ParseFault> {
        let line = n.line();
        let callee = &n.children[0];
        let mut positional: Vec<&Node> = Vec::new();
        let mut named: Vec<(&Node, &Node)> = Vec::new();
        for a in &n.children[1..] {
            if a.tok() == Tok::Colon && a.children.len() == 2 {
                if a.children[0].tok() != Tok::Symbol {
                    return fault("bad named argument", a.line());
                }
                named.push((&a.children[0], &a.children[1]));
            } else {
                positional.push(a);
            }
        }

        let mcall = callee.tok() == Tok::Dot;
        if mcall {
            let sym = self.member_sym(callee)?;
            self.gen_expr(&callee.children[0])?;
            self.emit(Op::Dup, line);
            self.emit1(Op::Member, sym, line);
        } else {
            self.gen_expr(callee)?;
        }
        for &a in &positional {
            self.gen_expr(a)?;
        }

        if named.is_empty() {
            let op = if mcall { Op::Mcall } else { Op::Fcall };
            self.emit1(op, positional.len() as u16, line);
        } else {
            self.emit(Op::NewHash, line);
            for (key, val) in named {
                let s = self.sym_const(&key.bytes().to_vec(), key.line())?;
                self.emit1(Op::PushConst, s, key.line());
                self.gen_expr(val)?;
                self.emit(Op::Happend, val.line());
            }
            let op = if mcall { Op::McallH } else { Op::FcallH };
            self.emit1(op, positional.len() as u16, line);
        }
        Ok(())
    }

    fn gen_idx(&mut self, n: &Node) -> Result<(), ParseFault> {
        let line = n.line();
        let items = &n.children[1..];
        let simple = items.len() == 1 && items[0].tok() != Tok::Colon;
        if simple {
            self.gen_expr(&n.children[0])?;
            self.gen_expr(&items[0])?;
            self.emit(Op::Index, line);
            return Ok(());
        }
        // Slice extraction builds a fresh vector.
        self.gen_expr(&n.children[0])?;
        self.emit(Op::NewVec, line);
        self.emit(Op::Xchg, line);
        for item in items {
            if item.tok() == Tok::Colon {
                if item.children.len() != 2 {
                    return fault("bad slice", item.line());
                }
                self.gen_expr(&item.children[0])?;
                self.gen_expr(&item.children[1])?;
                self.emit(Op::Slice2, item.line());
            } else {
                self.gen_expr(item)?;
                self.emit(Op::Slice, item.line());
            }
        }
        self.emit(Op::Pop, line);
        Ok(())
    }

    fn gen_func_literal(&mut self, n: &Node) -> Result<(), ParseFault> {
        let line = n.line();
        let (params, body) = match n.children.len() {
            1 => (None, &n.children[0]),
            2 => (Some(&n.children[0]), &n.children[1]),
            _ => return fault("parse error in func literal", line),
        };

        let code_ref = {
            let mut sub = Gen::new(&mut *self.g, self.src_file);
            let mut arg_syms: Vec<Ref> = Vec::new();
            let mut opt_args: Vec<(Ref, u16)> = Vec::new();
            let mut rest_sym = Ref::nil();
            if let Some(params) = params {
                for (i, item) in params.children.iter().enumerate() {
                    match item.tok() {
                        Tok::Symbol => {
                            if !opt_args.is_empty() || !rest_sym.is_nil() {
                                return fault(
                                    "positional parameter after optional",
                                    item.line(),
                                );
                            }
                            arg_syms.push(sub.g.intern(item.bytes()));
                        }
                        Tok::Assign => {
                            if item.children[0].tok() != Tok::Symbol {
                                return fault("bad function parameter", item.line());
                            }
                            let sym = sub.g.intern(item.children[0].bytes());
                            let cidx = sub.const_of_literal(&item.children[1])?;
                            opt_args.push((sym, cidx));
                        }
                        Tok::Ellipsis => {
                            if item.children.len() != 1
                                || item.children[0].tok() != Tok::Symbol
                                || i + 1 != params.children.len()
                            {
                                return fault("rest parameter must be last", item.line());
                            }
                            rest_sym = sub.g.intern(item.children[0].bytes());
                        }
                        _ => return fault("bad function parameter", item.line()),
                    }
                }
            }
            sub.gen_block(&body.children, true)?;
            sub.emit(Op::Return, body.line());
            sub.finish(arg_syms, opt_args, rest_sym, params.is_none())?
        };

        let idx = self.push_const(code_ref, line)?;
        self.emit1(Op::PushConst, idx, line);
        Ok(())
    }

    /// Seal the accumulated state into a code object.
    fn finish(
        self,
        arg_syms: Vec<Ref>,
        opt_args: Vec<(Ref, u16)>,
        rest_sym: Ref,
        implicit_args: bool,
    ) -> Result<Ref, ParseFault> {
        if self.ops.len() > u16::MAX as usize {
            return fault("code too large", self.last_line);
        }
        let code = crate::vm::heap::CodeObj {
            ops: self.ops.into_boxed_slice(),
            consts: self.consts.into_boxed_slice(),
            arg_syms: arg_syms.into_boxed_slice(),
            opt_args: opt_args.into_boxed_slice(),
            rest_sym,
            implicit_args,
            src_file: self.src_file,
            line_ips: self.line_ips.into_boxed_slice(),
        };
        Ok(self.g.heap.new_code(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::debug;
    use crate::parser;

    fn compile(src: &str) -> (Globals, Ref) {
        let mut g = Globals::new();
        let tree = parser::parse(src).unwrap();
        let code = generate(&mut g, "test.sg", &tree).unwrap();
        (g, code)
    }

    fn ops_of(src: &str) -> Vec<Op> {
        let (g, code) = compile(src);
        debug::op_list(&g.heap, code)
    }

    #[test]
    fn unary_minus_compiles_to_neg() {
        let ops = ops_of("a * -2;");
        assert!(ops.contains(&Op::Mul));
        assert!(ops.contains(&Op::Neg));
    }

    #[test]
    fn concat_compiles_to_cat() {
        let ops = ops_of("\"foo\" ~ \"bar\";");
        assert!(ops.contains(&Op::Cat));
    }

    #[test]
    fn small_integer_literals_use_short_forms() {
        let ops = ops_of("1; 0;");
        assert!(ops.contains(&Op::PushOne));
        assert!(ops.contains(&Op::PushZero));
    }

    #[test]
    fn constants_deduplicate() {
        let (g, code) = compile("a = 2.5 + 2.5 + 2.5;");
        let c = g.heap.code(code);
        let nums = c
            .consts
            .iter()
            .filter(|r| r.as_num() == Some(2.5))
            .count();
        assert_eq!(nums, 1);
        // The symbol `a` appears once despite two uses (read and write are
        // both compiled against the same constant).
        let syms = c
            .consts
            .iter()
            .filter(|r| {
                r.is_kind(crate::vm::value::Kind::Str)
                    && g.heap.string(**r).bytes() == b"a"
            })
            .count();
        assert_eq!(syms, 1);
    }

    #[test]
    fn loops_emit_mark_discipline() {
        let ops = ops_of("while (a) { b; }");
        assert!(ops.contains(&Op::Mark));
        assert!(ops.contains(&Op::Unmark));
        assert!(ops.contains(&Op::JmpLoop));

        let ops = ops_of("foreach (var e; v) { e; }");
        assert!(ops.contains(&Op::Each));
        assert!(ops.contains(&Op::JifEnd));
        assert!(ops.contains(&Op::Break2));
    }

    #[test]
    fn calls_pick_method_form() {
        let ops = ops_of("f(1, 2);");
        assert!(ops.contains(&Op::Fcall));
        let ops = ops_of("o.m(1);");
        assert!(ops.contains(&Op::Mcall));
        let ops = ops_of("f(1, k: 2);");
        assert!(ops.contains(&Op::FcallH));
    }

    #[test]
    fn nested_function_is_a_code_constant() {
        let (g, code) = compile("var f = func(x) { return x; };");
        let c = g.heap.code(code);
        let codes = c
            .consts
            .iter()
            .filter(|r| r.is_kind(crate::vm::value::Kind::Code))
            .count();
        assert_eq!(codes, 1);
    }

    #[test]
    fn line_table_is_ascending() {
        let (g, code) = compile("a;\nb;\n\nc;");
        let c = g.heap.code(code);
        let ips: Vec<u16> = c.line_ips.iter().map(|&(ip, _)| ip).collect();
        let mut sorted = ips.clone();
        sorted.sort_unstable();
        assert_eq!(ips, sorted);
        assert_eq!(c.line_for_ip(0), 1);
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let mut g = Globals::new();
        let tree = parser::parse("break;").unwrap();
        assert!(generate(&mut g, "t", &tree).is_err());
    }

    #[test]
    fn default_must_be_constant() {
        let mut g = Globals::new();
        let tree = parser::parse("var f = func(a = b) { a; };").unwrap();
        assert!(generate(&mut g, "t", &tree).is_err());
        let tree = parser::parse("var f = func(a = -1, b = 'x') { a; };").unwrap();
        assert!(generate(&mut g, "t", &tree).is_ok());
    }
}
