//! Token-tree parser.
//!
//! Phase A pairs `()`/`[]`/`{}` with a stack sweep, making each opening
//! token the parent of the tokens between the pair. Phase B folds operator
//! precedence over each sibling list: left-associative binary levels split
//! at the rightmost operator, right-associative levels at the leftmost,
//! prefix operators bind when they lead the list, and suffix operators
//! (call, index, member access, ellipsis) bind at the tail. Statement
//! keywords (`if`, loops, `func`, `return`…) are grouped structurally.

use super::token::{Node, Tok, Token};
use super::ParseFault;

#[derive(Clone, Copy, PartialEq)]
enum Rule {
    Binary,
    Reverse,
    Prefix,
    Suffix,
}

/// Precedence levels, loosest first.
const LEVELS: &[(&[Tok], Rule)] = &[
    (&[Tok::Comma], Rule::Reverse),
    (
        &[
            Tok::Assign,
            Tok::PlusEq,
            Tok::MinusEq,
            Tok::MulEq,
            Tok::DivEq,
            Tok::CatEq,
            Tok::BitAndEq,
            Tok::BitOrEq,
            Tok::BitXorEq,
            Tok::NullChain,
        ],
        Rule::Reverse,
    ),
    (&[Tok::Question, Tok::Colon], Rule::Reverse),
    (&[Tok::Var], Rule::Prefix),
    (&[Tok::Or], Rule::Binary),
    (&[Tok::And], Rule::Binary),
    (&[Tok::BitOr], Rule::Binary),
    (&[Tok::BitXor], Rule::Binary),
    (&[Tok::BitAnd], Rule::Binary),
    (
        &[Tok::Lt, Tok::Lte, Tok::Gt, Tok::Gte, Tok::Eq, Tok::Neq],
        Rule::Binary,
    ),
    (&[Tok::Plus, Tok::Minus], Rule::Binary),
    (&[Tok::Mul, Tok::Div, Tok::Cat], Rule::Binary),
    (
        &[Tok::Minus, Tok::Neg, Tok::Not, Tok::Cat, Tok::BitNeg],
        Rule::Prefix,
    ),
    (
        &[Tok::LPar, Tok::LBra, Tok::Dot, Tok::NullAccess, Tok::Ellipsis],
        Rule::Suffix,
    ),
];

fn fault<T>(msg: &str, line: u32) -> Result<T, ParseFault> {
    Err(ParseFault::new(msg, line))
}

/// Parse a token list into the tree root.
pub fn parse(tokens: Vec<Token>) -> Result<Node, ParseFault> {
    let nodes = pair_brackets(tokens)?;
    let stmts = parse_block(nodes)?;
    Ok(Node::new(Tok::Top, 1, stmts))
}

fn closer_for(open: Tok) -> Tok {
    match open {
        Tok::LPar => Tok::RPar,
        Tok::LBra => Tok::RBra,
        _ => Tok::RCurl,
    }
}

/// Phase A: match bracket pairs, dropping closers and nesting the contents
/// under the opener.
fn pair_brackets(tokens: Vec<Token>) -> Result<Vec<Node>, ParseFault> {
    let mut cur: Vec<Node> = Vec::new();
    let mut stack: Vec<(Token, Vec<Node>)> = Vec::new();
    for t in tokens {
        match t.tok {
            Tok::LPar | Tok::LBra | Tok::LCurl => {
                stack.push((t, std::mem::take(&mut cur)));
            }
            Tok::RPar | Tok::RBra | Tok::RCurl => {
                let (open, saved) = match stack.pop() {
                    Some(top) => top,
                    None => return fault("unmatched bracket", t.line),
                };
                if closer_for(open.tok) != t.tok {
                    return fault("mismatched bracket", t.line);
                }
                let node = Node {
                    token: open,
                    children: std::mem::take(&mut cur),
                };
                cur = saved;
                cur.push(node);
            }
            _ => cur.push(Node::leaf(t)),
        }
    }
    if let Some((open, _)) = stack.pop() {
        return fault("unterminated bracket", open.line);
    }
    Ok(cur)
}

/// Split a sibling list on a top-level separator token.
fn split_on(nodes: Vec<Node>, sep: Tok) -> Vec<Vec<Node>> {
    let mut out = vec![Vec::new()];
    for n in nodes {
        if n.tok() == sep && n.children.is_empty() {
            out.push(Vec::new());
        } else {
            out.last_mut().expect("split buckets are never empty").push(n);
        }
    }
    out
}

/// Statement list: split on semicolons, dropping empty statements.
fn parse_block(nodes: Vec<Node>) -> Result<Vec<Node>, ParseFault> {
    let mut stmts = Vec::new();
    for seg in split_on(nodes, Tok::Semi) {
        if seg.is_empty() {
            continue;
        }
        stmts.push(parse_statement(seg)?);
    }
    Ok(stmts)
}

fn parse_statement(seg: Vec<Node>) -> Result<Node, ParseFault> {
    match seg[0].tok() {
        Tok::If => parse_if(seg),
        Tok::While => parse_cond_loop(Tok::While, seg),
        Tok::Foreach => parse_each_loop(Tok::Foreach, seg),
        Tok::Forindex => parse_each_loop(Tok::Forindex, seg),
        Tok::For => parse_for(seg),
        Tok::Return => {
            let line = seg[0].line();
            let mut rest: Vec<Node> = seg;
            rest.remove(0);
            let children = if rest.is_empty() {
                Vec::new()
            } else {
                vec![parse_expr(rest)?]
            };
            Ok(Node::new(Tok::Return, line, children))
        }
        Tok::Break | Tok::Continue => {
            let kind = seg[0].tok();
            let line = seg[0].line();
            let label = match seg.len() {
                1 => None,
                2 if seg[1].tok() == Tok::Symbol => Some(seg[1].bytes().to_vec()),
                _ => return fault("parse error", line),
            };
            let mut token = Token::bare(kind, line);
            token.str_ = label;
            Ok(Node {
                token,
                children: Vec::new(),
            })
        }
        _ => parse_expr(seg),
    }
}

/// `if (cond) { … } elsif (cond) { … } else { … }`
/// Children: condition, body block, then optionally a nested If (elsif
/// chain) or an else block.
fn parse_if(seg: Vec<Node>) -> Result<Node, ParseFault> {
    let line = seg[0].line();
    if seg.len() < 3 || seg[1].tok() != Tok::LPar || seg[2].tok() != Tok::LCurl {
        return fault("parse error in if statement", line);
    }
    let mut it = seg.into_iter();
    it.next(); // if / elsif
    let cond = parse_expr(it.next().expect("checked above").children)?;
    let body = Node::new(
        Tok::Block,
        line,
        parse_block(it.next().expect("checked above").children)?,
    );
    let rest: Vec<Node> = it.collect();
    let mut children = vec![cond, body];
    if !rest.is_empty() {
        match rest[0].tok() {
            Tok::Elsif => children.push(parse_if(rest)?),
            Tok::Else => {
                if rest.len() != 2 || rest[1].tok() != Tok::LCurl {
                    return fault("parse error in else clause", rest[0].line());
                }
                let mut it = rest.into_iter();
                it.next();
                let blk = it.next().expect("checked above");
                children.push(Node::new(Tok::Block, blk.line(), parse_block(blk.children)?));
            }
            _ => return fault("parse error after if body", rest[0].line()),
        }
    }
    Ok(Node::new(Tok::If, line, children))
}

/// An optional `name:` label followed by the loop body block.
fn parse_loop_body(rest: Vec<Node>, line: u32) -> Result<(Option<Vec<u8>>, Node), ParseFault> {
    let (label, body) = match rest.len() {
        1 if rest[0].tok() == Tok::LCurl => (None, &rest[0]),
        3 if rest[0].tok() == Tok::Symbol
            && rest[1].tok() == Tok::Colon
            && rest[2].tok() == Tok::LCurl =>
        {
            (Some(rest[0].bytes().to_vec()), &rest[2])
        }
        _ => return fault("parse error in loop body", line),
    };
    let block = Node::new(Tok::Block, body.line(), parse_block(body.children.clone())?);
    Ok((label, block))
}

/// `while (cond) body`
fn parse_cond_loop(kind: Tok, seg: Vec<Node>) -> Result<Node, ParseFault> {
    let line = seg[0].line();
    if seg.len() < 2 || seg[1].tok() != Tok::LPar {
        return fault("parse error in loop", line);
    }
    let mut it = seg.into_iter();
    it.next();
    let cond = parse_expr(it.next().expect("checked above").children)?;
    let (label, body) = parse_loop_body(it.collect(), line)?;
    let mut token = Token::bare(kind, line);
    token.str_ = label;
    Ok(Node {
        token,
        children: vec![cond, body],
    })
}

/// `foreach (var; vector) body` and `forindex (var; vector) body`
fn parse_each_loop(kind: Tok, seg: Vec<Node>) -> Result<Node, ParseFault> {
    let line = seg[0].line();
    if seg.len() < 2 || seg[1].tok() != Tok::LPar {
        return fault("parse error in loop", line);
    }
    let mut it = seg.into_iter();
    it.next();
    let head = it.next().expect("checked above");
    let mut parts = split_on(head.children, Tok::Semi);
    if parts.len() != 2 {
        return fault("parse error in loop header", line);
    }
    let vec_expr = parse_expr(parts.pop().expect("two parts"))?;
    let var_expr = parse_expr(parts.pop().expect("two parts"))?;
    let (label, body) = parse_loop_body(it.collect(), line)?;
    let mut token = Token::bare(kind, line);
    token.str_ = label;
    Ok(Node {
        token,
        children: vec![var_expr, vec_expr, body],
    })
}

/// `for (init; cond; update) body`
fn parse_for(seg: Vec<Node>) -> Result<Node, ParseFault> {
    let line = seg[0].line();
    if seg.len() < 2 || seg[1].tok() != Tok::LPar {
        return fault("parse error in for loop", line);
    }
    let mut it = seg.into_iter();
    it.next();
    let head = it.next().expect("checked above");
    let parts = split_on(head.children, Tok::Semi);
    if parts.len() != 3 {
        return fault("parse error in for loop header", line);
    }
    let mut exprs = Vec::with_capacity(3);
    for part in parts {
        exprs.push(parse_expr(part)?);
    }
    let (label, body) = parse_loop_body(it.collect(), line)?;
    exprs.push(body);
    let mut token = Token::bare(Tok::For, line);
    token.str_ = label;
    Ok(Node {
        token,
        children: exprs,
    })
}

/// Parse an expression from a sibling list.
pub fn parse_expr(nodes: Vec<Node>) -> Result<Node, ParseFault> {
    let line = nodes.first().map(|n| n.line()).unwrap_or(0);
    fold(nodes, 0, line)
}

/// `func` literals are structural, not operators: consume
/// `func [(params)] { body }` at the head of the list and splice the
/// finished node back in.
fn restructure_func(mut nodes: Vec<Node>) -> Result<Vec<Node>, ParseFault> {
    let line = nodes[0].line();
    nodes.remove(0);
    let mut children = Vec::new();
    if !nodes.is_empty() && nodes[0].tok() == Tok::LPar {
        let params = nodes.remove(0);
        let mut items = Vec::new();
        for seg in split_on(params.children, Tok::Comma) {
            if seg.is_empty() {
                continue;
            }
            items.push(parse_expr(seg)?);
        }
        children.push(Node::new(Tok::List, line, items));
    }
    if nodes.is_empty() || nodes[0].tok() != Tok::LCurl {
        return fault("parse error in func body", line);
    }
    let body = nodes.remove(0);
    children.push(Node::new(Tok::Block, body.line(), parse_block(body.children)?));
    nodes.insert(0, Node::new(Tok::Func, line, children));
    Ok(nodes)
}

fn fold(mut nodes: Vec<Node>, level: usize, hint: u32) -> Result<Node, ParseFault> {
    if !nodes.is_empty() && nodes[0].tok() == Tok::Func && nodes[0].children.is_empty() {
        nodes = restructure_func(nodes)?;
    }

    if level >= LEVELS.len() {
        return match nodes.len() {
            0 => Ok(Node::empty(hint)),
            1 => finalize(nodes.pop().expect("length checked")),
            _ => fault("parse error", nodes[1].line()),
        };
    }

    let (toks, rule) = LEVELS[level];
    match rule {
        Rule::Binary => {
            let mut found = None;
            for i in (1..nodes.len()).rev() {
                if toks.contains(&nodes[i].tok()) && nodes[i].children.is_empty() {
                    found = Some(i);
                    break;
                }
            }
            let i = match found {
                Some(i) => i,
                None => return fold(nodes, level + 1, hint),
            };
            if i == nodes.len() - 1 {
                return fault("missing operand", nodes[i].line());
            }
            let rhs: Vec<Node> = nodes.split_off(i + 1);
            let op = nodes.pop().expect("operator exists");
            let left = fold(nodes, level, op.line())?;
            let right = fold(rhs, level + 1, op.line())?;
            Ok(Node {
                token: op.token,
                children: vec![left, right],
            })
        }
        Rule::Reverse => {
            let mut found = None;
            for (i, n) in nodes.iter().enumerate() {
                if toks.contains(&n.tok()) && n.children.is_empty() {
                    found = Some(i);
                    break;
                }
            }
            let i = match found {
                Some(i) => i,
                None => return fold(nodes, level + 1, hint),
            };
            let op_line = nodes[i].line();
            let op_tok = nodes[i].tok();
            // Only a slice `:` may go without an operand on either side.
            if (i == 0 || i == nodes.len() - 1) && op_tok != Tok::Colon {
                return fault("missing operand", op_line);
            }
            let rhs: Vec<Node> = nodes.split_off(i + 1);
            let op = nodes.pop().expect("operator exists");
            let left = fold(nodes, level + 1, op_line)?;
            let right = fold(rhs, level, op_line)?;
            Ok(Node {
                token: op.token,
                children: vec![left, right],
            })
        }
        Rule::Prefix => {
            if nodes.len() > 1 && toks.contains(&nodes[0].tok()) && nodes[0].children.is_empty() {
                let mut op = nodes.remove(0);
                // Prefix minus and tilde mean negation and complement.
                op.token.tok = match op.token.tok {
                    Tok::Minus => Tok::Neg,
                    Tok::Cat => Tok::BitNeg,
                    other => other,
                };
                let operand = fold(nodes, level, op.line())?;
                Ok(Node {
                    token: op.token,
                    children: vec![operand],
                })
            } else {
                fold(nodes, level + 1, hint)
            }
        }
        Rule::Suffix => {
            let mut found = None;
            for i in (1..nodes.len()).rev() {
                if toks.contains(&nodes[i].tok()) {
                    found = Some(i);
                    break;
                }
            }
            let i = match found {
                Some(i) => i,
                None => return fold(nodes, level + 1, hint),
            };
            let line = nodes[i].line();
            match nodes[i].tok() {
                Tok::Dot | Tok::NullAccess => {
                    if i + 2 != nodes.len() || nodes[i + 1].tok() != Tok::Symbol {
                        return fault("parse error in member access", line);
                    }
                    let field = nodes.pop().expect("length checked");
                    let op = nodes.remove(i);
                    let left = fold(nodes, level, line)?;
                    Ok(Node {
                        token: op.token,
                        children: vec![left, field],
                    })
                }
                Tok::Ellipsis => {
                    if i + 1 != nodes.len() {
                        return fault("parse error", line);
                    }
                    let op = nodes.pop().expect("length checked");
                    let left = fold(nodes, level, line)?;
                    Ok(Node {
                        token: op.token,
                        children: vec![left],
                    })
                }
                Tok::LPar => {
                    if i + 1 != nodes.len() {
                        return fault("parse error", line);
                    }
                    let args_node = nodes.pop().expect("length checked");
                    let callee = fold(nodes, level, line)?;
                    let mut children = vec![callee];
                    for seg in split_on(args_node.children, Tok::Comma) {
                        if seg.is_empty() {
                            continue;
                        }
                        children.push(parse_expr(seg)?);
                    }
                    Ok(Node::new(Tok::Call, line, children))
                }
                Tok::LBra => {
                    if i + 1 != nodes.len() {
                        return fault("parse error", line);
                    }
                    let idx_node = nodes.pop().expect("length checked");
                    let base = fold(nodes, level, line)?;
                    let mut children = vec![base];
                    for seg in split_on(idx_node.children, Tok::Comma) {
                        if seg.is_empty() {
                            continue;
                        }
                        children.push(parse_expr(seg)?);
                    }
                    if children.len() < 2 {
                        return fault("empty index", line);
                    }
                    Ok(Node::new(Tok::Idx, line, children))
                }
                _ => fault("parse error", line),
            }
        }
    }
}

/// Turn a leftover primary into its structured form.
fn finalize(n: Node) -> Result<Node, ParseFault> {
    let line = n.line();
    match n.tok() {
        Tok::Symbol | Tok::Literal | Tok::Nil | Tok::Empty => Ok(n),
        // Already-structured nodes pass through.
        Tok::Func | Tok::Call | Tok::Idx | Tok::VecLit | Tok::HashLit | Tok::List
        | Tok::Block => Ok(n),
        Tok::LPar => {
            let mut segs: Vec<Vec<Node>> = split_on(n.children, Tok::Comma)
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect();
            match segs.len() {
                0 => Ok(Node::new(Tok::List, line, Vec::new())),
                1 => parse_expr(segs.pop().expect("length checked")),
                _ => {
                    let mut items = Vec::new();
                    for seg in segs {
                        items.push(parse_expr(seg)?);
                    }
                    Ok(Node::new(Tok::List, line, items))
                }
            }
        }
        Tok::LBra => {
            let mut items = Vec::new();
            for seg in split_on(n.children, Tok::Comma) {
                if seg.is_empty() {
                    continue;
                }
                items.push(parse_expr(seg)?);
            }
            Ok(Node::new(Tok::VecLit, line, items))
        }
        Tok::LCurl => {
            let mut pairs = Vec::new();
            for seg in split_on(n.children, Tok::Comma) {
                if seg.is_empty() {
                    continue;
                }
                pairs.push(parse_expr(seg)?);
            }
            Ok(Node::new(Tok::HashLit, line, pairs))
        }
        _ => fault("parse error", line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::lexer::lex;

    fn tree(src: &str) -> Node {
        parse(lex(src).unwrap()).unwrap()
    }

    fn stmt(src: &str) -> Node {
        let mut t = tree(src);
        assert_eq!(t.children.len(), 1, "expected one statement in {:?}", src);
        t.children.pop().unwrap()
    }

    #[test]
    fn precedence_shapes() {
        // a + b * c => Plus(a, Mul(b, c))
        let n = stmt("a + b * c;");
        assert_eq!(n.tok(), Tok::Plus);
        assert_eq!(n.children[1].tok(), Tok::Mul);

        // a * b + c => Plus(Mul(a, b), c)
        let n = stmt("a * b + c;");
        assert_eq!(n.tok(), Tok::Plus);
        assert_eq!(n.children[0].tok(), Tok::Mul);
    }

    #[test]
    fn concat_binds_with_mul_div() {
        // 1 - 2 ~ 3 => Minus(1, Cat(2, 3)): `~` is tighter than `+`/`-`.
        let n = stmt("1 - 2 ~ 3;");
        assert_eq!(n.tok(), Tok::Minus);
        assert_eq!(n.children[1].tok(), Tok::Cat);

        // 2 * 3 ~ x => Cat(Mul(2, 3), x): `~` shares the `*`/`/` level.
        let n = stmt("2 * 3 ~ x;");
        assert_eq!(n.tok(), Tok::Cat);
        assert_eq!(n.children[0].tok(), Tok::Mul);
    }

    #[test]
    fn relational_and_equality_share_a_level() {
        // a == b < c => Lt(Eq(a, b), c)
        let n = stmt("a == b < c;");
        assert_eq!(n.tok(), Tok::Lt);
        assert_eq!(n.children[0].tok(), Tok::Eq);

        // a < b == c => Eq(Lt(a, b), c)
        let n = stmt("a < b == c;");
        assert_eq!(n.tok(), Tok::Eq);
        assert_eq!(n.children[0].tok(), Tok::Lt);
    }

    #[test]
    fn left_associative_subtraction() {
        // a - b - c => Minus(Minus(a, b), c)
        let n = stmt("a - b - c;");
        assert_eq!(n.tok(), Tok::Minus);
        assert_eq!(n.children[0].tok(), Tok::Minus);
        assert_eq!(n.children[1].tok(), Tok::Symbol);
    }

    #[test]
    fn right_associative_assignment() {
        // a = b = c => Assign(a, Assign(b, c))
        let n = stmt("a = b = c;");
        assert_eq!(n.tok(), Tok::Assign);
        assert_eq!(n.children[1].tok(), Tok::Assign);
    }

    #[test]
    fn unary_minus_via_rewrite() {
        // a * -2 => Mul(a, Neg(2))
        let n = stmt("a * -2;");
        assert_eq!(n.tok(), Tok::Mul);
        assert_eq!(n.children[1].tok(), Tok::Neg);
        assert_eq!(n.children[1].children[0].tok(), Tok::Literal);
    }

    #[test]
    fn ternary_shape() {
        let n = stmt("a ? b : c;");
        assert_eq!(n.tok(), Tok::Question);
        assert_eq!(n.children[1].tok(), Tok::Colon);
    }

    #[test]
    fn call_member_index_chain() {
        // a.b(c)[0] => Idx(Call(Dot(a, b), c), 0)
        let n = stmt("a.b(c)[0];");
        assert_eq!(n.tok(), Tok::Idx);
        let call = &n.children[0];
        assert_eq!(call.tok(), Tok::Call);
        assert_eq!(call.children[0].tok(), Tok::Dot);
        assert_eq!(call.children.len(), 2);
    }

    #[test]
    fn grouping_dissolves() {
        let n = stmt("(a + b) * c;");
        assert_eq!(n.tok(), Tok::Mul);
        assert_eq!(n.children[0].tok(), Tok::Plus);
    }

    #[test]
    fn func_literal_shape() {
        let n = stmt("var f = func(x) { return x; };");
        assert_eq!(n.tok(), Tok::Assign);
        let f = &n.children[1];
        assert_eq!(f.tok(), Tok::Func);
        assert_eq!(f.children.len(), 2);
        assert_eq!(f.children[0].tok(), Tok::List);
        assert_eq!(f.children[1].tok(), Tok::Block);
    }

    #[test]
    fn func_without_params() {
        let n = stmt("var f = func { return 1; };");
        let f = &n.children[1];
        assert_eq!(f.tok(), Tok::Func);
        assert_eq!(f.children.len(), 1);
        assert_eq!(f.children[0].tok(), Tok::Block);
    }

    #[test]
    fn if_elsif_else_chain() {
        let n = stmt("if (a) { b; } elsif (c) { d; } else { e; }");
        assert_eq!(n.tok(), Tok::If);
        assert_eq!(n.children.len(), 3);
        let elsif = &n.children[2];
        assert_eq!(elsif.tok(), Tok::If);
        assert_eq!(elsif.children.len(), 3);
        assert_eq!(elsif.children[2].tok(), Tok::Block);
    }

    #[test]
    fn loops_parse() {
        let n = stmt("for (var i = 0; i < 3; i += 1) { x; }");
        assert_eq!(n.tok(), Tok::For);
        assert_eq!(n.children.len(), 4);

        let n = stmt("foreach (var e; v) { e; }");
        assert_eq!(n.tok(), Tok::Foreach);
        assert_eq!(n.children.len(), 3);

        let n = stmt("while (a) outer: { break outer; }");
        assert_eq!(n.tok(), Tok::While);
        assert_eq!(n.token.str_.as_deref(), Some(&b"outer"[..]));
    }

    #[test]
    fn hash_and_vector_literals() {
        let n = stmt("var h = {a: 1, b: 2};");
        let h = &n.children[1];
        assert_eq!(h.tok(), Tok::HashLit);
        assert_eq!(h.children.len(), 2);
        assert_eq!(h.children[0].tok(), Tok::Colon);

        let n = stmt("var v = [1, 2, 3];");
        assert_eq!(n.children[1].tok(), Tok::VecLit);
        assert_eq!(n.children[1].children.len(), 3);
    }

    #[test]
    fn slices_allow_open_ends() {
        let n = stmt("v[1:, :2, 3:4];");
        assert_eq!(n.tok(), Tok::Idx);
        assert_eq!(n.children.len(), 4);
        assert_eq!(n.children[1].tok(), Tok::Colon);
        assert_eq!(n.children[1].children[1].tok(), Tok::Empty);
        assert_eq!(n.children[2].children[0].tok(), Tok::Empty);
    }

    #[test]
    fn multi_assignment_targets() {
        let n = stmt("(a, b) = f();");
        assert_eq!(n.tok(), Tok::Assign);
        assert_eq!(n.children[0].tok(), Tok::List);
        assert_eq!(n.children[0].children.len(), 2);
    }

    #[test]
    fn variadic_parameter() {
        let n = stmt("var f = func(a, rest...) { a; };");
        let params = &n.children[1].children[0];
        assert_eq!(params.children.len(), 2);
        assert_eq!(params.children[1].tok(), Tok::Ellipsis);
    }

    #[test]
    fn bracket_errors() {
        assert!(parse(lex("(a;").unwrap()).is_err());
        assert!(parse(lex("a];").unwrap()).is_err());
        assert!(parse(lex("(a];").unwrap()).is_err());
    }

    #[test]
    fn missing_operand_errors() {
        assert!(parse(lex("a + ;").unwrap()).is_err());
        assert!(parse(lex("a b;").unwrap()).is_err());
    }

    #[test]
    fn null_safe_and_coalesce() {
        let n = stmt("a?.b;");
        assert_eq!(n.tok(), Tok::NullAccess);
        let n = stmt("a ?? b;");
        assert_eq!(n.tok(), Tok::NullChain);
    }
}
