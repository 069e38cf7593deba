//! Client-side predicate expressions.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or   -> and ( "||" and )*
//! and  -> eq ( "&&" eq )*
//! eq   -> rel ( ("==" | "!=") rel )*
//! rel  -> add ( (">" | "<" | ">=" | "<=") add )*
//! add  -> mul ( ("+" | "-") mul )*
//! mul  -> unary ( ("*" | "/") unary )*
//! unary -> ("-" | "!") unary | primary
//! primary -> number | $variable | "(" or ")"
//! ```
//!
//! Booleans are 1.0 / 0.0. Any comparison or logical operator with a NaN
//! operand yields false, so a missing comparison never triggers.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown variable ${0}")]
    UnknownVariable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(f64),
    Var(String),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Number(f64),
    Var(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn lex(src: &str) -> Result<Vec<(Tok, usize)>, ExprError> {
    const OPS: &[&str] = &["||", "&&", "==", "!=", ">=", "<=", ">", "<", "+", "-", "*", "/", "!"];

    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut i = 0;

    'outer: while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' {
            tokens.push((Tok::LParen, pos));
            i += 1;
            continue;
        }
        if c == ')' {
            tokens.push((Tok::RParen, pos));
            i += 1;
            continue;
        }
        if c == '$' {
            let mut j = i + 1;
            while j < chars.len() && (chars[j].1.is_alphanumeric() || matches!(chars[j].1, '_' | '.')) {
                j += 1;
            }
            if j == i + 1 {
                return Err(ExprError::Syntax {
                    position: pos,
                    message: "empty variable name".into(),
                });
            }
            let name: String = chars[i + 1..j].iter().map(|(_, c)| *c).collect();
            tokens.push((Tok::Var(name), pos));
            i = j;
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            let mut j = i;
            while j < chars.len() {
                let d = chars[j].1;
                let exp_sign = matches!(d, '+' | '-') && matches!(chars[j - 1].1, 'e' | 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exp_sign {
                    j += 1;
                } else {
                    break;
                }
            }
            let end = chars.get(j).map(|(p, _)| *p).unwrap_or(src.len());
            let literal = &src[pos..end];
            let value = literal.parse::<f64>().map_err(|_| ExprError::Syntax {
                position: pos,
                message: format!("bad number {:?}", literal),
            })?;
            tokens.push((Tok::Number(value), pos));
            i = j;
            continue;
        }
        for op in OPS {
            if src[pos..].starts_with(op) {
                tokens.push((Tok::Op(*op), pos));
                i += op.chars().count();
                continue 'outer;
            }
        }
        return Err(ExprError::Syntax {
            position: pos,
            message: format!("unexpected character {:?}", c),
        });
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some((Tok::Op(op), _)) => Some(*op),
            _ => None,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        let position = self.tokens.get(self.pos).map(|(_, p)| *p).unwrap_or(self.len);
        ExprError::Syntax {
            position,
            message: message.into(),
        }
    }

    fn binary(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Parser) -> Result<Node, ExprError>,
    ) -> Result<Node, ExprError> {
        let mut left = next(self)?;
        while let Some(op) = self.peek_op() {
            let Some((_, bin)) = ops.iter().find(|(s, _)| *s == op) else {
                break;
            };
            self.pos += 1;
            let right = next(self)?;
            left = Node::Binary(*bin, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Node, ExprError> {
        self.binary(&[("||", BinOp::Or)], Parser::and)
    }

    fn and(&mut self) -> Result<Node, ExprError> {
        self.binary(&[("&&", BinOp::And)], Parser::eq)
    }

    fn eq(&mut self) -> Result<Node, ExprError> {
        self.binary(&[("==", BinOp::Eq), ("!=", BinOp::Ne)], Parser::rel)
    }

    fn rel(&mut self) -> Result<Node, ExprError> {
        self.binary(
            &[(">", BinOp::Gt), ("<", BinOp::Lt), (">=", BinOp::Ge), ("<=", BinOp::Le)],
            Parser::add,
        )
    }

    fn add(&mut self) -> Result<Node, ExprError> {
        self.binary(&[("+", BinOp::Add), ("-", BinOp::Sub)], Parser::mul)
    }

    fn mul(&mut self) -> Result<Node, ExprError> {
        self.binary(&[("*", BinOp::Mul), ("/", BinOp::Div)], Parser::unary)
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        match self.peek_op() {
            Some("-") => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.unary()?)))
            }
            Some("!") => {
                self.pos += 1;
                Ok(Node::Not(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        match token {
            Some(Tok::Number(v)) => {
                self.pos += 1;
                Ok(Node::Number(v))
            }
            Some(Tok::Var(name)) => {
                self.pos += 1;
                Ok(Node::Var(name))
            }
            Some(Tok::LParen) => {
                self.pos += 1;
                let inner = self.or()?;
                match self.tokens.get(self.pos) {
                    Some((Tok::RParen, _)) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(_) => Err(self.error("unexpected token")),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

/// A parsed predicate, evaluated against variable bindings
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    root: Node,
}

fn truth(v: bool) -> f64 {
    if v {
        1.0
    } else {
        0.0
    }
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr, ExprError> {
        let tokens = lex(src)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            len: src.len(),
        };
        let root = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing input"));
        }
        Ok(Expr { root })
    }

    /// Names of every `$variable` referenced
    pub fn variables(&self) -> Vec<String> {
        fn walk(node: &Node, out: &mut Vec<String>) {
            match node {
                Node::Number(_) => {}
                Node::Var(name) => {
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
                Node::Neg(inner) | Node::Not(inner) => walk(inner, out),
                Node::Binary(_, l, r) => {
                    walk(l, out);
                    walk(r, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out
    }

    pub fn eval(&self, vars: &HashMap<String, f64>) -> Result<f64, ExprError> {
        eval_node(&self.root, vars)
    }

    /// Evaluate and interpret the result as a trigger: non-zero and not NaN
    pub fn is_true(&self, vars: &HashMap<String, f64>) -> Result<bool, ExprError> {
        let v = self.eval(vars)?;
        Ok(!v.is_nan() && v != 0.0)
    }
}

fn eval_node(node: &Node, vars: &HashMap<String, f64>) -> Result<f64, ExprError> {
    Ok(match node {
        Node::Number(v) => *v,
        Node::Var(name) => *vars
            .get(name)
            .ok_or_else(|| ExprError::UnknownVariable(name.clone()))?,
        Node::Neg(inner) => -eval_node(inner, vars)?,
        Node::Not(inner) => {
            let v = eval_node(inner, vars)?;
            truth(!v.is_nan() && v == 0.0)
        }
        Node::Binary(op, l, r) => {
            let a = eval_node(l, vars)?;
            let b = eval_node(r, vars)?;
            let either_nan = a.is_nan() || b.is_nan();
            match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Or => truth(!either_nan && (a != 0.0 || b != 0.0)),
                BinOp::And => truth(!either_nan && a != 0.0 && b != 0.0),
                BinOp::Eq => truth(!either_nan && a == b),
                BinOp::Ne => truth(!either_nan && a != b),
                BinOp::Gt => truth(!either_nan && a > b),
                BinOp::Lt => truth(!either_nan && a < b),
                BinOp::Ge => truth(!either_nan && a >= b),
                BinOp::Le => truth(!either_nan && a <= b),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn eval(src: &str, pairs: &[(&str, f64)]) -> f64 {
        Expr::parse(src).unwrap().eval(&vars(pairs)).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("$A * $B + $C", &[("A", 2.0), ("B", 3.0), ("C", 4.0)]), 10.0);
        assert_eq!(eval("$D - $A / $B", &[("D", 10.0), ("A", 4.0), ("B", 2.0)]), 8.0);
        assert_eq!(eval("$B / $C * $D", &[("B", 6.0), ("C", 2.0), ("D", 3.0)]), 9.0);
        assert_eq!(eval("-(1 + 2) * 2", &[]), -6.0);
        assert_eq!(eval("1.5e2 - 50", &[]), 100.0);
    }

    #[test]
    fn test_logical_operators() {
        let src = "($A.err_count >0&& $A.err_count <=3)||($B.err_count>0 && $B.err_count <=5)";
        assert_eq!(eval(src, &[("A.err_count", 4.0), ("B.err_count", 2.0)]), 1.0);
        assert_eq!(eval(src, &[("A.err_count", 4.0), ("B.err_count", 9.0)]), 0.0);
        assert_eq!(eval("!($current > 1)", &[("current", 0.0)]), 1.0);
    }

    #[test]
    fn test_comparison_with_missing_history() {
        let expr = Expr::parse("$current > 2 * $d1").unwrap();
        let bound = vars(&[("current", 5.0), ("d1", f64::NAN)]);
        assert!(!expr.is_true(&bound).unwrap());

        let ne = Expr::parse("$current != $d1").unwrap();
        assert!(!ne.is_true(&bound).unwrap());
        assert!(expr.is_true(&vars(&[("current", 5.0), ("d1", 2.0)])).unwrap());
    }

    #[test]
    fn test_variables_listed() {
        let expr = Expr::parse("$current > $d1 && $current > $w1 || $d1 > 0").unwrap();
        assert_eq!(expr.variables(), vec!["current", "d1", "w1"]);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(Expr::parse("$a +"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expr::parse("(1 + 2"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expr::parse("1 2"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expr::parse("1 % 2"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expr::parse("$"), Err(ExprError::Syntax { .. })));
        let expr = Expr::parse("$missing > 1").unwrap();
        assert_eq!(
            expr.eval(&HashMap::new()),
            Err(ExprError::UnknownVariable("missing".into()))
        );
    }
}
