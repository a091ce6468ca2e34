//! Small arithmetic expression language used by custom calibrations and
//! composite equations.
//!
//! Expressions are compiled once against a fixed list of variable names and then
//! evaluated per pixel with a slice of values, indexed in the same order as the
//! variable names.
//!
//! Supported syntax: numbers (`1`, `0.5`, `1e-3`), variables, `+ - * / ^`
//! (`^` is right associative), unary minus, parentheses, the constants `pi` and
//! `e`, and the functions `abs sqrt exp ln log10 log sin cos tan asin acos atan
//! atan2 pow min max clamp floor ceil round`.
//!
//! # Example
//! ```
//! use satproducts::expr::Expression;
//!
//! let expr = Expression::parse("2 * val ^ 2 + line", &["val", "line"]).unwrap();
//! assert_eq!(expr.eval(&[3.0, 1.0]), 19.0);
//! ```
use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Ident(usize, usize),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    Eof,
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn error(&self, msg: impl Into<String>) -> Error {
        Error::Expression {
            pos: self.pos,
            message: msg.into(),
        }
    }

    /// Returns the token and the offset it started at.
    fn next_token(&mut self) -> Result<(Token, usize)> {
        while self.peek_byte().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
        let start = self.pos;
        let Some(b) = self.peek_byte() else {
            return Ok((Token::Eof, start));
        };

        let tok = match b {
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => Token::Star,
            b'/' => Token::Slash,
            b'^' => Token::Caret,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b',' => Token::Comma,
            b'0'..=b'9' | b'.' => return Ok((self.read_number()?, start)),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while self
                    .peek_byte()
                    .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
                {
                    self.pos += 1;
                }
                return Ok((Token::Ident(start, self.pos), start));
            }
            _ => return Err(self.error(format!("unexpected character: {:?}", b as char))),
        };
        self.pos += 1;
        Ok((tok, start))
    }

    fn read_number(&mut self) -> Result<Token> {
        let start = self.pos;
        while self
            .peek_byte()
            .is_some_and(|b| b.is_ascii_digit() || b == b'.')
        {
            self.pos += 1;
        }
        // exponent, only when followed by digits so `2e` stays an error
        if matches!(self.peek_byte(), Some(b'e' | b'E')) {
            let mut end = self.pos + 1;
            if matches!(self.input.get(end), Some(b'+' | b'-')) {
                end += 1;
            }
            if self.input.get(end).is_some_and(u8::is_ascii_digit) {
                self.pos = end;
                while self.peek_byte().is_some_and(|b| b.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|err| self.error(err.to_string()))?;
        text.parse::<f64>()
            .map(Token::Num)
            .map_err(|_| Error::Expression {
                pos: start,
                message: format!("invalid number: {text}"),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Abs,
    Sqrt,
    Exp,
    Ln,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Pow,
    Min,
    Max,
    Clamp,
    Floor,
    Ceil,
    Round,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Self::Abs,
            "sqrt" => Self::Sqrt,
            "exp" => Self::Exp,
            "ln" | "log" => Self::Ln,
            "log10" => Self::Log10,
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "asin" => Self::Asin,
            "acos" => Self::Acos,
            "atan" => Self::Atan,
            "atan2" => Self::Atan2,
            "pow" => Self::Pow,
            "min" => Self::Min,
            "max" => Self::Max,
            "clamp" => Self::Clamp,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "round" => Self::Round,
            _ => return None,
        })
    }

    /// Minimum and maximum number of arguments.
    fn arity(self) -> (usize, usize) {
        match self {
            Self::Atan2 | Self::Pow => (2, 2),
            Self::Min | Self::Max => (2, usize::MAX),
            Self::Clamp => (3, 3),
            _ => (1, 1),
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Self::Abs => args[0].abs(),
            Self::Sqrt => args[0].sqrt(),
            Self::Exp => args[0].exp(),
            Self::Ln => args[0].ln(),
            Self::Log10 => args[0].log10(),
            Self::Sin => args[0].sin(),
            Self::Cos => args[0].cos(),
            Self::Tan => args[0].tan(),
            Self::Asin => args[0].asin(),
            Self::Acos => args[0].acos(),
            Self::Atan => args[0].atan(),
            Self::Atan2 => args[0].atan2(args[1]),
            Self::Pow => args[0].powf(args[1]),
            Self::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Clamp => args[0].max(args[1]).min(args[2]),
            Self::Floor => args[0].floor(),
            Self::Ceil => args[0].ceil(),
            Self::Round => args[0].round(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Const(f64),
    Var(usize),
    Neg(Box<Node>),
    Binary(Op, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

impl Node {
    fn eval(&self, values: &[f64]) -> f64 {
        match self {
            Node::Const(v) => *v,
            Node::Var(idx) => values.get(*idx).copied().unwrap_or(f64::NAN),
            Node::Neg(n) => -n.eval(values),
            Node::Binary(op, a, b) => {
                let (a, b) = (a.eval(values), b.eval(values));
                match op {
                    Op::Add => a + b,
                    Op::Sub => a - b,
                    Op::Mul => a * b,
                    Op::Div => a / b,
                    Op::Pow => a.powf(b),
                }
            }
            Node::Call(func, args) => {
                let args: Vec<f64> = args.iter().map(|a| a.eval(values)).collect();
                func.apply(&args)
            }
        }
    }

    fn collect_vars(&self, out: &mut Vec<usize>) {
        match self {
            Node::Const(_) => (),
            Node::Var(idx) => out.push(*idx),
            Node::Neg(n) => n.collect_vars(out),
            Node::Binary(_, a, b) => {
                a.collect_vars(out);
                b.collect_vars(out);
            }
            Node::Call(_, args) => args.iter().for_each(|a| a.collect_vars(out)),
        }
    }
}

/// Deepest syntax tree a parse may build, counting both nesting and chained
/// binary operators.
const MAX_DEPTH: usize = 256;

struct Parser<'a, S> {
    source: &'a str,
    lexer: Lexer<'a>,
    variables: &'a [S],
    tok: Token,
    tok_pos: usize,
    depth: usize,
}

impl<'a, S: AsRef<str>> Parser<'a, S> {
    fn new(source: &'a str, variables: &'a [S]) -> Result<Self> {
        let mut lexer = Lexer::new(source);
        let (tok, tok_pos) = lexer.next_token()?;
        Ok(Self {
            source,
            lexer,
            variables,
            tok,
            tok_pos,
            depth: 0,
        })
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!("expression nested deeper than {MAX_DEPTH}")));
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Token> {
        let prev = self.tok;
        (self.tok, self.tok_pos) = self.lexer.next_token()?;
        Ok(prev)
    }

    fn error(&self, msg: impl Into<String>) -> Error {
        Error::Expression {
            pos: self.tok_pos,
            message: msg.into(),
        }
    }

    fn expect(&mut self, tok: Token, what: &str) -> Result<()> {
        if self.tok != tok {
            return Err(self.error(format!("expected {what}")));
        }
        self.advance()?;
        Ok(())
    }

    fn list(&mut self) -> Result<Vec<Node>> {
        let mut nodes = vec![self.expr()?];
        while self.tok == Token::Comma {
            self.advance()?;
            nodes.push(self.expr()?);
        }
        if self.tok != Token::Eof {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(nodes)
    }

    fn expr(&mut self) -> Result<Node> {
        let depth = self.depth;
        let mut lhs = self.term()?;
        loop {
            let op = match self.tok {
                Token::Plus => Op::Add,
                Token::Minus => Op::Sub,
                _ => {
                    self.depth = depth;
                    return Ok(lhs);
                }
            };
            self.advance()?;
            self.descend()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(self.term()?));
        }
    }

    fn term(&mut self) -> Result<Node> {
        let depth = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.tok {
                Token::Star => Op::Mul,
                Token::Slash => Op::Div,
                _ => {
                    self.depth = depth;
                    return Ok(lhs);
                }
            };
            self.advance()?;
            self.descend()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Node> {
        self.descend()?;
        let node = match self.tok {
            Token::Minus => {
                self.advance()?;
                Node::Neg(Box::new(self.unary()?))
            }
            Token::Plus => {
                self.advance()?;
                self.unary()?
            }
            _ => self.power()?,
        };
        self.depth -= 1;
        Ok(node)
    }

    fn power(&mut self) -> Result<Node> {
        let base = self.atom()?;
        if self.tok != Token::Caret {
            return Ok(base);
        }
        self.advance()?;
        let exp = self.unary()?;
        Ok(Node::Binary(Op::Pow, Box::new(base), Box::new(exp)))
    }

    fn atom(&mut self) -> Result<Node> {
        let pos = self.tok_pos;
        match self.advance()? {
            Token::Num(v) => Ok(Node::Const(v)),
            Token::LParen => {
                let node = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(node)
            }
            Token::Ident(start, end) => {
                let name = &self.source[start..end];
                if self.tok == Token::LParen {
                    return self.call(name, pos);
                }
                if let Some(idx) = self.variables.iter().position(|v| v.as_ref() == name) {
                    return Ok(Node::Var(idx));
                }
                match name {
                    "pi" => Ok(Node::Const(std::f64::consts::PI)),
                    "e" => Ok(Node::Const(std::f64::consts::E)),
                    _ => Err(Error::Expression {
                        pos,
                        message: format!("unknown variable: {name}"),
                    }),
                }
            }
            Token::Eof => Err(Error::Expression {
                pos,
                message: "unexpected end of expression".into(),
            }),
            tok => Err(Error::Expression {
                pos,
                message: format!("unexpected token: {tok:?}"),
            }),
        }
    }

    fn call(&mut self, name: &str, pos: usize) -> Result<Node> {
        let Some(func) = Func::lookup(name) else {
            return Err(Error::Expression {
                pos,
                message: format!("unknown function: {name}"),
            });
        };
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if self.tok != Token::RParen {
            args.push(self.expr()?);
            while self.tok == Token::Comma {
                self.advance()?;
                args.push(self.expr()?);
            }
        }
        self.expect(Token::RParen, "')'")?;

        let (min, max) = func.arity();
        if args.len() < min || args.len() > max {
            return Err(Error::Expression {
                pos,
                message: format!("{name} takes {min} argument(s), got {}", args.len()),
            });
        }
        Ok(Node::Call(func, args))
    }
}

/// A compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
    used: Vec<usize>,
}

impl Expression {
    fn from_node(source: &str, root: Node) -> Self {
        let mut used = Vec::new();
        root.collect_vars(&mut used);
        used.sort_unstable();
        used.dedup();
        Self {
            source: source.to_string(),
            root,
            used,
        }
    }

    /// Compile a single expression. Identifiers resolve to their index in `variables`.
    ///
    /// # Errors
    /// [Error::Expression] on syntax errors, unknown variables or functions, and
    /// comma separated lists.
    pub fn parse<S: AsRef<str>>(source: &str, variables: &[S]) -> Result<Self> {
        let mut nodes = Parser::new(source, variables)?.list()?;
        if nodes.len() != 1 {
            return Err(Error::Expression {
                pos: 0,
                message: format!("expected 1 expression, got {}", nodes.len()),
            });
        }
        Ok(Self::from_node(source, nodes.remove(0)))
    }

    /// Compile a comma separated list of expressions, e.g., `"ch2, ch2, ch1"`.
    ///
    /// # Errors
    /// See [Expression::parse].
    pub fn parse_list<S: AsRef<str>>(source: &str, variables: &[S]) -> Result<Vec<Self>> {
        Ok(Parser::new(source, variables)?
            .list()?
            .into_iter()
            .map(|node| Self::from_node(source, node))
            .collect())
    }

    /// Evaluate with `values` indexed like the variables used to compile. Missing
    /// values evaluate as NaN.
    #[must_use]
    pub fn eval(&self, values: &[f64]) -> f64 {
        self.root.eval(values)
    }

    /// Sorted, deduplicated indexes of the variables this expression references.
    #[must_use]
    pub fn used_variables(&self) -> &[usize] {
        &self.used
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
