//! Expression evaluator (spec §4.B).
//!
//! Parses and evaluates small arithmetic expressions over a closed set of
//! named float vectors (`offset`, `delay`, `freq`, `clockaccuracy`,
//! `freqchange`, `freqchangeabs`, `m`), with a closed set of reduction
//! functions (`mean`, `variance`, `stddev`, `abs`). Expressions are parsed
//! once at startup and cached as an AST (spec: "Parse is eager and cached");
//! [`Expr::eval`] never re-parses.

use std::collections::HashMap;

use crate::error::EvalError;

/// The only variable names an expression may reference. Anything else is a
/// parse-time error.
pub const VARIABLES: &[&str] = &[
    "offset",
    "delay",
    "freq",
    "clockaccuracy",
    "freqchange",
    "freqchangeabs",
    "m",
];

/// A named float vector bound to a variable name, newest-first (matching the
/// ring store's read order).
pub type Env<'a> = HashMap<&'static str, &'a [f64]>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Comma,
    LParen,
    RParen,
    Eof,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            chars: src.char_indices().peekable(),
            src,
        }
    }

    fn next_token(&mut self) -> Result<Token, EvalError> {
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }

        let (start, c) = match self.chars.next() {
            Some(pair) => pair,
            None => return Ok(Token::Eof),
        };

        match c {
            '+' => Ok(Token::Plus),
            '-' => Ok(Token::Minus),
            '*' => Ok(Token::Star),
            '/' => Ok(Token::Slash),
            ',' => Ok(Token::Comma),
            '(' => Ok(Token::LParen),
            ')' => Ok(Token::RParen),
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, c)) = self.chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        self.chars.next();
                        end = i + c.len_utf8();
                    } else {
                        break;
                    }
                }
                let text = &self.src[start..end];
                text.parse::<f64>()
                    .map(Token::Number)
                    .map_err(|_| EvalError::UnexpectedToken(text.to_string()))
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, c)) = self.chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        self.chars.next();
                        end = i + c.len_utf8();
                    } else {
                        break;
                    }
                }
                Ok(Token::Ident(self.src[start..end].to_string()))
            }
            other => Err(EvalError::UnexpectedToken(other.to_string())),
        }
    }
}

/// A parsed, cached expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Var(&'static str),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Abs(Box<Expr>),
    Mean(&'static str, usize),
    Variance(&'static str, usize),
    Stddev(&'static str, usize),
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Result<Self, EvalError> {
        let mut lexer = Lexer::new(src);
        let current = lexer.next_token()?;
        Ok(Parser { lexer, current })
    }

    fn bump(&mut self) -> Result<Token, EvalError> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn expect(&mut self, token: &Token) -> Result<(), EvalError> {
        if &self.current == token {
            self.bump()?;
            Ok(())
        } else {
            Err(EvalError::UnexpectedToken(format!("{:?}", self.current)))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_term()?;
        loop {
            match self.current {
                Token::Plus => {
                    self.bump()?;
                    lhs = Expr::Add(Box::new(lhs), Box::new(self.parse_term()?));
                }
                Token::Minus => {
                    self.bump()?;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(self.parse_term()?));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_unary()?;
        loop {
            match self.current {
                Token::Star => {
                    self.bump()?;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(self.parse_unary()?));
                }
                Token::Slash => {
                    self.bump()?;
                    lhs = Expr::Div(Box::new(lhs), Box::new(self.parse_unary()?));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.current == Token::Minus {
            self.bump()?;
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        if self.current == Token::Plus {
            self.bump()?;
            return self.parse_unary();
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, EvalError> {
        match self.bump()? {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.current == Token::LParen {
                    self.parse_call(&name)
                } else {
                    intern_variable(&name).map(Expr::Var)
                }
            }
            other => Err(EvalError::UnexpectedToken(format!("{:?}", other))),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Expr, EvalError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if self.current != Token::RParen {
            args.push(self.parse_expr()?);
            while self.current == Token::Comma {
                self.bump()?;
                args.push(self.parse_expr()?);
            }
        }
        self.expect(&Token::RParen)?;

        match name {
            "abs" => {
                require_arity("abs", 1, args.len())?;
                Ok(Expr::Abs(Box::new(args.into_iter().next().unwrap())))
            }
            "mean" | "variance" | "stddev" => {
                require_arity(name, 2, args.len())?;
                let mut args = args.into_iter();
                let var = match args.next().unwrap() {
                    Expr::Var(v) => v,
                    _ => {
                        return Err(EvalError::UnexpectedToken(format!(
                            "{name}() first argument must be a variable name"
                        )))
                    }
                };
                let n = match args.next().unwrap() {
                    Expr::Number(n) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                    other => {
                        return Err(EvalError::UnexpectedToken(format!(
                            "{name}() second argument must be a non-negative integer literal, got {other:?}"
                        )))
                    }
                };
                Ok(match name {
                    "mean" => Expr::Mean(var, n),
                    "variance" => Expr::Variance(var, n),
                    "stddev" => Expr::Stddev(var, n),
                    _ => unreachable!(),
                })
            }
            other => Err(EvalError::UnknownFunction(other.to_string())),
        }
    }
}

fn require_arity(function: &'static str, expected: usize, got: usize) -> Result<(), EvalError> {
    if expected == got {
        Ok(())
    } else {
        Err(EvalError::Arity {
            function,
            expected,
            got,
        })
    }
}

fn intern_variable(name: &str) -> Result<&'static str, EvalError> {
    VARIABLES
        .iter()
        .find(|&&v| v == name)
        .copied()
        .ok_or_else(|| EvalError::UnknownVariable(name.to_string()))
}

impl Expr {
    /// Parse and validate `src`. Unknown variables, unknown functions, and
    /// arity mismatches are reported here, not at evaluation time.
    pub fn parse(src: &str) -> Result<Expr, EvalError> {
        let mut parser = Parser::new(src)?;
        let expr = parser.parse_expr()?;
        if parser.current != Token::Eof {
            return Err(EvalError::UnexpectedToken(format!("{:?}", parser.current)));
        }
        Ok(expr)
    }

    /// The set of variable names this expression actually references, so
    /// callers can skip building parameter vectors the expression never
    /// reads.
    pub fn variables(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_variables(&self, out: &mut Vec<&'static str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Var(v) => out.push(v),
            Expr::Neg(a) | Expr::Abs(a) => a.collect_variables(out),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
            Expr::Mean(v, _) | Expr::Variance(v, _) | Expr::Stddev(v, _) => out.push(v),
        }
    }

    /// Evaluate this expression against `env`. Variables absent from `env`
    /// are treated as empty vectors (the reductions below already handle
    /// that gracefully by yielding `0.0`).
    pub fn eval(&self, env: &Env) -> f64 {
        match self {
            Expr::Number(n) => *n,
            Expr::Var(name) => env.get(name).and_then(|v| v.first()).copied().unwrap_or(0.0),
            Expr::Neg(a) => -a.eval(env),
            Expr::Add(a, b) => a.eval(env) + b.eval(env),
            Expr::Sub(a, b) => a.eval(env) - b.eval(env),
            Expr::Mul(a, b) => a.eval(env) * b.eval(env),
            Expr::Div(a, b) => a.eval(env) / b.eval(env),
            Expr::Abs(a) => a.eval(env).abs(),
            Expr::Mean(name, n) => mean(take_prefix(env, name, *n)),
            Expr::Variance(name, n) => variance(take_prefix(env, name, *n)),
            Expr::Stddev(name, n) => variance(take_prefix(env, name, *n)).sqrt(),
        }
    }
}

fn take_prefix<'a>(env: &Env<'a>, name: &str, n: usize) -> &'a [f64] {
    match env.get(name) {
        Some(v) if v.len() <= n => v,
        Some(v) => &v[..n],
        None => &[],
    }
}

/// Arithmetic mean. `0.0` for an empty slice.
fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population variance via Welford's online algorithm, for numerical
/// stability over the naive sum-of-squares formula. `0.0` for a slice of
/// length 0 or 1.
fn variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let mut mean = 0.0_f64;
    let mut m2 = 0.0_f64;
    let mut count = 0.0_f64;
    for &x in xs {
        count += 1.0;
        let delta = x - mean;
        mean += delta / count;
        let delta2 = x - mean;
        m2 += delta * delta2;
    }
    m2 / count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env1(name: &'static str, values: &'static [f64]) -> Env<'static> {
        let mut e = Env::new();
        e.insert(name, values);
        e
    }

    #[test]
    fn parses_default_m_expression() {
        let expr = Expr::parse(
            "mean(clockaccuracy,100) + abs(mean(offset,100)) + 1.0*stddev(offset,100)",
        )
        .unwrap();
        assert!(expr.variables().contains(&"clockaccuracy"));
        assert!(expr.variables().contains(&"offset"));
    }

    #[test]
    fn parses_default_w_expression() {
        Expr::parse("mean(m,100) + 4.0*stddev(m,100)").unwrap();
    }

    #[test]
    fn parses_default_drift_expression() {
        Expr::parse("1.5*mean(freqchangeabs,99)").unwrap();
    }

    #[test]
    fn rejects_unknown_variable() {
        let err = Expr::parse("bogus + 1").unwrap_err();
        assert!(matches!(err, EvalError::UnknownVariable(name) if name == "bogus"));
    }

    #[test]
    fn rejects_unknown_function() {
        let err = Expr::parse("median(offset, 10)").unwrap_err();
        assert!(matches!(err, EvalError::UnknownFunction(name) if name == "median"));
    }

    #[test]
    fn rejects_wrong_arity() {
        let err = Expr::parse("mean(offset)").unwrap_err();
        assert!(matches!(
            err,
            EvalError::Arity {
                function: "mean",
                expected: 2,
                ..
            }
        ));
    }

    #[test]
    fn mean_uses_whole_vector_if_shorter_than_n() {
        let expr = Expr::parse("mean(offset, 100)").unwrap();
        let env = env1("offset", &[2.0, 4.0, 6.0]);
        assert_eq!(expr.eval(&env), 4.0);
    }

    #[test]
    fn variance_matches_known_value() {
        let expr = Expr::parse("variance(offset, 4)").unwrap();
        let env = env1("offset", &[2.0, 4.0, 4.0, 4.0]);
        // population variance of [2,4,4,4] is 0.75
        assert!((expr.eval(&env) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn stddev_is_sqrt_of_variance() {
        let expr = Expr::parse("stddev(offset, 4)").unwrap();
        let env = env1("offset", &[2.0, 4.0, 4.0, 4.0]);
        assert!((expr.eval(&env) - 0.75_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn abs_negates_correctly() {
        let expr = Expr::parse("abs(-5.0)").unwrap();
        assert_eq!(expr.eval(&Env::new()), 5.0);
    }

    #[test]
    fn arithmetic_precedence_is_standard() {
        let expr = Expr::parse("2 + 3 * 4").unwrap();
        assert_eq!(expr.eval(&Env::new()), 14.0);
        let expr = Expr::parse("(2 + 3) * 4").unwrap();
        assert_eq!(expr.eval(&Env::new()), 20.0);
    }
}
