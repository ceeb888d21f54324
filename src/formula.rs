use std::fmt;

use anyhow::{Result, anyhow, bail};

/// Arithmetic over lettered terms, e.g. `(a + b) - (c + d)`.
///
/// Term `a` is bound to the first declared term, `b` to the second, and so on.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Var(usize),
    Num(f64),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            bail!("formula {source:?} has trailing input");
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Highest variable index referenced, if any.
    pub fn max_var(&self) -> Option<usize> {
        fn walk(e: &Expr) -> Option<usize> {
            match e {
                Expr::Var(i) => Some(*i),
                Expr::Num(_) => None,
                Expr::Neg(inner) => walk(inner),
                Expr::Add(l, r) | Expr::Sub(l, r) => walk(l).max(walk(r)),
            }
        }
        walk(&self.expr)
    }

    /// Evaluates with `terms[i]` bound to the i-th letter, floored at zero.
    ///
    /// Category buckets from the provider overlap after rounding, so a raw
    /// difference can dip below zero; counts never do.
    pub fn evaluate(&self, terms: &[f64]) -> f64 {
        eval(&self.expr, terms).max(0.0)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl<'de> serde::Deserialize<'de> for Formula {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Formula::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn eval(e: &Expr, terms: &[f64]) -> f64 {
    match e {
        Expr::Var(i) => terms.get(*i).copied().unwrap_or(0.0),
        Expr::Num(n) => *n,
        Expr::Neg(inner) => -eval(inner, terms),
        Expr::Add(l, r) => eval(l, terms) + eval(r, terms),
        Expr::Sub(l, r) => eval(l, terms) - eval(r, terms),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(usize),
    Num(f64),
    Plus,
    Minus,
    Open,
    Close,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut out = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            ' ' | '\t' => {}
            '+' => out.push(Token::Plus),
            '-' => out.push(Token::Minus),
            '(' => out.push(Token::Open),
            ')' => out.push(Token::Close),
            'a'..='z' => {
                if chars.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
                    bail!("formula {source:?}: variables are single letters");
                }
                out.push(Token::Var((ch as u8 - b'a') as usize));
            }
            '0'..='9' => {
                let mut digits = ch.to_string();
                while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit()) {
                    digits.push(c);
                    chars.next();
                }
                let n = digits
                    .parse::<f64>()
                    .map_err(|_| anyhow!("formula {source:?}: bad number {digits}"))?;
                out.push(Token::Num(n));
            }
            other => bail!("formula {source:?}: unexpected character {other:?}"),
        }
    }
    if out.is_empty() {
        bail!("formula is empty");
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    // expr := unary (('+' | '-') unary)*
    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    lhs = Expr::Add(Box::new(lhs), Box::new(self.unary()?));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(self.unary()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Var(i)) => Ok(Expr::Var(i)),
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(anyhow!("unbalanced parenthesis")),
                }
            }
            Some(tok) => Err(anyhow!("unexpected token {tok:?}")),
            None => Err(anyhow!("formula ends early")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Formula;

    #[test]
    fn close_range_subtraction() {
        let f = Formula::parse("(a + b) - (c + d)").expect("valid formula");
        assert_eq!(f.evaluate(&[5.0, 3.0, 2.0, 1.0]), 5.0);
        assert_eq!(f.max_var(), Some(3));
    }

    #[test]
    fn negative_results_clamp_to_zero() {
        let f = Formula::parse("(a + b) - (c + d)").unwrap();
        assert_eq!(f.evaluate(&[1.0, 0.0, 2.0, 3.0]), 0.0);
        let g = Formula::parse("-a + 2").unwrap();
        assert_eq!(g.evaluate(&[1.0]), 1.0);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Formula::parse("(a + b").is_err());
        assert!(Formula::parse("ab - c").is_err());
        assert!(Formula::parse("a * b").is_err());
        assert!(Formula::parse("").is_err());
        assert!(Formula::parse("a b").is_err());
    }
}
