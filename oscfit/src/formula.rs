//! Boolean formulas over event variables.
//!
//! Selection cuts and dial apply-conditions are small predicates evaluated
//! against an event's variable bag: comparisons between variables and
//! numeric literals, combined with `&&`, `||`, `!` and parentheses. A bare
//! variable or literal is true iff it is non-zero.

use crate::event::VariableStore;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Error type returned when a formula fails to parse or evaluate.
#[derive(Debug, Error)]
pub enum FormulaError {
    /// The formula text could not be parsed.
    #[error("could not parse formula '{formula_text}': {reason} at offset {offset}")]
    Parse {
        /// The formula text.
        formula_text: String,
        /// What the parser expected.
        reason: String,
        /// Byte offset of the failure.
        offset: usize,
    },
    /// The formula referenced a variable the event does not carry.
    #[error("formula references unknown variable '{name}'")]
    UnknownVariable {
        /// The missing variable name.
        name: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum Atom {
    Var(String),
    Number(f64),
}

impl Atom {
    fn eval(&self, variables: &VariableStore) -> Result<f64, FormulaError> {
        match self {
            Self::Var(name) => variables
                .get(name)
                .and_then(|variable| variable.as_f64(0))
                .ok_or_else(|| FormulaError::UnknownVariable { name: name.clone() }),
            Self::Number(value) => Ok(*value),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Cmp(Atom, CmpOp, Atom),
    Truthy(Atom),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Node {
    #[allow(clippy::float_cmp)]
    fn eval(&self, variables: &VariableStore) -> Result<bool, FormulaError> {
        Ok(match self {
            Self::Cmp(lhs, op, rhs) => {
                let lhs = lhs.eval(variables)?;
                let rhs = rhs.eval(variables)?;
                match op {
                    CmpOp::Eq => lhs == rhs,
                    CmpOp::Ne => lhs != rhs,
                    CmpOp::Lt => lhs < rhs,
                    CmpOp::Le => lhs <= rhs,
                    CmpOp::Gt => lhs > rhs,
                    CmpOp::Ge => lhs >= rhs,
                }
            }
            Self::Truthy(atom) => atom.eval(variables)? != 0.0,
            Self::Not(inner) => !inner.eval(variables)?,
            Self::And(lhs, rhs) => lhs.eval(variables)? && rhs.eval(variables)?,
            Self::Or(lhs, rhs) => lhs.eval(variables)? || rhs.eval(variables)?,
        })
    }
}

/// A parsed predicate over event variables.
#[derive(Clone, Debug, PartialEq)]
pub struct Formula {
    source: String,
    root: Node,
}

impl Formula {
    /// Parses `source` into a formula.
    ///
    /// # Errors
    ///
    /// Returns [`FormulaError::Parse`] when `source` is not a valid
    /// predicate.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let mut parser = Parser {
            source,
            tokens: tokenize(source)?,
            cursor: 0,
        };
        let root = parser.or_expr()?;

        if parser.cursor != parser.tokens.len() {
            return Err(parser.fail("end of formula"));
        }

        Ok(Self {
            source: source.to_owned(),
            root,
        })
    }

    /// Evaluates the formula against an event's variable bag.
    ///
    /// # Errors
    ///
    /// Returns [`FormulaError::UnknownVariable`] when the formula references
    /// a variable the bag does not carry.
    pub fn eval(&self, variables: &VariableStore) -> Result<bool, FormulaError> {
        self.root.eval(variables)
    }

    /// The formula text as written.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Display for Formula {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Op(CmpOp),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, FormulaError> {
    let mut tokens = Vec::new();
    let bytes = source.as_bytes();
    let mut offset = 0;

    let fail = |offset: usize, reason: &str| FormulaError::Parse {
        formula_text: source.to_owned(),
        reason: reason.to_owned(),
        offset,
    };

    while offset < bytes.len() {
        let rest = &source[offset..];
        let byte = bytes[offset];

        if byte.is_ascii_whitespace() {
            offset += 1;
        } else if rest.starts_with("&&") {
            tokens.push((offset, Token::And));
            offset += 2;
        } else if rest.starts_with("||") {
            tokens.push((offset, Token::Or));
            offset += 2;
        } else if rest.starts_with("==") {
            tokens.push((offset, Token::Op(CmpOp::Eq)));
            offset += 2;
        } else if rest.starts_with("!=") {
            tokens.push((offset, Token::Op(CmpOp::Ne)));
            offset += 2;
        } else if rest.starts_with("<=") {
            tokens.push((offset, Token::Op(CmpOp::Le)));
            offset += 2;
        } else if rest.starts_with(">=") {
            tokens.push((offset, Token::Op(CmpOp::Ge)));
            offset += 2;
        } else if byte == b'<' {
            tokens.push((offset, Token::Op(CmpOp::Lt)));
            offset += 1;
        } else if byte == b'>' {
            tokens.push((offset, Token::Op(CmpOp::Gt)));
            offset += 1;
        } else if byte == b'!' {
            tokens.push((offset, Token::Not));
            offset += 1;
        } else if byte == b'(' {
            tokens.push((offset, Token::Open));
            offset += 1;
        } else if byte == b')' {
            tokens.push((offset, Token::Close));
            offset += 1;
        } else if byte.is_ascii_digit() || byte == b'-' || byte == b'+' || byte == b'.' {
            let end = rest
                .char_indices()
                .skip(1)
                .find(|&(_, c)| !(c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '-' || c == '+'))
                .map_or(rest.len(), |(index, _)| index);
            // the scan above is greedy over exponent signs, back off until it parses
            let mut end = end;
            loop {
                if let Ok(value) = rest[..end].parse::<f64>() {
                    tokens.push((offset, Token::Number(value)));
                    break;
                }
                if end == 0 {
                    return Err(fail(offset, "a number"));
                }
                end -= 1;
            }
            offset += end.max(1);
        } else if byte.is_ascii_alphabetic() || byte == b'_' {
            let end = rest
                .char_indices()
                .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                .map_or(rest.len(), |(index, _)| index);
            tokens.push((offset, Token::Ident(rest[..end].to_owned())));
            offset += end;
        } else {
            return Err(fail(offset, "a token"));
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    cursor: usize,
}

impl Parser<'_> {
    fn fail(&self, reason: &str) -> FormulaError {
        FormulaError::Parse {
            formula_text: self.source.to_owned(),
            reason: reason.to_owned(),
            offset: self
                .tokens
                .get(self.cursor)
                .map_or(self.source.len(), |&(offset, _)| offset),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, token)| token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).map(|(_, token)| token.clone());
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<Node, FormulaError> {
        let mut node = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.cursor += 1;
            node = Node::Or(Box::new(node), Box::new(self.and_expr()?));
        }
        Ok(node)
    }

    fn and_expr(&mut self) -> Result<Node, FormulaError> {
        let mut node = self.unary_expr()?;
        while self.peek() == Some(&Token::And) {
            self.cursor += 1;
            node = Node::And(Box::new(node), Box::new(self.unary_expr()?));
        }
        Ok(node)
    }

    fn unary_expr(&mut self) -> Result<Node, FormulaError> {
        if self.peek() == Some(&Token::Not) {
            self.cursor += 1;
            return Ok(Node::Not(Box::new(self.unary_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Node, FormulaError> {
        if self.peek() == Some(&Token::Open) {
            self.cursor += 1;
            let node = self.or_expr()?;
            if self.advance() != Some(Token::Close) {
                return Err(self.fail("a closing parenthesis"));
            }
            return Ok(node);
        }

        let lhs = self.atom()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.cursor += 1;
            let rhs = self.atom()?;
            Ok(Node::Cmp(lhs, op, rhs))
        } else {
            Ok(Node::Truthy(lhs))
        }
    }

    fn atom(&mut self) -> Result<Atom, FormulaError> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.cursor += 1;
                Ok(Atom::Var(name))
            }
            Some(Token::Number(value)) => {
                self.cursor += 1;
                Ok(Atom::Number(value))
            }
            _ => Err(self.fail("a variable or a number")),
        }
    }
}
