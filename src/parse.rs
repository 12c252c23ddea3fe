//! Parsing of elementwise kernel statements such as `a[i] = b[i] + scalar * c[i]`.

use crate::common::LOOP_INDEX;
use crate::expr::{BinOp, Expr};

use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("column {column}: {reason}")]
pub struct ParseError {
    pub column: usize,
    pub reason: ParseErrorReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseErrorReason {
    UnexpectedChar(char),
    UnexpectedToken { expected: &'static str, found: String },
    BadNumber(String),
    /// A subscript other than the loop index, e.g. `b[i+1]`.
    NonElementwiseSubscript(String),
    /// The loop index itself was assigned or indexed, e.g. `i[i] = ...`.
    ReservedName(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,
    Eof,
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

/// Parse a single assignment line into its destination array and right-hand side.
pub fn parse_assignment(line: &str) -> Result<(String, Expr), ParseError> {
    let mut parser = Parser::new(lex(line)?);
    let dest = parser.parse_element()?;
    parser.expect(&Token::Eq, "'='")?;
    let rhs = parser.parse_expr(0)?;
    parser.expect(&Token::Eof, "end of statement")?;
    Ok((dest, rhs))
}

fn lex(line: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.char_indices().peekable();
    while let Some(&(column, c)) = chars.peek() {
        let single = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '=' => Some(Token::Eq),
            _ => None,
        };
        if let Some(token) = single {
            chars.next();
            tokens.push((token, column));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if !(c.is_ascii_alphanumeric() || c == '_') {
                    break;
                }
                ident.push(c);
                chars.next();
            }
            tokens.push((Token::Ident(ident), column));
        } else if c.is_ascii_digit() || c == '.' {
            let mut text = String::new();
            let mut prev = c;
            while let Some(&(_, c)) = chars.peek() {
                let exponent_sign = (c == '+' || c == '-') && (prev == 'e' || prev == 'E');
                if !(c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign) {
                    break;
                }
                text.push(c);
                prev = c;
                chars.next();
            }
            let value = text.parse::<f64>().map_err(|_| ParseError {
                column,
                reason: ParseErrorReason::BadNumber(text.clone()),
            })?;
            tokens.push((Token::Number(value), column));
        } else {
            return Err(ParseError {
                column,
                reason: ParseErrorReason::UnexpectedChar(c),
            });
        }
    }
    tokens.push((Token::Eof, line.len()));
    Ok(tokens)
}

impl Parser {
    fn new(tokens: Vec<(Token, usize)>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    fn column(&self) -> usize {
        self.tokens[self.pos].1
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].0.clone();
        if token != Token::Eof {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self, expected: &'static str) -> ParseError {
        ParseError {
            column: self.column(),
            reason: ParseErrorReason::UnexpectedToken {
                expected,
                found: self.peek().to_string(),
            },
        }
    }

    fn expect(&mut self, token: &Token, expected: &'static str) -> Result<(), ParseError> {
        if self.peek() != token {
            return Err(self.unexpected(expected));
        }
        self.advance();
        Ok(())
    }

    /// Parse `name[i]`, returning `name`.
    fn parse_element(&mut self) -> Result<String, ParseError> {
        let column = self.column();
        let Token::Ident(name) = self.peek().clone() else {
            return Err(self.unexpected("an array name"));
        };
        self.advance();
        if name == LOOP_INDEX {
            return Err(ParseError {
                column,
                reason: ParseErrorReason::ReservedName(name),
            });
        }
        self.expect(&Token::LBracket, "'['")?;
        self.parse_subscript()?;
        Ok(name)
    }

    fn parse_subscript(&mut self) -> Result<(), ParseError> {
        let column = self.column();
        let subscript = self.parse_expr(0)?;
        if subscript != Expr::Index {
            return Err(ParseError {
                column,
                reason: ParseErrorReason::NonElementwiseSubscript(subscript.to_string()),
            });
        }
        self.expect(&Token::RBracket, "']'")
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_primary()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                _ => break,
            };
            let (l_bp, r_bp) = op.binding_power();
            if l_bp < min_bp {
                break;
            }
            self.advance();
            let rhs = self.parse_expr(r_bp)?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().clone() {
            Token::Number(value) => {
                self.advance();
                Ok(Expr::Literal(value))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.parse_primary()?)))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr(0)?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                let column = self.column();
                self.advance();
                if self.peek() == &Token::LBracket {
                    if name == LOOP_INDEX {
                        return Err(ParseError {
                            column,
                            reason: ParseErrorReason::ReservedName(name),
                        });
                    }
                    self.advance();
                    self.parse_subscript()?;
                    Ok(Expr::Element(name))
                } else if name == LOOP_INDEX {
                    Ok(Expr::Index)
                } else {
                    Ok(Expr::Scalar(name))
                }
            }
            _ => Err(self.unexpected("an operand, number, or '('")),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{name}"),
            Token::Number(value) => write!(f, "{value}"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eq => write!(f, "="),
            Token::Eof => write!(f, "end of statement"),
        }
    }
}

impl fmt::Display for ParseErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorReason::UnexpectedChar(c) => write!(f, "unexpected character {c:?}"),
            ParseErrorReason::UnexpectedToken { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            ParseErrorReason::BadNumber(text) => write!(f, "malformed number {text:?}"),
            ParseErrorReason::NonElementwiseSubscript(subscript) => write!(
                f,
                "arrays may only be subscripted by the loop index {LOOP_INDEX}, not {subscript}"
            ),
            ParseErrorReason::ReservedName(name) => {
                write!(f, "{name} is the loop index and cannot be used as an array")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_copy() {
        let (dest, rhs) = parse_assignment("a[i] = b[i]").unwrap();
        assert_eq!(dest, "a");
        assert_eq!(rhs, Expr::Element("b".into()));
    }

    #[test]
    fn test_parse_triad_precedence() {
        let (dest, rhs) = parse_assignment("  a[i] = b[i] + scalar * c[i]  ").unwrap();
        assert_eq!(dest, "a");
        assert_eq!(
            rhs,
            Expr::binary(
                BinOp::Add,
                Expr::Element("b".into()),
                Expr::binary(
                    BinOp::Mul,
                    Expr::Scalar("scalar".into()),
                    Expr::Element("c".into())
                )
            )
        );
    }

    #[test]
    fn test_parse_selfscale_without_space() {
        let (_, rhs) = parse_assignment("a[i] = scalar *a[i]").unwrap();
        assert_eq!(rhs.to_string(), "scalar * a[i]");
    }

    #[test]
    fn test_parse_literals_and_index() {
        let (_, rhs) = parse_assignment("c[i] = 0").unwrap();
        assert_eq!(rhs, Expr::Literal(0.0));
        let (_, rhs) = parse_assignment("c[i] = 2.5e-1 * i").unwrap();
        assert_eq!(
            rhs,
            Expr::binary(BinOp::Mul, Expr::Literal(0.25), Expr::Index)
        );
    }

    #[test]
    fn test_parse_left_associative_subtraction() {
        let (_, rhs) = parse_assignment("a[i] = b[i] - c[i] - 1").unwrap();
        assert_eq!(rhs.to_string(), "b[i] - c[i] - 1");
        let (_, rhs) = parse_assignment("a[i] = b[i] - (c[i] - 1)").unwrap();
        assert_eq!(rhs.to_string(), "b[i] - (c[i] - 1)");
    }

    #[test]
    fn test_rejects_non_elementwise_subscript() {
        let err = parse_assignment("a[i] = b[i + 1]").unwrap_err();
        assert!(matches!(
            err.reason,
            ParseErrorReason::NonElementwiseSubscript(_)
        ));
    }

    #[test]
    fn test_rejects_malformed_statements() {
        assert!(parse_assignment("a = b[i]").is_err());
        assert!(parse_assignment("a[i] b[i]").is_err());
        assert!(parse_assignment("a[i] = b[i] +").is_err());
        assert!(parse_assignment("a[i] = (b[i]").is_err());
        assert!(parse_assignment("a[i] = b[i] $ c[i]").is_err());
        assert!(parse_assignment("i[i] = 1").is_err());
    }

    #[test]
    fn test_error_reports_column() {
        let err = parse_assignment("a[i] = b[i] ; c").unwrap_err();
        assert_eq!(err.column, 12);
        assert_eq!(err.reason, ParseErrorReason::UnexpectedChar(';'));
    }
}
