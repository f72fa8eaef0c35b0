//! Tokenizer and precedence-climbing parser for constraint equations.
//!
//! ```text
//! expr   := atom (binop expr)*
//! atom   := number | symbol | call | "(" expr ")"
//! call   := symbol "(" (expr ("," expr)*)? ")"
//! number := digits ("." digits)?
//! symbol := letter (letter | digit | "_")*
//! ```
//!
//! Symbols are case-folded to lowercase. There is no unary minus: write
//! `neg(x)` instead of `-x`.

use super::{BinaryOp, Expr};
use thiserror::Error;

/// A parse failure at a 1-based `line:column` position.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} ({line}:{column})")]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Symbol(String),
    /// An identifier immediately followed by `(`.
    Call(String),
    Op(BinaryOp),
    LParen,
    RParen,
    Comma,
    Eof,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Symbol(name) => format!("symbol \"{name}\""),
            TokenKind::Call(name) => format!("call \"{name}\""),
            TokenKind::Op(op) => format!("operator \"{}\"", op.symbol()),
            TokenKind::LParen => "\"(\"".to_string(),
            TokenKind::RParen => "\")\"".to_string(),
            TokenKind::Comma => "\",\"".to_string(),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
    column: usize,
}

struct InputStream<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    /// Characters consumed on the current line.
    col: usize,
}

impl<'a> InputStream<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
            col: 0,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn next(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    /// Position of the next character.
    fn position(&self) -> (usize, usize) {
        (self.line, self.col + 1)
    }

    fn croak(&self, message: impl Into<String>) -> SyntaxError {
        let (line, column) = self.position();
        SyntaxError {
            message: message.into(),
            line,
            column,
        }
    }
}

fn is_symbol_start(c: char) -> bool {
    c.is_ascii_alphabetic()
}

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(input: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut stream = InputStream::new(input);
    let mut tokens = Vec::new();

    loop {
        while stream.peek().is_some_and(|c| c.is_whitespace()) {
            stream.next();
        }

        let (line, column) = stream.position();
        let Some(c) = stream.peek() else {
            tokens.push(Token {
                kind: TokenKind::Eof,
                line,
                column,
            });
            return Ok(tokens);
        };

        let kind = if let Some(op) = BinaryOp::from_char(c) {
            stream.next();
            TokenKind::Op(op)
        } else if is_symbol_start(c) {
            let mut ident = String::new();
            while let Some(d) = stream.peek().filter(|&d| is_symbol_char(d)) {
                ident.push(d.to_ascii_lowercase());
                stream.next();
            }
            if stream.peek() == Some('(') {
                TokenKind::Call(ident)
            } else {
                TokenKind::Symbol(ident)
            }
        } else if c.is_ascii_digit() || c == '.' {
            read_number(&mut stream)?
        } else {
            match c {
                '(' => {
                    stream.next();
                    TokenKind::LParen
                }
                ')' => {
                    stream.next();
                    TokenKind::RParen
                }
                ',' => {
                    stream.next();
                    TokenKind::Comma
                }
                _ => return Err(stream.croak(format!("Can't handle character: {c}"))),
            }
        };

        tokens.push(Token { kind, line, column });
    }
}

fn read_number(stream: &mut InputStream<'_>) -> Result<TokenKind, SyntaxError> {
    let (line, column) = stream.position();
    let mut text = String::new();
    let mut dots_seen = 0;
    while let Some(d) = stream.peek() {
        if d == '.' {
            dots_seen += 1;
            if dots_seen > 1 {
                return Err(stream.croak("Multiple decimals in number."));
            }
        } else if !d.is_ascii_digit() {
            break;
        }
        text.push(d);
        stream.next();
    }
    text.parse::<f64>().map(TokenKind::Number).map_err(|_| SyntaxError {
        message: format!("Invalid number: \"{text}\""),
        line,
        column,
    })
}

/// Deepest parenthesis or call nesting accepted by `parse`.
pub const MAX_NESTING: usize = 256;

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };
    let expr = parser.parse_expression(0)?;
    match parser.peek().kind {
        TokenKind::Eof => Ok(expr),
        _ => Err(parser.unexpected()),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always terminates the list with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error_at(&self, message: String) -> SyntaxError {
        let token = self.peek();
        SyntaxError {
            message,
            line: token.line,
            column: token.column,
        }
    }

    fn unexpected(&self) -> SyntaxError {
        let kind = &self.peek().kind;
        let hint = match kind {
            TokenKind::Op(BinaryOp::Sub) => " (unary minus is not supported, use neg(...))",
            _ => "",
        };
        self.error_at(format!("Unexpected token: {}{hint}", kind.describe()))
    }

    fn skip(&mut self, expected: TokenKind, text: &str) -> Result<(), SyntaxError> {
        if self.peek().kind == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error_at(format!("Expecting punctuation: \"{text}\"")))
        }
    }

    fn enter(&mut self) -> Result<(), SyntaxError> {
        if self.nesting >= MAX_NESTING {
            return Err(self.error_at(format!(
                "Expression nested deeper than {MAX_NESTING} levels"
            )));
        }
        self.nesting += 1;
        Ok(())
    }

    /// Parses an atom, then folds in every following operator that binds
    /// tighter than `min_prec`. Equal precedence associates to the left.
    fn parse_expression(&mut self, min_prec: u8) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_atom()?;

        while let TokenKind::Op(op) = self.peek().kind {
            let prec = op.precedence();
            if prec <= min_prec {
                break;
            }
            self.advance();
            let right = self.parse_expression(prec)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek().kind.clone() {
            TokenKind::LParen => {
                self.enter()?;
                self.advance();
                let expr = self.parse_expression(0)?;
                self.skip(TokenKind::RParen, ")")?;
                self.nesting -= 1;
                Ok(expr)
            }
            TokenKind::Call(name) => {
                self.enter()?;
                self.advance();
                let call = self.parse_call(name)?;
                self.nesting -= 1;
                Ok(call)
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::Symbol(name) => {
                self.advance();
                Ok(Expr::Symbol(name))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, SyntaxError> {
        self.skip(TokenKind::LParen, "(")?;
        let mut args = Vec::new();
        if self.peek().kind != TokenKind::RParen {
            args.push(self.parse_expression(0)?);
            while self.peek().kind == TokenKind::Comma {
                self.advance();
                args.push(self.parse_expression(0)?);
            }
        }
        self.skip(TokenKind::RParen, ")")?;
        Ok(Expr::Call(name, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Box<Expr> {
        Box::new(Expr::Number(n))
    }

    fn sym(name: &str) -> Box<Expr> {
        Box::new(Expr::Symbol(name.to_string()))
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let expr = parse("3+4*2").expect("parse");
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Add,
                num(3.0),
                Box::new(Expr::Binary(BinaryOp::Mul, num(4.0), num(2.0)))
            )
        );
    }

    #[test]
    fn equal_precedence_associates_left() {
        let expr = parse("8 - 3 - 2").expect("parse");
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Sub,
                Box::new(Expr::Binary(BinaryOp::Sub, num(8.0), num(3.0))),
                num(2.0)
            )
        );
    }

    #[test]
    fn power_binds_tightest() {
        let expr = parse("2*x^2").expect("parse");
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Mul,
                num(2.0),
                Box::new(Expr::Binary(BinaryOp::Pow, sym("x"), num(2.0)))
            )
        );
    }

    #[test]
    fn symbols_are_case_folded_and_calls_detected() {
        let expr = parse("SQRT(P1_X)").expect("parse");
        assert_eq!(expr, Expr::Call("sqrt".to_string(), vec![Expr::Symbol("p1_x".to_string())]));
    }

    #[test]
    fn calls_take_comma_separated_arguments() {
        let expr = parse("f(1, x, (2))").expect("parse");
        assert_eq!(
            expr,
            Expr::Call(
                "f".to_string(),
                vec![Expr::Number(1.0), Expr::Symbol("x".to_string()), Expr::Number(2.0)]
            )
        );
        assert_eq!(parse("f()").expect("parse"), Expr::Call("f".to_string(), Vec::new()));
    }

    #[test]
    fn numbers_allow_one_decimal_point() {
        assert_eq!(parse("2.5").expect("parse"), Expr::Number(2.5));
        assert_eq!(parse(".5").expect("parse"), Expr::Number(0.5));

        let err = parse("1.2.3").expect_err("two decimal points");
        assert!(err.message.contains("Multiple decimals"));
        assert_eq!((err.line, err.column), (1, 4));
    }

    #[test]
    fn unknown_character_reports_position() {
        let err = parse("x +\n  $y").expect_err("bad character");
        assert!(err.message.contains("Can't handle character: $"));
        assert_eq!((err.line, err.column), (2, 3));
        assert_eq!(err.to_string(), "Can't handle character: $ (2:3)");
    }

    #[test]
    fn leading_minus_is_rejected() {
        let err = parse("-x").expect_err("no unary minus");
        assert!(err.message.contains("neg("), "message: {}", err.message);
        assert_eq!((err.line, err.column), (1, 1));
    }

    #[test]
    fn missing_punctuation_is_reported() {
        let err = parse("sin(x").expect_err("unclosed call");
        assert!(err.message.contains("Expecting punctuation: \")\""));

        let err = parse("(1 + 2").expect_err("unclosed paren");
        assert_eq!((err.line, err.column), (1, 7));
    }

    #[test]
    fn trailing_input_is_rejected() {
        let err = parse("1 + 2)").expect_err("trailing paren");
        assert!(err.message.starts_with("Unexpected token"));
        assert_eq!(err.column, 6);

        assert!(parse("sin (x)").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let within = format!("{}x{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert_eq!(parse(&within).expect("parse"), Expr::Symbol("x".into()));

        let calls = format!("{}x{}", "neg(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        let err = parse(&calls).expect_err("too deep");
        assert!(err.message.contains("nested deeper than"), "message: {}", err.message);
        assert_eq!(err.column, 4 * MAX_NESTING + 1);
    }

    #[test]
    fn whitespace_is_insignificant_between_tokens() {
        assert_eq!(parse(" 1\t+\r\n2 ").expect("parse"), parse("1+2").expect("parse"));
    }
}
