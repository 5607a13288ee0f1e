//! Recursive-descent parser implementing the EBNF in spec §6.5 exactly:
//! `Expr = OrExpr`, `OrExpr = AndExpr {"or" AndExpr}`, down through `Cmp`,
//! `Sum`, `Prod`, `Pow` (right-associative), `Unary`, `Atom`. Anything the
//! grammar doesn't admit — calls, subscription, lambdas, assignment — simply
//! has no production to parse it, so it surfaces as `UnexpectedToken` or
//! `TrailingInput` rather than a dedicated rejection check.

use super::ast::{BinOp, Expr, Identifier, UnaryOp};
use super::lexer::{tokenize, Token};
use crate::error::RuleCompileError;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: &Token) -> Result<(), RuleCompileError> {
        if self.peek() == tok {
            self.advance();
            Ok(())
        } else {
            Err(RuleCompileError::UnexpectedToken(format!("{:?}", self.peek())))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, RuleCompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, RuleCompileError> {
        let mut left = self.parse_and()?;
        while *self.peek() == Token::KwOr {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(Box::new(left), BinOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, RuleCompileError> {
        let mut left = self.parse_not_cmp()?;
        while *self.peek() == Token::KwAnd {
            self.advance();
            let right = self.parse_not_cmp()?;
            left = Expr::Binary(Box::new(left), BinOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_not_cmp(&mut self) -> Result<Expr, RuleCompileError> {
        if *self.peek() == Token::KwNot {
            self.advance();
            let inner = self.parse_cmp()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, RuleCompileError> {
        let mut left = self.parse_sum()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                Token::KwIn => BinOp::In,
                Token::KwNot if self.tokens.get(self.pos + 1) == Some(&Token::KwIn) => {
                    self.advance();
                    self.advance();
                    let right = self.parse_sum()?;
                    left = Expr::Binary(Box::new(left), BinOp::NotIn, Box::new(right));
                    continue;
                }
                _ => break,
            };
            self.advance();
            let right = self.parse_sum()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_sum(&mut self) -> Result<Expr, RuleCompileError> {
        let mut left = self.parse_prod()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_prod()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_prod(&mut self) -> Result<Expr, RuleCompileError> {
        let mut left = self.parse_pow()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_pow()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_pow(&mut self) -> Result<Expr, RuleCompileError> {
        let base = self.parse_unary()?;
        if *self.peek() == Token::StarStar {
            self.advance();
            let exp = self.parse_pow()?;
            return Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exp)));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr, RuleCompileError> {
        match self.peek() {
            Token::Plus => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Plus, Box::new(self.parse_atom()?)))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_atom()?)))
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, RuleCompileError> {
        match self.advance() {
            Token::Num(n) => Ok(Expr::Num(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::KwTrue => Ok(Expr::Bool(true)),
            Token::KwFalse => Ok(Expr::Bool(false)),
            Token::KwNull => Ok(Expr::Null),
            Token::Ident(name) => {
                Identifier::from_name(&name).map(Expr::Ident).ok_or(RuleCompileError::UnknownIdentifier(name))
            }
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(RuleCompileError::UnexpectedToken(format!("{other:?}"))),
        }
    }
}

/// Parse `source` into an AST, rejecting anything outside the restricted
/// grammar (spec §4.8).
pub fn parse(source: &str) -> Result<Expr, RuleCompileError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if *parser.peek() != Token::Eof {
        return Err(RuleCompileError::TrailingInput(format!("{:?}", parser.peek())));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comparison_with_identifier() {
        let expr = parse("score > 10 and manipulation_score < 30").unwrap();
        assert!(matches!(expr, Expr::Binary(_, BinOp::And, _)));
    }

    #[test]
    fn rejects_unknown_identifier() {
        let err = parse("foo > 1").unwrap_err();
        assert!(matches!(err, RuleCompileError::UnknownIdentifier(_)));
    }

    #[test]
    fn rejects_function_call_syntax() {
        let err = parse("score(1)").unwrap_err();
        assert!(matches!(err, RuleCompileError::TrailingInput(_)));
    }

    #[test]
    fn pow_is_right_associative() {
        // 2 ** 3 ** 2 == 2 ** (3 ** 2) == 512, not (2**3)**2 == 64.
        let expr = parse("2 ** 3 ** 2").unwrap();
        match expr {
            Expr::Binary(_, BinOp::Pow, rhs) => assert!(matches!(*rhs, Expr::Binary(_, BinOp::Pow, _))),
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn not_in_is_a_single_operator() {
        let expr = parse("rank not in 5").unwrap();
        assert!(matches!(expr, Expr::Binary(_, BinOp::NotIn, _)));
    }
}
