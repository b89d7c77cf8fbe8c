//! Dependent-type expressions: parsing qualifier arguments such as
//! `"this.items"` or `"#1"` and printing them in one canonical form.

use std::collections::BTreeSet;

use crate::dataflow::expression::FlowExpr;
use crate::ir::BinaryOp;

/// Outcome of standardizing one qualifier argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Standardized {
    Ok(FlowExpr),
    ParseError { expression: String, message: String },
}

/// Where the annotation containing the expression was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExpressionMode {
    /// On a method signature: parameters become `#i`.
    Declaration,
    /// Inside a method body: parameters and locals stay by name.
    Use,
}

/// Names an expression may refer to.
#[derive(Clone, Debug)]
pub(crate) struct ExpressionContext {
    pub(crate) mode: ExpressionMode,
    pub(crate) params: Vec<String>,
    pub(crate) locals: BTreeSet<String>,
    pub(crate) fields: BTreeSet<String>,
}

impl ExpressionContext {
    pub(crate) fn declaration(params: Vec<String>, fields: BTreeSet<String>) -> Self {
        Self {
            mode: ExpressionMode::Declaration,
            params,
            locals: BTreeSet::new(),
            fields,
        }
    }

    pub(crate) fn use_site(
        params: Vec<String>,
        locals: BTreeSet<String>,
        fields: BTreeSet<String>,
    ) -> Self {
        Self {
            mode: ExpressionMode::Use,
            params,
            locals,
            fields,
        }
    }

    fn resolve(&self, name: &str) -> Option<FlowExpr> {
        if self.locals.contains(name) {
            return Some(FlowExpr::Local(name.to_string()));
        }
        if let Some(position) = self.params.iter().position(|param| param == name) {
            return Some(match self.mode {
                ExpressionMode::Declaration => FlowExpr::Param(position + 1),
                ExpressionMode::Use => FlowExpr::Local(name.to_string()),
            });
        }
        if self.fields.contains(name) {
            return Some(FlowExpr::field(FlowExpr::This, name));
        }
        None
    }
}

/// Parse and canonicalize `text`.
pub(crate) fn standardize(text: &str, context: &ExpressionContext) -> Standardized {
    let parsed = Tokenizer::new(text)
        .tokenize()
        .and_then(|tokens| Parser::new(tokens, context).parse_all());
    match parsed {
        Ok(expr) => Standardized::Ok(expr),
        Err(message) => Standardized::ParseError {
            expression: text.to_string(),
            message,
        },
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Int(i64),
    Param(usize),
    Ident(String),
    Dot,
    Comma,
    Plus,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

struct Tokenizer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Tokenizer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }
            let token = match c {
                '.' => self.single(Token::Dot),
                ',' => self.single(Token::Comma),
                '+' => self.single(Token::Plus),
                '-' => self.single(Token::Minus),
                '(' => self.single(Token::LParen),
                ')' => self.single(Token::RParen),
                '[' => self.single(Token::LBracket),
                ']' => self.single(Token::RBracket),
                '#' => {
                    self.chars.next();
                    let digits = self.take_while(|c| c.is_ascii_digit());
                    let index: usize = digits
                        .parse()
                        .map_err(|_| "expected a parameter index after '#'".to_string())?;
                    if index == 0 {
                        return Err("parameter indices start at #1".to_string());
                    }
                    Token::Param(index)
                }
                c if c.is_ascii_digit() => {
                    let digits = self.take_while(|c| c.is_ascii_digit());
                    let value: i64 = digits
                        .parse()
                        .map_err(|_| format!("integer literal out of range: {digits}"))?;
                    Token::Int(value)
                }
                c if c.is_alphabetic() || c == '_' || c == '$' => {
                    Token::Ident(self.take_while(|c| c.is_alphanumeric() || c == '_' || c == '$'))
                }
                other => return Err(format!("unexpected character '{other}'")),
            };
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn single(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    fn take_while(&mut self, predicate: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if !predicate(c) {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    context: &'a ExpressionContext,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, context: &'a ExpressionContext) -> Self {
        Self {
            tokens,
            position: 0,
            context,
        }
    }

    fn parse_all(mut self) -> Result<FlowExpr, String> {
        if self.tokens.is_empty() {
            return Err("empty expression".to_string());
        }
        let expr = self.additive()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(format!("unexpected token {token:?}")),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected:?}, found {token:?}")),
            None => Err(format!("expected {expected:?} at end of expression")),
        }
    }

    fn additive(&mut self) -> Result<FlowExpr, String> {
        let mut left = self.postfix()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.next();
            let right = self.postfix()?;
            left = FlowExpr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn postfix(&mut self) -> Result<FlowExpr, String> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        _ => return Err("expected a member name after '.'".to_string()),
                    };
                    if self.peek() == Some(&Token::LParen) {
                        let args = self.arguments()?;
                        expr = FlowExpr::MethodCall {
                            receiver: Box::new(expr),
                            method: name,
                            args,
                        };
                    } else {
                        expr = FlowExpr::field(expr, &name);
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.additive()?;
                    self.expect(Token::RBracket)?;
                    expr = FlowExpr::ArrayAccess {
                        array: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<FlowExpr>, String> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.additive()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err("expected ',' or ')' in argument list".to_string()),
            }
        }
    }

    fn primary(&mut self) -> Result<FlowExpr, String> {
        match self.next() {
            Some(Token::Int(value)) => Ok(FlowExpr::Literal(value.to_string())),
            Some(Token::Minus) => match self.next() {
                Some(Token::Int(value)) => Ok(FlowExpr::Literal(format!("-{value}"))),
                _ => Err("expected an integer after unary '-'".to_string()),
            },
            Some(Token::Param(index)) => {
                if self.context.mode == ExpressionMode::Declaration
                    && index > self.context.params.len()
                {
                    return Err(format!("#{index} exceeds the number of parameters"));
                }
                Ok(FlowExpr::Param(index))
            }
            Some(Token::LParen) => {
                let inner = self.additive()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) if name == "this" => Ok(FlowExpr::This),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    let args = self.arguments()?;
                    return Ok(FlowExpr::MethodCall {
                        receiver: Box::new(FlowExpr::This),
                        method: name,
                        args,
                    });
                }
                self.context
                    .resolve(&name)
                    .ok_or_else(|| format!("{name}: identifier not found"))
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declaration() -> ExpressionContext {
        ExpressionContext::declaration(
            vec!["array".to_string(), "offset".to_string()],
            BTreeSet::from(["items".to_string()]),
        )
    }

    fn canonical(text: &str, context: &ExpressionContext) -> String {
        match standardize(text, context) {
            Standardized::Ok(expr) => expr.to_string(),
            Standardized::ParseError { message, .. } => panic!("{text}: {message}"),
        }
    }

    #[test]
    fn declaration_context_numbers_parameters() {
        let context = declaration();
        assert_eq!(canonical("array", &context), "#1");
        assert_eq!(canonical("items", &context), "this.items");
        assert_eq!(canonical(" offset +  1", &context), "#2 + 1");
        assert_eq!(canonical("array.length", &context), "#1.length");
    }

    #[test]
    fn use_context_keeps_local_names() {
        let context = ExpressionContext::use_site(
            vec!["array".to_string()],
            BTreeSet::from(["copy".to_string()]),
            BTreeSet::from(["items".to_string()]),
        );
        assert_eq!(canonical("copy", &context), "copy");
        assert_eq!(canonical("array", &context), "array");
        assert_eq!(canonical("size()", &context), "this.size()");
        assert_eq!(canonical("items[copy - 1]", &context), "this.items[copy - 1]");
    }

    #[test]
    fn standardization_is_idempotent() {
        let context = declaration();
        for text in [
            "array",
            "items",
            "this.items.length",
            "offset - (1 + 2)",
            "#1[offset]",
            "items.get(#2, 3)",
        ] {
            let once = canonical(text, &context);
            assert_eq!(canonical(&once, &context), once, "re-standardizing {text}");
        }
    }

    #[test]
    fn reports_parse_errors_as_values() {
        let context = declaration();
        for text in ["", "missing", "items.", "#0", "#3", "a b", "items[1"] {
            assert!(
                matches!(
                    standardize(text, &context),
                    Standardized::ParseError { ref expression, .. } if expression == text
                ),
                "{text} should not parse"
            );
        }
    }
}
