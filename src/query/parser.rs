//! Lexer and recursive-descent parser for the query language.

use std::collections::BTreeSet;
use std::mem;

use crate::types::ErrorCode;

use super::arena::{ArenaStr, StringArena};
use super::ast::{
    Ast, BinaryOp, CollectionRef, Expr, ForSource, ObjectMember, SortElement, Statement, Terminal,
    UnaryOp,
};
use super::errors::SyntaxError;
use super::functions;
use super::value::Value;

/// Characters of source text shown in diagnostics before truncation.
const SNIPPET_LENGTH: usize = 32;

const RESERVED: &[&str] = &[
    "FOR", "IN", "FILTER", "LET", "SORT", "LIMIT", "RETURN", "DISTINCT", "INSERT", "INTO",
    "OPTIONS", "ASC", "DESC", "AND", "OR", "NOT", "TRUE", "FALSE", "NULL",
];

const SYMBOLS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%", "(", ")", "[",
    "]", "{", "}", ",", ".", ":", "?", "=",
];

/// Returns the source text starting at `line` (1-based) and `column`
/// (0-based, in characters), cut to 32 characters plus `...` when longer.
///
/// `\n`, `\r` and `\r\n` each count as one line break. A column past the
/// end of its line yields the text from the start of the next line; a
/// position past the end of the text yields an empty string.
pub fn extract_region(text: &str, line: usize, column: usize) -> String {
    let mut current_line = 1;
    let mut current_column = 0;
    let mut offset = text.len();
    let mut chars = text.char_indices().peekable();
    while let Some((index, c)) = chars.next() {
        if current_line > line || (current_line == line && current_column >= column) {
            offset = index;
            break;
        }
        match c {
            '\r' => {
                if matches!(chars.peek(), Some((_, '\n'))) {
                    chars.next();
                }
                current_line += 1;
                current_column = 0;
            }
            '\n' => {
                current_line += 1;
                current_column = 0;
            }
            _ => current_column += 1,
        }
    }
    let rest = &text[offset..];
    match rest.char_indices().nth(SNIPPET_LENGTH) {
        Some((cut, _)) => format!("{}...", &rest[..cut]),
        None => rest.to_owned(),
    }
}

fn syntax_error(text: &str, line: usize, column: usize, detail: &str) -> SyntaxError {
    SyntaxError {
        code: ErrorCode::QueryParse,
        line,
        column,
        message: format!(
            "syntax error, {detail} near '{}' at position {line}:{column}",
            extract_region(text, line, column)
        ),
    }
}

#[derive(Clone, Debug, PartialEq)]
enum TokenKind {
    Ident(String),
    QuotedIdent(String),
    Number(f64),
    Str { raw: String, escaped: bool },
    Param(String),
    CollectionParam(String),
    Symbol(&'static str),
    End,
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    line: usize,
    column: usize,
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(word) if word.eq_ignore_ascii_case(keyword))
    }

    fn is_symbol(&self, symbol: &str) -> bool {
        matches!(self.kind, TokenKind::Symbol(s) if s == symbol)
    }

    fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Ident(word) if is_reserved(word) => {
                format!("{} keyword", word.to_ascii_uppercase())
            }
            TokenKind::Ident(_) | TokenKind::QuotedIdent(_) => "identifier".to_owned(),
            TokenKind::Number(_) => "number".to_owned(),
            TokenKind::Str { .. } => "quoted string".to_owned(),
            TokenKind::Param(_) => "bind parameter".to_owned(),
            TokenKind::CollectionParam(_) => "collection bind parameter".to_owned(),
            TokenKind::Symbol(symbol) => format!("'{symbol}'"),
            TokenKind::End => "end of query".to_owned(),
        }
    }
}

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|keyword| keyword.eq_ignore_ascii_case(word))
}

struct Lexer<'t> {
    text: &'t str,
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl<'t> Lexer<'t> {
    fn new(text: &'t str) -> Self {
        Self {
            text,
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            column: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        match c {
            '\r' => {
                if self.peek() == Some('\n') {
                    self.pos += 1;
                }
                self.line += 1;
                self.column = 0;
            }
            '\n' => {
                self.line += 1;
                self.column = 0;
            }
            _ => self.column += 1,
        }
        Some(c)
    }

    fn error(&self, line: usize, column: usize, detail: &str) -> SyntaxError {
        syntax_error(self.text, line, column, detail)
    }

    fn tokenize(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::End,
                    line,
                    column,
                });
                return Ok(tokens);
            };
            let kind = match c {
                '\'' | '"' => self.string(c, line, column)?,
                '`' => self.quoted_identifier(line, column)?,
                '@' => self.parameter(line, column)?,
                c if c.is_ascii_digit() => self.number(line, column)?,
                c if c.is_alphabetic() || c == '_' => TokenKind::Ident(self.word()),
                _ => self.symbol(line, column)?,
            };
            tokens.push(Token { kind, line, column });
        }
    }

    fn skip_trivia(&mut self) -> Result<(), SyntaxError> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.peek() {
                        if c == '\n' || c == '\r' {
                            break;
                        }
                        self.bump();
                    }
                }
                (Some('/'), Some('*')) => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    self.bump();
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some('*'), Some('/')) => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            (Some(_), _) => {
                                self.bump();
                            }
                            (None, _) => {
                                return Err(self.error(line, column, "unterminated comment"))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if !(c.is_alphanumeric() || c == '_') {
                break;
            }
            word.push(c);
            self.bump();
        }
        word
    }

    fn string(&mut self, quote: char, line: usize, column: usize) -> Result<TokenKind, SyntaxError> {
        self.bump();
        let mut raw = String::new();
        let mut escaped = false;
        loop {
            match self.bump() {
                None => return Err(self.error(line, column, "unterminated quoted string")),
                Some(c) if c == quote => break,
                Some('\\') => {
                    escaped = true;
                    raw.push('\\');
                    match self.bump() {
                        Some(next) => raw.push(next),
                        None => {
                            return Err(self.error(line, column, "unterminated quoted string"))
                        }
                    }
                }
                Some('\r') if self.chars[self.pos - 1] == '\n' => raw.push_str("\r\n"),
                Some(c) => raw.push(c),
            }
        }
        Ok(TokenKind::Str { raw, escaped })
    }

    fn quoted_identifier(&mut self, line: usize, column: usize) -> Result<TokenKind, SyntaxError> {
        self.bump();
        let mut name = String::new();
        loop {
            match self.bump() {
                Some('`') => break,
                Some(c) => name.push(c),
                None => return Err(self.error(line, column, "unterminated quoted identifier")),
            }
        }
        if name.is_empty() {
            return Err(self.error(line, column, "empty quoted identifier"));
        }
        Ok(TokenKind::QuotedIdent(name))
    }

    fn parameter(&mut self, line: usize, column: usize) -> Result<TokenKind, SyntaxError> {
        self.bump();
        let collection = self.peek() == Some('@');
        if collection {
            self.bump();
        }
        let name = self.word();
        if name.is_empty() {
            return Err(self.error(line, column, "invalid bind parameter name"));
        }
        Ok(if collection {
            TokenKind::CollectionParam(name)
        } else {
            TokenKind::Param(name)
        })
    }

    fn number(&mut self, line: usize, column: usize) -> Result<TokenKind, SyntaxError> {
        fn digits(lexer: &mut Lexer<'_>, literal: &mut String) {
            while let Some(c) = lexer.peek().filter(char::is_ascii_digit) {
                literal.push(c);
                lexer.bump();
            }
        }

        let mut literal = String::new();
        digits(self, &mut literal);
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            literal.push('.');
            self.bump();
            digits(self, &mut literal);
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = matches!(self.peek_at(1), Some('+' | '-'));
            let exponent_at = if sign { 2 } else { 1 };
            if self.peek_at(exponent_at).is_some_and(|c| c.is_ascii_digit()) {
                for _ in 0..exponent_at {
                    if let Some(c) = self.bump() {
                        literal.push(c);
                    }
                }
                digits(self, &mut literal);
            }
        }
        if self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            return Err(self.error(line, column, "invalid number literal"));
        }
        literal
            .parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| self.error(line, column, "invalid number literal"))
    }

    fn symbol(&mut self, line: usize, column: usize) -> Result<TokenKind, SyntaxError> {
        for &symbol in SYMBOLS {
            let matches = symbol
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c));
            if matches {
                for _ in 0..symbol.chars().count() {
                    self.bump();
                }
                return Ok(TokenKind::Symbol(symbol));
            }
        }
        let unexpected = self.peek().unwrap_or_default();
        Err(self.error(line, column, &format!("unexpected character '{unexpected}'")))
    }
}

/// Parses query text into an [`Ast`], interning every string in `arena`.
pub struct Parser<'q> {
    text: &'q str,
    tokens: Vec<Token>,
    pos: usize,
    arena: &'q mut StringArena,
    variables: Vec<ArenaStr>,
    bind_parameters: BTreeSet<String>,
    collection_parameters: BTreeSet<String>,
}

impl<'q> Parser<'q> {
    /// Parses `text`.
    ///
    /// Empty text (or text holding only comments) fails with
    /// [`ErrorCode::QueryEmpty`]; grammar errors with
    /// [`ErrorCode::QueryParse`]; variable scoping and function lookup carry
    /// their own codes.
    pub fn parse(text: &'q str, arena: &'q mut StringArena) -> Result<Ast, SyntaxError> {
        let tokens = Lexer::new(text).tokenize()?;
        if let [only] = tokens.as_slice() {
            return Err(SyntaxError {
                code: ErrorCode::QueryEmpty,
                line: only.line,
                column: only.column,
                message: ErrorCode::QueryEmpty.base_text().to_owned(),
            });
        }
        let mut parser = Parser {
            text,
            tokens,
            pos: 0,
            arena,
            variables: Vec::new(),
            bind_parameters: BTreeSet::new(),
            collection_parameters: BTreeSet::new(),
        };
        parser.query()
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> &Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::End {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.peek().is_keyword(keyword);
        if found {
            self.pos += 1;
        }
        found
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        let found = self.peek().is_symbol(symbol);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), SyntaxError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected_expecting(keyword))
        }
    }

    fn expect_symbol(&mut self, symbol: &str) -> Result<(), SyntaxError> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.unexpected_expecting(&format!("'{symbol}'")))
        }
    }

    fn unexpected(&self) -> SyntaxError {
        let token = self.peek();
        syntax_error(
            self.text,
            token.line,
            token.column,
            &format!("unexpected {}", token.describe()),
        )
    }

    fn unexpected_expecting(&self, expected: &str) -> SyntaxError {
        let token = self.peek();
        syntax_error(
            self.text,
            token.line,
            token.column,
            &format!("unexpected {}, expecting {expected}", token.describe()),
        )
    }

    fn semantic(token: &Token, code: ErrorCode, message: String) -> SyntaxError {
        SyntaxError {
            code,
            line: token.line,
            column: token.column,
            message,
        }
    }

    fn intern(&mut self, token: &Token, text: &str, must_unescape: bool) -> Result<ArenaStr, SyntaxError> {
        self.arena
            .register(text, must_unescape)
            .map_err(|_| SyntaxError::out_of_memory(token.line, token.column))
    }

    fn query(&mut self) -> Result<Ast, SyntaxError> {
        let mut statements = Vec::new();
        let terminal = loop {
            let token = self.peek();
            if token.is_keyword("FOR") {
                statements.push(self.for_statement()?);
            } else if token.is_keyword("FILTER") {
                self.pos += 1;
                statements.push(Statement::Filter {
                    condition: self.expression()?,
                });
            } else if token.is_keyword("LET") {
                statements.push(self.let_statement()?);
            } else if token.is_keyword("SORT") {
                statements.push(self.sort_statement()?);
            } else if token.is_keyword("LIMIT") {
                statements.push(self.limit_statement()?);
            } else if token.is_keyword("RETURN") {
                break self.return_statement()?;
            } else if token.is_keyword("INSERT") {
                break self.insert_statement()?;
            } else {
                return Err(self.unexpected());
            }
        };
        if self.peek().kind != TokenKind::End {
            return Err(self.unexpected_expecting("end of query"));
        }
        Ok(Ast {
            statements,
            terminal: Some(terminal),
            bind_parameters: mem::take(&mut self.bind_parameters),
            collection_parameters: mem::take(&mut self.collection_parameters),
        })
    }

    fn variable_name(&mut self) -> Result<(Token, ArenaStr), SyntaxError> {
        let token = self.peek().clone();
        let name = match &token.kind {
            TokenKind::Ident(name) if !is_reserved(name) => name.clone(),
            TokenKind::QuotedIdent(name) => name.clone(),
            _ => return Err(self.unexpected_expecting("variable name")),
        };
        self.pos += 1;
        let name = self.intern(&token, &name, false)?;
        Ok((token, name))
    }

    fn declare(&mut self, token: &Token, name: &ArenaStr) -> Result<(), SyntaxError> {
        if self.variables.contains(name) {
            return Err(Self::semantic(
                token,
                ErrorCode::VariableRedeclared,
                format!("variable '{name}' is assigned multiple times"),
            ));
        }
        self.variables.push(name.clone());
        Ok(())
    }

    fn for_statement(&mut self) -> Result<Statement, SyntaxError> {
        self.pos += 1;
        let (token, variable) = self.variable_name()?;
        self.expect_keyword("IN")?;
        let source = match self.collection_source()? {
            Some(collection) => ForSource::Collection(collection),
            None => ForSource::Expr(self.expression()?),
        };
        self.declare(&token, &variable)?;
        Ok(Statement::For { variable, source })
    }

    fn collection_source(&mut self) -> Result<Option<CollectionRef>, SyntaxError> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::CollectionParam(name) => {
                self.pos += 1;
                self.collection_parameters.insert(name.clone());
                Ok(Some(CollectionRef::Parameter(self.intern(&token, name, false)?)))
            }
            TokenKind::Ident(name) | TokenKind::QuotedIdent(name) => {
                let is_word = matches!(token.kind, TokenKind::QuotedIdent(_)) || !is_reserved(name);
                let next = self.peek_next();
                let continues = next.is_symbol("(") || next.is_symbol(".") || next.is_symbol("[");
                let declared = self.variables.iter().any(|v| v.as_str() == name);
                if !is_word || continues || declared {
                    return Ok(None);
                }
                self.pos += 1;
                Ok(Some(CollectionRef::Name(self.intern(&token, name, false)?)))
            }
            _ => Ok(None),
        }
    }

    fn collection_target(&mut self) -> Result<CollectionRef, SyntaxError> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::CollectionParam(name) => {
                self.pos += 1;
                self.collection_parameters.insert(name.clone());
                Ok(CollectionRef::Parameter(self.intern(&token, name, false)?))
            }
            TokenKind::Ident(name) if !is_reserved(name) => {
                self.pos += 1;
                Ok(CollectionRef::Name(self.intern(&token, name, false)?))
            }
            TokenKind::QuotedIdent(name) => {
                self.pos += 1;
                Ok(CollectionRef::Name(self.intern(&token, name, false)?))
            }
            _ => Err(self.unexpected_expecting("collection name")),
        }
    }

    fn let_statement(&mut self) -> Result<Statement, SyntaxError> {
        self.pos += 1;
        let (token, variable) = self.variable_name()?;
        self.expect_symbol("=")?;
        let expr = self.expression()?;
        self.declare(&token, &variable)?;
        Ok(Statement::Let { variable, expr })
    }

    fn sort_statement(&mut self) -> Result<Statement, SyntaxError> {
        self.pos += 1;
        let mut elements = Vec::new();
        loop {
            let expr = self.expression()?;
            let ascending = if self.eat_keyword("DESC") {
                false
            } else {
                self.eat_keyword("ASC");
                true
            };
            elements.push(SortElement { expr, ascending });
            if !self.eat_symbol(",") {
                break;
            }
        }
        Ok(Statement::Sort { elements })
    }

    fn limit_statement(&mut self) -> Result<Statement, SyntaxError> {
        self.pos += 1;
        let first = self.expression()?;
        if self.eat_symbol(",") {
            let count = self.expression()?;
            return Ok(Statement::Limit {
                offset: first,
                count,
            });
        }
        Ok(Statement::Limit {
            offset: Expr::literal(0.0),
            count: first,
        })
    }

    fn return_statement(&mut self) -> Result<Terminal, SyntaxError> {
        self.pos += 1;
        let distinct = self.eat_keyword("DISTINCT");
        let expr = self.expression()?;
        Ok(Terminal::Return { expr, distinct })
    }

    fn insert_statement(&mut self) -> Result<Terminal, SyntaxError> {
        self.pos += 1;
        let expr = self.expression()?;
        if !(self.eat_keyword("INTO") || self.eat_keyword("IN")) {
            return Err(self.unexpected_expecting("INTO"));
        }
        let collection = self.collection_target()?;
        let mut ignore_errors = false;
        if self.eat_keyword("OPTIONS") {
            if !self.peek().is_symbol("{") {
                return Err(self.unexpected_expecting("object"));
            }
            if let Expr::Object { members } = self.primary()? {
                ignore_errors = members.iter().any(|member| {
                    member.name.as_str() == "ignoreErrors"
                        && member.value.constant().is_some_and(Value::is_truthy)
                });
            }
        }
        Ok(Terminal::Insert {
            expr,
            collection,
            ignore_errors,
        })
    }

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        let condition = self.or()?;
        if !self.eat_symbol("?") {
            return Ok(condition);
        }
        let then = self.expression()?;
        self.expect_symbol(":")?;
        let otherwise = self.expression()?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn or(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.and()?;
        while self.eat_symbol("||") || self.eat_keyword("OR") {
            let right = self.and()?;
            left = Self::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.equality()?;
        while self.eat_symbol("&&") || self.eat_keyword("AND") {
            let right = self.equality()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.membership()?;
        loop {
            let op = if self.eat_symbol("==") {
                BinaryOp::Eq
            } else if self.eat_symbol("!=") {
                BinaryOp::Ne
            } else {
                return Ok(left);
            };
            let right = self.membership()?;
            left = Self::binary(op, left, right);
        }
    }

    fn membership(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.relational()?;
        loop {
            let op = if self.eat_keyword("IN") {
                BinaryOp::In
            } else if self.peek().is_keyword("NOT") && self.peek_next().is_keyword("IN") {
                self.pos += 2;
                BinaryOp::NotIn
            } else {
                return Ok(left);
            };
            let right = self.relational()?;
            left = Self::binary(op, left, right);
        }
    }

    fn relational(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.additive()?;
        loop {
            let op = if self.eat_symbol("<=") {
                BinaryOp::Le
            } else if self.eat_symbol(">=") {
                BinaryOp::Ge
            } else if self.eat_symbol("<") {
                BinaryOp::Lt
            } else if self.eat_symbol(">") {
                BinaryOp::Gt
            } else {
                return Ok(left);
            };
            let right = self.additive()?;
            left = Self::binary(op, left, right);
        }
    }

    fn additive(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat_symbol("+") {
                BinaryOp::Add
            } else if self.eat_symbol("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = Self::binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_symbol("*") {
                BinaryOp::Mul
            } else if self.eat_symbol("/") {
                BinaryOp::Div
            } else if self.eat_symbol("%") {
                BinaryOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = Self::binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        let op = if self.eat_symbol("!") || self.eat_keyword("NOT") {
            UnaryOp::Not
        } else if self.eat_symbol("-") {
            UnaryOp::Minus
        } else if self.eat_symbol("+") {
            UnaryOp::Plus
        } else {
            return self.postfix();
        };
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_symbol(".") {
                let token = self.peek().clone();
                let name = match &token.kind {
                    TokenKind::Ident(name) | TokenKind::QuotedIdent(name) => name.clone(),
                    _ => return Err(self.unexpected_expecting("attribute name")),
                };
                self.pos += 1;
                let name = self.intern(&token, &name, false)?;
                expr = Expr::Attribute {
                    object: Box::new(expr),
                    name,
                };
            } else if self.eat_symbol("[") {
                let index = self.expression()?;
                self.expect_symbol("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Number(n) => {
                self.pos += 1;
                Ok(Expr::literal(*n))
            }
            TokenKind::Str { raw, escaped } => {
                self.pos += 1;
                let text = self.intern(&token, raw, *escaped)?;
                Ok(Expr::literal(Value::String(text.to_arc())))
            }
            TokenKind::Param(name) => {
                self.pos += 1;
                self.bind_parameters.insert(name.clone());
                Ok(Expr::BindParameter {
                    name: self.intern(&token, name, false)?,
                })
            }
            TokenKind::Symbol("(") => {
                self.pos += 1;
                let expr = self.expression()?;
                self.expect_symbol(")")?;
                Ok(expr)
            }
            TokenKind::Symbol("[") => {
                self.pos += 1;
                let mut members = Vec::new();
                if !self.eat_symbol("]") {
                    loop {
                        members.push(self.expression()?);
                        if self.eat_symbol("]") {
                            break;
                        }
                        self.expect_symbol(",")?;
                    }
                }
                Ok(Expr::Array { members })
            }
            TokenKind::Symbol("{") => {
                self.pos += 1;
                self.object_members()
            }
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("TRUE") => {
                self.pos += 1;
                Ok(Expr::literal(true))
            }
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("FALSE") => {
                self.pos += 1;
                Ok(Expr::literal(false))
            }
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("NULL") => {
                self.pos += 1;
                Ok(Expr::Literal { value: Value::Null })
            }
            TokenKind::Ident(name) if self.peek_next().is_symbol("(") => {
                let name = name.clone();
                self.pos += 2;
                self.call(&token, &name)
            }
            TokenKind::Ident(name) if !is_reserved(name) => {
                self.pos += 1;
                self.reference(&token, name)
            }
            TokenKind::QuotedIdent(name) => {
                self.pos += 1;
                self.reference(&token, name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn reference(&mut self, token: &Token, name: &str) -> Result<Expr, SyntaxError> {
        let Some(variable) = self.variables.iter().find(|v| v.as_str() == name).cloned() else {
            return Err(Self::semantic(
                token,
                ErrorCode::VariableNameUnknown,
                format!("unknown variable '{name}'"),
            ));
        };
        Ok(Expr::Reference { name: variable })
    }

    fn call(&mut self, token: &Token, name: &str) -> Result<Expr, SyntaxError> {
        let Some(def) = functions::lookup(name) else {
            return Err(Self::semantic(
                token,
                ErrorCode::FunctionNameUnknown,
                format!("usage of unknown function '{}()'", name.to_ascii_uppercase()),
            ));
        };
        let mut args = Vec::new();
        if !self.eat_symbol(")") {
            loop {
                args.push(self.expression()?);
                if self.eat_symbol(")") {
                    break;
                }
                self.expect_symbol(",")?;
            }
        }
        if !def.accepts(args.len()) {
            let err = def.arity_error();
            return Err(Self::semantic(token, err.code(), err.to_string()));
        }
        let name = self.intern(token, def.name, false)?;
        Ok(Expr::Call { name, args })
    }

    fn object_members(&mut self) -> Result<Expr, SyntaxError> {
        let mut members = Vec::new();
        if self.eat_symbol("}") {
            return Ok(Expr::Object { members });
        }
        loop {
            let token = self.peek().clone();
            let name = match &token.kind {
                TokenKind::Ident(name) | TokenKind::QuotedIdent(name) => {
                    self.pos += 1;
                    self.intern(&token, name, false)?
                }
                TokenKind::Str { raw, escaped } => {
                    self.pos += 1;
                    self.intern(&token, raw, *escaped)?
                }
                _ => return Err(self.unexpected_expecting("attribute name")),
            };
            self.expect_symbol(":")?;
            let value = self.expression()?;
            members.push(ObjectMember { name, value });
            if self.eat_symbol("}") {
                return Ok(Expr::Object { members });
            }
            self.expect_symbol(",")?;
        }
    }
}
