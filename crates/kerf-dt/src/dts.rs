//! Textual device-tree source
//!
//! Tokenizes and parses the DTS subset used by kerf documents, and writes
//! trees back out in one canonical layout.
//!
//! ## Grammar
//!
//! ```text
//! <document> ::= "/dts-v1/" ";" "/" "{" <body> "}" ";"
//! <body>     ::= { <property> | <node> }
//! <node>     ::= [ <label> ":" ] <name> "{" <body> "}" ";"
//! <property> ::= <name> [ "=" <value> { "," <value> } ] ";"
//! <value>    ::= "<" { <number> | "&" <label> } ">"
//!              | "/bits/" ("32" | "64") "<" { <number> } ">"
//!              | <string>
//!              | "[" { <hex-bytes> } "]"
//! ```
//!
//! `//` and `/* */` comments are skipped. Values of one property must all
//! be of the same kind.

use std::fmt::Write as _;

use crate::error::DecodeError;
use crate::tree::{Cell, NodeIndex, PropValue, RawTree};

/// Deepest node nesting accepted from text
pub const MAX_DEPTH: usize = 64;

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tok {
    /// Node or property name, number, or hex byte run
    Word(String),
    /// `name:`
    Label(String),
    /// `&name`
    Ref(String),
    Str(String),
    /// `/dts-v1/`, `/bits/`
    Directive(String),
    Slash,
    LBrace,
    RBrace,
    LAngle,
    RAngle,
    LBracket,
    RBracket,
    Semi,
    Eq,
    Comma,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
    pub col: usize,
}

fn is_word_start(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '#' | '?')
}

fn is_word_char(ch: char) -> bool {
    is_word_start(ch) || matches!(ch, ',' | '.' | '+' | '-' | '@')
}

fn is_label(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct Lexer<'a> {
    input: &'a str,
    position: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Lexer {
            input,
            position: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.input[self.position..].chars();
        chars.next();
        chars.next()
    }

    fn consume(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.position += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn error(&self, message: impl Into<String>) -> DecodeError {
        DecodeError::syntax(self.line, self.col, message)
    }

    /// Skip whitespace and comments
    fn skip_trivia(&mut self) -> Result<(), DecodeError> {
        loop {
            match (self.peek(), self.peek_second()) {
                (Some(ch), _) if ch.is_whitespace() => {
                    self.consume();
                }
                (Some('/'), Some('/')) => {
                    while let Some(ch) = self.consume() {
                        if ch == '\n' {
                            break;
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    let (line, col) = (self.line, self.col);
                    self.consume();
                    self.consume();
                    loop {
                        match self.consume() {
                            Some('*') if self.peek() == Some('/') => {
                                self.consume();
                                break;
                            }
                            Some(_) => {}
                            None => {
                                return Err(DecodeError::syntax(line, col, "unterminated comment"))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_word(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.peek() {
            if is_word_char(ch) {
                result.push(ch);
                self.consume();
            } else {
                break;
            }
        }
        result
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let (line, col) = (self.line, self.col);
        self.consume();
        let mut result = String::new();
        loop {
            match self.consume() {
                Some('"') => return Ok(result),
                Some('\\') => match self.consume() {
                    Some('n') => result.push('\n'),
                    Some('t') => result.push('\t'),
                    Some('r') => result.push('\r'),
                    Some('\\') => result.push('\\'),
                    Some('"') => result.push('"'),
                    Some('x') => {
                        let hex: String = [self.consume(), self.consume()]
                            .into_iter()
                            .flatten()
                            .collect();
                        let byte = u8::from_str_radix(&hex, 16)
                            .map_err(|_| self.error("bad \\x escape"))?;
                        if !byte.is_ascii() {
                            return Err(self.error("\\x escape outside ASCII"));
                        }
                        result.push(char::from(byte));
                    }
                    _ => return Err(self.error("unknown escape")),
                },
                Some(ch) => result.push(ch),
                None => return Err(DecodeError::syntax(line, col, "unterminated string")),
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, DecodeError> {
        self.skip_trivia()?;
        let (line, col) = (self.line, self.col);
        let Some(ch) = self.peek() else {
            return Ok(None);
        };

        let tok = match ch {
            '{' | '}' | '<' | '>' | '[' | ']' | ';' | '=' | ',' => {
                self.consume();
                match ch {
                    '{' => Tok::LBrace,
                    '}' => Tok::RBrace,
                    '<' => Tok::LAngle,
                    '>' => Tok::RAngle,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    ';' => Tok::Semi,
                    '=' => Tok::Eq,
                    _ => Tok::Comma,
                }
            }
            '"' => Tok::Str(self.read_string()?),
            '&' => {
                self.consume();
                let label = self.read_word();
                if !is_label(&label) {
                    return Err(DecodeError::syntax(line, col, "expected label after '&'"));
                }
                Tok::Ref(label)
            }
            '/' => {
                self.consume();
                if self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
                    let name = self.read_word();
                    if self.consume() != Some('/') {
                        return Err(DecodeError::syntax(line, col, "unterminated directive"));
                    }
                    Tok::Directive(name)
                } else {
                    Tok::Slash
                }
            }
            c if is_word_start(c) => {
                let word = self.read_word();
                if self.peek() == Some(':') {
                    self.consume();
                    if !is_label(&word) {
                        return Err(DecodeError::syntax(line, col, "invalid label"));
                    }
                    Tok::Label(word)
                } else {
                    Tok::Word(word)
                }
            }
            other => {
                return Err(DecodeError::syntax(
                    line,
                    col,
                    format!("unexpected character '{}'", other),
                ))
            }
        };

        Ok(Some(Token { tok, line, col }))
    }
}

/// Split source text into tokens
pub fn tokenize(input: &str) -> Result<Vec<Token>, DecodeError> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

/// Accumulated value of one property while its items are parsed
enum Acc {
    Nothing,
    Cells(Vec<Cell>),
    Wide(Vec<u64>),
    Strings(Vec<String>),
    Bytes(Vec<u8>),
}

impl Acc {
    fn kind(&self) -> &'static str {
        match self {
            Acc::Nothing => "nothing",
            Acc::Cells(_) => "cells",
            Acc::Wide(_) => "64-bit cells",
            Acc::Strings(_) => "strings",
            Acc::Bytes(_) => "bytes",
        }
    }

    fn into_value(self) -> PropValue {
        match self {
            Acc::Nothing => PropValue::Empty,
            Acc::Cells(c) => PropValue::Cells(c),
            Acc::Wide(w) => PropValue::Wide(w),
            Acc::Strings(s) => PropValue::Strings(s),
            Acc::Bytes(b) => PropValue::Bytes(b),
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    tree: RawTree,
    end: (usize, usize),
}

fn parse_number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset).map(|t| &t.tok)
    }

    fn here(&self) -> (usize, usize) {
        self.tokens
            .get(self.pos)
            .map_or(self.end, |t| (t.line, t.col))
    }

    fn error(&self, message: impl Into<String>) -> DecodeError {
        let (line, col) = self.here();
        DecodeError::syntax(line, col, message)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|t| t.tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Tok, what: &str) -> Result<(), DecodeError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn parse_document(&mut self) -> Result<(), DecodeError> {
        self.expect(Tok::Directive("dts-v1".to_string()), "/dts-v1/")?;
        self.expect(Tok::Semi, "';'")?;
        self.expect(Tok::Slash, "root node '/'")?;
        self.expect(Tok::LBrace, "'{'")?;
        self.parse_body(RawTree::ROOT, 1)?;
        self.expect(Tok::RBrace, "'}'")?;
        self.expect(Tok::Semi, "';'")?;
        if self.peek().is_some() {
            return Err(self.error("trailing input after root node"));
        }
        Ok(())
    }

    fn parse_body(&mut self, parent: NodeIndex, depth: usize) -> Result<(), DecodeError> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(Tok::RBrace), _) | (None, _) => return Ok(()),
                (Some(Tok::Label(_)), _) | (Some(Tok::Word(_)), Some(Tok::LBrace)) => {
                    self.parse_node(parent, depth)?
                }
                (Some(Tok::Word(_)), _) => self.parse_property(parent)?,
                _ => return Err(self.error("expected property or node")),
            }
        }
    }

    fn parse_node(&mut self, parent: NodeIndex, depth: usize) -> Result<(), DecodeError> {
        if depth > MAX_DEPTH {
            return Err(self.error("nodes nested too deeply"));
        }
        let label = match self.peek() {
            Some(Tok::Label(l)) => {
                let l = l.clone();
                self.pos += 1;
                Some(l)
            }
            _ => None,
        };
        let name = match self.next() {
            Some(Tok::Word(name)) => name,
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.error("expected node name"));
            }
        };
        if self.tree.child(parent, &name).is_some() {
            self.pos -= 1;
            return Err(self.error(format!("duplicate node '{}'", name)));
        }

        let idx = self.tree.add_child(parent, name);
        if let Some(label) = label {
            self.tree.set_label(idx, label);
        }
        self.expect(Tok::LBrace, "'{'")?;
        self.parse_body(idx, depth + 1)?;
        self.expect(Tok::RBrace, "'}'")?;
        self.expect(Tok::Semi, "';'")
    }

    fn parse_property(&mut self, node: NodeIndex) -> Result<(), DecodeError> {
        let name = match self.next() {
            Some(Tok::Word(name)) => name,
            _ => return Err(self.error("expected property name")),
        };
        if self.tree.prop(node, &name).is_some() {
            self.pos -= 1;
            return Err(self.error(format!("duplicate property '{}'", name)));
        }

        let value = match self.next() {
            Some(Tok::Semi) => PropValue::Empty,
            Some(Tok::Eq) => {
                let mut acc = Acc::Nothing;
                loop {
                    acc = self.parse_value(acc)?;
                    match self.next() {
                        Some(Tok::Comma) => continue,
                        Some(Tok::Semi) => break,
                        _ => {
                            self.pos = self.pos.saturating_sub(1);
                            return Err(self.error("expected ',' or ';'"));
                        }
                    }
                }
                acc.into_value()
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.error("expected '=' or ';'"));
            }
        };
        self.tree.set_prop(node, name, value);
        Ok(())
    }

    fn mixed(&self, acc: &Acc, item: &str) -> DecodeError {
        self.error(format!("cannot mix {} and {} in one property", acc.kind(), item))
    }

    fn parse_value(&mut self, acc: Acc) -> Result<Acc, DecodeError> {
        match self.peek() {
            Some(Tok::LAngle) => {
                self.pos += 1;
                let cells = self.parse_cells(true)?;
                let cells = cells
                    .into_iter()
                    .map(|c| match c {
                        WideCell::Num(v) => u32::try_from(v)
                            .map(Cell::Num)
                            .map_err(|_| self.error("cell value exceeds 32 bits")),
                        WideCell::Ref(l) => Ok(Cell::Ref(l)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                match acc {
                    Acc::Nothing => Ok(Acc::Cells(cells)),
                    Acc::Cells(mut prev) => {
                        prev.extend(cells);
                        Ok(Acc::Cells(prev))
                    }
                    other => Err(self.mixed(&other, "cells")),
                }
            }
            Some(Tok::Directive(d)) if d == "bits" => {
                self.pos += 1;
                let width = match self.next() {
                    Some(Tok::Word(w)) => w,
                    _ => return Err(self.error("expected bit width")),
                };
                match width.as_str() {
                    "32" if self.peek() == Some(&Tok::LAngle) => self.parse_value(acc),
                    "64" => {
                        self.expect(Tok::LAngle, "'<'")?;
                        let values = self
                            .parse_cells(false)?
                            .into_iter()
                            .filter_map(|c| match c {
                                WideCell::Num(v) => Some(v),
                                WideCell::Ref(_) => None,
                            })
                            .collect::<Vec<_>>();
                        match acc {
                            Acc::Nothing => Ok(Acc::Wide(values)),
                            Acc::Wide(mut prev) => {
                                prev.extend(values);
                                Ok(Acc::Wide(prev))
                            }
                            other => Err(self.mixed(&other, "64-bit cells")),
                        }
                    }
                    _ => Err(self.error(format!("unsupported /bits/ width {}", width))),
                }
            }
            Some(Tok::Str(_)) => {
                let Some(Tok::Str(s)) = self.next() else {
                    return Err(self.error("expected string"));
                };
                match acc {
                    Acc::Nothing => Ok(Acc::Strings(vec![s])),
                    Acc::Strings(mut prev) => {
                        prev.push(s);
                        Ok(Acc::Strings(prev))
                    }
                    other => Err(self.mixed(&other, "strings")),
                }
            }
            Some(Tok::LBracket) => {
                self.pos += 1;
                let bytes = self.parse_bytes()?;
                match acc {
                    Acc::Nothing => Ok(Acc::Bytes(bytes)),
                    Acc::Bytes(mut prev) => {
                        prev.extend(bytes);
                        Ok(Acc::Bytes(prev))
                    }
                    other => Err(self.mixed(&other, "bytes")),
                }
            }
            _ => Err(self.error("expected property value")),
        }
    }

    /// Cells up to and including `>`
    fn parse_cells(&mut self, allow_refs: bool) -> Result<Vec<WideCell>, DecodeError> {
        let mut cells = Vec::new();
        loop {
            match self.next() {
                Some(Tok::RAngle) => return Ok(cells),
                Some(Tok::Word(w)) => match parse_number(&w) {
                    Some(v) => cells.push(WideCell::Num(v)),
                    None => {
                        self.pos -= 1;
                        return Err(self.error(format!("'{}' is not a number", w)));
                    }
                },
                Some(Tok::Ref(label)) if allow_refs => cells.push(WideCell::Ref(label)),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.error("expected number or '>'"));
                }
            }
        }
    }

    /// Hex bytes up to and including `]`
    fn parse_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let mut bytes = Vec::new();
        loop {
            match self.next() {
                Some(Tok::RBracket) => return Ok(bytes),
                Some(Tok::Word(w)) if w.len() % 2 == 0 && w.is_ascii() => {
                    for pair in w.as_bytes().chunks(2) {
                        let text = std::str::from_utf8(pair).unwrap_or("");
                        match u8::from_str_radix(text, 16) {
                            Ok(b) => bytes.push(b),
                            Err(_) => {
                                self.pos -= 1;
                                return Err(self.error(format!("'{}' is not hex", w)));
                            }
                        }
                    }
                }
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.error("expected hex bytes or ']'"));
                }
            }
        }
    }
}

enum WideCell {
    Num(u64),
    Ref(String),
}

/// Parse source text into a tree. References are not checked here; see
/// [`crate::resolve`].
pub fn parse(input: &str) -> Result<RawTree, DecodeError> {
    let tokens = tokenize(input)?;
    let end = tokens.last().map_or((1, 1), |t| (t.line, t.col + 1));
    let mut parser = Parser {
        tokens,
        pos: 0,
        tree: RawTree::new(),
        end,
    };
    parser.parse_document()?;
    Ok(parser.tree)
}

// ============================================================================
// Writer
// ============================================================================

fn fmt_num(out: &mut String, v: u64) {
    if v < 0x10000 {
        let _ = write!(out, "{}", v);
    } else {
        let _ = write!(out, "{:#x}", v);
    }
}

fn escape(out: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_control() => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

fn write_value(out: &mut String, value: &PropValue) {
    match value {
        PropValue::Empty => {}
        PropValue::Cells(cells) => {
            out.push_str(" = <");
            for (i, cell) in cells.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                match cell {
                    Cell::Num(v) => fmt_num(out, u64::from(*v)),
                    Cell::Ref(label) => {
                        out.push('&');
                        out.push_str(label);
                    }
                }
            }
            out.push('>');
        }
        PropValue::Wide(values) => {
            out.push_str(" = /bits/ 64 <");
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                fmt_num(out, *v);
            }
            out.push('>');
        }
        // An empty string list has no text form; it is written as an
        // empty property.
        PropValue::Strings(values) if values.is_empty() => {}
        PropValue::Strings(values) => {
            out.push_str(" = ");
            for (i, s) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push('"');
                escape(out, s);
                out.push('"');
            }
        }
        PropValue::Bytes(bytes) => {
            out.push_str(" = [");
            for (i, b) in bytes.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                let _ = write!(out, "{:02x}", b);
            }
            out.push(']');
        }
    }
}

fn write_node(out: &mut String, tree: &RawTree, idx: NodeIndex, depth: usize) {
    let node = tree.node(idx);
    let indent = "\t".repeat(depth);

    for prop in &node.props {
        out.push_str(&indent);
        out.push_str(&prop.name);
        write_value(out, &prop.value);
        out.push_str(";\n");
    }

    for (i, child) in node.children.iter().enumerate() {
        if i > 0 || !node.props.is_empty() {
            out.push('\n');
        }
        let child_node = tree.node(*child);
        out.push_str(&indent);
        if let Some(label) = &child_node.label {
            out.push_str(label);
            out.push_str(": ");
        }
        out.push_str(&child_node.name);
        out.push_str(" {\n");
        write_node(out, tree, *child, depth + 1);
        out.push_str(&indent);
        out.push_str("};\n");
    }
}

/// Canonical source text of a tree
pub fn write(tree: &RawTree) -> String {
    let mut out = String::from("/dts-v1/;\n\n/ {\n");
    write_node(&mut out, tree, RawTree::ROOT, 1);
    out.push_str("};\n");
    out
}
