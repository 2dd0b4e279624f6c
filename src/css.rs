//! Built-in stylesheet compiler for the nested-rule dialect.
//!
//! Supports:
//! - nested rules and `&` parent references
//! - comma selector lists (expanded parent-major)
//! - `/* */` and `//` comments
//! - `@media`, `@supports`, `@container`, `@layer`, `@document` bubbled
//!   out of the rules they are nested in
//! - opaque at-rules (`@keyframes`, `@font-face`, ...) emitted unscoped
//! - statement at-rules (`@import`, `@charset`, ...) passed through
//! - `@name: value;` variables, block scoped, substituted into declaration
//!   values and group at-rule preludes
//!
//! Mixins, functions, operations, guards and `@{name}` interpolation are not
//! part of the dialect. Interpolation and undefined variables are rejected
//! with a diagnostic; other constructs are passed through or rejected as
//! unrecognised input.

use crate::style::{StyleCompiler, StyleDiagnostic};
use std::collections::HashMap;

const GROUP_AT_RULES: &[&str] = &["media", "supports", "container", "layer", "document"];

/// Variables referring to variables deeper than this are taken as a cycle.
const MAX_VARIABLE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    /// 1-based
    line: usize,
    /// 0-based
    column: usize,
}

#[derive(Debug)]
enum Node {
    Declaration {
        name: String,
        value: String,
        pos: Pos,
    },
    Variable {
        name: String,
        value: String,
    },
    Rule {
        selectors: Vec<String>,
        children: Vec<Node>,
    },
    AtRule {
        name: String,
        prelude: String,
        block: Option<Vec<Node>>,
        pos: Pos,
    },
}

#[derive(Debug)]
enum Output {
    Rule {
        selectors: Vec<String>,
        declarations: Vec<(String, String)>,
    },
    Group {
        header: String,
        items: Vec<Output>,
    },
    Raw(String),
}

struct ParseError {
    message: String,
    pos: Pos,
}

impl ParseError {
    fn new(message: impl Into<String>, pos: Pos) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }
}

struct Parser {
    chars: Vec<char>,
    index: usize,
    line: usize,
    column: usize,
}

enum Terminator {
    Open,
    Semicolon,
    Close,
    Eof,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            index: 0,
            line: 1,
            column: 0,
        }
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.index + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.index += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    /// Skips a comment starting at the cursor. Returns false if none starts here.
    fn skip_comment(&mut self) -> Result<bool, ParseError> {
        match (self.peek(), self.peek_next()) {
            (Some('/'), Some('*')) => {
                let start = self.pos();
                self.bump();
                self.bump();
                loop {
                    match self.bump() {
                        Some('*') if self.peek() == Some('/') => {
                            self.bump();
                            return Ok(true);
                        }
                        Some(_) => {}
                        None => return Err(ParseError::new("Unclosed comment", start)),
                    }
                }
            }
            (Some('/'), Some('/')) => {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    if !self.skip_comment()? {
                        return Ok(());
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Reads text up to the next top-level `{`, `;` or `}` (not consumed).
    fn read_prelude(&mut self) -> Result<(String, Terminator), ParseError> {
        let mut text = String::new();
        let mut parens = 0usize;
        let mut brackets = 0usize;

        loop {
            let Some(c) = self.peek() else {
                return Ok((text, Terminator::Eof));
            };
            match c {
                '"' | '\'' => self.read_string(&mut text)?,
                '@' if self.peek_next() == Some('{') => {
                    // Keep `@{name}` whole so it is reported, not split as a block
                    while let Some(c) = self.bump() {
                        text.push(c);
                        if c == '}' {
                            break;
                        }
                    }
                }
                '/' if parens == 0 && matches!(self.peek_next(), Some('/') | Some('*')) => {
                    self.skip_comment()?;
                    text.push(' ');
                }
                '/' if self.peek_next() == Some('*') => {
                    self.skip_comment()?;
                    text.push(' ');
                }
                '(' => {
                    parens += 1;
                    text.push(c);
                    self.bump();
                }
                ')' => {
                    parens = parens.saturating_sub(1);
                    text.push(c);
                    self.bump();
                }
                '[' => {
                    brackets += 1;
                    text.push(c);
                    self.bump();
                }
                ']' => {
                    brackets = brackets.saturating_sub(1);
                    text.push(c);
                    self.bump();
                }
                '{' if parens == 0 && brackets == 0 => return Ok((text, Terminator::Open)),
                ';' if parens == 0 && brackets == 0 => return Ok((text, Terminator::Semicolon)),
                '}' if parens == 0 && brackets == 0 => return Ok((text, Terminator::Close)),
                _ => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    fn read_string(&mut self, text: &mut String) -> Result<(), ParseError> {
        let start = self.pos();
        let Some(quote) = self.bump() else {
            return Ok(());
        };
        text.push(quote);
        loop {
            match self.bump() {
                Some('\\') => {
                    text.push('\\');
                    if let Some(escaped) = self.bump() {
                        text.push(escaped);
                    }
                }
                Some(c) if c == quote => {
                    text.push(c);
                    return Ok(());
                }
                Some('\n') | None => return Err(ParseError::new("Unterminated string", start)),
                Some(c) => text.push(c),
            }
        }
    }

    /// Parses items until the closing brace of the block opened at `opener`,
    /// or until end of input at the top level.
    fn parse_items(&mut self, opener: Option<Pos>) -> Result<Vec<Node>, ParseError> {
        let mut nodes = Vec::new();

        loop {
            self.skip_trivia()?;
            let start = self.pos();

            match self.peek() {
                None => {
                    return match opener {
                        Some(pos) => Err(ParseError::new("Unclosed block: missing '}'", pos)),
                        None => Ok(nodes),
                    }
                }
                Some('}') => {
                    if opener.is_some() {
                        self.bump();
                        return Ok(nodes);
                    }
                    return Err(ParseError::new("Unexpected '}'", start));
                }
                Some(';') => {
                    self.bump();
                    continue;
                }
                _ => {}
            }

            let (prelude, terminator) = self.read_prelude()?;
            let prelude = collapse_whitespace(&prelude);

            match terminator {
                Terminator::Open => {
                    self.bump();
                    let children = self.parse_items(Some(start))?;
                    nodes.push(block_node(prelude, children, start)?);
                }
                Terminator::Semicolon => {
                    self.bump();
                    nodes.push(statement_node(prelude, start, opener.is_some())?);
                }
                Terminator::Close => {
                    nodes.push(statement_node(prelude, start, opener.is_some())?);
                }
                Terminator::Eof => {
                    if let Some(pos) = opener {
                        return Err(ParseError::new("Unclosed block: missing '}'", pos));
                    }
                    nodes.push(statement_node(prelude, start, false)?);
                    return Ok(nodes);
                }
            }
        }
    }
}

fn block_node(prelude: String, children: Vec<Node>, pos: Pos) -> Result<Node, ParseError> {
    if let Some(rest) = prelude.strip_prefix('@') {
        if matches!(variable_definition(rest), Some((_, ""))) {
            return Err(ParseError::new("Detached rulesets are not supported", pos));
        }
        let (name, params) = rest.split_once(' ').unwrap_or((rest, ""));
        if name.is_empty() {
            return Err(ParseError::new("Missing at-rule name", pos));
        }
        return Ok(Node::AtRule {
            name: name.to_ascii_lowercase(),
            prelude: params.trim().to_string(),
            block: Some(children),
            pos,
        });
    }

    if prelude.contains("@{") {
        return Err(ParseError::new("Selector interpolation is not supported", pos));
    }
    let selectors = split_top_level(&prelude, ',');
    if selectors.is_empty() || selectors.iter().any(|s| s.is_empty()) {
        return Err(ParseError::new("Missing selector before '{'", pos));
    }
    Ok(Node::Rule { selectors, children })
}

fn statement_node(prelude: String, pos: Pos, in_block: bool) -> Result<Node, ParseError> {
    if let Some(rest) = prelude.strip_prefix('@') {
        if let Some((name, value)) = variable_definition(rest) {
            if value.is_empty() {
                return Err(ParseError::new(format!("Missing value for variable '@{}'", name), pos));
            }
            return Ok(Node::Variable {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        let (name, params) = rest.split_once(' ').unwrap_or((rest, ""));
        return Ok(Node::AtRule {
            name: name.to_ascii_lowercase(),
            prelude: params.trim().to_string(),
            block: None,
            pos,
        });
    }

    let Some((name, value)) = prelude.split_once(':') else {
        return Err(ParseError::new(format!("Unrecognised input '{}'", prelude), pos));
    };
    let name = name.trim();
    let value = value.trim();

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ParseError::new(format!("Unrecognised input '{}'", prelude), pos));
    }
    if value.is_empty() {
        return Err(ParseError::new(format!("Missing value for property '{}'", name), pos));
    }
    if !in_block {
        return Err(ParseError::new(
            format!("Declaration '{}' must appear inside a rule", name),
            pos,
        ));
    }

    Ok(Node::Declaration {
        name: name.to_string(),
        value: value.to_string(),
        pos,
    })
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Splits `name: value` after the leading `@`, if that is what `rest` is.
fn variable_definition(rest: &str) -> Option<(&str, &str)> {
    let end = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
    let (name, tail) = rest.split_at(end);
    let value = tail.trim_start().strip_prefix(':')?;
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

/// Variables visible inside one block: its own definitions over the
/// enclosing blocks'. A later definition in the same block wins, and a
/// variable may be used before the line that defines it.
struct Scope<'a> {
    variables: HashMap<&'a str, &'a str>,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    fn new(nodes: &'a [Node], parent: Option<&'a Scope<'a>>) -> Self {
        let variables = nodes
            .iter()
            .filter_map(|node| match node {
                Node::Variable { name, value } => Some((name.as_str(), value.as_str())),
                _ => None,
            })
            .collect();
        Self { variables, parent }
    }

    fn lookup(&self, name: &str) -> Option<(&'a str, &Self)> {
        let mut scope = self;
        loop {
            if let Some(value) = scope.variables.get(name) {
                return Some((*value, scope));
            }
            scope = scope.parent?;
        }
    }

    /// Replaces every `@name` outside quotes with the variable's value.
    fn substitute(&self, text: &str, pos: Pos) -> Result<String, ParseError> {
        self.substitute_at(text, pos, 0)
    }

    fn substitute_at(&self, text: &str, pos: Pos, depth: usize) -> Result<String, ParseError> {
        if !text.contains('@') {
            return Ok(text.to_string());
        }
        if depth > MAX_VARIABLE_DEPTH {
            return Err(ParseError::new("Recursive variable definition", pos));
        }

        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();
        let mut quote: Option<char> = None;

        while let Some(c) = chars.next() {
            if let Some(q) = quote {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '"' | '\'' => {
                    quote = Some(c);
                    out.push(c);
                }
                '@' => {
                    if chars.peek() == Some(&'{') {
                        return Err(ParseError::new("Variable interpolation is not supported", pos));
                    }
                    let mut name = String::new();
                    while let Some(&next) = chars.peek() {
                        if !is_name_char(next) {
                            break;
                        }
                        name.push(next);
                        chars.next();
                    }
                    if name.is_empty() {
                        out.push('@');
                        continue;
                    }
                    match self.lookup(&name) {
                        Some((value, owner)) => out.push_str(&owner.substitute_at(value, pos, depth + 1)?),
                        None => return Err(ParseError::new(format!("variable @{} is undefined", name), pos)),
                    }
                }
                _ => out.push(c),
            }
        }
        Ok(out)
    }
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in text.chars() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        if c == '"' || c == '\'' {
            quote = Some(c);
        }
        out.push(c);
    }
    out
}

fn split_top_level(text: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match (quote, c) {
            (Some(q), _) => {
                if c == q {
                    quote = None;
                }
            }
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '(') | (None, '[') => depth += 1,
            (None, ')') | (None, ']') => depth = depth.saturating_sub(1),
            (None, _) if c == separator && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() || !parts.is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn resolve_selectors(parents: &[String], own: &[String]) -> Vec<String> {
    if parents.is_empty() {
        return own
            .iter()
            .map(|s| collapse_whitespace(&s.replace('&', "")))
            .collect();
    }

    let mut resolved = Vec::with_capacity(parents.len() * own.len());
    for parent in parents {
        for selector in own {
            if selector.contains('&') {
                resolved.push(selector.replace('&', parent));
            } else {
                resolved.push(format!("{} {}", parent, selector));
            }
        }
    }
    resolved
}

fn flatten(nodes: &[Node], parents: &[String], outer: Option<&Scope<'_>>) -> Result<Vec<Output>, ParseError> {
    let scope = Scope::new(nodes, outer);
    let mut declarations = Vec::new();
    let mut nested = Vec::new();

    for node in nodes {
        match node {
            Node::Declaration { name, value, pos } => {
                if parents.is_empty() {
                    return Err(ParseError::new(
                        format!("Declaration '{}' must appear inside a rule", name),
                        *pos,
                    ));
                }
                declarations.push((name.clone(), scope.substitute(value, *pos)?));
            }
            Node::Variable { .. } => {}
            Node::Rule { selectors, children } => {
                let resolved = resolve_selectors(parents, selectors);
                nested.extend(flatten(children, &resolved, Some(&scope))?);
            }
            Node::AtRule {
                name,
                prelude,
                block: Some(children),
                pos,
            } if GROUP_AT_RULES.contains(&name.as_str()) => {
                let items = flatten(children, parents, Some(&scope))?;
                if !items.is_empty() {
                    nested.push(Output::Group {
                        header: at_header(name, &scope.substitute(prelude, *pos)?),
                        items,
                    });
                }
            }
            Node::AtRule {
                name,
                prelude,
                block: Some(children),
                ..
            } => {
                let mut text = String::new();
                write_opaque(&mut text, &at_header(name, prelude), children, 0, &scope)?;
                nested.push(Output::Raw(text));
            }
            Node::AtRule {
                name,
                prelude,
                block: None,
                ..
            } => {
                nested.push(Output::Raw(format!("{};\n", at_header(name, prelude))));
            }
        }
    }

    if !declarations.is_empty() {
        nested.insert(
            0,
            Output::Rule {
                selectors: parents.to_vec(),
                declarations,
            },
        );
    }
    Ok(nested)
}

fn at_header(name: &str, prelude: &str) -> String {
    if prelude.is_empty() {
        format!("@{}", name)
    } else {
        format!("@{} {}", name, prelude)
    }
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

fn write_opaque(
    out: &mut String,
    header: &str,
    children: &[Node],
    depth: usize,
    outer: &Scope<'_>,
) -> Result<(), ParseError> {
    let scope = Scope::new(children, Some(outer));
    out.push_str(&format!("{}{} {{\n", indent(depth), header));
    for child in children {
        match child {
            Node::Declaration { name, value, pos } => {
                let value = scope.substitute(value, *pos)?;
                out.push_str(&format!("{}{}: {};\n", indent(depth + 1), name, value));
            }
            Node::Variable { .. } => {}
            Node::Rule { selectors, children } => {
                write_opaque(out, &selectors.join(", "), children, depth + 1, &scope)?;
            }
            Node::AtRule {
                name,
                prelude,
                block: Some(inner),
                ..
            } => {
                write_opaque(out, &at_header(name, prelude), inner, depth + 1, &scope)?;
            }
            Node::AtRule {
                name,
                prelude,
                block: None,
                ..
            } => {
                out.push_str(&format!("{}{};\n", indent(depth + 1), at_header(name, prelude)));
            }
        }
    }
    out.push_str(&format!("{}}}\n", indent(depth)));
    Ok(())
}

fn write_output(out: &mut String, items: &[Output], depth: usize) {
    for item in items {
        match item {
            Output::Rule { selectors, declarations } => {
                let separator = format!(",\n{}", indent(depth));
                out.push_str(&format!("{}{} {{\n", indent(depth), selectors.join(&separator)));
                for (name, value) in declarations {
                    out.push_str(&format!("{}{}: {};\n", indent(depth + 1), name, value));
                }
                out.push_str(&format!("{}}}\n", indent(depth)));
            }
            Output::Group { header, items } => {
                out.push_str(&format!("{}{} {{\n", indent(depth), header));
                write_output(out, items, depth + 1);
                out.push_str(&format!("{}}}\n", indent(depth)));
            }
            Output::Raw(text) => {
                for line in text.lines() {
                    out.push_str(&format!("{}{}\n", indent(depth), line));
                }
            }
        }
    }
}

/// In-process compiler for nested stylesheets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NestingCompiler;

impl NestingCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl StyleCompiler for NestingCompiler {
    fn compile(&self, source: &str) -> Result<String, StyleDiagnostic> {
        let parsed = Parser::new(source)
            .parse_items(None)
            .and_then(|nodes| flatten(&nodes, &[], None));

        match parsed {
            Ok(items) => {
                let mut css = String::new();
                write_output(&mut css, &items, 0);
                Ok(css)
            }
            Err(ParseError { message, pos }) => {
                let excerpt = source
                    .lines()
                    .skip(pos.line - 1)
                    .take(2)
                    .map(str::to_string)
                    .collect();
                Err(StyleDiagnostic {
                    message,
                    line: pos.line,
                    column: pos.column,
                    excerpt,
                })
            }
        }
    }
}
