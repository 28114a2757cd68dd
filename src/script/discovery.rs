//! Static discovery of the variables a PowerShell script references.
//!
//! The script is tokenized with PowerShell's lexical rules and every variable
//! token is collected. String interpolation is opaque to that pass, so the raw
//! text of every string literal is also scanned for `$name` and `${any text}`.
//! This over-matches (literal text that looks like a variable) and
//! under-matches (names built dynamically), and that is accepted: names the
//! caller's context does not define are simply dropped.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static STRING_VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([a-zA-Z0-9_]+)|\$\{([^}]+)\}").expect("variable pattern is valid")
});

/// Source of values for discovered variables.
pub trait VariableContext {
    /// The value of a variable, or `None` when it is not defined.
    fn try_get_variable(&self, name: &str) -> Option<String>;
}

impl VariableContext for HashMap<String, String> {
    fn try_get_variable(&self, name: &str) -> Option<String> {
        self.get(name).cloned().or_else(|| {
            self.iter()
                .find(|(key, _)| names_equal(key, name))
                .map(|(_, value)| value.clone())
        })
    }
}

impl<F> VariableContext for F
where
    F: Fn(&str) -> Option<String>,
{
    fn try_get_variable(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Case-insensitive comparison of variable names.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

/// Whether a discovered name may be injected as a variable: letters, digits,
/// `_` and `-` only.
pub fn is_legal_variable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

/// Names of every variable the script references, deduplicated
/// case-insensitively, in order of first appearance.
pub fn discover_variables(script: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut add = |name: &str| {
        if !name.is_empty() && !found.iter().any(|seen| names_equal(seen, name)) {
            found.push(name.to_string());
        }
    };

    let tokens = tokenize(script);
    for token in &tokens {
        if let Token::Variable(name) = token {
            add(name);
        }
    }
    for token in &tokens {
        if let Token::StringLiteral(text) = token {
            for caps in STRING_VARIABLE.captures_iter(text) {
                if let Some(name) = caps.get(1).or_else(|| caps.get(2)) {
                    add(name.as_str());
                }
            }
        }
    }
    found
}

/// Discover the script's variables and look up the legal ones in `context`.
///
/// A referenced variable the context leaves unset is not materialized.
pub fn extract_variables<C>(script: &str, context: &C) -> HashMap<String, String>
where
    C: VariableContext + ?Sized,
{
    discover_variables(script)
        .into_iter()
        .filter(|name| is_legal_variable_name(name))
        .filter_map(|name| context.try_get_variable(&name).map(|value| (name, value)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Variable(String),
    /// Raw text between the delimiters of a string literal.
    StringLiteral(String),
}

fn tokenize(script: &str) -> Vec<Token> {
    Lexer {
        chars: script.chars().collect(),
        pos: 0,
        tokens: Vec::new(),
    }
    .run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn at_word_start(&self) -> bool {
        self.pos == 0
            || self.chars[self.pos - 1].is_whitespace()
            || matches!(self.chars[self.pos - 1], ';' | '(' | '{' | '}' | ')' | '|')
    }

    fn run(mut self) -> Vec<Token> {
        while let Some(c) = self.peek(0) {
            match c {
                '<' if self.peek(1) == Some('#') => self.block_comment(),
                '#' if self.at_word_start() => self.line_comment(),
                '@' if matches!(self.peek(1), Some('"' | '\'')) && self.here_string_opens() => {
                    self.here_string()
                }
                // Splat; inside a word `@` is just a character.
                '@' if self.at_word_start() && self.peek(1).is_some_and(is_identifier_char) => {
                    self.pos += 1;
                    let name = self.identifier();
                    self.tokens.push(Token::Variable(name));
                }
                '"' => self.expandable_string(),
                '\'' => self.literal_string(),
                '$' => self.variable(),
                '`' => self.pos += 2,
                _ => self.pos += 1,
            }
        }
        self.tokens
    }

    fn line_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn block_comment(&mut self) {
        self.pos += 2;
        while let Some(c) = self.peek(0) {
            if c == '#' && self.peek(1) == Some('>') {
                self.pos += 2;
                return;
            }
            self.pos += 1;
        }
    }

    /// `@"` or `@'` opens a here-string only when the rest of the line is blank.
    fn here_string_opens(&self) -> bool {
        let mut i = self.pos + 2;
        while let Some(&c) = self.chars.get(i) {
            match c {
                '\n' => return true,
                c if c.is_whitespace() => i += 1,
                _ => return false,
            }
        }
        false
    }

    fn here_string(&mut self) {
        let quote = self.chars[self.pos + 1];
        while self.peek(0).is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
        self.pos += 1;
        let start = self.pos;
        // Closes at a line starting with the quote followed by `@`.
        let mut line_start = true;
        while let Some(c) = self.peek(0) {
            if line_start && c == quote && self.peek(1) == Some('@') {
                let text: String = self.chars[start..self.pos].iter().collect();
                self.tokens.push(Token::StringLiteral(text));
                self.pos += 2;
                return;
            }
            line_start = c == '\n';
            self.pos += 1;
        }
        let text: String = self.chars[start.min(self.chars.len())..].iter().collect();
        self.tokens.push(Token::StringLiteral(text));
    }

    fn expandable_string(&mut self) {
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            match c {
                '`' => self.pos += 2,
                '"' if self.peek(1) == Some('"') => self.pos += 2,
                '"' => {
                    let text: String = self.chars[start..self.pos].iter().collect();
                    self.tokens.push(Token::StringLiteral(text));
                    self.pos += 1;
                    return;
                }
                _ => self.pos += 1,
            }
        }
        let text: String = self.chars[start.min(self.chars.len())..].iter().collect();
        self.tokens.push(Token::StringLiteral(text));
    }

    fn literal_string(&mut self) {
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c == '\'' {
                if self.peek(1) == Some('\'') {
                    self.pos += 2;
                    continue;
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                self.tokens.push(Token::StringLiteral(text));
                self.pos += 1;
                return;
            }
            self.pos += 1;
        }
        let text: String = self.chars[start..].iter().collect();
        self.tokens.push(Token::StringLiteral(text));
    }

    fn variable(&mut self) {
        self.pos += 1;
        match self.peek(0) {
            Some('{') => {
                self.pos += 1;
                let mut name = String::new();
                while let Some(c) = self.peek(0) {
                    match c {
                        '}' => {
                            self.pos += 1;
                            break;
                        }
                        '`' => {
                            if let Some(escaped) = self.peek(1) {
                                name.push(escaped);
                            }
                            self.pos += 2;
                        }
                        _ => {
                            name.push(c);
                            self.pos += 1;
                        }
                    }
                }
                self.tokens.push(Token::Variable(name));
            }
            Some(c @ ('$' | '?' | '^')) => {
                self.pos += 1;
                self.tokens.push(Token::Variable(c.to_string()));
            }
            Some(c) if is_identifier_char(c) => {
                let mut name = self.identifier();
                // Scope or drive qualifier, e.g. `$env:PATH`.
                if self.peek(0) == Some(':')
                    && self.peek(1) != Some(':')
                    && self.peek(1).is_some_and(is_identifier_char)
                {
                    self.pos += 1;
                    name.push(':');
                    name.push_str(&self.identifier());
                }
                self.tokens.push(Token::Variable(name));
            }
            // `$(` subexpressions and a lone `$` are not variables.
            _ => {}
        }
    }

    fn identifier(&mut self) -> String {
        let mut name = String::new();
        while let Some(c) = self.peek(0) {
            if !is_identifier_char(c) {
                break;
            }
            name.push(c);
            self.pos += 1;
        }
        name
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
