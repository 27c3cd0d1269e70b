//! Minimal text templates for record lines.
//!
//! The syntax is a subset of Go's `text/template`, enough to write record
//! lines such as:
//!
//! ```text
//! {{ .Name }} 60 IN TXT "{{ .Remote }}"
//! {{ .Name }} {{ .Meta "ttl" | parseInt }} IN A 10.0.0.1
//! ```
//!
//! Supported: literal text, `{{ … }}` actions with `{{-` / `-}}` trimming,
//! comments, pipelines, field chains (`.Question.Type`), string, raw string,
//! integer and boolean literals, parenthesized pipelines and calls into an
//! injected [`FunctionTable`]. Control structures are rejected when parsing,
//! so executing a template is bounded by its length.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Upper bound on rendered output, in bytes.
pub const MAX_OUTPUT: usize = 64 * 1024;

const KEYWORDS: &[&str] = &[
    "if", "else", "end", "range", "with", "define", "template", "block", "break", "continue",
];

/// Template parse or execution error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// The template text is malformed.
    #[error("parse error at byte {offset}: {message}")]
    Parse {
        /// Byte offset into the template source.
        offset: usize,
        /// What went wrong.
        message: String,
    },

    /// The template called a function that is not in the table.
    #[error("function {0:?} not defined")]
    UnknownFunction(String),

    /// A field or method is not available on the data.
    #[error("can't evaluate field {0}")]
    UnknownField(String),

    /// A function or method returned an error.
    #[error("error calling {name}: {message}")]
    Call {
        /// Function or method name.
        name: String,
        /// Error reported by the callee.
        message: String,
    },

    /// Output exceeded [`MAX_OUTPUT`].
    #[error("output exceeds {MAX_OUTPUT} bytes")]
    OutputTooLarge,

    /// Anything else that fails while executing.
    #[error("{0}")]
    Exec(String),
}

/// A value flowing through a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Missing value; prints as nothing.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// Text.
    Str(String),
}

impl Value {
    /// Interpret as an integer when possible.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Uint(u) => write!(f, "{u}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Data a template is executed against.
pub trait Scope {
    /// Resolve a field chain such as `["Question", "Name"]`. An empty path
    /// is the dot itself.
    fn field(&self, path: &[String]) -> Result<Value, TemplateError>;

    /// Call a method such as `.Meta "key"`.
    fn method(&self, path: &[String], args: &[Value]) -> Result<Value, TemplateError>;
}

/// A template function.
pub type Function = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Named functions available to templates.
///
/// Passed into rendering explicitly; there is no global registry.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, Function>,
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable").field("functions", &names).finish()
    }
}

impl FunctionTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with `parseInt`, `lower` and `upper`.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.insert("parseInt", parse_int);
        table.insert("lower", |args: &[Value]| {
            Ok(Value::Str(single_str("lower", args)?.to_lowercase()))
        });
        table.insert("upper", |args: &[Value]| {
            Ok(Value::Str(single_str("upper", args)?.to_uppercase()))
        });
        table
    }

    /// Add or replace a function.
    pub fn insert<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    /// Look up a function.
    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// True if the function exists.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

fn single_str<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, String> {
    match args {
        [Value::Str(s)] => Ok(s),
        _ => Err(format!("{name} expects one string argument")),
    }
}

/// `parseInt s [base [bits]]`, after Go's `strconv.ParseUint`.
fn parse_int(args: &[Value]) -> Result<Value, String> {
    let (text, base, bits) = match args {
        [s] => (s, 0, 64),
        [s, base] => (s, int_arg(base)?, 64),
        [s, base, bits] => (s, int_arg(base)?, int_arg(bits)?),
        _ => return Err("parseInt expects 1 to 3 arguments".to_string()),
    };
    let text = match text {
        Value::Str(s) => s.clone(),
        Value::Int(_) | Value::Uint(_) => text.to_string(),
        other => return Err(format!("parseInt: unsupported argument {other:?}")),
    };
    if !(0..=64).contains(&bits) {
        return Err(format!("parseInt: invalid bit size {bits}"));
    }

    let digits = text.replace('_', "");
    let (digits, radix) = match base {
        0 => {
            let lower = digits.to_ascii_lowercase();
            if let Some(rest) = lower.strip_prefix("0x") {
                (rest.to_string(), 16)
            } else if let Some(rest) = lower.strip_prefix("0o") {
                (rest.to_string(), 8)
            } else if let Some(rest) = lower.strip_prefix("0b") {
                (rest.to_string(), 2)
            } else if lower.len() > 1 && lower.starts_with('0') {
                (lower[1..].to_string(), 8)
            } else {
                (lower, 10)
            }
        }
        2..=36 => (digits, base as u32),
        _ => return Err(format!("parseInt: invalid base {base}")),
    };

    let value = u64::from_str_radix(&digits, radix)
        .map_err(|e| format!("parseInt: parsing {text:?}: {e}"))?;
    let bits = if bits == 0 { 64 } else { bits };
    if bits < 64 && value >> bits != 0 {
        return Err(format!("parseInt: parsing {text:?}: value out of range"));
    }
    Ok(Value::Uint(value))
}

fn int_arg(value: &Value) -> Result<i64, String> {
    value
        .as_i64()
        .ok_or_else(|| format!("expected integer argument, got {value:?}"))
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Action(Pipeline),
}

#[derive(Debug, Clone, PartialEq)]
struct Pipeline {
    commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
struct Command {
    args: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Field(Vec<String>),
    Ident(String),
    Literal(Value),
    Pipe(Box<Pipeline>),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    /// Parse template text.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let nodes = Parser::new(source).parse()?;
        Ok(Self { nodes })
    }

    /// Names of all functions the template calls.
    pub fn function_names(&self) -> Vec<&str> {
        fn walk<'a>(pipeline: &'a Pipeline, out: &mut Vec<&'a str>) {
            for command in &pipeline.commands {
                for arg in &command.args {
                    match arg {
                        Operand::Ident(name) => out.push(name),
                        Operand::Pipe(inner) => walk(inner, out),
                        _ => {}
                    }
                }
            }
        }

        let mut names = Vec::new();
        for node in &self.nodes {
            if let Node::Action(pipeline) = node {
                walk(pipeline, &mut names);
            }
        }
        names
    }

    /// Execute against `scope`, calling into `functions`.
    pub fn execute(
        &self,
        scope: &dyn Scope,
        functions: &FunctionTable,
    ) -> Result<String, TemplateError> {
        let mut out = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Action(pipeline) => {
                    let value = eval_pipeline(pipeline, scope, functions)?;
                    out.push_str(&value.to_string());
                }
            }
            if out.len() > MAX_OUTPUT {
                return Err(TemplateError::OutputTooLarge);
            }
        }
        Ok(out)
    }
}

fn eval_pipeline(
    pipeline: &Pipeline,
    scope: &dyn Scope,
    functions: &FunctionTable,
) -> Result<Value, TemplateError> {
    let mut piped: Option<Value> = None;
    for command in &pipeline.commands {
        piped = Some(eval_command(command, piped.take(), scope, functions)?);
    }
    Ok(piped.unwrap_or(Value::Nil))
}

fn eval_command(
    command: &Command,
    piped: Option<Value>,
    scope: &dyn Scope,
    functions: &FunctionTable,
) -> Result<Value, TemplateError> {
    let (head, rest) = command
        .args
        .split_first()
        .ok_or_else(|| TemplateError::Exec("empty command".to_string()))?;

    let mut args = rest
        .iter()
        .map(|arg| eval_operand(arg, scope, functions))
        .collect::<Result<Vec<_>, _>>()?;
    args.extend(piped);

    match head {
        Operand::Ident(name) => {
            let function = functions
                .get(name)
                .ok_or_else(|| TemplateError::UnknownFunction(name.clone()))?;
            function(&args).map_err(|message| TemplateError::Call {
                name: name.clone(),
                message,
            })
        }
        Operand::Field(path) if args.is_empty() => scope.field(path),
        Operand::Field(path) => scope.method(path, &args),
        other if args.is_empty() => eval_operand(other, scope, functions),
        _ => Err(TemplateError::Exec(
            "can't give argument to non-function".to_string(),
        )),
    }
}

fn eval_operand(
    operand: &Operand,
    scope: &dyn Scope,
    functions: &FunctionTable,
) -> Result<Value, TemplateError> {
    match operand {
        Operand::Field(path) => scope.field(path),
        Operand::Literal(value) => Ok(value.clone()),
        Operand::Pipe(pipeline) => eval_pipeline(pipeline, scope, functions),
        Operand::Ident(name) => {
            let function = functions
                .get(name)
                .ok_or_else(|| TemplateError::UnknownFunction(name.clone()))?;
            function(&[]).map_err(|message| TemplateError::Call {
                name: name.clone(),
                message,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>),
    Ident(String),
    Literal(Value),
    Pipe,
    Open,
    Close,
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> TemplateError {
        TemplateError::Parse {
            offset,
            message: message.into(),
        }
    }

    fn parse(mut self) -> Result<Vec<Node>, TemplateError> {
        let mut nodes = Vec::new();
        let mut trim_next = false;

        while self.pos < self.src.len() {
            let rest = &self.src[self.pos..];
            let Some(open) = rest.find("{{") else {
                push_text(&mut nodes, rest, trim_next, false);
                break;
            };

            let trim_left = rest[open + 2..].starts_with("- ")
                || rest[open + 2..].starts_with("-\t")
                || rest[open + 2..].starts_with("-\n");
            push_text(&mut nodes, &rest[..open], trim_next, trim_left);

            let action_start = self.pos + open;
            self.pos = action_start + 2 + if trim_left { 2 } else { 0 };

            let (pipeline, trim_right) = self.parse_action(action_start)?;
            if let Some(pipeline) = pipeline {
                nodes.push(Node::Action(pipeline));
            }
            trim_next = trim_right;
        }

        Ok(nodes)
    }

    /// Parse one action body; `self.pos` sits just after `{{` (and `- `).
    fn parse_action(&mut self, start: usize) -> Result<(Option<Pipeline>, bool), TemplateError> {
        self.skip_space();
        if self.src[self.pos..].starts_with("/*") {
            let end = self.src[self.pos..]
                .find("*/")
                .ok_or_else(|| self.error(start, "unclosed comment"))?;
            self.pos += end + 2;
            let trim_right = self.close_action(start)?;
            return Ok((None, trim_right));
        }

        let mut tokens = Vec::new();
        let trim_right = loop {
            self.skip_space();
            if self.at_close() {
                break self.close_action(start)?;
            }
            if self.pos >= self.src.len() {
                return Err(self.error(start, "unclosed action"));
            }
            let offset = self.pos;
            tokens.push((offset, self.next_token()?));
        };

        if tokens.is_empty() {
            return Err(self.error(start, "missing value for command"));
        }
        if let (offset, Token::Ident(word)) = &tokens[0] {
            if KEYWORDS.contains(&word.as_str()) {
                return Err(self.error(*offset, format!("unsupported action {word:?}")));
            }
        }

        let mut cursor = 0;
        let pipeline = parse_pipeline(&tokens, &mut cursor, false).map_err(|(offset, msg)| {
            self.error(offset.unwrap_or(start), msg)
        })?;
        Ok((Some(pipeline), trim_right))
    }

    fn at_close(&self) -> bool {
        let rest = &self.src[self.pos..];
        rest.starts_with("}}") || rest.starts_with("-}}")
    }

    fn close_action(&mut self, start: usize) -> Result<bool, TemplateError> {
        self.skip_space();
        let rest = &self.src[self.pos..];
        if rest.starts_with("-}}") {
            self.pos += 3;
            Ok(true)
        } else if rest.starts_with("}}") {
            self.pos += 2;
            Ok(false)
        } else {
            Err(self.error(start, "unclosed action"))
        }
    }

    fn skip_space(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn next_token(&mut self) -> Result<Token, TemplateError> {
        let rest = &self.src[self.pos..];
        let start = self.pos;
        let c = rest.chars().next().unwrap_or_default();

        match c {
            '|' => {
                self.pos += 1;
                Ok(Token::Pipe)
            }
            '(' => {
                self.pos += 1;
                Ok(Token::Open)
            }
            ')' => {
                self.pos += 1;
                Ok(Token::Close)
            }
            '"' => self.quoted(start),
            '`' => {
                let end = rest[1..]
                    .find('`')
                    .ok_or_else(|| self.error(start, "unterminated raw string"))?;
                self.pos += end + 2;
                Ok(Token::Literal(Value::Str(rest[1..end + 1].to_string())))
            }
            '.' => {
                let mut path = Vec::new();
                let mut cursor = 0;
                while rest[cursor..].starts_with('.') {
                    let ident = ident_len(&rest[cursor + 1..]);
                    if ident == 0 {
                        break;
                    }
                    path.push(rest[cursor + 1..cursor + 1 + ident].to_string());
                    cursor += 1 + ident;
                }
                // A lone dot is the data itself.
                self.pos += cursor.max(1);
                Ok(Token::Field(path))
            }
            '-' | '+' | '0'..='9' => {
                let len = rest
                    .char_indices()
                    .skip(1)
                    .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '_'))
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
                let text = &rest[..len];
                self.pos += len;
                text.parse::<i64>()
                    .map(|i| Token::Literal(Value::Int(i)))
                    .map_err(|_| self.error(start, format!("bad number syntax: {text:?}")))
            }
            c if c.is_alphabetic() || c == '_' => {
                let len = ident_len(rest);
                self.pos += len;
                Ok(match &rest[..len] {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "nil" => Token::Literal(Value::Nil),
                    word => Token::Ident(word.to_string()),
                })
            }
            other => Err(self.error(start, format!("unexpected {other:?} in action"))),
        }
    }

    fn quoted(&mut self, start: usize) -> Result<Token, TemplateError> {
        let mut out = String::new();
        let mut chars = self.src[start + 1..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos = start + 1 + i + 1;
                    return Ok(Token::Literal(Value::Str(out)));
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, '"')) => out.push('"'),
                    Some((_, other)) => {
                        return Err(self.error(start, format!("unknown escape \\{other}")))
                    }
                    None => break,
                },
                '\n' => break,
                c => out.push(c),
            }
        }
        Err(self.error(start, "unterminated quoted string"))
    }
}

fn ident_len(s: &str) -> usize {
    s.char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

fn push_text(nodes: &mut Vec<Node>, text: &str, trim_start: bool, trim_end: bool) {
    let mut text = text;
    if trim_start {
        text = text.trim_start();
    }
    if trim_end {
        text = text.trim_end();
    }
    if !text.is_empty() {
        nodes.push(Node::Text(text.to_string()));
    }
}

type ParseFailure = (Option<usize>, String);

fn parse_pipeline(
    tokens: &[(usize, Token)],
    cursor: &mut usize,
    nested: bool,
) -> Result<Pipeline, ParseFailure> {
    let mut commands = Vec::new();
    let mut args = Vec::new();

    while let Some((offset, token)) = tokens.get(*cursor) {
        *cursor += 1;
        match token {
            Token::Pipe => {
                if args.is_empty() {
                    return Err((Some(*offset), "missing command before '|'".to_string()));
                }
                commands.push(Command {
                    args: std::mem::take(&mut args),
                });
            }
            Token::Close if nested => {
                if args.is_empty() {
                    return Err((Some(*offset), "empty parenthesized pipeline".to_string()));
                }
                commands.push(Command { args });
                return Ok(Pipeline { commands });
            }
            Token::Close => return Err((Some(*offset), "unexpected ')'".to_string())),
            Token::Open => {
                let inner = parse_pipeline(tokens, cursor, true)?;
                args.push(Operand::Pipe(Box::new(inner)));
            }
            Token::Field(path) => args.push(Operand::Field(path.clone())),
            Token::Ident(name) => args.push(Operand::Ident(name.clone())),
            Token::Literal(value) => args.push(Operand::Literal(value.clone())),
        }
    }

    if nested {
        return Err((None, "unclosed '('".to_string()));
    }
    if args.is_empty() {
        return Err((None, "missing command after '|'".to_string()));
    }
    commands.push(Command { args });
    Ok(Pipeline { commands })
}
