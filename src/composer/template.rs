//! Template expansion for workflow arguments, conditions and output.
//!
//! Templates are `{{ ... }}` actions evaluated over a JSON binding:
//!
//! ```text
//! {{.params.repo}}                         input parameter
//! {{.steps.fetch.output.title}}            field of a step's output
//! {{if eq .steps.fetch.status "completed"}}ok{{else}}skipped{{end}}
//! {"issue": {{json .steps.fetch.output}}}  JSON-encode a value
//! {{(fromJson .steps.api.output.text).id}} parse a string-encoded payload
//! ```
//!
//! Supported: actions, pipelines, parenthesized pipelines, `if`/`else if`/
//! `else`, `range`, `with`, `$` for the root binding, trim markers and
//! comments. Functions: `json`, `fromJson`, `quote`, `default`, `eq`, `ne`,
//! `lt`, `le`, `gt`, `ge`, `and`, `or`, `not`, `len`, `index`.
//!
//! Missing values render as `<no value>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Number, Value};

use super::WorkflowContext;
use super::error::TemplateError;
use crate::context::CallContext;
use crate::vmcp::JsonMap;

/// Maximum nesting depth of expanded data
pub const MAX_TEMPLATE_DEPTH: usize = 100;
/// Maximum bytes produced by one expansion
pub const MAX_TEMPLATE_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

const NO_VALUE: &str = "<no value>";

const FUNCTIONS: [&str; 15] = [
    "json", "fromJson", "quote", "default", "eq", "ne", "lt", "le", "gt", "ge", "and", "or",
    "not", "len", "index",
];

/// Expands templates against a workflow's state
#[async_trait]
pub trait TemplateExpander: Send + Sync {
    /// Render every string leaf of `data`; other leaves are kept as-is.
    async fn expand(
        &self,
        ctx: &CallContext,
        data: &JsonMap,
        workflow: &WorkflowContext,
    ) -> Result<JsonMap, TemplateError>;

    /// Render `condition` and read it as a boolean. Empty means `true`.
    async fn evaluate_condition(
        &self,
        ctx: &CallContext,
        condition: &str,
        workflow: &WorkflowContext,
    ) -> Result<bool, TemplateError>;

    /// Render a JSON output template with `.workflow.end_time` and
    /// `.workflow.duration_ms` filled in and parse the result as an object.
    async fn expand_output_format(
        &self,
        ctx: &CallContext,
        format: &str,
        workflow: &WorkflowContext,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<JsonMap, TemplateError>;
}

/// [`TemplateExpander`] with the standard depth and size limits
#[derive(Debug, Clone)]
pub struct DefaultTemplateExpander {
    max_depth: usize,
    max_output_size: usize,
}

impl Default for DefaultTemplateExpander {
    fn default() -> Self {
        Self {
            max_depth: MAX_TEMPLATE_DEPTH,
            max_output_size: MAX_TEMPLATE_OUTPUT_SIZE,
        }
    }
}

impl DefaultTemplateExpander {
    /// Expander with default limits
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the output size limit
    #[must_use]
    pub fn with_max_output_size(mut self, bytes: usize) -> Self {
        self.max_output_size = bytes;
        self
    }

    fn expand_value(
        &self,
        ctx: &CallContext,
        value: &Value,
        binding: &Value,
        depth: usize,
        budget: &mut usize,
    ) -> Result<Value, TemplateError> {
        if depth > self.max_depth {
            return Err(TemplateError::DepthExceeded(self.max_depth));
        }
        match value {
            Value::String(text) => {
                if ctx.err().is_some() {
                    return Err(TemplateError::Cancelled);
                }
                if !text.contains("{{") {
                    return Ok(value.clone());
                }
                let tree = parse(text)?;
                let rendered = execute(&tree, binding, *budget, self.max_output_size)?;
                *budget = budget.saturating_sub(rendered.len());
                Ok(Value::String(rendered))
            }
            Value::Object(map) => Ok(Value::Object(
                self.expand_map(ctx, map, binding, depth, budget)?,
            )),
            Value::Array(items) => items
                .iter()
                .map(|item| self.expand_value(ctx, item, binding, depth + 1, budget))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn expand_map(
        &self,
        ctx: &CallContext,
        map: &JsonMap,
        binding: &Value,
        depth: usize,
        budget: &mut usize,
    ) -> Result<JsonMap, TemplateError> {
        if depth > self.max_depth {
            return Err(TemplateError::DepthExceeded(self.max_depth));
        }
        map.iter()
            .map(|(key, value)| {
                Ok((
                    key.clone(),
                    self.expand_value(ctx, value, binding, depth + 1, budget)?,
                ))
            })
            .collect()
    }
}

#[async_trait]
impl TemplateExpander for DefaultTemplateExpander {
    async fn expand(
        &self,
        ctx: &CallContext,
        data: &JsonMap,
        workflow: &WorkflowContext,
    ) -> Result<JsonMap, TemplateError> {
        if ctx.err().is_some() {
            return Err(TemplateError::Cancelled);
        }
        let binding = workflow.template_data();
        let mut budget = self.max_output_size;
        self.expand_map(ctx, data, &binding, 0, &mut budget)
    }

    async fn evaluate_condition(
        &self,
        ctx: &CallContext,
        condition: &str,
        workflow: &WorkflowContext,
    ) -> Result<bool, TemplateError> {
        if condition.is_empty() {
            return Ok(true);
        }
        if ctx.err().is_some() {
            return Err(TemplateError::Cancelled);
        }
        let tree = parse(condition)?;
        let rendered = execute(
            &tree,
            &workflow.template_data(),
            self.max_output_size,
            self.max_output_size,
        )?;
        match rendered.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(TemplateError::InvalidCondition(rendered)),
        }
    }

    async fn expand_output_format(
        &self,
        ctx: &CallContext,
        format: &str,
        workflow: &WorkflowContext,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<JsonMap, TemplateError> {
        if ctx.err().is_some() {
            return Err(TemplateError::Cancelled);
        }
        let tree = parse(format).map_err(|e| TemplateError::InvalidOutputFormat(e.to_string()))?;

        let mut binding = workflow.template_data();
        if let Some(meta) = binding.get_mut("workflow").and_then(Value::as_object_mut) {
            meta.insert("start_time".into(), start_time.timestamp_millis().into());
            meta.insert("end_time".into(), end_time.timestamp_millis().into());
            meta.insert(
                "duration_ms".into(),
                (end_time - start_time).num_milliseconds().max(0).into(),
            );
        }

        let rendered = execute(&tree, &binding, self.max_output_size, self.max_output_size)?;
        match serde_json::from_str::<Value>(&rendered) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(TemplateError::OutputNotJson(format!(
                "expected a JSON object, got {}",
                kind(&other)
            ))),
            Err(e) => Err(TemplateError::OutputNotJson(e.to_string())),
        }
    }
}

/// Check that `template` parses
pub fn validate_template(template: &str) -> Result<(), TemplateError> {
    parse(template).map(|_| ())
}

/// Render `template` against an arbitrary JSON binding
pub fn render(template: &str, binding: &Value) -> Result<String, TemplateError> {
    let tree = parse(template)?;
    execute(&tree, binding, MAX_TEMPLATE_OUTPUT_SIZE, MAX_TEMPLATE_OUTPUT_SIZE)
}

/// Field paths referenced by `template`, such as `.steps.fetch.output.title`.
/// Paths rooted at `$` are reported relative to the root as well.
pub fn extract_references(template: &str) -> Result<Vec<String>, TemplateError> {
    let tree = parse(template)?;
    let mut refs = Vec::new();
    collect_nodes(&tree, &mut refs);
    let mut seen = std::collections::HashSet::new();
    refs.retain(|r| seen.insert(r.clone()));
    Ok(refs)
}

// ============================================================================
// Parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Action(Pipeline),
    If {
        branches: Vec<(Pipeline, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    Range {
        pipeline: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    With {
        pipeline: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Pipeline(Vec<Command>);

#[derive(Debug, Clone, PartialEq)]
struct Command(Vec<Operand>);

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Dot,
    Field(Vec<String>),
    Root(Vec<String>),
    Chain(Box<Pipeline>, Vec<String>),
    Literal(Value),
    Function(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dot,
    Field(Vec<String>),
    Root(Vec<String>),
    Ident(String),
    Literal(Value),
    Pipe,
    Open,
    Close,
}

enum Segment {
    Text(String),
    Action(Vec<Token>),
}

fn parse(source: &str) -> Result<Vec<Node>, TemplateError> {
    let segments = split(source)?;
    let mut parser = Parser {
        segments,
        position: 0,
    };
    let (nodes, stop) = parser.parse_list()?;
    match stop {
        Stop::Eof => Ok(nodes),
        Stop::End => Err(TemplateError::Parse("unexpected {{end}}".into())),
        Stop::Else(_) => Err(TemplateError::Parse("unexpected {{else}}".into())),
    }
}

/// Split into text and tokenized actions, applying trim markers and
/// dropping comments.
fn split(source: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut trim_next = false;

    while let Some(open) = rest.find("{{") {
        let mut text = &rest[..open];
        if trim_next {
            text = text.trim_start();
        }
        let mut inner = &rest[open + 2..];
        let trim_left = inner.starts_with('-') && inner[1..].starts_with(char::is_whitespace);
        if trim_left {
            text = text.trim_end();
            inner = &inner[1..];
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text.to_string()));
        }

        let close = find_close(inner)?;
        let mut body = &inner[..close];
        rest = &inner[close + 2..];
        trim_next = body.ends_with('-')
            && body[..body.len() - 1].ends_with(char::is_whitespace);
        if trim_next {
            body = &body[..body.len() - 1];
        }

        let trimmed = body.trim();
        if trimmed.starts_with("/*") {
            if !trimmed.ends_with("*/") {
                return Err(TemplateError::Parse("unclosed comment".into()));
            }
            continue;
        }
        segments.push(Segment::Action(tokenize(trimmed)?));
    }

    let mut text = rest;
    if trim_next {
        text = text.trim_start();
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
    Ok(segments)
}

/// Offset of the `}}` closing an action, skipping quoted strings and comments
fn find_close(inner: &str) -> Result<usize, TemplateError> {
    let bytes = inner.as_bytes();
    if inner.trim_start().starts_with("/*") {
        return inner
            .find("*/")
            .and_then(|end| inner[end..].find("}}").map(|c| end + c))
            .ok_or_else(|| TemplateError::Parse("unclosed comment".into()));
    }

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'`' {
                    i += 1;
                }
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Ok(i),
            _ => {}
        }
        i += 1;
    }
    Err(TemplateError::Parse("unclosed action".into()))
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn read_path(chars: &[char], mut i: usize) -> (Vec<String>, usize) {
    let mut path = Vec::new();
    while i < chars.len() && chars[i] == '.' {
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && is_ident_char(chars[end]) {
            end += 1;
        }
        if end == start {
            break;
        }
        path.push(chars[start..end].iter().collect());
        i = end;
    }
    (path, i)
}

fn tokenize(action: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = action.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '.' => {
                let (path, next) = read_path(&chars, i);
                if path.is_empty() {
                    tokens.push(Token::Dot);
                    i += 1;
                } else {
                    tokens.push(Token::Field(path));
                    i = next;
                }
            }
            '$' => {
                if chars.get(i + 1).is_some_and(|c| is_ident_char(*c)) {
                    let name: String = chars[i + 1..]
                        .iter()
                        .take_while(|c| is_ident_char(**c))
                        .collect();
                    return Err(TemplateError::Parse(format!("undefined variable \"${name}\"")));
                }
                let (path, next) = read_path(&chars, i + 1);
                tokens.push(Token::Root(path));
                i = next;
            }
            '"' => {
                let mut end = i + 1;
                while end < chars.len() && chars[end] != '"' {
                    if chars[end] == '\\' {
                        end += 1;
                    }
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(TemplateError::Parse("unterminated quoted string".into()));
                }
                let quoted: String = chars[i..=end].iter().collect();
                let value: String = serde_json::from_str(&quoted)
                    .map_err(|e| TemplateError::Parse(format!("bad string {quoted}: {e}")))?;
                tokens.push(Token::Literal(Value::String(value)));
                i = end + 1;
            }
            '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|c| *c == '`')
                    .ok_or_else(|| TemplateError::Parse("unterminated raw string".into()))?;
                let raw: String = chars[i + 1..i + 1 + end].iter().collect();
                tokens.push(Token::Literal(Value::String(raw)));
                i += end + 2;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Literal(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "nil" => Token::Literal(Value::Null),
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(TemplateError::Parse(format!(
                    "unexpected {other:?} in action"
                )));
            }
        }
    }
    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Value, TemplateError> {
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::Number(n.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| TemplateError::Parse(format!("bad number syntax: {text:?}")))
}

enum Stop {
    Eof,
    End,
    Else(Vec<Token>),
}

struct Parser {
    segments: Vec<Segment>,
    position: usize,
}

impl Parser {
    fn parse_list(&mut self) -> Result<(Vec<Node>, Stop), TemplateError> {
        let mut nodes = Vec::new();
        while self.position < self.segments.len() {
            let segment = std::mem::replace(
                &mut self.segments[self.position],
                Segment::Text(String::new()),
            );
            self.position += 1;
            let tokens = match segment {
                Segment::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Segment::Action(tokens) => tokens,
            };

            let keyword = match tokens.first() {
                Some(Token::Ident(word)) => word.as_str(),
                _ => "",
            };
            match keyword {
                "end" => {
                    if tokens.len() > 1 {
                        return Err(TemplateError::Parse("unexpected tokens after end".into()));
                    }
                    return Ok((nodes, Stop::End));
                }
                "else" => return Ok((nodes, Stop::Else(tokens[1..].to_vec()))),
                "if" => nodes.push(self.parse_if(&tokens[1..])?),
                "range" | "with" => {
                    let pipeline = parse_pipeline(&tokens[1..])?;
                    let (body, stop) = self.parse_list()?;
                    let otherwise = match stop {
                        Stop::End => Vec::new(),
                        Stop::Else(rest) if rest.is_empty() => self.expect_end()?,
                        Stop::Else(_) => {
                            return Err(TemplateError::Parse(format!(
                                "unexpected else-if in {keyword}"
                            )));
                        }
                        Stop::Eof => {
                            return Err(TemplateError::Parse(format!(
                                "unexpected EOF in {keyword}"
                            )));
                        }
                    };
                    nodes.push(if keyword == "range" {
                        Node::Range {
                            pipeline,
                            body,
                            otherwise,
                        }
                    } else {
                        Node::With {
                            pipeline,
                            body,
                            otherwise,
                        }
                    });
                }
                "define" | "template" | "block" | "break" | "continue" => {
                    return Err(TemplateError::Parse(format!(
                        "{keyword} is not supported"
                    )));
                }
                _ => nodes.push(Node::Action(parse_pipeline(&tokens)?)),
            }
        }
        Ok((nodes, Stop::Eof))
    }

    fn parse_if(&mut self, condition: &[Token]) -> Result<Node, TemplateError> {
        let mut branches = Vec::new();
        let mut condition = parse_pipeline(condition)?;
        loop {
            let (body, stop) = self.parse_list()?;
            branches.push((condition, body));
            match stop {
                Stop::End => {
                    return Ok(Node::If {
                        branches,
                        otherwise: Vec::new(),
                    });
                }
                Stop::Else(rest) if rest.is_empty() => {
                    return Ok(Node::If {
                        branches,
                        otherwise: self.expect_end()?,
                    });
                }
                Stop::Else(rest) => match rest.first() {
                    Some(Token::Ident(word)) if word == "if" => {
                        condition = parse_pipeline(&rest[1..])?;
                    }
                    _ => return Err(TemplateError::Parse("malformed else clause".into())),
                },
                Stop::Eof => return Err(TemplateError::Parse("unexpected EOF in if".into())),
            }
        }
    }

    fn expect_end(&mut self) -> Result<Vec<Node>, TemplateError> {
        match self.parse_list()? {
            (nodes, Stop::End) => Ok(nodes),
            (_, Stop::Else(_)) => Err(TemplateError::Parse("expected end; found else".into())),
            (_, Stop::Eof) => Err(TemplateError::Parse("unexpected EOF".into())),
        }
    }
}

fn parse_pipeline(tokens: &[Token]) -> Result<Pipeline, TemplateError> {
    if tokens.is_empty() {
        return Err(TemplateError::Parse("missing value for command".into()));
    }

    let mut commands = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Open => depth += 1,
            Token::Close => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| TemplateError::Parse("unexpected right paren".into()))?;
            }
            Token::Pipe if depth == 0 => {
                commands.push(parse_command(&tokens[start..i])?);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(TemplateError::Parse("unclosed left paren".into()));
    }
    commands.push(parse_command(&tokens[start..])?);
    Ok(Pipeline(commands))
}

fn parse_command(tokens: &[Token]) -> Result<Command, TemplateError> {
    if tokens.is_empty() {
        return Err(TemplateError::Parse("missing command in pipeline".into()));
    }
    let mut operands = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let operand = match &tokens[i] {
            Token::Dot => Operand::Dot,
            Token::Field(path) => Operand::Field(path.clone()),
            Token::Root(path) => Operand::Root(path.clone()),
            Token::Literal(value) => Operand::Literal(value.clone()),
            Token::Ident(name) => {
                if !FUNCTIONS.contains(&name.as_str()) {
                    return Err(TemplateError::Parse(format!(
                        "function \"{name}\" not defined"
                    )));
                }
                Operand::Function(name.clone())
            }
            Token::Open => {
                let close = matching_close(tokens, i)?;
                let inner = parse_pipeline(&tokens[i + 1..close])?;
                i = close;
                if let Some(Token::Field(path)) = tokens.get(i + 1) {
                    i += 1;
                    Operand::Chain(Box::new(inner), path.clone())
                } else {
                    Operand::Chain(Box::new(inner), Vec::new())
                }
            }
            Token::Close => return Err(TemplateError::Parse("unexpected right paren".into())),
            Token::Pipe => return Err(TemplateError::Parse("unexpected pipe".into())),
        };
        operands.push(operand);
        i += 1;
    }
    Ok(Command(operands))
}

fn matching_close(tokens: &[Token], open: usize) -> Result<usize, TemplateError> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token {
            Token::Open => depth += 1,
            Token::Close => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(TemplateError::Parse("unclosed left paren".into()))
}

fn collect_nodes(nodes: &[Node], refs: &mut Vec<String>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Action(pipeline) => collect_pipeline(pipeline, refs),
            Node::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    collect_pipeline(condition, refs);
                    collect_nodes(body, refs);
                }
                collect_nodes(otherwise, refs);
            }
            Node::Range {
                pipeline,
                body,
                otherwise,
            }
            | Node::With {
                pipeline,
                body,
                otherwise,
            } => {
                collect_pipeline(pipeline, refs);
                collect_nodes(body, refs);
                collect_nodes(otherwise, refs);
            }
        }
    }
}

fn collect_pipeline(pipeline: &Pipeline, refs: &mut Vec<String>) {
    for command in &pipeline.0 {
        for operand in &command.0 {
            match operand {
                Operand::Field(path) | Operand::Root(path) if !path.is_empty() => {
                    refs.push(format!(".{}", path.join(".")));
                }
                Operand::Chain(inner, _) => collect_pipeline(inner, refs),
                _ => {}
            }
        }
    }
}

// ============================================================================
// Execution
// ============================================================================

struct Exec<'a> {
    root: &'a Value,
    out: String,
    budget: usize,
    limit: usize,
}

fn execute(
    nodes: &[Node],
    root: &Value,
    budget: usize,
    limit: usize,
) -> Result<String, TemplateError> {
    let mut exec = Exec {
        root,
        out: String::new(),
        budget,
        limit,
    };
    exec.run(nodes, root)?;
    Ok(exec.out)
}

impl Exec<'_> {
    fn write(&mut self, text: &str) -> Result<(), TemplateError> {
        if self.out.len() + text.len() > self.budget {
            return Err(TemplateError::OutputTooLarge { limit: self.limit });
        }
        self.out.push_str(text);
        Ok(())
    }

    fn run(&mut self, nodes: &[Node], dot: &Value) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                Node::Text(text) => self.write(text)?,
                Node::Action(pipeline) => {
                    let value = self.eval_pipeline(pipeline, dot)?;
                    self.write(&format_value(&value))?;
                }
                Node::If {
                    branches,
                    otherwise,
                } => {
                    let mut taken = false;
                    for (condition, body) in branches {
                        if truthy(&self.eval_pipeline(condition, dot)?) {
                            self.run(body, dot)?;
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        self.run(otherwise, dot)?;
                    }
                }
                Node::Range {
                    pipeline,
                    body,
                    otherwise,
                } => {
                    let value = self.eval_pipeline(pipeline, dot)?;
                    let items: Vec<Value> = match value {
                        Value::Array(items) => items,
                        Value::Object(map) => {
                            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
                            entries.sort_by(|a, b| a.0.cmp(&b.0));
                            entries.into_iter().map(|(_, v)| v).collect()
                        }
                        Value::Null => Vec::new(),
                        other => {
                            return Err(TemplateError::Exec(format!(
                                "range can't iterate over {}",
                                kind(&other)
                            )));
                        }
                    };
                    if items.is_empty() {
                        self.run(otherwise, dot)?;
                    }
                    for item in &items {
                        self.run(body, item)?;
                    }
                }
                Node::With {
                    pipeline,
                    body,
                    otherwise,
                } => {
                    let value = self.eval_pipeline(pipeline, dot)?;
                    if truthy(&value) {
                        self.run(body, &value)?;
                    } else {
                        self.run(otherwise, dot)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn eval_pipeline(&self, pipeline: &Pipeline, dot: &Value) -> Result<Value, TemplateError> {
        let mut piped = None;
        for command in &pipeline.0 {
            piped = Some(self.eval_command(command, dot, piped)?);
        }
        Ok(piped.unwrap_or(Value::Null))
    }

    fn eval_command(
        &self,
        command: &Command,
        dot: &Value,
        piped: Option<Value>,
    ) -> Result<Value, TemplateError> {
        let (first, rest) = command
            .0
            .split_first()
            .ok_or_else(|| TemplateError::Exec("empty command".into()))?;

        if let Operand::Function(name) = first {
            let mut args = rest
                .iter()
                .map(|operand| self.eval_operand(operand, dot))
                .collect::<Result<Vec<_>, _>>()?;
            args.extend(piped);
            return call_function(name, args);
        }

        if !rest.is_empty() || piped.is_some() {
            return Err(TemplateError::Exec(
                "can't give argument to non-function".into(),
            ));
        }
        self.eval_operand(first, dot)
    }

    fn eval_operand(&self, operand: &Operand, dot: &Value) -> Result<Value, TemplateError> {
        match operand {
            Operand::Dot => Ok(dot.clone()),
            Operand::Field(path) => lookup(dot, path),
            Operand::Root(path) => lookup(self.root, path),
            Operand::Chain(inner, path) => lookup(&self.eval_pipeline(inner, dot)?, path),
            Operand::Literal(value) => Ok(value.clone()),
            Operand::Function(name) => call_function(name, Vec::new()),
        }
    }
}

fn lookup(value: &Value, path: &[String]) -> Result<Value, TemplateError> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
            Value::Null => return Ok(Value::Null),
            other => {
                return Err(TemplateError::Exec(format!(
                    "can't evaluate field {segment} in type {}",
                    kind(other)
                )));
            }
        };
    }
    Ok(current.clone())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn format_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        #[allow(clippy::cast_possible_truncation)]
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        Some(f) => format!("{f}"),
        None => n.to_string(),
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => NO_VALUE.to_string(),
        other => format_nested(other),
    }
}

fn format_nested(value: &Value) -> String {
    match value {
        Value::Null => "<nil>".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(n),
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(format_nested).collect();
            format!("[{}]", parts.join(" "))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{k}:{}", format_nested(&map[k])))
                .collect();
            format!("map[{}]", parts.join(" "))
        }
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), TemplateError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(TemplateError::Exec(format!(
            "wrong number of args for {name}: want {expected} got {}",
            args.len()
        )))
    }
}

fn call_function(name: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
    match name {
        "json" => {
            arity(name, &args, 1)?;
            serde_json::to_string(&args[0])
                .map(Value::String)
                .map_err(|e| TemplateError::Exec(format!("json: {e}")))
        }
        "fromJson" => {
            arity(name, &args, 1)?;
            let Value::String(text) = &args[0] else {
                return Err(TemplateError::Exec(format!(
                    "fromJson: expected string, got {}",
                    kind(&args[0])
                )));
            };
            serde_json::from_str(text).map_err(|e| TemplateError::Exec(format!("fromJson: {e}")))
        }
        "quote" => {
            arity(name, &args, 1)?;
            let text = match &args[0] {
                Value::String(s) => s.clone(),
                other => format_value(other),
            };
            serde_json::to_string(&text)
                .map(Value::String)
                .map_err(|e| TemplateError::Exec(format!("quote: {e}")))
        }
        "default" => {
            arity(name, &args, 2)?;
            let mut args = args.into_iter();
            let fallback = args.next().unwrap_or(Value::Null);
            let given = args.next().unwrap_or(Value::Null);
            Ok(if truthy(&given) { given } else { fallback })
        }
        "eq" => {
            if args.len() < 2 {
                return Err(TemplateError::Exec("missing argument for comparison".into()));
            }
            let first = &args[0];
            Ok(Value::Bool(args[1..].iter().any(|other| values_equal(first, other))))
        }
        "ne" => {
            arity(name, &args, 2)?;
            Ok(Value::Bool(!values_equal(&args[0], &args[1])))
        }
        "lt" | "le" | "gt" | "ge" => {
            arity(name, &args, 2)?;
            let ordering = compare(&args[0], &args[1])?;
            Ok(Value::Bool(match name {
                "lt" => ordering.is_lt(),
                "le" => ordering.is_le(),
                "gt" => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        "and" => {
            if args.is_empty() {
                return Err(TemplateError::Exec("and: missing arguments".into()));
            }
            let last = args.len() - 1;
            Ok(args
                .into_iter()
                .enumerate()
                .find(|(i, v)| !truthy(v) || *i == last)
                .map(|(_, v)| v)
                .unwrap_or(Value::Null))
        }
        "or" => {
            if args.is_empty() {
                return Err(TemplateError::Exec("or: missing arguments".into()));
            }
            let last = args.len() - 1;
            Ok(args
                .into_iter()
                .enumerate()
                .find(|(i, v)| truthy(v) || *i == last)
                .map(|(_, v)| v)
                .unwrap_or(Value::Null))
        }
        "not" => {
            arity(name, &args, 1)?;
            Ok(Value::Bool(!truthy(&args[0])))
        }
        "len" => {
            arity(name, &args, 1)?;
            match &args[0] {
                Value::String(s) => Ok(s.len().into()),
                Value::Array(items) => Ok(items.len().into()),
                Value::Object(map) => Ok(map.len().into()),
                other => Err(TemplateError::Exec(format!(
                    "len of {} is not defined",
                    kind(other)
                ))),
            }
        }
        "index" => {
            let mut args = args.into_iter();
            let mut current = args
                .next()
                .ok_or_else(|| TemplateError::Exec("index: missing arguments".into()))?;
            for key in args {
                current = match (&current, &key) {
                    (Value::Object(map), Value::String(k)) => {
                        map.get(k).cloned().unwrap_or(Value::Null)
                    }
                    (Value::Array(items), Value::Number(n)) => {
                        let idx = n
                            .as_u64()
                            .and_then(|i| usize::try_from(i).ok())
                            .ok_or_else(|| TemplateError::Exec(format!("index: bad index {n}")))?;
                        items.get(idx).cloned().ok_or_else(|| {
                            TemplateError::Exec(format!("index out of range: {idx}"))
                        })?
                    }
                    (Value::Null, _) => Value::Null,
                    (container, key) => {
                        return Err(TemplateError::Exec(format!(
                            "can't index item of type {} with {}",
                            kind(container),
                            kind(key)
                        )));
                    }
                };
            }
            Ok(current)
        }
        other => Err(TemplateError::Exec(format!(
            "function \"{other}\" not defined"
        ))),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, TemplateError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .ok_or_else(|| TemplateError::Exec("incomparable numbers".into())),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(TemplateError::Exec(format!(
            "incompatible types for comparison: {} and {}",
            kind(a),
            kind(b)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn map(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn workflow() -> WorkflowContext {
        let ctx = WorkflowContext::new(
            "wf-1",
            map(json!({"repo": "acme/api", "count": 42, "obj": {"key": "value"}, "flag": true})),
        );
        ctx.record_step_start("fetch");
        ctx.record_step_success("fetch", map(json!({"title": "bug", "labels": ["a", "b"]})), 0);
        ctx
    }

    async fn expand(data: Value) -> Result<JsonMap, TemplateError> {
        DefaultTemplateExpander::new()
            .expand(&CallContext::new(), &map(data), &workflow())
            .await
    }

    #[tokio::test]
    async fn substitutes_params_and_step_outputs() {
        let out = expand(json!({
            "repo": "{{.params.repo}}",
            "title": "Issue: {{.steps.fetch.output.title}}",
            "count": "{{.params.count}}",
            "nested": {"deep": ["{{.params.repo}}", 7, false]},
            "literal": 3
        }))
        .await
        .unwrap();

        assert_eq!(out["repo"], "acme/api");
        assert_eq!(out["title"], "Issue: bug");
        assert_eq!(out["count"], "42");
        assert_eq!(out["nested"]["deep"], json!(["acme/api", 7, false]));
        assert_eq!(out["literal"], 3);
    }

    #[tokio::test]
    async fn json_function_embeds_values() {
        let out = expand(json!({"payload": "{\"data\": {{json .params.obj}}}"}))
            .await
            .unwrap();
        assert_eq!(out["payload"], r#"{"data": {"key":"value"}}"#);
    }

    #[tokio::test]
    async fn missing_values_render_placeholder() {
        let out = expand(json!({
            "a": "{{.params.missing}}",
            "b": "{{.steps.missing_step.output.data}}"
        }))
        .await
        .unwrap();
        assert_eq!(out["a"], "<no value>");
        assert_eq!(out["b"], "<no value>");
    }

    #[tokio::test]
    async fn unclosed_action_is_an_error() {
        let err = expand(json!({"a": "{{.params.missing"})).await.unwrap_err();
        assert!(matches!(err, TemplateError::Parse(_)));
    }

    #[tokio::test]
    async fn depth_limit() {
        let mut ok = json!("leaf");
        for _ in 0..MAX_TEMPLATE_DEPTH {
            ok = json!({ "n": ok });
        }
        assert!(expand(ok.clone()).await.is_ok());

        let too_deep = json!({ "n": ok });
        let err = expand(too_deep).await.unwrap_err();
        assert_eq!(err, TemplateError::DepthExceeded(MAX_TEMPLATE_DEPTH));
    }

    #[tokio::test]
    async fn size_limit_applies_across_leaves() {
        let expander = DefaultTemplateExpander::new().with_max_output_size(24);
        let data = map(json!({
            "a": "{{.params.repo}}{{.params.repo}}",
            "b": "{{.params.repo}}{{.params.repo}}"
        }));
        let err = expander
            .expand(&CallContext::new(), &data, &workflow())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn cancelled_context_stops_expansion() {
        let ctx = CallContext::new();
        ctx.cancel();
        let err = DefaultTemplateExpander::new()
            .expand(&ctx, &map(json!({"a": "{{.params.repo}}"})), &workflow())
            .await
            .unwrap_err();
        assert_eq!(err, TemplateError::Cancelled);
    }

    #[tokio::test]
    async fn conditions() {
        let expander = DefaultTemplateExpander::new();
        let ctx = CallContext::new();
        let wf = workflow();

        for (condition, expected) in [
            ("", true),
            ("true", true),
            ("False", false),
            ("{{.params.flag}}", true),
            ("{{if eq .steps.fetch.status \"completed\"}}true{{else}}false{{end}}", true),
            ("{{gt .params.count 50}}", false),
            ("{{and .params.flag (eq .params.repo \"acme/api\")}}", true),
            ("{{not .params.flag}}", false),
        ] {
            assert_eq!(
                expander.evaluate_condition(&ctx, condition, &wf).await.unwrap(),
                expected,
                "{condition}"
            );
        }

        let err = expander
            .evaluate_condition(&ctx, "not_boolean", &wf)
            .await
            .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidCondition(_)));
    }

    #[test]
    fn control_flow_and_functions() {
        let binding = json!({
            "items": ["x", "y"],
            "empty": [],
            "user": {"name": "ada", "raw": "{\"id\": 7}"},
            "n": 3.0
        });
        for (template, expected) in [
            ("{{range .items}}[{{.}}]{{end}}", "[x][y]"),
            ("{{range .empty}}x{{else}}none{{end}}", "none"),
            ("{{with .user}}{{.name}}{{end}}", "ada"),
            ("{{with .user}}{{$.n}}{{end}}", "3"),
            ("{{.user.name | quote}}", "\"ada\""),
            ("{{(fromJson .user.raw).id}}", "7"),
            ("{{.missing | default \"fallback\"}}", "fallback"),
            ("{{len .items}}", "2"),
            ("{{index .items 1}}", "y"),
            ("{{index .user \"name\"}}", "ada"),
            ("{{if .missing}}a{{else if .n}}b{{else}}c{{end}}", "b"),
            ("a  {{- .user.name -}}  b", "aadab"),
            ("{{/* ignored */}}kept", "kept"),
            ("{{.items}}", "[x y]"),
            ("{{eq .n 3}}", "true"),
        ] {
            assert_eq!(render(template, &binding).unwrap(), expected, "{template}");
        }
    }

    #[test]
    fn unknown_function_fails_to_parse() {
        assert!(validate_template("{{frobnicate .x}}").is_err());
        assert!(validate_template("{{if .x}}open").is_err());
        assert!(validate_template("{{end}}").is_err());
        assert!(validate_template("{{json .x | quote}}").is_ok());
    }

    #[test]
    fn references() {
        let refs = extract_references(
            "{{if eq .steps.a.status \"completed\"}}{{.steps.a.output.result}}{{end}} {{json $.params.x}}",
        )
        .unwrap();
        assert_eq!(
            refs,
            vec![".steps.a.status", ".steps.a.output.result", ".params.x"]
        );
        assert!(extract_references("plain text").unwrap().is_empty());
    }

    #[tokio::test]
    async fn output_format_renders_json_with_metadata() {
        let wf = workflow();
        let start = wf.start_time();
        let end = start + chrono::Duration::milliseconds(1500);
        let out = DefaultTemplateExpander::new()
            .expand_output_format(
                &CallContext::new(),
                r#"{"id": "{{.workflow.id}}", "ms": {{.workflow.duration_ms}}, "steps": {{.workflow.step_count}}, "issue": {{json .steps.fetch.output}}}"#,
                &wf,
                start,
                end,
            )
            .await
            .unwrap();
        assert_eq!(out["id"], "wf-1");
        assert_eq!(out["ms"], 1500);
        assert_eq!(out["steps"], 1);
        assert_eq!(out["issue"]["title"], "bug");
    }

    #[tokio::test]
    async fn output_format_errors() {
        let expander = DefaultTemplateExpander::new();
        let wf = workflow();
        let now = Utc::now();
        let ctx = CallContext::new();

        let err = expander
            .expand_output_format(&ctx, "{{.broken", &wf, now, now)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid output format template"));

        let err = expander
            .expand_output_format(&ctx, r#"{"a": {{.nonexistent.field}}}"#, &wf, now, now)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("output format must produce valid JSON"));

        let err = expander
            .expand_output_format(&ctx, "plain", &wf, now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, TemplateError::OutputNotJson(_)));
    }

    #[tokio::test]
    async fn output_format_size_limit() {
        let wf = WorkflowContext::new("wf", JsonMap::new());
        let chunk = "x".repeat(100);
        let big: JsonMap = (0..110_000)
            .map(|i| (format!("key_{i}"), Value::String(chunk.clone())))
            .collect();
        wf.record_step_success("large_step", big, 0);
        let now = Utc::now();
        let err = DefaultTemplateExpander::new()
            .expand_output_format(
                &CallContext::new(),
                r#"{"data": {{json .steps.large_step.output}}}"#,
                &wf,
                now,
                now,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
