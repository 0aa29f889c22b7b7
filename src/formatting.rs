//! Rendering of queue messages into delivery text.
//!
//! A [`TemplateRenderer`] loads its template once. Templates substitute
//! display fields with `{{.Field}}` and branch with
//! `{{if .Field}}...{{else}}...{{end}}`. Any failure to load, parse or
//! substitute turns into an `InternalServerError: ...` text that is
//! delivered in place of the message, so recipients see the malfunction.

use crate::core::{EventKind, Message, Renderer};
use chrono::{Local, TimeZone};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{error, info};

pub const ALERT_LABEL: &str = "告警";
pub const RECOVERY_LABEL: &str = "恢复";

const LIST_SEPARATOR: &str = ",";

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("cannot read template {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse template: {0}")]
    Syntax(String),

    #[error("template references undefined field {0:?}")]
    UnknownField(String),
}

/// The status label shown for an event kind. Unknown kinds get none.
pub fn status_label(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::Alert => ALERT_LABEL,
        EventKind::Recovery => RECOVERY_LABEL,
        EventKind::Other(_) => "",
    }
}

/// Formats epoch seconds as local `YYYY-MM-DD HH:MM:SS`.
pub fn format_etime(epoch_seconds: i64) -> String {
    match Local.timestamp_opt(epoch_seconds, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => epoch_seconds.to_string(),
    }
}

/// A value a template can substitute or test.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Flag(bool),
}

impl FieldValue {
    fn is_truthy(&self) -> bool {
        match self {
            FieldValue::Text(s) => !s.is_empty(),
            FieldValue::Flag(b) => *b,
        }
    }

    fn write_to(&self, out: &mut String) {
        match self {
            FieldValue::Text(s) => out.push_str(s),
            FieldValue::Flag(b) => out.push_str(if *b { "true" } else { "false" }),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Flag(b)
    }
}

/// Derives the named display fields a template can reference.
pub fn display_fields(message: &Message) -> BTreeMap<&'static str, FieldValue> {
    let event = &message.event;
    let link = |l: &Option<String>| FieldValue::from(l.clone().unwrap_or_default());

    let mut fields = BTreeMap::new();
    fields.insert("IsAlert", FieldValue::from(event.kind == EventKind::Alert));
    fields.insert("Status", status_label(&event.kind).into());
    fields.insert("Sname", event.name.as_str().into());
    fields.insert("Endpoint", message.readable_endpoint.as_str().into());
    fields.insert("Metric", message.metrics.join(LIST_SEPARATOR).into());
    fields.insert("Tags", message.readable_tags.as_str().into());
    fields.insert("Value", event.value.to_string().into());
    fields.insert("Info", event.info.as_str().into());
    fields.insert("Etime", format_etime(event.occurred_at).into());
    fields.insert("Elink", link(&message.event_link));
    fields.insert("Slink", link(&message.stra_link));
    fields.insert("Clink", link(&message.claim_link));
    fields.insert("IsUpgrade", FieldValue::from(message.is_upgrade));
    fields.insert("Bindings", message.bindings.join(LIST_SEPARATOR).into());
    fields.insert("Priority", event.priority.to_string().into());
    fields
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Field(String),
    If {
        field: String,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

fn action_regex() -> &'static Regex {
    static ACTION: OnceLock<Regex> = OnceLock::new();
    ACTION.get_or_init(|| Regex::new(r"(?s)\{\{\s*(.*?)\s*\}\}").expect("action pattern is valid"))
}

fn field_name(raw: &str) -> Result<String, RenderError> {
    let name = raw
        .strip_prefix('.')
        .ok_or_else(|| RenderError::Syntax(format!("expected .Field, found {:?}", raw)))?;
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(RenderError::Syntax(format!("invalid field name {:?}", raw)));
    }
    Ok(name.to_string())
}

/// An `if` block being filled while parsing.
struct OpenBlock {
    field: String,
    then: Vec<Node>,
    in_else: bool,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, RenderError> {
        let mut root: Vec<Node> = Vec::new();
        let mut open: Vec<(OpenBlock, Vec<Node>)> = Vec::new();

        fn push_text(target: &mut Vec<Node>, text: &str) -> Result<(), RenderError> {
            if text.contains("{{") {
                return Err(RenderError::Syntax("unclosed action".to_string()));
            }
            if !text.is_empty() {
                target.push(Node::Text(text.to_string()));
            }
            Ok(())
        }

        let mut last = 0;
        for captures in action_regex().captures_iter(source) {
            let whole = captures.get(0).expect("group 0 always matches");
            let action = captures.get(1).map_or("", |m| m.as_str());
            let current = match open.last_mut() {
                Some((_, nodes)) => nodes,
                None => &mut root,
            };
            push_text(current, &source[last..whole.start()])?;
            last = whole.end();

            if let Some(cond) = action.strip_prefix("if ") {
                let block = OpenBlock {
                    field: field_name(cond.trim())?,
                    then: Vec::new(),
                    in_else: false,
                };
                open.push((block, Vec::new()));
            } else if action == "else" {
                let (block, nodes) = open
                    .last_mut()
                    .ok_or_else(|| RenderError::Syntax("{{else}} outside of {{if}}".to_string()))?;
                if block.in_else {
                    return Err(RenderError::Syntax("duplicate {{else}}".to_string()));
                }
                block.in_else = true;
                block.then = std::mem::take(nodes);
            } else if action == "end" {
                let (mut block, nodes) = open
                    .pop()
                    .ok_or_else(|| RenderError::Syntax("{{end}} without {{if}}".to_string()))?;
                let otherwise = if block.in_else {
                    nodes
                } else {
                    block.then = nodes;
                    Vec::new()
                };
                let node = Node::If {
                    field: block.field,
                    then: block.then,
                    otherwise,
                };
                match open.last_mut() {
                    Some((_, parent)) => parent.push(node),
                    None => root.push(node),
                }
            } else {
                current_or_root(&mut open, &mut root).push(Node::Field(field_name(action)?));
            }
        }

        if !open.is_empty() {
            return Err(RenderError::Syntax("unterminated {{if}}".to_string()));
        }
        push_text(&mut root, &source[last..])?;
        Ok(Self { nodes: root })
    }

    pub fn render(&self, fields: &BTreeMap<&'static str, FieldValue>) -> Result<String, RenderError> {
        let mut out = String::new();
        render_nodes(&self.nodes, fields, &mut out)?;
        Ok(out)
    }
}

fn current_or_root<'a>(
    open: &'a mut [(OpenBlock, Vec<Node>)],
    root: &'a mut Vec<Node>,
) -> &'a mut Vec<Node> {
    match open.last_mut() {
        Some((_, nodes)) => nodes,
        None => root,
    }
}

fn lookup<'a>(
    fields: &'a BTreeMap<&'static str, FieldValue>,
    name: &str,
) -> Result<&'a FieldValue, RenderError> {
    fields
        .get(name)
        .ok_or_else(|| RenderError::UnknownField(name.to_string()))
}

fn render_nodes(
    nodes: &[Node],
    fields: &BTreeMap<&'static str, FieldValue>,
    out: &mut String,
) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Field(name) => lookup(fields, name)?.write_to(out),
            Node::If {
                field,
                then,
                otherwise,
            } => {
                let branch = if lookup(fields, field)?.is_truthy() {
                    then
                } else {
                    otherwise
                };
                render_nodes(branch, fields, out)?;
            }
        }
    }
    Ok(())
}

/// Renders messages with a template loaded from disk.
pub struct TemplateRenderer {
    template: Result<Template, RenderError>,
}

impl TemplateRenderer {
    /// Loads and parses the template at `path`. A failure here is kept and
    /// reported through the fallback text of every render.
    pub fn from_path(path: &Path) -> Self {
        let template = std::fs::read_to_string(path)
            .map_err(|source| RenderError::Load {
                path: path.to_path_buf(),
                source,
            })
            .and_then(|source| Template::parse(&source));
        match &template {
            Ok(_) => info!(path = %path.display(), "Loaded message template"),
            Err(e) => error!(path = %path.display(), error = %e, "Message template unusable"),
        }
        Self { template }
    }

    pub fn from_template(template: Template) -> Self {
        Self {
            template: Ok(template),
        }
    }

    fn fallback(error: &RenderError) -> String {
        metrics::counter!("render_failures_total").increment(1);
        let payload = format!("InternalServerError: {}", error);
        error!("{}", payload);
        payload
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, message: &Message) -> String {
        let template = match &self.template {
            Ok(template) => template,
            Err(e) => return Self::fallback(e),
        };
        template
            .render(&display_fields(message))
            .unwrap_or_else(|e| Self::fallback(&e))
    }
}
