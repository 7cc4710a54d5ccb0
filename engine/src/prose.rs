//! The `prose` row format.
//!
//! A prose file starts with a `@prose <template>` header. Each record is one
//! headline matching the compiled template, optionally followed by
//! deeper-indented overflow lines for fields the template does not mention:
//!
//! ```text
//! @prose #{id} "{title}" by {author}
//!
//! #1 "Written by Me" by Author Name
//! #2 Dune by Frank Herbert
//!   tags: ["scifi", "classic"]
//! ```
//!
//! Templates mix literal text with `{fieldName}` placeholders. A value that
//! would collide with the following literal (or read back as a different
//! scalar) is double-quoted with `\"` escapes. `~` encodes null and
//! `[a, b]` encodes arrays. The trailing field is captured greedily.
//!
//! Decoding stores the header template under the reserved `_template`
//! envelope key so that `encode(decode(file)) == file` for well-formed input.

use crate::codec::Codec;
use crate::error::Result;
use crate::Error;
use serde_json::Value;

/// Reserved envelope key carrying the file's template through decode/encode.
pub const TEMPLATE_KEY: &str = "_template";

const HEADER_PREFIX: &str = "@prose ";
const DEFAULT_TEMPLATE: &str = "{id}";

fn prose_error(message: impl std::fmt::Display) -> Error {
    Error::Serialization {
        format: "prose".to_string(),
        message: message.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A compiled headline template.
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Compile a template string into matchable segments.
    ///
    /// Two adjacent placeholders without literal text between them are
    /// rejected: there would be no delimiter to split their values on.
    pub fn compile(raw: &str) -> Result<Template> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;

        while let Some(open) = rest.find('{') {
            let close = rest[open..]
                .find('}')
                .map(|i| open + i)
                .ok_or_else(|| prose_error(format!("unclosed placeholder in template '{raw}'")))?;
            literal.push_str(&rest[..open]);
            let name = &rest[open + 1..close];
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(prose_error(format!("invalid placeholder '{{{name}}}'")));
            }
            if literal.is_empty() && matches!(segments.last(), Some(Segment::Field(_))) {
                return Err(prose_error(format!(
                    "adjacent placeholders without a delimiter in template '{raw}'"
                )));
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Field(name.to_string()));
            rest = &rest[close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if !segments.iter().any(|s| matches!(s, Segment::Field(_))) {
            return Err(prose_error(format!("template '{raw}' has no placeholders")));
        }

        Ok(Template {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Field names the template captures, in order.
    pub fn fields(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Field(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Render one entity's headline.
    fn encode_line(&self, entity: &serde_json::Map<String, Value>) -> String {
        let mut line = String::new();
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(text) => line.push_str(text),
                Segment::Field(name) => {
                    let value = entity.get(name.as_str()).unwrap_or(&Value::Null);
                    let next_literal = self.segments.get(i + 1).and_then(|s| match s {
                        Segment::Literal(text) => Some(text.as_str()),
                        Segment::Field(_) => None,
                    });
                    line.push_str(&encode_value(value, next_literal));
                }
            }
        }
        line
    }

    /// Parse one headline back into the template's fields.
    fn decode_line(&self, line: &str) -> Result<serde_json::Map<String, Value>> {
        let mut entity = serde_json::Map::new();
        let mut rest = line;
        let mut i = 0;

        while i < self.segments.len() {
            match &self.segments[i] {
                Segment::Literal(text) => {
                    rest = rest.strip_prefix(text.as_str()).ok_or_else(|| {
                        prose_error(format!(
                            "line '{line}' does not match template '{}'",
                            self.raw
                        ))
                    })?;
                    i += 1;
                }
                Segment::Field(name) => {
                    let next_literal = self.segments.get(i + 1).and_then(|s| match s {
                        Segment::Literal(text) => Some(text.as_str()),
                        Segment::Field(_) => None,
                    });
                    let (value, consumed) = decode_value(rest, next_literal)
                        .map_err(|e| prose_error(format!("line '{line}': {e}")))?;
                    entity.insert(name.clone(), value);
                    rest = &rest[consumed..];
                    i += 1;
                }
            }
        }
        if !rest.is_empty() {
            return Err(prose_error(format!(
                "trailing text '{rest}' after template match in line '{line}'"
            )));
        }
        Ok(entity)
    }
}

/// Whether a bare rendering would be misread on decode.
fn needs_quoting(rendered: &str, is_string: bool, next_literal: Option<&str>) -> bool {
    if rendered.is_empty() {
        return is_string;
    }
    if !is_string {
        // Scalars render unambiguously
        return false;
    }
    if rendered.starts_with('"')
        || rendered.starts_with('[')
        || rendered.starts_with(char::is_whitespace)
        || rendered.ends_with(char::is_whitespace)
    {
        return true;
    }
    // A string that reads back as another scalar must be quoted
    if rendered == "~"
        || rendered == "true"
        || rendered == "false"
        || rendered.parse::<f64>().is_ok()
    {
        return true;
    }
    // A string containing the delimiter would end the capture early
    match next_literal {
        Some(delim) => rendered.contains(delim),
        None => false,
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn encode_value(value: &Value, next_literal: Option<&str>) -> String {
    match value {
        Value::Null => "~".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            if needs_quoting(s, true, next_literal) {
                quote(s)
            } else {
                s.clone()
            }
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::String(s)
                        if s.contains(',')
                            || s.contains(']')
                            || needs_quoting(s, true, None) =>
                    {
                        quote(s)
                    }
                    other => encode_value(other, None),
                })
                .collect();
            format!("[{}]", rendered.join(", "))
        }
        // Nested objects have no headline form; they belong on overflow lines
        Value::Object(_) => quote(&value.to_string()),
    }
}

/// Parse a quoted string starting at `text[0] == '"'`.
///
/// Returns the unescaped value and the number of bytes consumed.
fn decode_quoted(text: &str) -> std::result::Result<(String, usize), String> {
    let mut out = String::new();
    let mut chars = text.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => return Err("unterminated escape in quoted value".to_string()),
            },
            '"' => return Ok((out, i + 1)),
            _ => out.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}

fn parse_scalar(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed == "~" {
        return Value::Null;
    }
    if trimmed == "true" {
        return Value::Bool(true);
    }
    if trimmed == "false" {
        return Value::Bool(false);
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

fn parse_array(text: &str) -> std::result::Result<Value, String> {
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| format!("malformed array '{text}'"))?;
    let inner = inner.trim();
    if inner.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }

    let mut items = Vec::new();
    let mut rest = inner;
    loop {
        let rest_trimmed = rest.trim_start();
        if rest_trimmed.starts_with('"') {
            let (value, consumed) = decode_quoted(rest_trimmed)?;
            items.push(Value::String(value));
            let after = rest_trimmed[consumed..].trim_start();
            if after.is_empty() {
                break;
            }
            rest = after
                .strip_prefix(',')
                .ok_or_else(|| format!("expected ',' in array '{text}'"))?;
        } else {
            match rest_trimmed.find(',') {
                Some(comma) => {
                    items.push(parse_scalar(&rest_trimmed[..comma]));
                    rest = &rest_trimmed[comma + 1..];
                }
                None => {
                    items.push(parse_scalar(rest_trimmed));
                    break;
                }
            }
        }
    }
    Ok(Value::Array(items))
}

/// Byte offset one past the `]` closing the array at the head of `text`,
/// ignoring brackets inside quoted items.
fn find_array_end(text: &str) -> std::result::Result<usize, String> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ']' if !in_quotes => return Ok(i + 1),
            _ => {}
        }
    }
    Err(format!("unterminated array in '{text}'"))
}

/// Decode a field value starting at the head of `text`.
///
/// Returns the value and the number of bytes consumed. Quoted values and
/// arrays are parsed structurally; with a following literal, any other value
/// runs until that literal's first occurrence; without one, the trailing
/// field captures the rest of the line.
fn decode_value(
    text: &str,
    next_literal: Option<&str>,
) -> std::result::Result<(Value, usize), String> {
    if text.starts_with('"') {
        let (value, consumed) = decode_quoted(text)?;
        return Ok((Value::String(value), consumed));
    }
    if text.starts_with('[') {
        let end = find_array_end(text)?;
        let value = parse_array(&text[..end])?;
        return Ok((value, end));
    }

    let raw_end = match next_literal {
        Some(delim) => text
            .find(delim)
            .ok_or_else(|| format!("delimiter '{delim}' not found"))?,
        None => text.len(),
    };
    Ok((parse_scalar(&text[..raw_end]), raw_end))
}

/// Render a value for an overflow line (`  field: <json>`).
fn overflow_json(value: &Value) -> String {
    value.to_string()
}

/// The prose codec.
///
/// The top-level value is an object of id-keyed entities plus the
/// [`TEMPLATE_KEY`] envelope entry; the persistence layer injects the
/// configured template on save and strips it on load.
pub struct ProseCodec;

impl ProseCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for ProseCodec {
    fn name(&self) -> &str {
        "prose"
    }

    fn extensions(&self) -> &[&str] {
        &["prose"]
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let object = value
            .as_object()
            .ok_or_else(|| prose_error("top-level value must be an object"))?;
        let raw_template = object
            .get(TEMPLATE_KEY)
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TEMPLATE);
        let template = Template::compile(raw_template)?;
        let headline_fields: Vec<&str> = template.fields();

        let mut out = String::new();
        out.push_str(HEADER_PREFIX);
        out.push_str(raw_template);
        out.push('\n');
        out.push('\n');

        for (key, entity) in object {
            if key.starts_with('_') {
                continue;
            }
            let entity = entity
                .as_object()
                .ok_or_else(|| prose_error(format!("entity '{key}' is not an object")))?;
            out.push_str(&template.encode_line(entity));
            out.push('\n');
            for (field, field_value) in entity {
                if headline_fields.contains(&field.as_str()) {
                    continue;
                }
                out.push_str("  ");
                out.push_str(field);
                out.push_str(": ");
                out.push_str(&overflow_json(field_value));
                out.push('\n');
            }
        }
        Ok(out.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(bytes).map_err(prose_error)?;
        let mut lines = text.lines();

        let header = loop {
            match lines.next() {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
                None => return Err(prose_error("empty file: missing @prose header")),
            }
        };
        let raw_template = header
            .strip_prefix(HEADER_PREFIX)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| prose_error(format!("first line must be '@prose <template>', got '{header}'")))?;
        let template = Template::compile(raw_template)?;

        let mut object = serde_json::Map::new();
        object.insert(
            TEMPLATE_KEY.to_string(),
            Value::String(raw_template.to_string()),
        );

        let mut current: Option<(String, serde_json::Map<String, Value>)> = None;
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // Overflow line belonging to the previous record
                let (_, entity) = current
                    .as_mut()
                    .ok_or_else(|| prose_error(format!("overflow line without a record: '{line}'")))?;
                let trimmed = line.trim_start();
                let (field, rest) = trimmed
                    .split_once(':')
                    .ok_or_else(|| prose_error(format!("malformed overflow line '{line}'")))?;
                let parsed: Value = serde_json::from_str(rest.trim())
                    .map_err(|e| prose_error(format!("overflow line '{line}': {e}")))?;
                entity.insert(field.trim().to_string(), parsed);
                continue;
            }

            if let Some((id, entity)) = current.take() {
                object.insert(id, Value::Object(entity));
            }
            let entity = template.decode_line(line)?;
            let id = entity
                .get("id")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .ok_or_else(|| prose_error(format!("record '{line}' has no id field")))?;
            current = Some((id, entity));
        }
        if let Some((id, entity)) = current.take() {
            object.insert(id, Value::Object(entity));
        }

        Ok(Value::Object(object))
    }
}
