//! Field templates.
//!
//! Two shapes are understood:
//! - a bare dotted path (`body.alert.title`, or `alert.title` with the
//!   location defaulting to `body`)
//! - interpolated text with `{{ webhook "path" }}` and `{{ arg "name" }}`
//!   actions
//!
//! Templates are parsed once into [`Part`]s and then rendered against a
//! lookup closure supplied by the caller.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("empty template")]
    Empty,

    #[error("unterminated action starting at byte {0}")]
    Unterminated(usize),

    #[error("unknown template function: {0}")]
    UnknownFunction(String),

    #[error("function {0} expects one quoted argument")]
    MissingArgument(String),

    #[error("invalid field path: {0}")]
    InvalidPath(String),
}

/// Named input locations a field path can start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Body,
}

impl Location {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "body" => Some(Location::Body),
            _ => None,
        }
    }
}

/// A parsed dotted path into one of the input locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub location: Location,
    pub segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self, TemplateError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(TemplateError::InvalidPath(path.to_string()));
        }

        let mut segments = Vec::new();
        for segment in path.split('.') {
            if segment.is_empty() {
                return Err(TemplateError::InvalidPath(path.to_string()));
            }
            segments.push(segment.to_string());
        }

        let location = match Location::from_name(&segments[0]) {
            Some(location) => {
                segments.remove(0);
                location
            }
            None => Location::Body,
        };

        Ok(Self { location, segments })
    }

    /// Walk the path through `root`. Digit-only segments index arrays.
    pub fn navigate<'a>(&self, root: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        use serde_json::Value;

        self.segments.iter().try_fold(root, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index)),
            _ => None,
        })
    }
}

/// What an action looks up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Webhook(FieldPath),
    Arg(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Literal(String),
    Lookup(Lookup),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
    bare: bool,
}

/// Result of rendering a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub found: bool,
}

impl Template {
    /// Parse a field template: bare dotted path unless it contains `{{`.
    pub fn parse_field(source: &str) -> Result<Self, TemplateError> {
        if source.contains("{{") {
            return Self::parse(source);
        }
        if source.trim().is_empty() {
            return Err(TemplateError::Empty);
        }

        let path = FieldPath::parse(source)?;
        Ok(Self {
            parts: vec![Part::Lookup(Lookup::Webhook(path))],
            bare: true,
        })
    }

    /// Parse interpolated text. Text without actions is a pure literal.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }

            let after_open = &rest[start + 2..];
            let end = after_open
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + start))?;

            parts.push(Part::Lookup(parse_action(&after_open[..end])?));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }

        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Ok(Self { parts, bare: false })
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn is_bare(&self) -> bool {
        self.bare
    }

    /// Render the template. Unresolved lookups become empty text.
    ///
    /// A bare path is found iff it resolved. Interpolated text is found iff
    /// at least one lookup resolved, or it has no lookups at all.
    pub fn render<F>(&self, mut resolve: F) -> Rendered
    where
        F: FnMut(&Lookup) -> Option<String>,
    {
        let mut text = String::new();
        let mut lookups = 0usize;
        let mut resolved = 0usize;

        for part in &self.parts {
            match part {
                Part::Literal(literal) => text.push_str(literal),
                Part::Lookup(lookup) => {
                    lookups += 1;
                    if let Some(value) = resolve(lookup) {
                        resolved += 1;
                        text.push_str(&value);
                    }
                }
            }
        }

        let found = if self.bare {
            resolved > 0
        } else {
            lookups == 0 || resolved > 0
        };

        Rendered { text, found }
    }
}

fn parse_action(action: &str) -> Result<Lookup, TemplateError> {
    let action = action.trim();
    let (function, argument) = match action.find(char::is_whitespace) {
        Some(split) => (&action[..split], action[split..].trim()),
        None => (action, ""),
    };

    match function {
        "webhook" => {
            let path = parse_quoted(argument)
                .ok_or_else(|| TemplateError::MissingArgument(function.to_string()))?;
            Ok(Lookup::Webhook(FieldPath::parse(&path)?))
        }
        "arg" => {
            let name = parse_quoted(argument)
                .ok_or_else(|| TemplateError::MissingArgument(function.to_string()))?;
            Ok(Lookup::Arg(name))
        }
        other => Err(TemplateError::UnknownFunction(other.to_string())),
    }
}

/// Parse a single double-quoted string literal, allowing `\"` and `\\`.
fn parse_quoted(argument: &str) -> Option<String> {
    let inner = argument.strip_prefix('"')?;
    let mut value = String::new();
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => value.push(chars.next()?),
            '"' => {
                return if chars.as_str().trim().is_empty() {
                    Some(value)
                } else {
                    None
                };
            }
            other => value.push(other),
        }
    }

    None
}

/// Render a JSON value the way templates print it: strings verbatim, other
/// values as JSON. Null and empty containers count as absent.
pub fn render_value(value: &serde_json::Value) -> Option<String> {
    use serde_json::Value;

    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}
