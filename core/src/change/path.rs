//! Minimal parser for the instance paths carried by change events, e.g.
//! `/ietf-system:system/dns-resolver/server[name='A']/udp-and-tcp/address`.
//!
//! Only what reconciliation needs is understood: node names with an optional module prefix and
//! equality predicates (`[key='value']`, `[.='value']` for leaf-list entries).

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path must be absolute: {0}")]
    NotAbsolute(String),
    #[error("empty node name in {0}")]
    EmptySegment(String),
    #[error("malformed predicate in {0}")]
    Predicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub prefix: Option<String>,
    pub name: String,
    pub predicates: Vec<(String, String)>,
}

impl PathSegment {
    pub fn predicate(&self, key: &str) -> Option<&str> {
        self.predicates
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePath {
    segments: Vec<PathSegment>,
}

impl NodePath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let body = raw
            .strip_prefix('/')
            .ok_or_else(|| PathError::NotAbsolute(raw.to_string()))?;

        let mut segments = Vec::new();
        for piece in split_segments(body, raw)? {
            segments.push(parse_segment(piece, raw)?);
        }
        if segments.is_empty() {
            return Err(PathError::EmptySegment(raw.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Path with predicates stripped, keeping whatever module prefixes were written.
    pub fn schema_path(&self) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            out.push('/');
            if let Some(prefix) = &seg.prefix {
                out.push_str(prefix);
                out.push(':');
            }
            out.push_str(&seg.name);
        }
        out
    }

    /// Name of the node the path points at.
    pub fn leaf_name(&self) -> &str {
        self.segments
            .last()
            .map(|s| s.name.as_str())
            .unwrap_or_default()
    }

    fn position(&self, list: &str) -> Option<usize> {
        self.segments.iter().rposition(|s| s.name == list)
    }

    /// Key value of the closest enclosing `list` entry.
    pub fn list_key(&self, list: &str, key: &str) -> Option<&str> {
        self.position(list)
            .and_then(|idx| self.segments[idx].predicate(key))
    }

    /// True when the path addresses the `list` entry itself rather than one of its children.
    pub fn targets_entry(&self, list: &str) -> bool {
        self.position(list) == Some(self.segments.len() - 1)
    }

    /// Names of the nodes below the closest `list` entry, outermost first.
    pub fn below(&self, list: &str) -> Vec<&str> {
        match self.position(list) {
            Some(idx) => self.segments[idx + 1..]
                .iter()
                .map(|s| s.name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            f.write_str("/")?;
            if let Some(prefix) = &seg.prefix {
                write!(f, "{prefix}:")?;
            }
            f.write_str(&seg.name)?;
            for (k, v) in &seg.predicates {
                write!(f, "[{k}='{v}']")?;
            }
        }
        Ok(())
    }
}

fn split_segments<'a>(body: &'a str, raw: &str) -> Result<Vec<&'a str>, PathError> {
    let mut pieces = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in body.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(ch),
            (None, '[') => depth += 1,
            (None, ']') => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| PathError::Predicate(raw.to_string()))?;
            }
            (None, '/') if depth == 0 => {
                pieces.push(&body[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() || depth != 0 {
        return Err(PathError::Predicate(raw.to_string()));
    }
    pieces.push(&body[start..]);
    Ok(pieces)
}

fn parse_segment(piece: &str, raw: &str) -> Result<PathSegment, PathError> {
    let (head, mut rest) = match piece.find('[') {
        Some(idx) => (&piece[..idx], &piece[idx..]),
        None => (piece, ""),
    };
    if head.is_empty() {
        return Err(PathError::EmptySegment(raw.to_string()));
    }
    let (prefix, name) = match head.split_once(':') {
        Some((p, n)) => (Some(p.to_string()), n.to_string()),
        None => (None, head.to_string()),
    };

    let mut predicates = Vec::new();
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('[')
            .ok_or_else(|| PathError::Predicate(raw.to_string()))?;
        let (key, after_eq) = inner
            .split_once('=')
            .ok_or_else(|| PathError::Predicate(raw.to_string()))?;
        let mut chars = after_eq.chars();
        let quote = chars
            .next()
            .filter(|c| *c == '\'' || *c == '"')
            .ok_or_else(|| PathError::Predicate(raw.to_string()))?;
        let quoted = &after_eq[1..];
        let end = quoted
            .find(quote)
            .ok_or_else(|| PathError::Predicate(raw.to_string()))?;
        let value = &quoted[..end];
        rest = quoted[end + 1..]
            .strip_prefix(']')
            .ok_or_else(|| PathError::Predicate(raw.to_string()))?;
        predicates.push((key.trim().to_string(), value.to_string()));
    }

    Ok(PathSegment {
        prefix,
        name,
        predicates,
    })
}
