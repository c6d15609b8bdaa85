//! Qualified MySQL table names.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use courier_core::TransportError;

/// A possibly schema-qualified table name.
///
/// Accepts the spellings `table`, `schema.table`, `` `table` `` and
/// `` `schema`.`table` ``. Renders with backtick quoting and compares
/// case-insensitively, which is how MySQL treats identifiers on the
/// platforms this transport targets.
#[derive(Debug, Clone, Eq)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    /// A bare table name in the connection's default schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// An explicitly schema-qualified table name.
    pub fn with_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Parse a qualified name, honoring backtick quoting.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let segments = split_identifiers(input.trim())
            .map_err(|e| TransportError::MalformedMessage(format!("bad table name {input:?}: {e}")))?;
        match segments.as_slice() {
            [name] => Ok(Self::new(name.clone())),
            [schema, name] => Ok(Self::with_schema(schema.clone(), name.clone())),
            _ => Err(TransportError::MalformedMessage(format!(
                "bad table name {input:?}: expected at most one schema qualifier"
            ))),
        }
    }

    /// The schema qualifier, if any.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// The unqualified table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backtick-quoted form to splice into SQL.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("`{schema}`.`{}`", self.name),
            None => format!("`{}`", self.name),
        }
    }
}

/// Split `a.b` into identifier segments, stripping backticks. Dots inside
/// backticks do not split. Backticks inside identifiers are rejected since
/// names are spliced into SQL verbatim.
fn split_identifiers(input: &str) -> Result<Vec<String>, String> {
    if input.is_empty() {
        return Err("empty name".into());
    }
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '`' => quoted = !quoted,
            '.' if !quoted => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if quoted {
        return Err("unbalanced backtick".into());
    }
    segments.push(current);
    if segments.iter().any(|s| s.is_empty()) {
        return Err("empty identifier segment".into());
    }
    Ok(segments)
}

impl PartialEq for TableName {
    fn eq(&self, other: &Self) -> bool {
        fn eq_opt(a: Option<&str>, b: Option<&str>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                (None, None) => true,
                _ => false,
            }
        }
        eq_opt(self.schema(), other.schema()) && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Hash for TableName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(schema) = &self.schema {
            schema.to_ascii_lowercase().hash(state);
        }
        self.name.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

impl FromStr for TableName {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_names() {
        let t = TableName::parse("messages").unwrap();
        assert_eq!(t.schema(), None);
        assert_eq!(t.name(), "messages");
        assert_eq!(t.qualified(), "`messages`");
    }

    #[test]
    fn parses_qualified_names() {
        let t = TableName::parse("bus.messages").unwrap();
        assert_eq!(t.schema(), Some("bus"));
        assert_eq!(t.qualified(), "`bus`.`messages`");
    }

    #[test]
    fn parses_backtick_quoted_names() {
        let t = TableName::parse("`bus`.`my.queue`").unwrap();
        assert_eq!(t.schema(), Some("bus"));
        assert_eq!(t.name(), "my.queue");
        assert_eq!(t.qualified(), "`bus`.`my.queue`");
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", ".", "a.", ".b", "a.b.c", "`oops"] {
            assert!(TableName::parse(bad).is_err(), "expected {bad:?} rejected");
        }
    }

    #[test]
    fn compares_case_insensitively() {
        assert_eq!(
            TableName::parse("Bus.Messages").unwrap(),
            TableName::parse("bus.messages").unwrap()
        );
        assert_ne!(
            TableName::parse("messages").unwrap(),
            TableName::parse("bus.messages").unwrap()
        );
    }
}
