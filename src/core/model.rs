use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::error::{Error, Result};

/// Kind of a code-side element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementKind {
    Class,
    Interface,
    Method,
    InterfaceMethod,
    Field,
    Usage,
}

impl ElementKind {
    pub const ALL: [ElementKind; 6] = [
        ElementKind::Class,
        ElementKind::Interface,
        ElementKind::Method,
        ElementKind::InterfaceMethod,
        ElementKind::Field,
        ElementKind::Usage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Class => "class",
            ElementKind::Interface => "interface",
            ElementKind::Method => "method",
            ElementKind::InterfaceMethod => "interfaceMethod",
            ElementKind::Field => "field",
            ElementKind::Usage => "usage",
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, ElementKind::Usage)
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A located code declaration or usage
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeElementRecord {
    pub file_path: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub kind: ElementKind,
    pub logical_id: String,
}

impl CodeElementRecord {
    pub fn new(
        file_path: impl Into<String>,
        start_offset: usize,
        end_offset: usize,
        kind: ElementKind,
        logical_id: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            start_offset,
            end_offset,
            kind,
            logical_id: logical_id.into(),
        }
    }

    /// Upsert key. Usages also carry their start offset so that several call
    /// sites of one id in one file stay distinct.
    pub fn store_key(&self) -> String {
        if self.kind.is_usage() {
            format!(
                "{}{SEP}{}{SEP}{}{SEP}{:010}",
                self.file_path, self.kind, self.logical_id, self.start_offset
            )
        } else {
            format!("{}{SEP}{}{SEP}{}", self.file_path, self.kind, self.logical_id)
        }
    }

    pub fn validate(&self, file_len: usize) -> Result<()> {
        validate_span(
            &self.logical_id,
            self.start_offset,
            self.end_offset,
            file_len,
        )
    }
}

/// A located markup statement
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkupElementRecord {
    pub file_path: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub tag_kind: String,
    pub logical_id: String,
    /// Dialect binding (`databaseId`); empty when unbound
    pub variant: String,
}

impl MarkupElementRecord {
    pub fn new(
        file_path: impl Into<String>,
        start_offset: usize,
        end_offset: usize,
        tag_kind: impl Into<String>,
        logical_id: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            start_offset,
            end_offset,
            tag_kind: tag_kind.into(),
            logical_id: logical_id.into(),
            variant: variant.into(),
        }
    }

    pub fn store_key(&self) -> String {
        format!(
            "{}{SEP}{}{SEP}{}{SEP}{}",
            self.file_path, self.tag_kind, self.logical_id, self.variant
        )
    }

    pub fn validate(&self, file_len: usize) -> Result<()> {
        validate_span(
            &self.logical_id,
            self.start_offset,
            self.end_offset,
            file_len,
        )
    }
}

/// Separator used inside composite store keys; never valid in paths or ids
pub(crate) const SEP: char = '\u{1f}';

fn validate_span(logical_id: &str, start: usize, end: usize, file_len: usize) -> Result<()> {
    if logical_id.is_empty() {
        return Err(Error::Extraction("empty logical id".to_string()));
    }
    if logical_id.contains(SEP) {
        return Err(Error::Extraction(format!(
            "logical id contains a control character: {:?}",
            logical_id
        )));
    }
    if start >= end || end > file_len {
        return Err(Error::Extraction(format!(
            "invalid span {}..{} for file of {} bytes",
            start, end, file_len
        )));
    }
    Ok(())
}

/// Which extractor a file is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Code,
    Markup,
}

/// Portion of the index rebuilt by a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshScope {
    /// Code declarations
    Code,
    /// Markup statements
    Markup,
    /// Call-site usages in code files
    Usage,
    All,
}

impl RefreshScope {
    pub fn includes_markup(&self) -> bool {
        matches!(self, RefreshScope::Markup | RefreshScope::All)
    }

    pub fn includes_code(&self) -> bool {
        matches!(self, RefreshScope::Code | RefreshScope::All)
    }

    pub fn includes_usage(&self) -> bool {
        matches!(self, RefreshScope::Usage | RefreshScope::All)
    }
}

impl fmt::Display for RefreshScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefreshScope::Code => "code",
            RefreshScope::Markup => "markup",
            RefreshScope::Usage => "usage",
            RefreshScope::All => "all",
        };
        f.write_str(name)
    }
}

impl FromStr for RefreshScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "code" | "java" => Ok(RefreshScope::Code),
            "markup" | "xml" => Ok(RefreshScope::Markup),
            "usage" | "usages" => Ok(RefreshScope::Usage),
            "all" => Ok(RefreshScope::All),
            other => Err(Error::Config(format!("unknown refresh scope: {}", other))),
        }
    }
}

/// Per-file position in the cache lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    Unknown,
    Fresh,
    Stale,
    Reparsing,
}

/// Row counts used by the health check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    /// All code records, usages included
    pub code: u64,
    pub markup: u64,
    pub digests: u64,
    /// Code records of kind `usage`
    pub usages: u64,
}

/// Both sides of one logical id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalIdRecords {
    pub code: Vec<CodeElementRecord>,
    pub markup: Vec<MarkupElementRecord>,
}

impl LogicalIdRecords {
    pub fn is_empty(&self) -> bool {
        self.code.is_empty() && self.markup.is_empty()
    }

    /// Distinct owning files across both sides
    pub fn files(&self) -> BTreeSet<String> {
        self.code
            .iter()
            .map(|r| r.file_path.clone())
            .chain(self.markup.iter().map(|r| r.file_path.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_kind_serde_names() {
        let json = serde_json::to_string(&ElementKind::InterfaceMethod).unwrap();
        assert_eq!(json, "\"interfaceMethod\"");
        let kind: ElementKind = serde_json::from_str("\"usage\"").unwrap();
        assert_eq!(kind, ElementKind::Usage);
        for kind in ElementKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json.trim_matches('"'), kind.as_str());
        }
    }

    #[test]
    fn test_code_store_key() {
        let decl = CodeElementRecord::new("A.java", 10, 20, ElementKind::Method, "a.B.find");
        let moved = CodeElementRecord::new("A.java", 30, 40, ElementKind::Method, "a.B.find");
        assert_eq!(decl.store_key(), moved.store_key());

        let first = CodeElementRecord::new("A.java", 10, 20, ElementKind::Usage, "a.B.find");
        let second = CodeElementRecord::new("A.java", 30, 40, ElementKind::Usage, "a.B.find");
        assert_ne!(first.store_key(), second.store_key());
    }

    #[test]
    fn test_markup_store_key_includes_variant() {
        let mysql = MarkupElementRecord::new("M.xml", 0, 5, "select", "ns.find", "mysql");
        let oracle = MarkupElementRecord::new("M.xml", 6, 9, "select", "ns.find", "oracle");
        assert_ne!(mysql.store_key(), oracle.store_key());
    }

    #[test]
    fn test_validate_span() {
        let ok = CodeElementRecord::new("A.java", 0, 4, ElementKind::Class, "a.A");
        assert!(ok.validate(4).is_ok());
        assert!(ok.validate(3).is_err());

        let empty = CodeElementRecord::new("A.java", 3, 3, ElementKind::Class, "a.A");
        assert!(empty.validate(10).is_err());

        let no_id = MarkupElementRecord::new("M.xml", 0, 4, "select", "", "");
        assert!(no_id.validate(10).is_err());
    }

    #[test]
    fn test_refresh_scope_parse() {
        assert_eq!("all".parse::<RefreshScope>().unwrap(), RefreshScope::All);
        assert_eq!("XML".parse::<RefreshScope>().unwrap(), RefreshScope::Markup);
        assert_eq!("java".parse::<RefreshScope>().unwrap(), RefreshScope::Code);
        assert_eq!("usage".parse::<RefreshScope>().unwrap(), RefreshScope::Usage);
        assert!("everything".parse::<RefreshScope>().is_err());
        assert!(RefreshScope::All.includes_usage());
        assert!(!RefreshScope::Code.includes_markup());
    }
}
