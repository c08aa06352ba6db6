use crate::core::error::{Error, Result};
use crate::core::model::{CodeElementRecord, MarkupElementRecord};
use crate::indexing::digest::digest_bytes;
use crate::indexing::java::JavaExtractor;
use crate::indexing::mapper_xml::MapperXmlExtractor;
use crate::indexing::targets::{SourceTargetResolver, TargetMethodResolver, TargetSet};
use std::path::Path;
use std::sync::Arc;

/// Read-only snapshot of one file. The digest is taken from the same bytes
/// the extractors see.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Store key of the file
    pub path: String,
    pub text: String,
    pub digest: String,
}

impl SourceFile {
    pub fn read(path: &Path, key: &str) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let digest = digest_bytes(&bytes);
        let text = String::from_utf8(bytes).map_err(|e| {
            Error::Extraction(format!("{} is not valid UTF-8: {}", path.display(), e))
        })?;
        Ok(Self {
            path: key.to_string(),
            text,
            digest,
        })
    }

    pub fn from_text(key: &str, text: &str) -> Self {
        Self {
            path: key.to_string(),
            text: text.to_string(),
            digest: digest_bytes(text.as_bytes()),
        }
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Turns a markup file into statement records
pub trait MarkupExtractor: Send + Sync {
    fn extract_markup(&self, file: &SourceFile) -> Result<Vec<MarkupElementRecord>>;
}

/// Turns a code file into declaration and usage records
pub trait CodeExtractor: Send + Sync {
    /// Declarations: every kind except `usage`
    fn extract_code(&self, file: &SourceFile) -> Result<Vec<CodeElementRecord>>;

    /// Call sites of `targets` whose first argument resolves to a logical id
    fn extract_usages(
        &self,
        file: &SourceFile,
        targets: &TargetSet,
    ) -> Result<Vec<CodeElementRecord>>;
}

/// The external collaborators the engine drives
#[derive(Clone)]
pub struct Extractors {
    pub markup: Arc<dyn MarkupExtractor>,
    pub code: Arc<dyn CodeExtractor>,
    pub targets: Arc<dyn TargetMethodResolver>,
}

impl Extractors {
    /// Built-in extractors with the given target class patterns
    pub fn with_patterns(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            markup: Arc::new(MapperXmlExtractor::new()?),
            code: Arc::new(JavaExtractor::new()?),
            targets: Arc::new(SourceTargetResolver::new(patterns)?),
        })
    }
}

/// Drop records that break the span or id invariants, logging each one
pub fn retain_valid<T>(
    file: &SourceFile,
    records: Vec<T>,
    validate: impl Fn(&T, usize) -> Result<()>,
) -> Vec<T> {
    let len = file.len();
    records
        .into_iter()
        .filter(|record| match validate(record, len) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %file.path, error = %e, "dropping invalid record");
                false
            }
        })
        .collect()
}

/// Blank out byte ranges while keeping every offset stable.
///
/// Replaced bytes become `fill`; newlines survive so line structure is intact.
pub(crate) fn mask_ranges(text: &str, ranges: &[(usize, usize)], fill: u8) -> String {
    let mut bytes = text.as_bytes().to_vec();
    for &(start, end) in ranges {
        for byte in &mut bytes[start..end.min(text.len())] {
            if *byte != b'\n' {
                *byte = fill;
            }
        }
    }
    // Ranges start and end on ASCII delimiters, so whole characters were replaced
    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ElementKind;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_source_file_digest_matches_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("A.java");
        fs::write(&path, "class A {}").unwrap();

        let file = SourceFile::read(&path, "A.java").unwrap();
        assert_eq!(file.digest, digest_bytes(b"class A {}"));
        assert_eq!(file.len(), 10);
    }

    #[test]
    fn test_source_file_rejects_invalid_utf8() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Bad.java");
        fs::write(&path, [0x63, 0xff, 0xfe]).unwrap();

        assert!(matches!(
            SourceFile::read(&path, "Bad.java"),
            Err(Error::Extraction(_))
        ));
    }

    #[test]
    fn test_retain_valid_drops_bad_spans() {
        let file = SourceFile::from_text("A.java", "class A {}");
        let records = vec![
            CodeElementRecord::new("A.java", 6, 7, ElementKind::Class, "A"),
            CodeElementRecord::new("A.java", 6, 99, ElementKind::Class, "A"),
            CodeElementRecord::new("A.java", 0, 1, ElementKind::Class, ""),
        ];
        let kept = retain_valid(&file, records, CodeElementRecord::validate);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].end_offset, 7);
    }

    #[test]
    fn test_mask_ranges_keeps_offsets() {
        let text = "a /* é */ b\nc";
        let masked = mask_ranges(text, &[(2, 10)], b' ');
        assert_eq!(masked.len(), text.len());
        assert_eq!(&masked[..2], "a ");
        assert_eq!(&masked[10..], " b\nc");
        assert!(!masked.contains('é'));
    }
}
