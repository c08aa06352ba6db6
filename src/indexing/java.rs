use crate::core::error::{Error, Result};
use crate::core::model::{CodeElementRecord, ElementKind};
use crate::indexing::extract::{mask_ranges, retain_valid, CodeExtractor, SourceFile};
use crate::indexing::targets::TargetSet;
use regex::Regex;
use std::collections::HashMap;

/// Words that can precede `name(` without making it a declaration
const CALL_CONTEXT_WORDS: &[&str] = &["new", "return", "throw", "else", "case", "yield", "assert"];

/// Never method names
const KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "synchronized", "try", "do", "super", "this",
    "return", "new", "throw", "assert",
];

/// Kind of the file's primary type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeKind {
    Class,
    Interface,
}

#[derive(Debug, Clone)]
pub(crate) struct TypeDecl {
    pub kind: TypeKind,
    pub name: String,
    pub name_span: (usize, usize),
    /// Offsets of the opening and closing body braces
    pub body: (usize, usize),
    /// Names after `extends`/`implements`, generics stripped, as written
    pub supertypes: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct MethodDecl {
    pub name: String,
    pub name_span: (usize, usize),
    pub public: bool,
    pub first_param_is_string: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ConstantDecl {
    pub name: String,
    pub name_span: (usize, usize),
    pub value: Option<String>,
}

/// One parsed Java compilation unit.
///
/// Only the first top-level type is modelled; its fully-qualified name stands
/// for the whole file.
pub(crate) struct JavaUnit<'a> {
    pub path: &'a str,
    pub text: &'a str,
    /// Comments blanked and string interiors filled, offsets unchanged
    pub masked: String,
    depth: Vec<u32>,
    pub package: Option<String>,
    pub imports: Vec<String>,
    pub decl: Option<TypeDecl>,
    pub methods: Vec<MethodDecl>,
    pub constants: Vec<ConstantDecl>,
    pub constant_values: HashMap<String, String>,
}

impl JavaUnit<'_> {
    pub fn fqn(&self) -> Option<String> {
        let decl = self.decl.as_ref()?;
        Some(match &self.package {
            Some(package) => format!("{}.{}", package, decl.name),
            None => decl.name.clone(),
        })
    }

    /// Resolve a type name as written to a fully-qualified name using the
    /// imports and the package of this file
    pub fn qualify(&self, name: &str) -> String {
        if name.contains('.') {
            return name.to_string();
        }
        let suffix = format!(".{}", name);
        if let Some(import) = self.imports.iter().find(|i| i.ends_with(&suffix)) {
            return import.clone();
        }
        match &self.package {
            Some(package) => format!("{}.{}", package, name),
            None => name.to_string(),
        }
    }

    fn depth_at(&self, pos: usize) -> u32 {
        self.depth.get(pos).copied().unwrap_or(0)
    }

    fn in_body(&self, pos: usize) -> bool {
        self.decl
            .as_ref()
            .is_some_and(|d| pos > d.body.0 && pos < d.body.1 && self.depth_at(pos) == 1)
    }
}

/// Regexes shared by the extractor and the target resolver
pub(crate) struct JavaSyntax {
    package: Regex,
    import: Regex,
    type_decl: Regex,
    call: Regex,
    string_decl: Regex,
}

impl JavaSyntax {
    pub fn new() -> Result<Self> {
        Ok(Self {
            package: Regex::new(r"(?m)^\s*package\s+([\w$.]+)\s*;")?,
            import: Regex::new(r"(?m)^\s*import\s+([\w$.]+)\s*;")?,
            type_decl: Regex::new(r"\b(class|interface|enum|record)\s+([A-Za-z_$][\w$]*)")?,
            call: Regex::new(r"([A-Za-z_$][\w$]*)\s*\(")?,
            string_decl: Regex::new(r"\bString\s+([A-Za-z_$][\w$]*)\s*=")?,
        })
    }

    pub fn parse<'a>(&self, path: &'a str, text: &'a str) -> Result<JavaUnit<'a>> {
        let (comments, strings) = lex_ranges(text);
        let masked = mask_ranges(&mask_ranges(text, &comments, b' '), &strings, b'_');
        if masked.len() != text.len() {
            return Err(Error::Extraction(format!("{}: masking changed offsets", path)));
        }
        let depth = brace_depths(&masked);

        let package = self
            .package
            .captures(&masked)
            .map(|caps| caps[1].to_string());
        let imports = self
            .import
            .captures_iter(&masked)
            .map(|caps| caps[1].to_string())
            .collect();

        let mut unit = JavaUnit {
            path,
            text,
            masked,
            depth,
            package,
            imports,
            decl: None,
            methods: Vec::new(),
            constants: Vec::new(),
            constant_values: HashMap::new(),
        };
        unit.decl = self.find_type(&unit);
        unit.methods = self.find_methods(&unit);
        self.find_constants(&mut unit);
        Ok(unit)
    }

    fn find_type(&self, unit: &JavaUnit) -> Option<TypeDecl> {
        let masked = unit.masked.as_str();
        let caps = self.type_decl.captures_iter(masked).find(|caps| {
            let start = caps.get(0).map_or(0, |m| m.start());
            unit.depth_at(start) == 0 && prev_non_ws(masked, start).map(|(_, c)| c) != Some(b'@')
        })?;
        let keyword = caps.get(1)?;
        let name = caps.get(2)?;

        let open = name.end() + masked[name.end()..].find('{')?;
        let close = (open + 1..masked.len())
            .find(|&i| masked.as_bytes()[i] == b'}' && unit.depth_at(i) == 1)
            .unwrap_or(masked.len());

        let kind = if keyword.as_str() == "interface" {
            TypeKind::Interface
        } else {
            TypeKind::Class
        };
        Some(TypeDecl {
            kind,
            name: name.as_str().to_string(),
            name_span: (name.start(), name.end()),
            body: (open, close),
            supertypes: supertypes(&masked[name.end()..open]),
        })
    }

    fn find_methods(&self, unit: &JavaUnit) -> Vec<MethodDecl> {
        let Some(decl) = &unit.decl else {
            return Vec::new();
        };
        let masked = unit.masked.as_str();
        let mut methods = Vec::new();

        for caps in self.call.captures_iter(masked) {
            let Some(name) = caps.get(1) else { continue };
            if !unit.in_body(name.start())
                || KEYWORDS.contains(&name.as_str())
                || name.as_str() == decl.name
                || !is_declaration_head(masked, name.start())
            {
                continue;
            }

            let open = caps.get(0).map_or(name.end(), |m| m.end() - 1);
            let Some(close) = matching_close(masked, open) else { continue };
            let after = masked[close + 1..].trim_start();
            if !(after.starts_with('{')
                || after.starts_with(';')
                || after.starts_with("throws")
                || after.starts_with("default"))
            {
                continue;
            }

            let head = statement_head(masked, name.start());
            let public = has_word(head, "public")
                || (decl.kind == TypeKind::Interface && !has_word(head, "private"));
            methods.push(MethodDecl {
                name: name.as_str().to_string(),
                name_span: (name.start(), name.end()),
                public,
                first_param_is_string: first_param_is_string(&masked[open + 1..close]),
            });
        }
        methods
    }

    fn find_constants(&self, unit: &mut JavaUnit) {
        let Some(decl) = &unit.decl else { return };
        let interface = decl.kind == TypeKind::Interface;
        let masked = unit.masked.as_str();

        let mut raw = Vec::new();
        for caps in self.string_decl.captures_iter(masked) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else { continue };
            if !unit.in_body(whole.start()) {
                continue;
            }
            let head = statement_head(masked, whole.start());
            if !(interface || (has_word(head, "static") && has_word(head, "final"))) {
                continue;
            }
            let Some(semi) = masked[whole.end()..].find(';') else { continue };
            raw.push((
                name.as_str().to_string(),
                (name.start(), name.end()),
                (whole.end(), whole.end() + semi),
            ));
        }

        let mut values: HashMap<String, String> = HashMap::new();
        // Constants may reference each other in any order
        for _ in 0..=raw.len() {
            let before = values.len();
            for (name, _, expr) in &raw {
                if values.contains_key(name) {
                    continue;
                }
                if let Some(value) = eval_string_expr(unit.text, masked, *expr, &values) {
                    values.insert(name.clone(), value);
                }
            }
            if values.len() == before {
                break;
            }
        }

        unit.constants = raw
            .into_iter()
            .map(|(name, name_span, _)| ConstantDecl {
                value: values.get(&name).cloned(),
                name,
                name_span,
            })
            .collect();
        unit.constant_values = values;
    }

    /// Call sites of target methods: `(name span start, close paren end, first-arg range)`
    fn call_sites(&self, unit: &JavaUnit, targets: &TargetSet) -> Vec<(usize, usize, (usize, usize))> {
        let masked = unit.masked.as_str();
        let mut sites = Vec::new();
        for caps in self.call.captures_iter(masked) {
            let Some(name) = caps.get(1) else { continue };
            if !targets.contains_method(name.as_str()) || unit.depth_at(name.start()) == 0 {
                continue;
            }
            if !is_call_head(masked, name.start()) {
                continue;
            }
            let open = caps.get(0).map_or(name.end(), |m| m.end() - 1);
            let Some(close) = matching_close(masked, open) else { continue };
            let Some(first) = split_top_level(masked, open + 1, close, b',', false).into_iter().next() else {
                continue;
            };
            if masked[first.0..first.1].trim().is_empty() {
                continue;
            }
            sites.push((name.start(), close + 1, first));
        }
        sites
    }
}

/// Handler producing the records of one element kind
type Handler = fn(&JavaSyntax, &JavaUnit, ElementKind, &TargetSet) -> Vec<CodeElementRecord>;

const HANDLERS: &[(ElementKind, Handler)] = &[
    (ElementKind::Class, type_records),
    (ElementKind::Interface, type_records),
    (ElementKind::Method, method_records),
    (ElementKind::InterfaceMethod, method_records),
    (ElementKind::Field, field_records),
    (ElementKind::Usage, usage_records),
];

fn handler(kind: ElementKind) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, handler)| *handler)
}

fn type_records(_: &JavaSyntax, unit: &JavaUnit, kind: ElementKind, _: &TargetSet) -> Vec<CodeElementRecord> {
    let (Some(decl), Some(fqn)) = (&unit.decl, unit.fqn()) else {
        return Vec::new();
    };
    let wanted = match decl.kind {
        TypeKind::Class => ElementKind::Class,
        TypeKind::Interface => ElementKind::Interface,
    };
    if wanted != kind {
        return Vec::new();
    }
    vec![CodeElementRecord::new(unit.path, decl.name_span.0, decl.name_span.1, kind, fqn)]
}

fn method_records(_: &JavaSyntax, unit: &JavaUnit, kind: ElementKind, _: &TargetSet) -> Vec<CodeElementRecord> {
    let (Some(decl), Some(fqn)) = (&unit.decl, unit.fqn()) else {
        return Vec::new();
    };
    let wanted = match decl.kind {
        TypeKind::Class => ElementKind::Method,
        TypeKind::Interface => ElementKind::InterfaceMethod,
    };
    if wanted != kind {
        return Vec::new();
    }
    unit.methods
        .iter()
        .map(|m| {
            CodeElementRecord::new(
                unit.path,
                m.name_span.0,
                m.name_span.1,
                kind,
                format!("{}.{}", fqn, m.name),
            )
        })
        .collect()
}

fn field_records(_: &JavaSyntax, unit: &JavaUnit, kind: ElementKind, _: &TargetSet) -> Vec<CodeElementRecord> {
    unit.constants
        .iter()
        .filter_map(|c| {
            let value = c.value.as_deref().filter(|v| is_dotted_identifier(v))?;
            Some(CodeElementRecord::new(unit.path, c.name_span.0, c.name_span.1, kind, value))
        })
        .collect()
}

fn usage_records(
    syntax: &JavaSyntax,
    unit: &JavaUnit,
    kind: ElementKind,
    targets: &TargetSet,
) -> Vec<CodeElementRecord> {
    if targets.is_empty() || !targets.receivers().any(|r| has_word(&unit.masked, r)) {
        return Vec::new();
    }
    syntax
        .call_sites(unit, targets)
        .into_iter()
        .filter_map(|(start, end, arg)| {
            let id = eval_string_expr(unit.text, &unit.masked, arg, &unit.constant_values)?;
            let id = id.trim();
            if id.is_empty() {
                return None;
            }
            Some(CodeElementRecord::new(unit.path, start, end, kind, id))
        })
        .collect()
}

/// Built-in code extractor for `.java` sources
pub struct JavaExtractor {
    syntax: JavaSyntax,
}

impl JavaExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            syntax: JavaSyntax::new()?,
        })
    }

    fn run(&self, file: &SourceFile, kinds: &[ElementKind], targets: &TargetSet) -> Result<Vec<CodeElementRecord>> {
        let unit = self.syntax.parse(&file.path, &file.text)?;
        let mut records = Vec::new();
        for kind in kinds {
            if let Some(handler) = handler(*kind) {
                records.extend(handler(&self.syntax, &unit, *kind, targets));
            }
        }
        Ok(retain_valid(file, records, CodeElementRecord::validate))
    }
}

impl CodeExtractor for JavaExtractor {
    fn extract_code(&self, file: &SourceFile) -> Result<Vec<CodeElementRecord>> {
        let kinds: Vec<ElementKind> = ElementKind::ALL
            .into_iter()
            .filter(|k| !k.is_usage())
            .collect();
        self.run(file, &kinds, &TargetSet::default())
    }

    fn extract_usages(&self, file: &SourceFile, targets: &TargetSet) -> Result<Vec<CodeElementRecord>> {
        self.run(file, &[ElementKind::Usage], targets)
    }
}

/// Comment ranges and string/char literal interiors
fn lex_ranges(text: &str) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
    let bytes = text.as_bytes();
    let n = bytes.len();
    let mut comments = Vec::new();
    let mut strings = Vec::new();
    let mut i = 0;

    while i < n {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                let end = text[i..].find('\n').map_or(n, |p| i + p);
                comments.push((i, end));
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = text[i + 2..].find("*/").map_or(n, |p| i + 2 + p + 2);
                comments.push((i, end));
                i = end;
            }
            b'"' if text[i..].starts_with("\"\"\"") => {
                let body = i + 3;
                let end = text[body..].find("\"\"\"").map_or(n, |p| body + p);
                strings.push((body, end));
                i = (end + 3).min(n);
            }
            quote @ (b'"' | b'\'') => {
                let body = i + 1;
                let mut j = body;
                while j < n && bytes[j] != quote && bytes[j] != b'\n' {
                    j += if bytes[j] == b'\\' { 2 } else { 1 };
                }
                let end = j.min(n);
                strings.push((body, end));
                i = end + 1;
            }
            _ => i += 1,
        }
    }
    (comments, strings)
}

/// Brace depth before each byte
fn brace_depths(masked: &str) -> Vec<u32> {
    let mut depths = Vec::with_capacity(masked.len() + 1);
    let mut depth: u32 = 0;
    for byte in masked.bytes() {
        depths.push(depth);
        match byte {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    depths.push(depth);
    depths
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn prev_non_ws(s: &str, pos: usize) -> Option<(usize, u8)> {
    s.as_bytes()[..pos]
        .iter()
        .enumerate()
        .rev()
        .find(|(_, b)| !b.is_ascii_whitespace())
        .map(|(i, b)| (i, *b))
}

/// Identifier ending at (and including) `end`
fn word_ending_at(s: &str, end: usize) -> &str {
    let bytes = s.as_bytes();
    let mut start = end + 1;
    while start > 0 && is_ident_byte(bytes[start - 1]) {
        start -= 1;
    }
    &s[start..=end]
}

/// `name(` preceded by a return type rather than an expression context
fn is_declaration_head(masked: &str, name_start: usize) -> bool {
    match prev_non_ws(masked, name_start) {
        Some((i, b)) if is_ident_byte(b) => !CALL_CONTEXT_WORDS.contains(&word_ending_at(masked, i)),
        Some((i, b'>')) => i == 0 || masked.as_bytes()[i - 1] != b'-',
        Some((_, b']')) => true,
        _ => false,
    }
}

/// `name(` in expression position: a member call or a bare call
fn is_call_head(masked: &str, name_start: usize) -> bool {
    match prev_non_ws(masked, name_start) {
        Some((_, b'.')) => true,
        Some((i, b)) if is_ident_byte(b) => CALL_CONTEXT_WORDS.contains(&word_ending_at(masked, i)),
        Some((_, b)) => b"=(,;{}!&|?:+".contains(&b),
        None => false,
    }
}

/// Text between the previous statement boundary and `pos`
fn statement_head(masked: &str, pos: usize) -> &str {
    let start = masked[..pos]
        .rfind(|c| matches!(c, ';' | '{' | '}'))
        .map_or(0, |i| i + 1);
    &masked[start..pos]
}

pub(crate) fn has_word(hay: &str, word: &str) -> bool {
    find_word(hay, word).is_some()
}

fn find_word(hay: &str, word: &str) -> Option<usize> {
    if word.is_empty() {
        return None;
    }
    let bytes = hay.as_bytes();
    hay.match_indices(word).map(|(i, _)| i).find(|&i| {
        let before = i == 0 || !is_ident_byte(bytes[i - 1]);
        let after = bytes.get(i + word.len()).map_or(true, |b| !is_ident_byte(*b));
        before && after
    })
}

/// Offset of the `)` matching the `(` at `open`
fn matching_close(masked: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in masked.bytes().enumerate().skip(open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split `masked[start..end]` at `sep` outside any brackets; ranges are trimmed
fn split_top_level(masked: &str, start: usize, end: usize, sep: u8, angles: bool) -> Vec<(usize, usize)> {
    let bytes = masked.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut part_start = start;
    for i in start..end {
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b'<' if angles => depth += 1,
            b'>' if angles => depth -= 1,
            b if b == sep && depth == 0 => {
                parts.push(trim_range(masked, part_start, i));
                part_start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(trim_range(masked, part_start, end));
    parts
}

fn trim_range(s: &str, mut start: usize, mut end: usize) -> (usize, usize) {
    let bytes = s.as_bytes();
    while start < end && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    (start, end)
}

/// Remove `@Annotation` and `@Annotation(...)` from a parameter list
fn strip_annotations(params: &str) -> String {
    let bytes = params.as_bytes();
    let mut out = String::with_capacity(params.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'@' {
            let ch_len = params[i..].chars().next().map_or(1, char::len_utf8);
            out.push_str(&params[i..i + ch_len]);
            i += ch_len;
            continue;
        }
        i += 1;
        while i < bytes.len() && (is_ident_byte(bytes[i]) || bytes[i] == b'.') {
            i += 1;
        }
        let rest = i + (params[i..].len() - params[i..].trim_start().len());
        if bytes.get(rest) == Some(&b'(') {
            i = matching_close(params, rest).map_or(bytes.len(), |c| c + 1);
        }
    }
    out
}

fn first_param_is_string(params: &str) -> bool {
    let params = strip_annotations(params);
    let Some((start, end)) = split_top_level(&params, 0, params.len(), b',', true)
        .into_iter()
        .next()
    else {
        return false;
    };
    let tokens: Vec<&str> = params[start..end]
        .split_whitespace()
        .filter(|t| *t != "final")
        .collect();
    if tokens.len() < 2 {
        return false;
    }
    let ty = tokens[..tokens.len() - 1].concat();
    ty == "String" || ty == "java.lang.String"
}

/// Names after `extends` / `implements` in a type header
fn supertypes(header: &str) -> Vec<String> {
    let mut plain = String::with_capacity(header.len());
    let mut depth = 0;
    for ch in header.chars() {
        match ch {
            '<' => depth += 1,
            '>' => depth -= 1,
            _ if depth == 0 => plain.push(ch),
            _ => {}
        }
    }

    let mut names = Vec::new();
    for keyword in ["extends", "implements"] {
        let Some(pos) = find_word(&plain, keyword) else { continue };
        let rest = &plain[pos + keyword.len()..];
        let end = ["extends", "implements", "permits"]
            .iter()
            .filter_map(|k| find_word(rest, k))
            .min()
            .unwrap_or(rest.len());
        names.extend(
            rest[..end]
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
        );
    }
    names
}

fn is_dotted_identifier(value: &str) -> bool {
    let mut segments = 0;
    for segment in value.split('.') {
        let mut chars = segment.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$');
        if !valid_start || !chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$') {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

/// Statically evaluate a string expression made of literals, constants,
/// parentheses and `+`
fn eval_string_expr(
    text: &str,
    masked: &str,
    (start, end): (usize, usize),
    constants: &HashMap<String, String>,
) -> Option<String> {
    let mut out = String::new();
    for (s, e) in split_top_level(masked, start, end, b'+', false) {
        let piece = &text[s..e];
        let piece_masked = &masked[s..e];
        if piece.len() >= 6 && piece.starts_with("\"\"\"") && piece.ends_with("\"\"\"") {
            out.push_str(piece[3..piece.len() - 3].trim());
        } else if piece.len() >= 2 && piece.starts_with('"') && piece.ends_with('"') {
            out.push_str(&unescape(&piece[1..piece.len() - 1]));
        } else if piece_masked.starts_with('(') && piece_masked.ends_with(')') && e - s >= 2 {
            out.push_str(&eval_string_expr(text, masked, (s + 1, e - 1), constants)?);
        } else if !piece.is_empty()
            && piece.bytes().all(|b| is_ident_byte(b) || b == b'.')
        {
            let name = piece.rsplit('.').next()?;
            out.push_str(constants.get(name)?);
        } else {
            return None;
        }
    }
    Some(out)
}

fn unescape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
