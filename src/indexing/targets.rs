use crate::core::error::Result;
use crate::indexing::extract::SourceFile;
use crate::indexing::java::JavaSyntax;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Patterns used when none are configured
pub const DEFAULT_TARGET_PATTERNS: &[&str] = &[
    "org.apache.ibatis.session.SqlSession",
    "org.mybatis.spring.SqlSessionTemplate",
];

const SQL_SESSION_METHODS: &[&str] = &[
    "selectOne",
    "selectList",
    "selectMap",
    "selectCursor",
    "select",
    "insert",
    "update",
    "delete",
];

/// Library classes that never appear as project sources: name, supertypes,
/// public string-first methods
const LIBRARY_CLASSES: &[(&str, &[&str], &[&str])] = &[
    ("org.apache.ibatis.session.SqlSession", &[], SQL_SESSION_METHODS),
    (
        "org.mybatis.spring.SqlSessionTemplate",
        &["org.apache.ibatis.session.SqlSession"],
        &[],
    ),
    (
        "org.apache.ibatis.session.defaults.DefaultSqlSession",
        &["org.apache.ibatis.session.SqlSession"],
        &[],
    ),
];

/// A method whose call sites carry a logical id as first argument
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetMethod {
    /// Fully-qualified name of the matched class
    pub class_name: String,
    pub method: String,
}

/// Resolved target methods plus the class names that signal a file may call them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    methods: BTreeSet<TargetMethod>,
    method_names: BTreeSet<String>,
    receivers: BTreeSet<String>,
}

impl TargetSet {
    /// `extra_receivers` are simple names of further classes (for example project
    /// subclasses of a target class) whose mention makes a file worth scanning
    pub fn new(
        methods: impl IntoIterator<Item = TargetMethod>,
        extra_receivers: impl IntoIterator<Item = String>,
    ) -> Self {
        let methods: BTreeSet<TargetMethod> = methods.into_iter().collect();
        let method_names = methods.iter().map(|m| m.method.clone()).collect();
        let receivers = methods
            .iter()
            .map(|m| simple_name(&m.class_name).to_string())
            .chain(extra_receivers)
            .collect();
        Self {
            methods,
            method_names,
            receivers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn contains_method(&self, name: &str) -> bool {
        self.method_names.contains(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &TargetMethod> {
        self.methods.iter()
    }

    pub fn receivers(&self) -> impl Iterator<Item = &str> {
        self.receivers.iter().map(String::as_str)
    }
}

/// Identifies the call-site entry points for usage scanning
pub trait TargetMethodResolver: Send + Sync {
    fn resolve(&self, code_files: &[SourceFile]) -> Result<TargetSet>;
}

/// Resolves class patterns against the project's own sources and a table of
/// well-known library classes
pub struct SourceTargetResolver {
    patterns: Vec<Regex>,
    syntax: JavaSyntax,
}

struct ClassInfo {
    supertypes: Vec<String>,
    methods: BTreeSet<String>,
}

impl SourceTargetResolver {
    /// Compile `patterns`; `*` matches any run of name characters. An empty
    /// list falls back to the defaults.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut configured: Vec<&str> = patterns
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        if configured.is_empty() {
            tracing::warn!(
                defaults = ?DEFAULT_TARGET_PATTERNS,
                "no target class patterns configured, using defaults"
            );
            configured = DEFAULT_TARGET_PATTERNS.to_vec();
        }

        let mut compiled = Vec::with_capacity(configured.len());
        for pattern in configured {
            let source = format!("^{}$", regex::escape(pattern).replace(r"\*", r"[\w$.]*"));
            compiled.push(Regex::new(&source)?);
        }

        Ok(Self {
            patterns: compiled,
            syntax: JavaSyntax::new()?,
        })
    }

    fn matches(&self, class_name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(class_name))
    }

    fn collect_classes(&self, code_files: &[SourceFile]) -> BTreeMap<String, ClassInfo> {
        let mut classes: BTreeMap<String, ClassInfo> = LIBRARY_CLASSES
            .iter()
            .map(|(name, supertypes, methods)| {
                (
                    name.to_string(),
                    ClassInfo {
                        supertypes: supertypes.iter().map(|s| s.to_string()).collect(),
                        methods: methods.iter().map(|m| m.to_string()).collect(),
                    },
                )
            })
            .collect();

        for file in code_files {
            let unit = match self.syntax.parse(&file.path, &file.text) {
                Ok(unit) => unit,
                Err(e) => {
                    tracing::debug!(path = %file.path, error = %e, "skipping unparsable source");
                    continue;
                }
            };
            let (Some(decl), Some(fqn)) = (&unit.decl, unit.fqn()) else {
                continue;
            };
            let supertypes = decl.supertypes.iter().map(|s| unit.qualify(s)).collect();
            let methods = unit
                .methods
                .iter()
                .filter(|m| m.public && m.first_param_is_string)
                .map(|m| m.name.clone())
                .collect();
            classes.insert(fqn, ClassInfo { supertypes, methods });
        }
        classes
    }
}

impl TargetMethodResolver for SourceTargetResolver {
    fn resolve(&self, code_files: &[SourceFile]) -> Result<TargetSet> {
        let classes = self.collect_classes(code_files);

        let mut methods = BTreeSet::new();
        let mut roots = BTreeSet::new();
        for class_name in classes.keys().filter(|name| self.matches(name)) {
            roots.insert(class_name.clone());
            let mut seen = HashSet::new();
            let mut pending = vec![class_name.clone()];
            while let Some(current) = pending.pop() {
                if !seen.insert(current.clone()) {
                    continue;
                }
                let Some(info) = classes.get(&current) else { continue };
                methods.extend(info.methods.iter().map(|method| TargetMethod {
                    class_name: class_name.clone(),
                    method: method.clone(),
                }));
                pending.extend(info.supertypes.iter().cloned());
            }
        }

        // Project classes extending a target class are receivers too
        let mut receivers = BTreeSet::new();
        for (name, info) in &classes {
            let mut seen = HashSet::new();
            let mut pending: Vec<&String> = info.supertypes.iter().collect();
            while let Some(current) = pending.pop() {
                if !seen.insert(current) {
                    continue;
                }
                if roots.contains(current) {
                    receivers.insert(simple_name(name).to_string());
                    break;
                }
                if let Some(parent) = classes.get(current) {
                    pending.extend(parent.supertypes.iter());
                }
            }
        }

        let targets = TargetSet::new(methods, receivers);
        tracing::debug!(
            methods = targets.len(),
            classes = roots.len(),
            "resolved target methods"
        );
        Ok(targets)
    }
}

fn simple_name(class_name: &str) -> &str {
    class_name.rsplit('.').next().unwrap_or(class_name)
}
