use crate::core::model::{RefreshScope, TableCounts};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Inconsistency patterns in the table counts, in detection order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthSignature {
    /// Markup indexed but no code records
    MissingCode,
    /// Code indexed but no markup records
    MissingMarkup,
    /// Nothing indexed at all
    Empty,
    /// Records present without any digests
    MissingDigests,
    /// No call-site usages anywhere
    MissingUsages,
}

impl HealthSignature {
    /// First signature matching `counts`, if any
    pub fn detect(counts: &TableCounts) -> Option<Self> {
        let has_code = counts.code > 0;
        let has_markup = counts.markup > 0;
        match (has_code, has_markup) {
            (false, true) => Some(Self::MissingCode),
            (true, false) => Some(Self::MissingMarkup),
            (false, false) => Some(Self::Empty),
            _ if counts.digests == 0 => Some(Self::MissingDigests),
            _ if counts.usages == 0 => Some(Self::MissingUsages),
            _ => None,
        }
    }

    /// Refresh scope that repairs this signature
    pub fn suggested_scope(&self) -> RefreshScope {
        match self {
            Self::MissingCode => RefreshScope::Code,
            Self::MissingMarkup => RefreshScope::Markup,
            Self::Empty | Self::MissingDigests => RefreshScope::All,
            Self::MissingUsages => RefreshScope::Usage,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::MissingCode => "Code declarations are missing from the index",
            Self::MissingMarkup => "Mapper statements are missing from the index",
            Self::Empty => "The index is empty",
            Self::MissingDigests => "File digests are missing; changes cannot be detected",
            Self::MissingUsages => "No call-site usages are indexed",
        }
    }
}

impl fmt::Display for HealthSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A suggestion to run a refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    pub signature: HealthSignature,
    pub suggested_scope: RefreshScope,
    pub counts: TableCounts,
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}. Run a refresh with scope '{}'.",
            self.signature, self.suggested_scope
        )
    }
}

/// One-shot advisory gate: once raised it stays quiet until re-armed
#[derive(Debug)]
pub struct HealthMonitor {
    armed: AtomicBool,
    dismissed: AtomicBool,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self {
            armed: AtomicBool::new(true),
            dismissed: AtomicBool::new(false),
        }
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an advisory for `counts` if a signature matches and the gate is open
    pub fn check(&self, counts: &TableCounts) -> Option<Advisory> {
        if self.dismissed.load(Ordering::SeqCst) {
            return None;
        }
        let signature = HealthSignature::detect(counts)?;
        if !self.armed.swap(false, Ordering::SeqCst) {
            return None;
        }
        Some(Advisory {
            signature,
            suggested_scope: signature.suggested_scope(),
            counts: *counts,
        })
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn rearm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Suppress advisories for the rest of the session
    pub fn dismiss(&self) {
        self.dismissed.store(true, Ordering::SeqCst);
    }

    /// Undo a dismissal and re-arm
    pub fn reset(&self) {
        self.dismissed.store(false, Ordering::SeqCst);
        self.rearm();
    }
}
