//! Command safety classification.
//!
//! Every command submitted through `execute` is classified before it reaches
//! the remote host. The check is advisory defense-in-depth: it catches common
//! destructive one-liners typed by mistake, it is NOT a sandbox. Anything the
//! remote account is allowed to do can still be reached through quoting,
//! aliases, scripts on the host or other tricks. Operators must enforce real
//! limits on the target host (account permissions, sudoers, forced commands).
//!
//! # Classification Order
//!
//! 1. The trimmed, lowercased command is checked for each fragment in
//!    [`DANGEROUS_FRAGMENTS`] by substring match. The first hit blocks.
//! 2. Otherwise each rule in the suspicious pattern table is tried as a regex.
//!    The first hit blocks.
//! 3. Otherwise the command is allowed.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Destructive command fragments, matched as substrings of the normalized command.
///
/// Covers recursive delete, disk format/wipe, power state changes and
/// permission escalation idioms.
pub const DANGEROUS_FRAGMENTS: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "dd if=",
    "mkfs",
    "format",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "chmod 777",
    "chown root",
];

/// Suspicious shell metacharacter idioms, tried in order.
const SUSPICIOUS_PATTERNS: &[&str] = &[
    r">\s*;",                               // redirect then chain
    r"\|\s*rm\b",                           // pipe into rm
    r"&&",                                  // AND chaining
    r"\$\(",                                // command substitution
    r"`",                                   // backtick execution
    r"\bcurl\b.*\|\s*(ba|z|da)?sh\b",       // download and execute
    r"\bwget\b.*\|\s*(ba|z|da)?sh\b",
];

struct SuspiciousRule {
    pattern: &'static str,
    regex: Regex,
}

static SUSPICIOUS_RULES: Lazy<Vec<SuspiciousRule>> = Lazy::new(|| {
    SUSPICIOUS_PATTERNS
        .iter()
        .map(|&pattern| SuspiciousRule {
            pattern,
            // Patterns are compile-time constants covered by tests.
            regex: Regex::new(pattern).expect("valid suspicious pattern"),
        })
        .collect()
});

/// Why a command was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Matched a fragment of [`DANGEROUS_FRAGMENTS`]
    Dangerous(&'static str),
    /// Matched a suspicious metacharacter pattern (regex source)
    Suspicious(&'static str),
}

impl BlockReason {
    /// The fragment or regex that matched.
    pub fn matched(&self) -> &'static str {
        match self {
            BlockReason::Dangerous(fragment) => fragment,
            BlockReason::Suspicious(pattern) => pattern,
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Dangerous(fragment) => write!(f, "dangerous pattern: {}", fragment),
            BlockReason::Suspicious(pattern) => write!(f, "suspicious pattern: {}", pattern),
        }
    }
}

/// Result of classifying a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked(BlockReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Classify a command. Pure and case-insensitive; surrounding whitespace is ignored.
pub fn classify(command: &str) -> Verdict {
    let normalized = command.trim().to_lowercase();

    // Deny-list is checked first and takes priority over patterns
    for fragment in DANGEROUS_FRAGMENTS {
        if normalized.contains(fragment) {
            return Verdict::Blocked(BlockReason::Dangerous(fragment));
        }
    }

    for rule in SUSPICIOUS_RULES.iter() {
        if rule.regex.is_match(&normalized) {
            return Verdict::Blocked(BlockReason::Suspicious(rule.pattern));
        }
    }

    Verdict::Allowed
}
