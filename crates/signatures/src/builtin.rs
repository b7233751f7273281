//! Built-in attack signatures, grouped by category in evaluation order.

use crate::SignatureCategory;

pub(crate) struct BuiltinSignature {
    pub id: &'static str,
    pub category: SignatureCategory,
    pub description: &'static str,
    pub pattern: &'static str,
}

const fn sig(
    id: &'static str,
    category: SignatureCategory,
    description: &'static str,
    pattern: &'static str,
) -> BuiltinSignature {
    BuiltinSignature {
        id,
        category,
        description,
        pattern,
    }
}

use SignatureCategory::{CommandInjection, PathTraversal, SqlInjection, Xss};

pub(crate) const BUILTIN_SIGNATURES: &[BuiltinSignature] = &[
    // SQL injection
    sig(
        "sqli-001",
        SqlInjection,
        "stacked query with destructive statement",
        r#"(?i);\s*(?:drop|delete|insert|update|alter|create|truncate|exec|shutdown)\s"#,
    ),
    sig(
        "sqli-002",
        SqlInjection,
        "quoted tautology",
        r#"(?i)['"]\s*(?:or|and)\s+['"]?\w+['"]?\s*=\s*['"]?\w+|\bor\s+1\s*=\s*1\b"#,
    ),
    sig(
        "sqli-003",
        SqlInjection,
        "union select",
        r"(?i)\bunion\s+(?:all\s+)?select\b",
    ),
    sig(
        "sqli-004",
        SqlInjection,
        "quote followed by comment terminator",
        r"(?i)'\s*(?:--|#|/\*)",
    ),
    sig(
        "sqli-005",
        SqlInjection,
        "time-based blind probe",
        r"(?i)\b(?:sleep|benchmark|pg_sleep)\s*\(|\bwaitfor\s+delay\b",
    ),
    sig(
        "sqli-006",
        SqlInjection,
        "schema enumeration",
        r"(?i)\binformation_schema\b|\bpg_catalog\b|\bmysql\.user\b",
    ),
    // Cross-site scripting
    sig(
        "xss-001",
        Xss,
        "script tag",
        r"(?i)(?:<|%3c)\s*script\b",
    ),
    sig(
        "xss-002",
        Xss,
        "inline event handler",
        r"(?i)<[^>]*\bon[a-z]+\s*=",
    ),
    sig(
        "xss-003",
        Xss,
        "javascript URI",
        r"(?i)javascript\s*:",
    ),
    sig(
        "xss-004",
        Xss,
        "active content element",
        r"(?i)<\s*(?:iframe|object|embed|svg)\b",
    ),
    // Path traversal
    sig(
        "pt-001",
        PathTraversal,
        "parent directory sequence",
        r"(?i)(?:\.\.|%2e%2e|%252e%252e)(?:/|\\|%2f|%5c|%252f)",
    ),
    sig(
        "pt-002",
        PathTraversal,
        "sensitive system file",
        r"(?i)/etc/(?:passwd|shadow|sudoers)\b|/proc/self/|\bwin\.ini\b|\bboot\.ini\b",
    ),
    sig(
        "pt-003",
        PathTraversal,
        "null byte",
        r"%00|\x00",
    ),
    // Command injection
    sig(
        "ci-001",
        CommandInjection,
        "chained shell command",
        r"(?i)(?:;|\||&&|`)\s*(?:cat|ls|id|whoami|uname|wget|curl|nc|bash|sh|ping|rm|chmod)(?:\s|$)",
    ),
    sig(
        "ci-002",
        CommandInjection,
        "command substitution",
        r"\$\([^)]*\)|`[^`]+`",
    ),
    sig(
        "ci-003",
        CommandInjection,
        "shell interpreter path",
        r"(?i)/bin/(?:ba)?sh\b|\bcmd\.exe\b|\bpowershell(?:\.exe)?\b",
    ),
];
