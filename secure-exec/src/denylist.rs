//! Denylist registry.
//!
//! Static configuration consumed by the validator and the input sanitizer:
//! forbidden modules, forbidden bare calls, forbidden method calls, forbidden
//! attribute-name substrings, and the raw-text patterns used to screen user
//! queries. Built once at startup; deployment settings can add entries but
//! never remove the built-in ones.

use regex::RegexSet;
use std::collections::BTreeSet;

/// Modules whose import is rejected (matched on the top-level package)
pub const FORBIDDEN_MODULES: &[&str] = &[
    // operating system / interpreter access
    "os", "sys", "posix", "nt", "pty", "shutil", "pathlib", "io", "fileinput",
    "tempfile", "glob", "importlib", "imp", "builtins", "__builtin__", "gc",
    "inspect", "ctypes", "cffi", "resource", "signal", "threading",
    "_thread", "multiprocessing", "concurrent", "asyncio", "code", "codeop",
    // process spawning
    "subprocess", "pexpect",
    // networking
    "socket", "ssl", "select", "selectors", "requests", "urllib", "urllib2",
    "urllib3", "httplib", "http", "ftplib", "smtplib", "poplib", "imaplib",
    "telnetlib", "xmlrpc", "webbrowser",
    // serialization that can run code
    "pickle", "cPickle", "_pickle", "marshal", "shelve", "dill", "cloudpickle",
    // names the original screen also listed as modules
    "eval", "exec", "compile", "__import__", "open", "input", "raw_input",
    "reload", "exit", "quit",
];

/// Bare names that may not be called
pub const FORBIDDEN_CALLS: &[&str] = &[
    "eval", "exec", "compile", "__import__", "open", "input", "raw_input",
    "breakpoint", "globals", "locals", "vars", "getattr", "setattr", "delattr",
    "reload", "exit", "quit", "help", "memoryview",
];

/// Attribute names that may not be called as methods (`df.eval(...)`)
pub const FORBIDDEN_METHOD_CALLS: &[&str] = &[
    "eval", "exec", "system", "popen", "spawn", "execv", "execve", "fork",
];

/// Substrings that make an attribute (or bare name) an escape hatch
pub const FORBIDDEN_ATTRIBUTE_PATTERNS: &[&str] = &[
    "__class__", "__bases__", "__base__", "__mro__", "__subclasses__",
    "__globals__", "__builtins__", "__code__", "__closure__", "__func__",
    "__self__", "__dict__", "__getattribute__", "__import__", "__loader__",
    "__spec__", "__reduce__", "__reduce_ex__", "__init_subclass__",
    "__subclasshook__", "__frame__", "f_globals", "f_locals", "f_back",
    "gi_frame", "gi_code", "cr_frame", "co_code", "tb_frame",
];

/// Raw-text markers screened out of user queries, as (label, regex)
pub const SUSPICIOUS_QUERY_PATTERNS: &[(&str, &str)] = &[
    ("__import__", r"__import__"),
    ("eval(", r"\beval\s*\("),
    ("exec(", r"\bexec\s*\("),
    ("compile(", r"\bcompile\s*\("),
    ("subprocess.", r"\bsubprocess\s*\."),
    ("os.system", r"\bos\s*\.\s*system\b"),
    ("os.popen", r"\bos\s*\.\s*popen\b"),
    ("os.exec", r"\bos\s*\.\s*exec"),
    ("pty.spawn", r"\bpty\s*\.\s*spawn\b"),
];

/// Labelled set of case-insensitive patterns for raw-text screening
#[derive(Debug, Clone)]
pub struct QueryPatterns {
    labels: Vec<String>,
    set: RegexSet,
}

impl QueryPatterns {
    pub fn new<'a>(patterns: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self, regex::Error> {
        let (labels, sources): (Vec<String>, Vec<String>) = patterns
            .into_iter()
            .map(|(label, source)| (label.to_string(), format!("(?i){}", source)))
            .unzip();
        let set = RegexSet::new(&sources)?;
        Ok(Self { labels, set })
    }

    /// Label of the first pattern (in declaration order) that matches
    pub fn first_match(&self, text: &str) -> Option<&str> {
        self.set
            .matches(text)
            .iter()
            .next()
            .map(|index| self.labels[index].as_str())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Default for QueryPatterns {
    fn default() -> Self {
        // The built-in table is constant; a failure here is a programming error
        // caught by the unit tests below.
        Self::new(SUSPICIOUS_QUERY_PATTERNS.iter().copied())
            .unwrap_or_else(|_| Self {
                labels: Vec::new(),
                set: RegexSet::empty(),
            })
    }
}

/// The complete registry, read-only once built
#[derive(Debug, Clone)]
pub struct Denylist {
    modules: BTreeSet<String>,
    calls: BTreeSet<String>,
    method_calls: BTreeSet<String>,
    attribute_patterns: Vec<String>,
    query_patterns: QueryPatterns,
}

impl Default for Denylist {
    fn default() -> Self {
        Self {
            modules: to_set(FORBIDDEN_MODULES),
            calls: to_set(FORBIDDEN_CALLS),
            method_calls: to_set(FORBIDDEN_METHOD_CALLS),
            attribute_patterns: FORBIDDEN_ATTRIBUTE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            query_patterns: QueryPatterns::default(),
        }
    }
}

fn to_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Denylist {
    /// Built-in entries plus deployment-time additions.
    ///
    /// Additions only ever tighten the denylist.
    pub fn with_additions(
        modules: impl IntoIterator<Item = String>,
        calls: impl IntoIterator<Item = String>,
        attribute_patterns: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut denylist = Self::default();
        denylist.modules.extend(modules);
        denylist.calls.extend(calls);
        for pattern in attribute_patterns {
            if !pattern.is_empty() && !denylist.attribute_patterns.contains(&pattern) {
                denylist.attribute_patterns.push(pattern);
            }
        }
        denylist
    }

    pub fn is_forbidden_module(&self, module: &str) -> bool {
        let top_level = module.split('.').next().unwrap_or(module);
        self.modules.contains(top_level)
    }

    pub fn is_forbidden_call(&self, name: &str) -> bool {
        self.calls.contains(name)
    }

    pub fn is_forbidden_method_call(&self, name: &str) -> bool {
        self.method_calls.contains(name)
    }

    /// The first forbidden pattern contained in `name`, if any
    pub fn forbidden_attribute_pattern(&self, name: &str) -> Option<&str> {
        self.attribute_patterns
            .iter()
            .find(|pattern| name.contains(pattern.as_str()))
            .map(String::as_str)
    }

    /// Patterns the input sanitizer screens raw queries with
    pub fn query_patterns(&self) -> &QueryPatterns {
        &self.query_patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_query_patterns_compile() {
        let patterns = QueryPatterns::new(SUSPICIOUS_QUERY_PATTERNS.iter().copied()).unwrap();
        assert_eq!(patterns.len(), SUSPICIOUS_QUERY_PATTERNS.len());
        assert!(!patterns.is_empty());
    }

    #[test]
    fn test_module_match_uses_top_level_package() {
        let denylist = Denylist::default();
        assert!(denylist.is_forbidden_module("os"));
        assert!(denylist.is_forbidden_module("os.path"));
        assert!(denylist.is_forbidden_module("urllib.request"));
        assert!(!denylist.is_forbidden_module("math"));
        assert!(!denylist.is_forbidden_module("oslo"));
    }

    #[test]
    fn test_attribute_patterns_match_substrings() {
        let denylist = Denylist::default();
        assert_eq!(denylist.forbidden_attribute_pattern("__class__"), Some("__class__"));
        assert_eq!(denylist.forbidden_attribute_pattern("__subclasses__"), Some("__subclasses__"));
        assert_eq!(denylist.forbidden_attribute_pattern("columns"), None);
        assert_eq!(denylist.forbidden_attribute_pattern("__init__"), None);
    }

    #[test]
    fn test_query_patterns_are_case_insensitive() {
        let patterns = QueryPatterns::default();
        assert_eq!(patterns.first_match("please EVAL(1+1)"), Some("eval("));
        assert_eq!(patterns.first_match("Run os.system('ls')"), Some("os.system"));
        assert_eq!(patterns.first_match("Show me the first 10 rows"), None);
        // "evaluate" is a normal word, not a call
        assert_eq!(patterns.first_match("evaluate the model (quickly)"), None);
    }

    #[test]
    fn test_additions_only_tighten() {
        let denylist = Denylist::with_additions(
            vec!["numpy".to_string()],
            vec!["print".to_string()],
            vec!["_private".to_string()],
        );

        assert!(denylist.is_forbidden_module("numpy"));
        assert!(denylist.is_forbidden_module("os"));
        assert!(denylist.is_forbidden_call("print"));
        assert!(denylist.is_forbidden_call("eval"));
        assert_eq!(denylist.forbidden_attribute_pattern("x._private_thing"), Some("_private"));
    }
}
