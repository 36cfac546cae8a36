//! Per-language symbol extraction.
//!
//! A [`SummarizerRegistry`] maps file extensions to [`Summarizer`]
//! implementations; anything unregistered resolves to [`NoopSummarizer`].
//! Errors and panics inside a summarizer never escape the registry: they
//! become a warning and the file is kept without symbols.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Type,
    Function,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    /// 1-based.
    pub line: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SummarizeError(pub String);

pub trait Summarizer: Send + Sync {
    fn language(&self) -> &str;

    /// Symbols in source order.
    fn summarize(&self, path: &str, content: &str) -> Result<Vec<Symbol>, SummarizeError>;
}

/// Used for languages without a registered summarizer.
pub struct NoopSummarizer;

impl Summarizer for NoopSummarizer {
    fn language(&self) -> &str {
        "unknown"
    }

    fn summarize(&self, _path: &str, _content: &str) -> Result<Vec<Symbol>, SummarizeError> {
        Ok(Vec::new())
    }
}

/// Outcome of summarizing one file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSummary {
    pub symbols: Vec<Symbol>,
    pub warning: Option<String>,
}

pub struct SummarizerRegistry {
    by_extension: HashMap<String, Arc<dyn Summarizer>>,
    fallback: Arc<dyn Summarizer>,
}

impl Default for SummarizerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SummarizerRegistry {
    pub fn empty() -> Self {
        Self {
            by_extension: HashMap::new(),
            fallback: Arc::new(NoopSummarizer),
        }
    }

    /// Registry with the built-in language summarizers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(&[".py", ".pyi", ".pyw"], Arc::new(RegexSummarizer::python()));
        registry.register(
            &[".js", ".jsx", ".ts", ".tsx", ".mjs", ".cjs"],
            Arc::new(RegexSummarizer::javascript()),
        );
        registry.register(&[".go"], Arc::new(RegexSummarizer::go()));
        registry.register(&[".rs"], Arc::new(RegexSummarizer::rust()));
        registry.register(&[".rb"], Arc::new(RegexSummarizer::ruby()));
        registry.register(&[".php"], Arc::new(RegexSummarizer::php()));
        registry
    }

    /// Register `summarizer` for each extension, replacing earlier entries.
    pub fn register(&mut self, extensions: &[&str], summarizer: Arc<dyn Summarizer>) {
        for ext in extensions {
            self.by_extension
                .insert(ext.to_lowercase(), Arc::clone(&summarizer));
        }
    }

    pub fn resolve(&self, path: &str) -> Arc<dyn Summarizer> {
        extension(path)
            .and_then(|ext| self.by_extension.get(&ext))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn summarize(&self, path: &str, content: &str) -> FileSummary {
        let summarizer = self.resolve(path);
        let outcome = catch_unwind(AssertUnwindSafe(|| summarizer.summarize(path, content)));
        match outcome {
            Ok(Ok(symbols)) => FileSummary {
                symbols,
                warning: None,
            },
            Ok(Err(e)) => {
                warn!(path, language = summarizer.language(), error = %e, "summarizer failed");
                FileSummary {
                    symbols: Vec::new(),
                    warning: Some(format!("{path}: symbol extraction failed: {e}")),
                }
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                warn!(path, language = summarizer.language(), panic = %msg, "summarizer panicked");
                FileSummary {
                    symbols: Vec::new(),
                    warning: Some(format!("{path}: symbol extraction crashed: {msg}")),
                }
            }
        }
    }
}

fn extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let idx = name.rfind('.').filter(|&i| i > 0)?;
    Some(name[idx..].to_lowercase())
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

/// Line-oriented regex extraction. Each rule's first capture group is the symbol name.
pub struct RegexSummarizer {
    language: &'static str,
    rules: &'static [(Regex, SymbolKind)],
}

type Rules = LazyLock<Vec<(Regex, SymbolKind)>>;

macro_rules! rules {
    ($($pattern:literal => $kind:ident),+ $(,)?) => {
        LazyLock::new(|| vec![$((Regex::new($pattern).unwrap(), SymbolKind::$kind)),+])
    };
}

static PYTHON: Rules = rules![
    r"^\s*(?:async\s+)?def\s+([A-Za-z0-9_]+)\s*\(" => Function,
    r"^\s*class\s+([A-Za-z0-9_]+)\s*[\(:]" => Class,
];

static JAVASCRIPT: Rules = rules![
    r"\bclass\s+([A-Za-z0-9_$]+)" => Class,
    r"\b(?:const|let|var)\s+([A-Za-z0-9_$]+)\s*=\s*class\b" => Class,
    r"\binterface\s+([A-Za-z0-9_$]+)" => Type,
    r"\btype\s+([A-Za-z0-9_$]+)\s*=" => Type,
    r"\bfunction\s*\*?\s*([A-Za-z0-9_$]+)\s*\(" => Function,
    r"\b(?:const|let|var)\s+([A-Za-z0-9_$]+)\s*=\s*(?:async\s+)?function\b" => Function,
    r"\b(?:const|let|var)\s+([A-Za-z0-9_$]+)\s*=\s*(?:async\s*)?\([^)]*\)\s*=>" => Function,
    r"^\s*([A-Za-z0-9_$]+)\s*:\s*(?:async\s+)?function\s*\(" => Function,
];

static GO: Rules = rules![
    r"^\s*func\s+(?:\([^)]+\)\s*)?([A-Za-z0-9_]+)\s*[\[(]" => Function,
    r"^\s*type\s+([A-Za-z0-9_]+)\s+(?:struct|interface)\b" => Type,
];

static RUST: Rules = rules![
    r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z0-9_]+)" => Function,
    r"^\s*(?:pub(?:\([^)]*\))?\s+)?struct\s+([A-Za-z0-9_]+)" => Type,
    r"^\s*(?:pub(?:\([^)]*\))?\s+)?enum\s+([A-Za-z0-9_]+)" => Type,
    r"^\s*(?:pub(?:\([^)]*\))?\s+)?trait\s+([A-Za-z0-9_]+)" => Type,
];

static RUBY: Rules = rules![
    r"^\s*def\s+([A-Za-z0-9_?!]+(?:\.[A-Za-z0-9_?!]+)?)" => Function,
    r"^\s*(?:class|module)\s+([A-Za-z0-9_:]+)" => Class,
];

static PHP: Rules = rules![
    r"(?i)\bfunction\s+&?\s*([A-Za-z0-9_]+)\s*\(" => Function,
    r"(?i)\b(?:class|interface|trait)\s+([A-Za-z0-9_]+)" => Class,
];

impl RegexSummarizer {
    pub fn python() -> Self {
        Self {
            language: "python",
            rules: PYTHON.as_slice(),
        }
    }

    pub fn javascript() -> Self {
        Self {
            language: "javascript",
            rules: JAVASCRIPT.as_slice(),
        }
    }

    pub fn go() -> Self {
        Self {
            language: "go",
            rules: GO.as_slice(),
        }
    }

    pub fn rust() -> Self {
        Self {
            language: "rust",
            rules: RUST.as_slice(),
        }
    }

    pub fn ruby() -> Self {
        Self {
            language: "ruby",
            rules: RUBY.as_slice(),
        }
    }

    pub fn php() -> Self {
        Self {
            language: "php",
            rules: PHP.as_slice(),
        }
    }
}

impl Summarizer for RegexSummarizer {
    fn language(&self) -> &str {
        self.language
    }

    fn summarize(&self, _path: &str, content: &str) -> Result<Vec<Symbol>, SummarizeError> {
        let mut symbols = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let before = symbols.len();
            for (regex, kind) in self.rules {
                let Some(name) = regex.captures(line).and_then(|c| c.get(1)) else {
                    continue;
                };
                let name = name.as_str();
                // Overlapping patterns may hit the same declaration
                if symbols[before..]
                    .iter()
                    .any(|s: &Symbol| s.name == name)
                {
                    continue;
                }
                symbols.push(Symbol {
                    kind: *kind,
                    name: name.to_string(),
                    line: idx + 1,
                });
            }
        }
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(symbols: &[Symbol], kind: SymbolKind) -> Vec<(String, usize)> {
        symbols
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (s.name.clone(), s.line))
            .collect()
    }

    #[test]
    fn python_functions_and_classes() {
        let src = "import os\n\nclass Greeter(object):\n    def hello(self):\n        pass\n\nasync def main():\n    pass\n";
        let s = RegexSummarizer::python().summarize("app.py", src).unwrap();
        assert_eq!(names(&s, SymbolKind::Class), vec![("Greeter".into(), 3)]);
        assert_eq!(
            names(&s, SymbolKind::Function),
            vec![("hello".into(), 4), ("main".into(), 7)]
        );
    }

    #[test]
    fn javascript_variants() {
        let src = "export class Widget {}\nfunction render() {}\nconst handler = async (e) => {}\nconst legacy = function () {}\n";
        let s = RegexSummarizer::javascript().summarize("w.js", src).unwrap();
        assert_eq!(names(&s, SymbolKind::Class), vec![("Widget".into(), 1)]);
        assert_eq!(
            names(&s, SymbolKind::Function),
            vec![
                ("render".into(), 2),
                ("handler".into(), 3),
                ("legacy".into(), 4)
            ]
        );
    }

    #[test]
    fn go_receivers_and_types() {
        let src = "type Server struct {\n}\nfunc (s *Server) Start() error {\n}\nfunc main() {\n}\n";
        let s = RegexSummarizer::go().summarize("main.go", src).unwrap();
        assert_eq!(names(&s, SymbolKind::Type), vec![("Server".into(), 1)]);
        assert_eq!(
            names(&s, SymbolKind::Function),
            vec![("Start".into(), 3), ("main".into(), 5)]
        );
    }

    #[test]
    fn rust_items() {
        let src = "pub struct Job;\npub(crate) enum State { A }\nasync fn run() {}\npub fn stop() {}\n";
        let s = RegexSummarizer::rust().summarize("lib.rs", src).unwrap();
        assert_eq!(
            names(&s, SymbolKind::Type),
            vec![("Job".into(), 1), ("State".into(), 2)]
        );
        assert_eq!(
            names(&s, SymbolKind::Function),
            vec![("run".into(), 3), ("stop".into(), 4)]
        );
    }

    #[test]
    fn ruby_and_php() {
        let rb = RegexSummarizer::ruby()
            .summarize("a.rb", "class Foo::Bar\n  def self.build\n  end\nend\n")
            .unwrap();
        assert_eq!(names(&rb, SymbolKind::Class), vec![("Foo::Bar".into(), 1)]);
        assert_eq!(names(&rb, SymbolKind::Function), vec![("self.build".into(), 2)]);

        let php = RegexSummarizer::php()
            .summarize("a.php", "<?php\ninterface Repo {}\nFUNCTION &load($x) {}\n")
            .unwrap();
        assert_eq!(names(&php, SymbolKind::Class), vec![("Repo".into(), 2)]);
        assert_eq!(names(&php, SymbolKind::Function), vec![("load".into(), 3)]);
    }

    #[test]
    fn unknown_language_is_noop() {
        let registry = SummarizerRegistry::with_defaults();
        assert_eq!(registry.resolve("Main.java").language(), "unknown");
        let summary = registry.summarize("Main.java", "class Main {}");
        assert!(summary.symbols.is_empty());
        assert!(summary.warning.is_none());
    }

    #[test]
    fn extension_lookup_case_insensitive() {
        let registry = SummarizerRegistry::with_defaults();
        assert_eq!(registry.resolve("src/App.TSX").language(), "javascript");
        assert_eq!(registry.resolve("Makefile").language(), "unknown");
        assert_eq!(registry.resolve(".bashrc").language(), "unknown");
    }

    struct Failing;
    impl Summarizer for Failing {
        fn language(&self) -> &str {
            "failing"
        }
        fn summarize(&self, _: &str, _: &str) -> Result<Vec<Symbol>, SummarizeError> {
            Err(SummarizeError("unbalanced braces".into()))
        }
    }

    struct Panicking;
    impl Summarizer for Panicking {
        fn language(&self) -> &str {
            "panicking"
        }
        fn summarize(&self, _: &str, _: &str) -> Result<Vec<Symbol>, SummarizeError> {
            panic!("parser exploded")
        }
    }

    #[test]
    fn failures_become_warnings() {
        let mut registry = SummarizerRegistry::empty();
        registry.register(&[".bad"], Arc::new(Failing));
        registry.register(&[".boom"], Arc::new(Panicking));

        let failed = registry.summarize("x.bad", "");
        assert!(failed.symbols.is_empty());
        assert!(failed.warning.unwrap().contains("unbalanced braces"));

        let crashed = registry.summarize("x.boom", "");
        assert!(crashed.symbols.is_empty());
        assert!(crashed.warning.unwrap().contains("parser exploded"));
    }
}
