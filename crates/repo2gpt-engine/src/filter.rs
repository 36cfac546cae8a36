//! File inclusion rules.
//!
//! [`FilterEngine::decide`] is a pure function of the compiled configuration
//! and a relative path, evaluated in a fixed order:
//!
//! 1. size above `max_file_bytes` (when non-zero) excludes
//! 2. `include_all` includes everything else; otherwise an ignore match excludes
//! 3. a code extension, an include pattern, or a special filename includes
//! 4. anything left is included only with `allow_non_code`
//!
//! Ignore always beats include. Patterns use ignore-file conventions: `**`
//! crosses directories, a trailing `/` matches directories only, a leading
//! `!` negates an earlier rule (last match wins), a leading `/` anchors to
//! the tree root, and `#` starts a comment.

use std::collections::BTreeSet;
use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use repo2gpt_core::job::FilterOptions;
use tracing::debug;

pub const DEFAULT_MAX_FILE_BYTES: u64 = 500_000;

pub const DEFAULT_CODE_EXTENSIONS: &[&str] = &[
    ".py", ".pyi", ".pyw", ".js", ".jsx", ".ts", ".tsx", ".mjs", ".cjs", ".java", ".kt", ".kts",
    ".go", ".rb", ".rs", ".c", ".h", ".cpp", ".cc", ".cxx", ".hpp", ".hh", ".hxx", ".cs", ".swift",
    ".m", ".mm", ".php", ".scala", ".clj", ".cljs", ".hs", ".lua", ".r", ".jl", ".dart", ".sql",
    ".sh", ".bash", ".zsh", ".ps1", ".psm1", ".psd1", ".bat", ".cmd", ".fs", ".fsx", ".f90",
    ".f95", ".erl", ".ex", ".exs", ".vb", ".groovy", ".gradle", ".cmake", ".svelte", ".vue",
];

pub const DEFAULT_SPECIAL_FILENAMES: &[&str] = &[
    "Dockerfile",
    "Makefile",
    "CMakeLists.txt",
    "BUILD",
    "WORKSPACE",
    "Gemfile",
    "Rakefile",
    "Procfile",
];

/// Directory names skipped at any depth.
pub const DEFAULT_DIRNAME_DENYLIST: &[&str] =
    &["node_modules", "vendor", "deps", "third_party", "__pycache__"];

pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git/", ".hg/", ".svn/", ".idea/", ".vscode/", ".vs/", ".venv/", "venv/", ".mypy_cache/",
    ".pytest_cache/", "__pycache__/", "node_modules/", "bower_components/", "dist/", "build/",
    "coverage/", "logs/", "tmp/", "temp/", "deps/", "vendor/", "third_party/", ".gradle/",
    ".terraform/", ".next/", ".nuxt/", ".svelte-kit/", ".cache/", ".parcel-cache/",
    ".ruff_cache/", "public/build/", "public/dist/", "*.log", "*.tmp", "*.bak", "*.lock",
    "*.sqlite", "*.db", "*.sqlite3", "*.min.js", "*.min.css", "*.map", "*.png", "*.jpg", "*.jpeg",
    "*.gif", "*.svg", "*.ico", "*.bmp", "*.mp3", "*.mp4", "*.mov", "*.avi", "*.wav", "*.flac",
    "*.zip", "*.gz", "*.bz2", "*.xz", "*.7z", "*.tar", "*.tgz", "*.rar", "*.pdf",
];

/// Ignore files read from the tree root, in evaluation order.
const REPO_IGNORE_FILES: &[&str] = &[".gitignore", ".git/info/exclude", ".gptignore"];
const REPO_INCLUDE_FILE: &str = ".gptinclude";

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid filter pattern {pattern:?}: {detail}")]
    InvalidPattern { pattern: String, detail: String },
}

/// Why a file was included or excluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    Size,
    Ignored,
    NonCode,
    Binary,
    IncludeAll,
    Code,
    IncludePattern,
    SpecialFile,
    AllowNonCode,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Ignored => "ignored",
            Self::NonCode => "non_code",
            Self::Binary => "binary",
            Self::IncludeAll => "include_all",
            Self::Code => "code",
            Self::IncludePattern => "include_pattern",
            Self::SpecialFile => "special_file",
            Self::AllowNonCode => "allow_non_code",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub include: bool,
    pub reason: Reason,
}

impl Decision {
    fn include(reason: Reason) -> Self {
        Self {
            include: true,
            reason,
        }
    }

    fn exclude(reason: Reason) -> Self {
        Self {
            include: false,
            reason,
        }
    }
}

/// Resolved per-job filter settings (defaults merged with job overrides).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterConfig {
    pub ignore_patterns: Vec<String>,
    pub include_patterns: Vec<String>,
    pub allowed_extensions: BTreeSet<String>,
    pub special_filenames: BTreeSet<String>,
    /// 0 disables the size check.
    pub max_file_bytes: u64,
    pub allow_non_code: bool,
    pub include_all: bool,
    pub respect_repo_ignore_files: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            include_patterns: Vec::new(),
            allowed_extensions: DEFAULT_CODE_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            special_filenames: DEFAULT_SPECIAL_FILENAMES
                .iter()
                .map(|f| f.to_string())
                .collect(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            allow_non_code: false,
            include_all: false,
            respect_repo_ignore_files: true,
        }
    }
}

impl FilterConfig {
    /// Merge job overrides over the defaults. Extension and filename lists extend the defaults.
    pub fn from_options(options: &FilterOptions, default_max_file_bytes: u64) -> Self {
        let mut config = Self::default();
        config.ignore_patterns = options.ignore_patterns.clone();
        config.include_patterns = options.include_patterns.clone();
        config
            .allowed_extensions
            .extend(options.allowed_extensions.iter().filter_map(|e| normalize_extension(e)));
        config.special_filenames.extend(
            options
                .special_filenames
                .iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty()),
        );
        config.max_file_bytes = options.max_file_bytes.unwrap_or(default_max_file_bytes);
        config.allow_non_code = options.allow_non_code;
        config.include_all = options.include_all;
        config.respect_repo_ignore_files = options.respect_repo_ignore_files;
        config
    }
}

/// `"PY"` → `".py"`, `".Rs"` → `".rs"`.
fn normalize_extension(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('.').to_lowercase();
    (!trimmed.is_empty()).then(|| format!(".{trimmed}"))
}

/// One compiled ignore/include line.
#[derive(Debug)]
struct Rule {
    negated: bool,
    files: GlobSet,
    dirs: GlobSet,
}

impl Rule {
    /// Returns `Ok(None)` for blank lines and comments.
    fn parse(raw: &str) -> Result<Option<Self>, FilterError> {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let (negated, body) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let anchored = body.starts_with('/');
        let body = body.trim_start_matches('/');
        let dir_only = body.ends_with('/');
        let base = body.trim_end_matches('/');
        if base.is_empty() {
            return Ok(None);
        }

        let mut prefixes = vec![""];
        if !anchored && !base.starts_with("**/") {
            prefixes.push("**/");
        }

        let mut files = GlobSetBuilder::new();
        let mut dirs = GlobSetBuilder::new();
        for prefix in prefixes {
            if !dir_only {
                files.add(glob(line, &format!("{prefix}{base}"))?);
            }
            files.add(glob(line, &format!("{prefix}{base}/**"))?);
            dirs.add(glob(line, &format!("{prefix}{base}"))?);
        }

        Ok(Some(Self {
            negated,
            files: files.build().map_err(|e| invalid(line, e))?,
            dirs: dirs.build().map_err(|e| invalid(line, e))?,
        }))
    }

    fn matches(&self, path: &str, is_dir: bool) -> bool {
        if is_dir {
            self.dirs.is_match(path)
        } else {
            self.files.is_match(path)
        }
    }
}

fn glob(original: &str, pattern: &str) -> Result<globset::Glob, FilterError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| invalid(original, e))
}

fn invalid(pattern: &str, e: globset::Error) -> FilterError {
    FilterError::InvalidPattern {
        pattern: pattern.to_string(),
        detail: e.kind().to_string(),
    }
}

fn compile_all<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<Vec<Rule>, FilterError> {
    let mut rules = Vec::new();
    for p in patterns {
        if let Some(rule) = Rule::parse(p)? {
            rules.push(rule);
        }
    }
    Ok(rules)
}

/// Last matching rule wins; `None` when nothing matched.
fn verdict<'a>(rules: impl Iterator<Item = &'a Rule>, path: &str, is_dir: bool) -> Option<bool> {
    rules.fold(None, |acc, rule| {
        if rule.matches(path, is_dir) {
            Some(!rule.negated)
        } else {
            acc
        }
    })
}

/// Compiled filter for one job.
#[derive(Debug)]
pub struct FilterEngine {
    config: FilterConfig,
    default_ignores: Vec<Rule>,
    repo_ignores: Vec<Rule>,
    job_ignores: Vec<Rule>,
    repo_includes: Vec<Rule>,
    job_includes: Vec<Rule>,
}

impl FilterEngine {
    /// Compile the job's patterns. Fails on the first malformed pattern.
    pub fn new(config: FilterConfig) -> Result<Self, FilterError> {
        Ok(Self {
            default_ignores: compile_all(DEFAULT_IGNORE_PATTERNS.iter().copied())?,
            repo_ignores: Vec::new(),
            job_ignores: compile_all(config.ignore_patterns.iter().map(String::as_str))?,
            repo_includes: Vec::new(),
            job_includes: compile_all(config.include_patterns.iter().map(String::as_str))?,
            config,
        })
    }

    /// Add rules from the tree's own ignore/include files.
    ///
    /// Repository rules are evaluated after the defaults and before the
    /// job's own patterns. Malformed lines are skipped and reported.
    pub fn load_repo_rules(&mut self, root: &Path) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.config.respect_repo_ignore_files {
            return warnings;
        }
        for name in REPO_IGNORE_FILES {
            let rules = read_rule_file(&root.join(name), name, &mut warnings);
            self.repo_ignores.extend(rules);
        }
        let rules = read_rule_file(&root.join(REPO_INCLUDE_FILE), REPO_INCLUDE_FILE, &mut warnings);
        self.repo_includes.extend(rules);
        warnings
    }

    pub fn decide(&self, relative_path: &str, byte_size: u64) -> Decision {
        let max = self.config.max_file_bytes;
        if max > 0 && byte_size > max {
            return Decision::exclude(Reason::Size);
        }
        if self.config.include_all {
            return Decision::include(Reason::IncludeAll);
        }
        if self.is_ignored(relative_path, false) {
            return Decision::exclude(Reason::Ignored);
        }

        let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        if self.is_code_file(file_name) {
            return Decision::include(Reason::Code);
        }
        if self.matches_include(relative_path) {
            return Decision::include(Reason::IncludePattern);
        }
        if self.config.special_filenames.contains(file_name) {
            return Decision::include(Reason::SpecialFile);
        }
        if self.config.allow_non_code {
            return Decision::include(Reason::AllowNonCode);
        }
        Decision::exclude(Reason::NonCode)
    }

    /// Whether a directory can be skipped without visiting its contents.
    ///
    /// Only prunes when no negation rule could re-include something beneath it.
    pub fn should_prune_dir(&self, relative_dir: &str) -> bool {
        if self.config.include_all || relative_dir.is_empty() {
            return false;
        }
        if relative_dir
            .split('/')
            .any(|seg| DEFAULT_DIRNAME_DENYLIST.contains(&seg))
        {
            return true;
        }
        let has_negation = self
            .ignore_rules()
            .any(|r| r.negated);
        !has_negation && self.is_ignored(relative_dir, true)
    }

    /// Extension-based code check used by the summarize stage.
    pub fn is_code_file(&self, file_name: &str) -> bool {
        match file_name.rfind('.') {
            Some(idx) if idx > 0 => self
                .config
                .allowed_extensions
                .contains(&file_name[idx..].to_lowercase()),
            _ => false,
        }
    }

    fn ignore_rules(&self) -> impl Iterator<Item = &Rule> {
        self.default_ignores
            .iter()
            .chain(&self.repo_ignores)
            .chain(&self.job_ignores)
    }

    fn is_ignored(&self, path: &str, is_dir: bool) -> bool {
        let mut segments: Vec<&str> = path.split('/').collect();
        if !is_dir {
            segments.pop();
        }
        if segments.iter().any(|s| DEFAULT_DIRNAME_DENYLIST.contains(s)) {
            return true;
        }
        verdict(self.ignore_rules(), path, is_dir) == Some(true)
    }

    fn matches_include(&self, path: &str) -> bool {
        let rules = self.repo_includes.iter().chain(&self.job_includes);
        verdict(rules, path, false) == Some(true)
    }
}

fn read_rule_file(path: &Path, label: &str, warnings: &mut Vec<String>) -> Vec<Rule> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    debug!(file = label, "loading repository filter rules");
    let mut rules = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        match Rule::parse(line) {
            Ok(Some(rule)) => rules.push(rule),
            Ok(None) => {}
            Err(e) => warnings.push(format!("{label} line {}: {e}", idx + 1)),
        }
    }
    rules
}
