//! # File Selection Engine
//!
//! Resolves which paths actually get passed to the snapshot engine for a
//! given backup target: explicit include/exclude paths, glob patterns, and
//! named pattern groups, combined with the precedence rules in
//! [`FileSelection::should_include`].
//!
//! Patterns are compiled to anchored, case-insensitive regexes and cached;
//! the cache is invalidated lazily via a dirty flag rather than eagerly on
//! every mutation, mirroring the mutate-many-then-compile-once usage
//! pattern of building up a selection from config.

use crate::error::{Result, ValidationError};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A named bundle of common exclude patterns a user can opt into instead of
/// spelling out every glob by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PatternGroup {
    OfficeDocuments,
    TemporaryFiles,
    MediaFiles,
    SourceCode,
}

impl PatternGroup {
    /// All recognized group names, for error messages and CLI help.
    pub const ALL: [PatternGroup; 4] = [
        PatternGroup::OfficeDocuments,
        PatternGroup::TemporaryFiles,
        PatternGroup::MediaFiles,
        PatternGroup::SourceCode,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PatternGroup::OfficeDocuments => "office_documents",
            PatternGroup::TemporaryFiles => "temporary_files",
            PatternGroup::MediaFiles => "media_files",
            PatternGroup::SourceCode => "source_code",
        }
    }

    pub fn patterns(self) -> &'static [&'static str] {
        match self {
            PatternGroup::OfficeDocuments => &[
                "*.doc", "*.docx", "*.xls", "*.xlsx", "*.ppt", "*.pptx", "*.odt", "*.ods",
                "*.odp", "*.pdf",
            ],
            PatternGroup::TemporaryFiles => &[
                "*.tmp", "*.temp", "~*", "*.bak", "*.swp", "*.cache", "__pycache__/*", "*.pyc",
                "node_modules/*",
            ],
            PatternGroup::MediaFiles => &[
                "*.jpg", "*.jpeg", "*.png", "*.gif", "*.mp3", "*.mp4", "*.avi", "*.mov", "*.wav",
            ],
            PatternGroup::SourceCode => &[
                "*.py", "*.java", "*.cpp", "*.h", "*.js", "*.ts", "*.html", "*.css", "*.sql",
            ],
        }
    }

    pub fn from_name(name: &str) -> Option<PatternGroup> {
        Self::ALL.into_iter().find(|g| g.name() == name)
    }
}

/// Translates a shell glob (`*`, `?`, `[seq]`) into an anchored,
/// case-insensitive regex, matching the semantics of Python's
/// `fnmatch.translate` closely enough for our purposes: `*` and `?` do not
/// cross path separators conceptually, but since matching is done against
/// path components and full relative paths alike, we keep `*` greedy across
/// any character as the upstream behavior does.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("(?i)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '\\' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                while let Some(&next) = chars.peek() {
                    if next == ']' {
                        break;
                    }
                    out.push(next);
                    chars.next();
                }
                if chars.next() == Some(']') {
                    out.push(']');
                } else {
                    return Err(ValidationError::MalformedPattern(pattern.to_string()).into());
                }
            }
            other => out.push(other),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|_| ValidationError::MalformedPattern(pattern.to_string()).into())
}

/// Whether a file selection entry looks directory-shaped: it exists and is
/// a directory, or it has no file extension, or it ends with a separator.
fn is_directory_path(path: &Path) -> bool {
    if path.is_dir() {
        return true;
    }
    let as_str = path.to_string_lossy();
    if as_str.ends_with('/') || as_str.ends_with(std::path::MAIN_SEPARATOR) {
        return true;
    }
    path.extension().is_none()
}

/// Progress callback invoked periodically while walking a selection, with
/// the running file count.
pub type ProgressCallback<'a> = dyn FnMut(u64) + 'a;

/// Aggregate statistics from [`FileSelection::estimate_size`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionEstimate {
    pub total_size: u64,
    pub file_count: u64,
    pub directory_count: u64,
}

/// Whether a pattern, pattern group, or path belongs to the include set or
/// the exclude set of a [`FileSelection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionType {
    Include,
    Exclude,
}

/// Describes what to include and exclude from a backup target.
#[derive(Debug, Clone, Default)]
pub struct FileSelection {
    includes: BTreeSet<PathBuf>,
    excludes: BTreeSet<PathBuf>,
    include_patterns: BTreeSet<String>,
    exclude_patterns: BTreeSet<String>,
    include_groups: BTreeSet<PatternGroup>,
    exclude_groups: BTreeSet<PatternGroup>,
    compiled_include: Vec<Regex>,
    compiled_exclude: Vec<Regex>,
    dirty: bool,
}

impl FileSelection {
    pub fn new() -> Self {
        Self {
            dirty: true,
            ..Default::default()
        }
    }

    pub fn add_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.includes.insert(path.into());
        self
    }

    pub fn remove_path(&mut self, path: &Path) -> &mut Self {
        self.includes.remove(path);
        self
    }

    pub fn exclude_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.excludes.insert(path.into());
        self
    }

    pub fn add_pattern(&mut self, pattern: impl Into<String>, selection_type: SelectionType) -> &mut Self {
        match selection_type {
            SelectionType::Include => self.include_patterns.insert(pattern.into()),
            SelectionType::Exclude => self.exclude_patterns.insert(pattern.into()),
        };
        self.dirty = true;
        self
    }

    pub fn remove_pattern(&mut self, pattern: &str, selection_type: SelectionType) -> &mut Self {
        match selection_type {
            SelectionType::Include => self.include_patterns.remove(pattern),
            SelectionType::Exclude => self.exclude_patterns.remove(pattern),
        };
        self.dirty = true;
        self
    }

    pub fn add_pattern_group(&mut self, group: PatternGroup, selection_type: SelectionType) -> &mut Self {
        match selection_type {
            SelectionType::Include => self.include_groups.insert(group),
            SelectionType::Exclude => self.exclude_groups.insert(group),
        };
        self.dirty = true;
        self
    }

    pub fn remove_pattern_group(&mut self, group: PatternGroup, selection_type: SelectionType) -> &mut Self {
        match selection_type {
            SelectionType::Include => self.include_groups.remove(&group),
            SelectionType::Exclude => self.exclude_groups.remove(&group),
        };
        self.dirty = true;
        self
    }

    /// Checks that the selection has at least one directory-shaped include
    /// and that every referenced pattern group is known.
    pub fn validate(&self) -> Result<()> {
        if self.includes.is_empty() {
            return Err(ValidationError::EmptyIncludeSet.into());
        }
        if !self.includes.iter().any(|p| is_directory_path(p)) {
            return Err(ValidationError::EmptyIncludeSet.into());
        }
        Ok(())
    }

    fn all_include_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.include_patterns.iter().cloned().collect();
        for group in &self.include_groups {
            patterns.extend(group.patterns().iter().map(|s| s.to_string()));
        }
        patterns
    }

    fn all_exclude_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.exclude_patterns.iter().cloned().collect();
        for group in &self.exclude_groups {
            patterns.extend(group.patterns().iter().map(|s| s.to_string()));
        }
        patterns
    }

    fn compile_patterns(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.compiled_include = self
            .all_include_patterns()
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>>>()?;
        self.compiled_exclude = self
            .all_exclude_patterns()
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>>>()?;
        self.dirty = false;
        Ok(())
    }

    fn matches_any(patterns: &[Regex], candidate: &str) -> bool {
        patterns.iter().any(|re| re.is_match(candidate))
    }

    /// Decides whether `path` should be part of the backup, in precedence
    /// order: exact exclude path, exclude-path prefix, exclude pattern,
    /// exact include path, include-path prefix, include pattern, default
    /// `false`.
    pub fn should_include(&mut self, path: &Path) -> Result<bool> {
        self.compile_patterns()?;
        let candidate = path.to_string_lossy();

        if self.excludes.contains(path) {
            return Ok(false);
        }
        if self
            .excludes
            .iter()
            .any(|excluded| path.strip_prefix(excluded).is_ok())
        {
            return Ok(false);
        }
        if Self::matches_any(&self.compiled_exclude, &candidate) {
            return Ok(false);
        }

        if self.includes.contains(path) {
            return Ok(true);
        }
        if self
            .includes
            .iter()
            .any(|included| path.strip_prefix(included).is_ok())
        {
            return Ok(true);
        }
        if Self::matches_any(&self.compiled_include, &candidate) {
            return Ok(true);
        }

        Ok(false)
    }

    /// All top-level include roots, in deterministic (sorted) order.
    pub fn backup_paths(&self) -> Vec<PathBuf> {
        self.includes.iter().cloned().collect()
    }

    /// All exclude patterns (including group-expanded ones) in deterministic
    /// order, suitable for direct use as `--exclude` arguments.
    pub fn exclude_args(&self) -> Vec<String> {
        let mut patterns = self.all_exclude_patterns();
        patterns.sort();
        patterns.dedup();
        patterns
    }

    /// Builds the engine argv fragment for this selection: positional
    /// include roots, `--exclude <pattern>` per pattern, `--exclude
    /// <path>` per excluded path. Order is deterministic (sorted), unlike
    /// the set-iteration order of the system this is modeled on.
    pub fn to_engine_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self
            .backup_paths()
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        for pattern in self.exclude_args() {
            args.push("--exclude".to_string());
            args.push(pattern);
        }

        let mut excluded_paths: Vec<String> = self
            .excludes
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        excluded_paths.sort();
        for path in excluded_paths {
            args.push("--exclude".to_string());
            args.push(path);
        }

        args
    }

    /// Walks every include root, applying [`Self::should_include`] and
    /// pruning excluded directories, invoking `progress` every 1000 files
    /// visited. Returns the matched paths in walk order.
    pub fn effective_paths(&mut self, mut progress: Option<&mut ProgressCallback>) -> Result<Vec<PathBuf>> {
        self.compile_patterns()?;
        let mut matched = Vec::new();
        let mut visited: u64 = 0;

        for root in self.backup_paths() {
            if !root.exists() {
                continue;
            }
            let walker = walkdir::WalkDir::new(&root).into_iter().filter_entry(|entry| {
                if !entry.file_type().is_dir() {
                    return true;
                }
                !self.excludes.contains(entry.path())
            });

            for entry in walker.filter_map(|e| e.ok()) {
                if entry.file_type().is_dir() {
                    continue;
                }
                visited += 1;
                if visited % 1000 == 0 {
                    if let Some(cb) = progress.as_deref_mut() {
                        cb(visited);
                    }
                }
                if self.should_include(entry.path())? {
                    matched.push(entry.path().to_path_buf());
                }
            }
        }

        Ok(matched)
    }

    /// Estimates total size, file count, and directory count across all
    /// include roots. Silently skips entries the OS refuses to stat.
    pub fn estimate_size(&mut self) -> Result<SelectionEstimate> {
        self.compile_patterns()?;
        let mut estimate = SelectionEstimate::default();

        for root in self.backup_paths() {
            if !root.exists() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&root)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if metadata.is_dir() {
                    estimate.directory_count += 1;
                    continue;
                }
                if !self.should_include(entry.path())? {
                    continue;
                }
                estimate.file_count += 1;
                estimate.total_size += metadata.len();
            }
        }

        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_selection_fails_validation() {
        let selection = FileSelection::new();
        assert!(selection.validate().is_err());
    }

    #[test]
    fn glob_matches_extension() {
        let re = glob_to_regex("*.tmp").unwrap();
        assert!(re.is_match("foo.tmp"));
        assert!(re.is_match("FOO.TMP"));
        assert!(!re.is_match("foo.tmp.bak"));
    }

    #[test]
    fn pattern_group_excludes_temp_files() {
        let mut selection = FileSelection::new();
        selection.add_path("/data");
        selection.add_pattern_group(PatternGroup::TemporaryFiles, SelectionType::Exclude);
        assert!(selection
            .should_include(Path::new("/data/cache.tmp"))
            .unwrap()
            == false);
    }

    #[test]
    fn explicit_exclude_path_wins_over_include() {
        let mut selection = FileSelection::new();
        selection.add_path("/data");
        selection.exclude_path("/data/secret");
        assert!(!selection.should_include(Path::new("/data/secret")).unwrap());
        assert!(selection
            .should_include(Path::new("/data/secret/inner.txt"))
            .unwrap()
            == false);
    }

    #[test]
    fn include_prefix_matches_subpaths() {
        let mut selection = FileSelection::new();
        selection.add_path("/data/docs");
        assert!(selection
            .should_include(Path::new("/data/docs/report.pdf"))
            .unwrap());
    }

    #[test]
    fn default_is_exclude() {
        let mut selection = FileSelection::new();
        selection.add_path("/data");
        assert!(!selection.should_include(Path::new("/other/file.txt")).unwrap());
    }

    #[test]
    fn include_pattern_matches_paths_outside_include_roots() {
        let mut selection = FileSelection::new();
        selection.add_path("/data");
        selection.add_pattern("*.txt", SelectionType::Include);
        assert!(selection.should_include(Path::new("/elsewhere/notes.txt")).unwrap());
    }

    #[test]
    fn include_and_exclude_patterns_are_independent() {
        let mut selection = FileSelection::new();
        selection.add_path("/data");
        selection.add_pattern("*.txt", SelectionType::Include);
        selection.add_pattern("*.tmp", SelectionType::Exclude);
        assert!(selection.should_include(Path::new("/anywhere/a.txt")).unwrap());
        assert!(!selection.should_include(Path::new("/anywhere/a.tmp")).unwrap());
    }

    #[test]
    fn engine_args_are_deterministic() {
        let mut a = FileSelection::new();
        a.add_path("/data");
        a.add_pattern("*.bak", SelectionType::Exclude);
        a.add_pattern("*.tmp", SelectionType::Exclude);

        let mut b = FileSelection::new();
        b.add_path("/data");
        b.add_pattern("*.tmp", SelectionType::Exclude);
        b.add_pattern("*.bak", SelectionType::Exclude);

        assert_eq!(a.to_engine_args(), b.to_engine_args());
    }

    #[test]
    fn unknown_pattern_group_name_rejected() {
        assert!(PatternGroup::from_name("not_a_group").is_none());
    }

    #[test]
    fn malformed_bracket_pattern_rejected() {
        assert!(glob_to_regex("foo[bar").is_err());
    }

    proptest::proptest! {
        /// `*.ext` must match any basename with that extension, regardless of
        /// case, for arbitrary basenames and extensions — not just the one
        /// example above.
        #[test]
        fn star_dot_ext_matches_any_basename(
            basename in "[a-zA-Z0-9_]{1,12}",
            ext in "[a-z]{1,5}",
        ) {
            let re = glob_to_regex(&format!("*.{ext}")).unwrap();
            proptest::prop_assert!(re.is_match(&format!("{basename}.{ext}")));
            proptest::prop_assert!(re.is_match(&format!("{}.{}", basename.to_uppercase(), ext.to_uppercase())));
            proptest::prop_assert!(!re.is_match(&format!("{basename}.{ext}x")));
        }
    }
}
