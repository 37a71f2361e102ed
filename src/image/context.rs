//! Build-context packaging.
//!
//! The context directory is passed explicitly and walked in place; the process
//! working directory is never changed.

use glob::{MatchOptions, Pattern};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const DOCKERIGNORE: &str = ".dockerignore";

/// Inputs of one image build. Consumed by a single build call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub path: PathBuf,
    pub dockerfile: String,
    pub no_cache: bool,
}

impl BuildContext {
    pub fn new(path: impl Into<PathBuf>, dockerfile: impl Into<String>, no_cache: bool) -> Self {
        Self {
            path: path.into(),
            dockerfile: dockerfile.into(),
            no_cache,
        }
    }

    pub fn dockerfile_path(&self) -> PathBuf {
        self.path.join(&self.dockerfile)
    }
}

/// One `.dockerignore` rule. Later rules override earlier ones.
#[derive(Debug)]
struct IgnoreRule {
    pattern: Pattern,
    negated: bool,
}

#[derive(Debug, Default)]
pub struct IgnoreRules {
    rules: Vec<IgnoreRule>,
}

impl IgnoreRules {
    pub fn load(context: &Path) -> io::Result<Self> {
        match std::fs::read_to_string(context.join(DOCKERIGNORE)) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn parse(content: &str) -> Self {
        let rules = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let (negated, raw) = match line.strip_prefix('!') {
                    Some(rest) => (true, rest.trim()),
                    None => (false, line),
                };
                let raw = raw.trim_start_matches("./").trim_start_matches('/');
                let raw = raw.trim_end_matches('/');
                match Pattern::new(raw) {
                    Ok(pattern) => Some(IgnoreRule { pattern, negated }),
                    Err(e) => {
                        warn!(pattern = raw, error = %e, "ignoring invalid .dockerignore pattern");
                        None
                    }
                }
            })
            .collect();
        Self { rules }
    }

    /// Whether `rel` (slash-separated, relative to the context root) is excluded.
    /// A rule matching a parent directory applies to everything below it.
    pub fn is_excluded(&self, rel: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let mut excluded = false;
        for rule in &self.rules {
            let hit = ancestors(rel).any(|candidate| rule.pattern.matches_with(candidate, options));
            if hit {
                excluded = !rule.negated;
            }
        }
        excluded
    }
}

/// `a/b/c` yields `a`, `a/b`, `a/b/c`.
fn ancestors(rel: &str) -> impl Iterator<Item = &str> {
    rel.match_indices('/')
        .map(move |(i, _)| &rel[..i])
        .chain(std::iter::once(rel))
}

/// Tar the build context, honouring `.dockerignore`. The Dockerfile and the
/// ignore file itself are always sent.
pub fn package(context: &BuildContext) -> io::Result<Vec<u8>> {
    let root = &context.path;
    let rules = IgnoreRules::load(root)?;
    let always = [context.dockerfile.as_str(), DOCKERIGNORE];

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let mut files = 0usize;
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if !always.contains(&rel_str.as_str()) && rules.is_excluded(&rel_str) {
            continue;
        }

        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), rel)?;
            files += 1;
        }
    }

    let payload = builder.into_inner()?;
    debug!(files, bytes = payload.len(), context = %root.display(), "packaged build context");
    Ok(payload)
}
