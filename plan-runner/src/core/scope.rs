//! File-scope patterns: containment and overlap.
//!
//! A scope entry is either a plain repository-relative path, which covers
//! itself and everything beneath it, or a glob (`*`, `?`, `[..]`, `**`).
//! Overlap is conservative: two entries may be reported as overlapping when no
//! concrete path is matched by both, never the reverse. Conflicting units are
//! only serialized, so a false positive costs parallelism, not correctness.

use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One parsed entry of a unit's file scope.
#[derive(Debug, Clone)]
pub struct ScopePattern {
    raw: String,
    normalized: String,
    /// Leading path components that contain no wildcard.
    literal_prefix: String,
    glob: Option<Pattern>,
}

impl ScopePattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let normalized = normalize(raw);
        if raw.trim().starts_with('/') {
            return Err(format!("'{raw}' must be relative to the repository root"));
        }
        if normalized.split('/').any(|c| c == "..") {
            return Err(format!("'{raw}' must not contain '..'"));
        }
        if !has_wildcard(&normalized) {
            return Ok(Self {
                raw: raw.to_string(),
                literal_prefix: normalized.clone(),
                normalized,
                glob: None,
            });
        }
        let glob = Pattern::new(&normalized).map_err(|err| format!("'{raw}': {err}"))?;
        let literal_prefix = normalized
            .split('/')
            .take_while(|component| !has_wildcard(component))
            .collect::<Vec<_>>()
            .join("/");
        Ok(Self {
            raw: raw.to_string(),
            normalized,
            literal_prefix,
            glob: Some(glob),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_literal(&self) -> bool {
        self.glob.is_none()
    }

    /// True if `path` (repository-relative) falls inside this entry.
    pub fn contains(&self, path: &str) -> bool {
        let path = normalize(path);
        match &self.glob {
            None => is_ancestor_or_self(&self.normalized, &path),
            // A glob that matches a directory covers everything beneath it.
            Some(glob) => ancestors_and_self(&path).any(|p| glob.matches_with(p, MATCH_OPTIONS)),
        }
    }

    /// True if some path could be covered by both entries.
    pub fn overlaps(&self, other: &ScopePattern) -> bool {
        match (&self.glob, &other.glob) {
            (None, None) => {
                is_ancestor_or_self(&self.normalized, &other.normalized)
                    || is_ancestor_or_self(&other.normalized, &self.normalized)
            }
            (None, Some(_)) => literal_overlaps_glob(self, other),
            (Some(_), None) => literal_overlaps_glob(other, self),
            (Some(_), Some(_)) => {
                is_ancestor_or_self(&self.literal_prefix, &other.literal_prefix)
                    || is_ancestor_or_self(&other.literal_prefix, &self.literal_prefix)
            }
        }
    }
}

fn literal_overlaps_glob(literal: &ScopePattern, glob: &ScopePattern) -> bool {
    if is_ancestor_or_self(&literal.normalized, &glob.literal_prefix) {
        return true;
    }
    if !is_ancestor_or_self(&glob.literal_prefix, &literal.normalized) {
        return false;
    }
    if glob.contains(&literal.normalized) {
        return true;
    }
    // A literal that names a directory may hold files the glob matches.
    !looks_like_file(&literal.normalized)
}

/// Parse every entry of a scope, collecting syntax errors.
pub fn parse_scope(scope: &[String]) -> Result<Vec<ScopePattern>, Vec<String>> {
    let mut patterns = Vec::with_capacity(scope.len());
    let mut errors = Vec::new();
    for raw in scope {
        match ScopePattern::parse(raw) {
            Ok(pattern) => patterns.push(pattern),
            Err(err) => errors.push(err),
        }
    }
    if errors.is_empty() {
        Ok(patterns)
    } else {
        Err(errors)
    }
}

/// True if any entry of `a` overlaps any entry of `b`.
///
/// Entries that fail to parse are treated as covering the whole repository.
pub fn scopes_overlap(a: &[String], b: &[String]) -> bool {
    a.iter().any(|left| {
        b.iter().any(|right| {
            match (ScopePattern::parse(left), ScopePattern::parse(right)) {
                (Ok(l), Ok(r)) => l.overlaps(&r),
                _ => true,
            }
        })
    })
}

/// True if `path` is covered by at least one entry of `scope`.
pub fn in_scope(scope: &[String], path: &str) -> bool {
    scope
        .iter()
        .filter_map(|raw| ScopePattern::parse(raw).ok())
        .any(|pattern| pattern.contains(path))
}

/// Paths from `paths` that fall outside `scope`, sorted and deduplicated.
pub fn out_of_scope(scope: &[String], paths: &[String]) -> Vec<String> {
    let mut outside: Vec<String> = paths
        .iter()
        .map(|p| normalize(p))
        .filter(|p| !in_scope(scope, p))
        .collect();
    outside.sort();
    outside.dedup();
    outside
}

fn normalize(raw: &str) -> String {
    let mut path = raw.trim().replace('\\', "/");
    while let Some(rest) = path.strip_prefix("./") {
        path = rest.to_string();
    }
    let trimmed = path.trim_matches('/');
    trimmed
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Component-wise prefix test. The empty path is the repository root.
fn is_ancestor_or_self(ancestor: &str, path: &str) -> bool {
    ancestor.is_empty()
        || ancestor == path
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

fn ancestors_and_self(path: &str) -> impl Iterator<Item = &str> {
    let cuts = path
        .match_indices('/')
        .map(|(i, _)| i)
        .chain(std::iter::once(path.len()));
    cuts.map(move |end| &path[..end])
}

fn looks_like_file(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .is_some_and(|name| name.contains('.') && !name.starts_with('.'))
}
