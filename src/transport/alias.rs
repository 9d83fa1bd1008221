// ============================================================================
// File: src/transport/alias.rs
// ----------------------------------------------------------------------------
// OpenSSH client config subset: Host, HostName, Port, User, IdentityFile.
// ============================================================================

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{CloneError, CloneResult};
use crate::security::expand_home;

/// One `Host` block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasEntry {
    pub patterns: Vec<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl AliasEntry {
    /// A `!pattern` match vetoes the whole block
    fn matches(&self, host: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if wildcard_match(negated, host) {
                    return false;
                }
            } else if wildcard_match(pattern, host) {
                matched = true;
            }
        }
        matched
    }
}

/// Settings merged from every block that matches a host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasMatch {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
}

/// Parsed alias file
#[derive(Debug, Clone, Default)]
pub struct AliasFile {
    entries: Vec<AliasEntry>,
}

impl AliasFile {
    /// Load from disk; a missing file yields an empty set
    pub fn load(path: &Path) -> CloneResult<Self> {
        let path = expand_home(path);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No alias file at {}", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(CloneError::Configuration {
                message: format!("Failed to read alias file {}: {e}", path.display()),
            }),
        }
    }

    /// Parse config text; unknown keywords and malformed lines are skipped
    pub fn parse(contents: &str) -> Self {
        let mut entries = Vec::new();
        let mut current: Option<AliasEntry> = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (keyword, value) = match split_keyword(line) {
                Some(pair) => pair,
                None => continue,
            };

            if keyword.eq_ignore_ascii_case("host") {
                if let Some(entry) = current.take() {
                    entries.push(entry);
                }
                current = Some(AliasEntry {
                    patterns: value.split_whitespace().map(str::to_string).collect(),
                    ..AliasEntry::default()
                });
                continue;
            }

            // Settings before the first Host line apply to every host
            let entry = current.get_or_insert_with(|| AliasEntry {
                patterns: vec!["*".to_string()],
                ..AliasEntry::default()
            });

            match keyword.to_ascii_lowercase().as_str() {
                "hostname" => entry.hostname = Some(value.to_string()),
                "port" => match value.parse() {
                    Ok(port) => entry.port = Some(port),
                    Err(_) => debug!("Skipping invalid Port value={value:?}"),
                },
                "user" => entry.user = Some(value.to_string()),
                "identityfile" => entry.identity_file = Some(expand_home(Path::new(value))),
                _ => {}
            }
        }

        if let Some(entry) = current {
            entries.push(entry);
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[AliasEntry] {
        &self.entries
    }

    /// Resolve `host`; for each setting the first matching block wins
    pub fn lookup(&self, host: &str) -> AliasMatch {
        let mut found = AliasMatch::default();
        for entry in self.entries.iter().filter(|e| e.matches(host)) {
            if found.hostname.is_none() {
                found.hostname = entry.hostname.clone();
            }
            if found.port.is_none() {
                found.port = entry.port;
            }
            if found.user.is_none() {
                found.user = entry.user.clone();
            }
            if found.identity_file.is_none() {
                found.identity_file = entry.identity_file.clone();
            }
        }
        found
    }
}

/// `Keyword value`, `Keyword=value`, optional quotes around the value
fn split_keyword(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let keyword = &line[..idx];
    let value = line[idx..]
        .trim_start_matches(|c: char| c.is_whitespace() || c == '=')
        .trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    if keyword.is_empty() || value.is_empty() {
        return None;
    }
    Some((keyword, value))
}

/// Glob match supporting `*` and `?`
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# lab hypervisors
Host web1
    HostName 10.0.0.5
    Port 2222
    User deploy

Host hv-* !hv-legacy
    User ops
    IdentityFile /keys/ops_ed25519

Host *
    User fallback
    Port 22
"#;

    #[test]
    fn remaps_alias_to_real_endpoint() {
        let file = AliasFile::parse(SAMPLE);
        let found = file.lookup("web1");
        assert_eq!(found.hostname.as_deref(), Some("10.0.0.5"));
        assert_eq!(found.port, Some(2222));
        assert_eq!(found.user.as_deref(), Some("deploy"));
    }

    #[test]
    fn first_matching_block_wins_per_setting() {
        let file = AliasFile::parse(SAMPLE);
        let found = file.lookup("hv-03");
        assert_eq!(found.hostname, None);
        assert_eq!(found.user.as_deref(), Some("ops"));
        assert_eq!(found.port, Some(22));
        assert_eq!(found.identity_file, Some(PathBuf::from("/keys/ops_ed25519")));
    }

    #[test]
    fn negated_pattern_excludes_host() {
        let file = AliasFile::parse(SAMPLE);
        assert_eq!(file.lookup("hv-legacy").user.as_deref(), Some("fallback"));
    }

    #[test]
    fn equals_syntax_and_quotes() {
        let file = AliasFile::parse("Host=db\nHostName=\"db.internal\"\nport=2200\n");
        let found = file.lookup("db");
        assert_eq!(found.hostname.as_deref(), Some("db.internal"));
        assert_eq!(found.port, Some(2200));
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("hv-??", "hv-01"));
        assert!(!wildcard_match("hv-??", "hv-001"));
        assert!(wildcard_match("*.example.com", "a.b.example.com"));
        assert!(!wildcard_match("web", "web1"));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = AliasFile::load(&dir.path().join("config")).unwrap();
        assert!(file.entries().is_empty());
        assert_eq!(file.lookup("web1"), AliasMatch::default());
    }
}
