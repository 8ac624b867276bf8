use crate::error::ConfigLoadError;
use std::path::Path;
use tracing::info;

/// Hosts whose traffic is never intercepted or recorded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    entries: Vec<String>,
}

impl Blacklist {
    /// Create a blacklist from already-parsed entries. Blank entries are
    /// ignored and duplicates keep their first position.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.into().trim().to_ascii_lowercase();
            if !entry.is_empty() && !list.contains(&entry) {
                list.push(entry);
            }
        }
        Self { entries: list }
    }

    /// Parse the line format: one host per line, anything after `#` is a
    /// comment, blank lines are skipped.
    pub fn parse(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(|line| line.split('#').next().unwrap_or("").trim()),
        )
    }

    /// Load a blacklist file. A missing file yields an empty blacklist.
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Blacklist {} not found, no hosts suppressed", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigLoadError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Check if a host is suppressed.
    ///
    /// A host matches an entry when it equals it or is a proper subdomain of
    /// it (`api.example.com` matches `example.com`, `notexample.com` does
    /// not). Comparison ignores ASCII case.
    pub fn is_blocked(&self, host: &str) -> bool {
        self.entries.iter().any(|entry| host_matches(host, entry))
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn host_matches(host: &str, entry: &str) -> bool {
    if host.len() == entry.len() {
        return host.eq_ignore_ascii_case(entry);
    }
    if host.len() < entry.len() + 1 {
        return false;
    }
    let boundary = host.len() - entry.len() - 1;
    // `boundary` may not be a char boundary for non-ASCII hosts
    match (host.get(boundary..boundary + 1), host.get(boundary + 1..)) {
        (Some("."), Some(suffix)) => suffix.eq_ignore_ascii_case(entry),
        _ => false,
    }
}
