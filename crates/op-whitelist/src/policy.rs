use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::warn;

/// Marker that switches enforcement off when found on the first non-empty line.
pub const DISABLE_MARKER: &str = "DESACTIVADO";

const HEADER_WHITELIST: &str = "WHITELIST";
const HEADER_BLOCKED_SUBDOMAINS: &str = "BLOCKED-SUBDOMAINS";
const HEADER_BLOCKED_PATHS: &str = "BLOCKED-PATHS";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("document allows no domains")]
    Empty,
    #[error("document looks like markup (line {line}), not a whitelist")]
    Markup { line: usize },
}

/// Parsed whitelist document. Decided once at parse time; never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    Active(Rules),
    /// Emergency disable: enforcement is lifted regardless of entries.
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rules {
    pub domains: FxHashSet<String>,
    pub blocked_subdomains: FxHashSet<String>,
    pub blocked_paths: FxHashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Whitelist,
    BlockedSubdomains,
    BlockedPaths,
}

impl Policy {
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    pub fn rules(&self) -> Option<&Rules> {
        match self {
            Self::Active(rules) => Some(rules),
            Self::Disabled => None,
        }
    }

    /// Render the canonical document: sorted sections, one entry per line.
    pub fn to_document(&self) -> String {
        let rules = match self {
            Self::Disabled => return format!("# {DISABLE_MARKER}\n"),
            Self::Active(rules) => rules,
        };

        let mut out = String::new();
        for (header, entries) in [
            (HEADER_WHITELIST, &rules.domains),
            (HEADER_BLOCKED_SUBDOMAINS, &rules.blocked_subdomains),
            (HEADER_BLOCKED_PATHS, &rules.blocked_paths),
        ] {
            if entries.is_empty() {
                continue;
            }
            out.push_str("## ");
            out.push_str(header);
            out.push('\n');
            for entry in sorted(entries) {
                out.push_str(entry);
                out.push('\n');
            }
        }
        out
    }
}

impl Rules {
    /// Most specific label wins: `ads.google.com` blocked beats `google.com` allowed.
    pub fn allows(&self, domain: &str) -> bool {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();

        // Walk the domain hierarchy: a.b.example.com → b.example.com → example.com → com
        let mut check = domain.as_str();
        loop {
            if self.blocked_subdomains.contains(check) {
                return false;
            }
            if self.domains.contains(check) {
                return true;
            }
            match check.find('.') {
                Some(pos) => check = &check[pos + 1..],
                None => break,
            }
        }

        false
    }

    pub fn sorted_domains(&self) -> Vec<&str> {
        sorted(&self.domains)
    }

    pub fn sorted_blocked_subdomains(&self) -> Vec<&str> {
        sorted(&self.blocked_subdomains)
    }

    pub fn sorted_blocked_paths(&self) -> Vec<&str> {
        sorted(&self.blocked_paths)
    }
}

fn sorted(set: &FxHashSet<String>) -> Vec<&str> {
    let mut items: Vec<&str> = set.iter().map(String::as_str).collect();
    items.sort_unstable();
    items
}

/// Parse a whitelist document.
///
/// Lines before any `##` header belong to the whitelist section. Other `#`
/// lines are comments. Invalid domain entries are skipped with a warning.
pub fn parse(content: &str) -> Result<Policy, ParseError> {
    let mut lines = content
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty())
        .peekable();

    if let Some((_, first)) = lines.peek() {
        if first.to_uppercase().contains(DISABLE_MARKER) {
            return Ok(Policy::Disabled);
        }
    }

    let mut rules = Rules::default();
    let mut section = Section::Whitelist;

    for (number, line) in lines {
        if line.starts_with('<') {
            return Err(ParseError::Markup { line: number });
        }

        if let Some(header) = line.strip_prefix("##") {
            if let Some(next) = section_for(header.trim()) {
                section = next;
                continue;
            }
        }
        if line.starts_with('#') {
            continue;
        }

        match section {
            Section::Whitelist => insert_domain(&mut rules.domains, line, number),
            Section::BlockedSubdomains => {
                insert_domain(&mut rules.blocked_subdomains, line, number)
            }
            Section::BlockedPaths => {
                rules.blocked_paths.insert(line.to_string());
            }
        }
    }

    // Blocked sections alone would sinkhole everything.
    if rules.domains.is_empty() {
        return Err(ParseError::Empty);
    }

    Ok(Policy::Active(rules))
}

fn section_for(header: &str) -> Option<Section> {
    if header.eq_ignore_ascii_case(HEADER_WHITELIST) {
        Some(Section::Whitelist)
    } else if header.eq_ignore_ascii_case(HEADER_BLOCKED_SUBDOMAINS) {
        Some(Section::BlockedSubdomains)
    } else if header.eq_ignore_ascii_case(HEADER_BLOCKED_PATHS) {
        Some(Section::BlockedPaths)
    } else {
        None
    }
}

fn insert_domain(set: &mut FxHashSet<String>, raw: &str, line: usize) {
    let domain = normalize_domain(raw);
    if is_valid_domain(&domain) {
        set.insert(domain);
    } else {
        warn!(line, entry = raw, "Skipping invalid domain entry");
    }
}

/// Lowercase, drop a leading `*.` and a trailing root dot.
pub fn normalize_domain(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let stripped = lowered.strip_prefix("*.").unwrap_or(&lowered);
    stripped.trim_end_matches('.').to_string()
}

pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }

    if !domain.contains('.') {
        return false;
    }

    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}
