use hickory_proto::rr::Name;
use std::collections::HashSet;

/// Longest presentation-format name, without the trailing dot.
const MAX_NAME_LENGTH: usize = 253;

/// Longest single label.
const MAX_LABEL_LENGTH: usize = 63;

/// Normalise a name into a zone key: lower-cased, with the trailing
/// dot of a fully-qualified name removed.
pub fn clean_domain(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Check whether a string is a syntactically valid domain name.
///
/// This is deliberately lenient about which characters a label may
/// contain (underscores and the like are common in the wild), but
/// rejects empty labels, whitespace, and over-long labels or names.
pub fn is_domain_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }

    let labels_ok = name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LENGTH
            && label.bytes().all(|b| b.is_ascii_graphic())
    });

    labels_ok && Name::from_ascii(name).is_ok()
}

/// Names under `arpa` are reverse-lookup or infrastructure names, and
/// are not audited.
pub fn is_arpa(name: &str) -> bool {
    name == "arpa" || name.ends_with(".arpa")
}

/// Split a name into its ancestor zones, ordered from the top-level
/// zone down to the name itself.
///
/// `"www.example.com"` gives `["com", "example.com", "www.example.com"]`.
pub fn ancestor_zones(name: &str) -> Vec<String> {
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        return Vec::new();
    }

    let labels = name.split('.').collect::<Vec<_>>();
    (0..labels.len())
        .rev()
        .map(|i| labels[i..].join("."))
        .collect()
}

/// Whether `name` is equal to `parent` or a strict subdomain of it.
/// Both names must already be cleaned.
pub fn is_subdomain_of(name: &str, parent: &str) -> bool {
    if name == parent {
        return true;
    }
    name.len() > parent.len()
        && name.ends_with(parent)
        && name.as_bytes()[name.len() - parent.len() - 1] == b'.'
}

/// The entries of `a` which are not in `b`, in the order they appear
/// in `a`.
pub fn difference(a: &[String], b: &[String]) -> Vec<String> {
    let b = b.iter().collect::<HashSet<_>>();
    a.iter().filter(|s| !b.contains(s)).cloned().collect()
}
