//! Domain-capability augmentation phrases for the Embedding Engine (§4.5).
//!
//! This table is tunable data, not a contract: the set of categories and
//! phrases can grow or shrink without touching any embedding logic. A
//! backend's `category` (a free-text hint set in its launch spec, defaulting
//! to `"general"`) looks up a short phrase list here; the phrases are
//! appended to a tool's source text before embedding so that capability
//! inference is baked into the vector at index time.

/// `(category, augmenting phrases joined with "; ")`.
const PHRASES: &[(&str, &str)] = &[
    (
        "shell",
        "git version control; video processing; docker containers; process management",
    ),
    (
        "filesystem",
        "read and write files; directory listing; file search; disk storage",
    ),
    (
        "database",
        "sql queries; schema migration; data persistence; transactions",
    ),
    (
        "web",
        "http requests; scraping; rest apis; browser automation",
    ),
    (
        "vcs",
        "git; pull requests; commits; branches; code review",
    ),
    (
        "communication",
        "email; chat messages; notifications; calendar events",
    ),
    (
        "cloud",
        "infrastructure provisioning; containers; serverless functions; storage buckets",
    ),
    (
        "search",
        "full text search; indexing; ranked retrieval; question answering",
    ),
];

/// Return the augmentation phrase for a backend category, if one is known.
/// Unknown or `"general"` categories return `None` — no augmentation is added.
pub fn phrases_for(category: &str) -> Option<&'static str> {
    PHRASES
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(category))
        .map(|(_, phrases)| *phrases)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_category_resolves() {
        assert!(phrases_for("shell").unwrap().contains("git"));
        assert!(phrases_for("SHELL").unwrap().contains("git"));
    }

    #[test]
    fn unknown_category_is_none() {
        assert!(phrases_for("general").is_none());
        assert!(phrases_for("bespoke-widget").is_none());
    }
}
