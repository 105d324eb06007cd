use edgelake_core::matcher::MatchIndex;

/// Scores how well a configured path prefix `pattern` covers `request`.
///
/// An identical path is authoritative. The root pattern covers everything
/// with the weakest positive score. Otherwise `request` must start with
/// `pattern` followed by `/`, and longer prefixes score higher.
pub fn path_contains(pattern: &str, request: &str) -> MatchIndex {
    if pattern == request {
        return MatchIndex::HIGH_MATCH;
    }
    if pattern == "/" {
        return MatchIndex::MIN_MATCH;
    }
    if request.len() < pattern.len() {
        return MatchIndex::NO_MATCH;
    }
    match request.strip_prefix(pattern) {
        Some(rest) if rest.starts_with('/') => MatchIndex::partial(pattern.len() + 1),
        _ => MatchIndex::NO_MATCH,
    }
}

/// Best score of `request` over all `patterns`, stopping at the first exact hit.
pub fn best_path<'p, I>(patterns: I, request: &str) -> (MatchIndex, Option<&'p str>)
where
    I: IntoIterator<Item = &'p String>,
{
    let mut best = (MatchIndex::NO_MATCH, None);
    for pattern in patterns {
        let score = path_contains(pattern, request);
        if score > best.0 {
            best = (score, Some(pattern.as_str()));
            if score.is_high() {
                break;
            }
        }
    }
    best
}
