use std::fmt;

/// Match strength of a serviceable against a request.
///
/// Totally ordered. Values strictly between [`MatchIndex::MIN_MATCH`] and
/// [`MatchIndex::HIGH_MATCH`] are partial matches whose strength grows with
/// the length of the matched prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MatchIndex(u32);

impl MatchIndex {
    pub const NO_MATCH: MatchIndex = MatchIndex(0);
    pub const DEFAULT_MATCH: MatchIndex = MatchIndex(1);
    pub const MIN_MATCH: MatchIndex = MatchIndex(2);
    pub const HIGH_MATCH: MatchIndex = MatchIndex(u32::MAX);

    /// Partial match of the given strength above [`MatchIndex::DEFAULT_MATCH`].
    ///
    /// Saturates just below [`MatchIndex::HIGH_MATCH`] so that a partial match
    /// can never be mistaken for an exact one.
    pub fn partial(strength: usize) -> Self {
        let strength = u32::try_from(strength).unwrap_or(u32::MAX);
        MatchIndex(
            Self::DEFAULT_MATCH
                .0
                .saturating_add(strength)
                .min(Self::HIGH_MATCH.0 - 1),
        )
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_match(self) -> bool {
        self != Self::NO_MATCH
    }

    #[inline]
    pub fn is_high(self) -> bool {
        self == Self::HIGH_MATCH
    }
}

impl From<u32> for MatchIndex {
    fn from(value: u32) -> Self {
        MatchIndex(value)
    }
}

impl fmt::Display for MatchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NO_MATCH => f.write_str("NoMatch"),
            Self::DEFAULT_MATCH => f.write_str("DefaultMatch"),
            Self::MIN_MATCH => f.write_str("MinMatch"),
            Self::HIGH_MATCH => f.write_str("HighMatch"),
            MatchIndex(v) => write!(f, "Match({v})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MatchIndex;

    #[test]
    fn test_sentinel_order() {
        assert!(MatchIndex::NO_MATCH < MatchIndex::DEFAULT_MATCH);
        assert!(MatchIndex::DEFAULT_MATCH < MatchIndex::MIN_MATCH);
        assert!(MatchIndex::MIN_MATCH < MatchIndex::partial(2));
        assert!(MatchIndex::partial(usize::MAX) < MatchIndex::HIGH_MATCH);
    }

    #[test]
    fn test_partial_grows_with_strength() {
        assert!(MatchIndex::partial(4) < MatchIndex::partial(9));
        assert_eq!(MatchIndex::partial(3).value(), 4);
    }
}
