//! k-of-n vote tally
//!
//! Each fetch result string is one vote. A session is decided once some
//! result holds `k` votes, or fails once `n` votes were cast without that.

use std::cmp::Reverse;
use std::collections::HashMap;

/// Verdict emitted when no result reaches quorum
pub const NO_QUORUM: &str = "ERROR";

/// Prefix of every failed-fetch result
pub const ERROR_PREFIX: &str = "ERR:";

/// A failed fetch or the failing verdict; challenge bodies such as
/// `ERRATA` are ordinary results
pub fn is_error(result: &str) -> bool {
    result.starts_with(ERROR_PREFIX) || result == NO_QUORUM
}

/// Final outcome of a tally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub output: String,
    /// Votes held by the leading result
    pub confidence: usize,
}

impl Decision {
    pub fn is_ok(&self) -> bool {
        !is_error(&self.output)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tally {
    votes: HashMap<String, usize>,
    total: usize,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: &str) {
        *self.votes.entry(result.to_string()).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn max_votes(&self) -> usize {
        self.votes.values().copied().max().unwrap_or(0)
    }

    /// Result with the most votes
    ///
    /// Ties prefer a non-error result, then the lexicographically smallest.
    pub fn leader(&self) -> Option<(&str, usize)> {
        self.votes
            .iter()
            .max_by_key(|(result, count)| (**count, !is_error(result), Reverse(result.as_str())))
            .map(|(result, count)| (result.as_str(), *count))
    }

    /// Fetches the next round may launch: `min(k - max, n - total)`
    pub fn round_size(&self, k: usize, n: usize) -> usize {
        k.saturating_sub(self.max_votes())
            .min(n.saturating_sub(self.total))
    }

    /// `Some` once the session is decided
    ///
    /// Only a non-error result can win; `k` matching failures, or `n` votes
    /// without a winner, decide for [`NO_QUORUM`].
    pub fn decide(&self, k: usize, n: usize) -> Option<Decision> {
        match self.leader() {
            Some((output, confidence)) if confidence >= k && !is_error(output) => Some(Decision {
                output: output.to_string(),
                confidence,
            }),
            _ if self.max_votes() >= k || self.total >= n => Some(self.no_quorum()),
            _ => None,
        }
    }

    /// The failing decision, carrying the current top count
    pub fn no_quorum(&self) -> Decision {
        Decision {
            output: NO_QUORUM.to_string(),
            confidence: self.max_votes(),
        }
    }
}
