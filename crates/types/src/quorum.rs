//! Quorum arithmetic.
//!
//! Crash-fault protocols (Raft, Paxos, quorum replication) use a strict
//! majority. Byzantine protocols (PBFT) need strictly more than two thirds.

/// Check for a strict majority: more than half of `total`.
pub fn has_majority(votes: usize, total: usize) -> bool {
    votes * 2 > total
}

/// Check for a 2f+1 quorum (> 2/3 of total).
pub fn has_bft_quorum(votes: usize, total: usize) -> bool {
    votes * 3 > total * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority() {
        assert!(!has_majority(2, 5));
        assert!(has_majority(3, 5));
        assert!(!has_majority(2, 4), "Exactly half is not a majority");
        assert!(has_majority(3, 4));
        assert!(has_majority(1, 1));
        assert!(!has_majority(0, 0), "0/0 should not be a majority");
    }

    #[test]
    fn test_bft_quorum_boundary_conditions() {
        // Exact 2/3 should NOT be quorum (need > 2/3)
        assert!(!has_bft_quorum(6, 9), "Exactly 2/3 should not be quorum");
        assert!(has_bft_quorum(7, 10));
        assert!(!has_bft_quorum(6, 10));

        // n=4: need 3
        assert!(!has_bft_quorum(2, 4));
        assert!(has_bft_quorum(3, 4));

        // n=7: need 5
        assert!(!has_bft_quorum(4, 7));
        assert!(has_bft_quorum(5, 7));

        assert!(!has_bft_quorum(0, 0), "0/0 should not be quorum");
    }
}
