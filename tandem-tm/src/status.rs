//! Transaction status values and the legal transition table.

use std::fmt;

/// The lifecycle status of a transaction.
///
/// Statuses also appear as the one-byte status field of journal records, so
/// the numeric values are part of the on-disk format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxStatus {
    /// The transaction is running, branches can be enlisted.
    Active = 0,
    /// The transaction can only be rolled back.
    MarkedRollback = 1,
    /// Phase 1 is executing.
    Preparing = 2,
    /// Every participant voted; the commit decision is pending.
    Prepared = 3,
    /// The commit decision was journaled; phase 2 is executing.
    Committing = 4,
    /// Terminal: all participants committed.
    Committed = 5,
    /// Phase 2 rollback is executing.
    RollingBack = 6,
    /// Terminal: all participants rolled back.
    Rolledback = 7,
    /// Terminal: the outcome could not be determined; recovery owns the
    /// transaction from here.
    Unknown = 8,
    /// No transaction is associated.
    NoTransaction = 9,
}

impl TxStatus {
    /// Creates a status from its journal byte value.
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Active),
            1 => Some(Self::MarkedRollback),
            2 => Some(Self::Preparing),
            3 => Some(Self::Prepared),
            4 => Some(Self::Committing),
            5 => Some(Self::Committed),
            6 => Some(Self::RollingBack),
            7 => Some(Self::Rolledback),
            8 => Some(Self::Unknown),
            9 => Some(Self::NoTransaction),
            _ => None,
        }
    }

    /// Returns the journal byte value.
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Returns `true` for statuses no transition leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Rolledback | Self::Unknown)
    }

    /// Returns `true` for the two statuses whose journal records make a
    /// transaction dangling until a terminal record follows.
    pub fn is_dangling(self) -> bool {
        matches!(self, Self::Committing | Self::RollingBack)
    }

    /// Returns `true` when the transition `self` → `next` is legal.
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        match self {
            Self::Active => matches!(
                next,
                Self::MarkedRollback | Self::Preparing | Self::RollingBack
            ),
            Self::MarkedRollback => matches!(next, Self::RollingBack),
            Self::Preparing => {
                matches!(next, Self::Prepared | Self::RollingBack | Self::Unknown)
            }
            Self::Prepared => matches!(next, Self::Committing | Self::RollingBack),
            Self::Committing => matches!(next, Self::Committed | Self::Unknown),
            Self::RollingBack => matches!(next, Self::Rolledback | Self::Unknown),
            Self::Committed | Self::Rolledback | Self::Unknown | Self::NoTransaction => false,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::MarkedRollback => "MARKED_ROLLBACK",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::RollingBack => "ROLLING_BACK",
            Self::Rolledback => "ROLLEDBACK",
            Self::Unknown => "UNKNOWN",
            Self::NoTransaction => "NO_TRANSACTION",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip() {
        for value in 0..=9u8 {
            let status = TxStatus::from_value(value).unwrap();
            assert_eq!(status.value(), value);
        }
        assert_eq!(TxStatus::from_value(10), None);
        assert_eq!(TxStatus::from_value(0xFF), None);
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(TxStatus::Active.can_transition_to(TxStatus::Preparing));
        assert!(TxStatus::Preparing.can_transition_to(TxStatus::Prepared));
        assert!(TxStatus::Prepared.can_transition_to(TxStatus::Committing));
        assert!(TxStatus::Committing.can_transition_to(TxStatus::Committed));
    }

    #[test]
    fn test_rollback_transitions() {
        assert!(TxStatus::Active.can_transition_to(TxStatus::MarkedRollback));
        assert!(TxStatus::MarkedRollback.can_transition_to(TxStatus::RollingBack));
        assert!(TxStatus::Preparing.can_transition_to(TxStatus::RollingBack));
        assert!(TxStatus::Prepared.can_transition_to(TxStatus::RollingBack));
        assert!(TxStatus::RollingBack.can_transition_to(TxStatus::Rolledback));
    }

    #[test]
    fn test_unknown_reachable_from_in_flight_phases() {
        assert!(TxStatus::Preparing.can_transition_to(TxStatus::Unknown));
        assert!(TxStatus::Committing.can_transition_to(TxStatus::Unknown));
        assert!(TxStatus::RollingBack.can_transition_to(TxStatus::Unknown));
        assert!(!TxStatus::Active.can_transition_to(TxStatus::Unknown));
    }

    #[test]
    fn test_terminal_statuses_allow_nothing() {
        for terminal in [TxStatus::Committed, TxStatus::Rolledback, TxStatus::Unknown] {
            assert!(terminal.is_terminal());
            for value in 0..=9u8 {
                let next = TxStatus::from_value(value).unwrap();
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_illegal_shortcuts_rejected() {
        assert!(!TxStatus::Active.can_transition_to(TxStatus::Committed));
        assert!(!TxStatus::Active.can_transition_to(TxStatus::Committing));
        assert!(!TxStatus::MarkedRollback.can_transition_to(TxStatus::Preparing));
        assert!(!TxStatus::Committing.can_transition_to(TxStatus::RollingBack));
    }

    #[test]
    fn test_dangling_statuses() {
        assert!(TxStatus::Committing.is_dangling());
        assert!(TxStatus::RollingBack.is_dangling());
        assert!(!TxStatus::Committed.is_dangling());
        assert!(!TxStatus::Preparing.is_dangling());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(TxStatus::MarkedRollback.to_string(), "MARKED_ROLLBACK");
        assert_eq!(TxStatus::Committing.to_string(), "COMMITTING");
        assert_eq!(TxStatus::Rolledback.to_string(), "ROLLEDBACK");
    }
}
