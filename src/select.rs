//! Slot decision state machine.
//!
//! Pure function of the persisted flags; persisting the result is left to the caller.

use crate::{
    SlotChoice,
    state::{NvdataRecord, TryCount, TryOutcome},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SelectorInput {
    pub recovery: bool,
    pub prior_outcome: TryOutcome,
    pub try_b: bool,
    pub try_count: TryCount,
}

impl SelectorInput {
    pub fn from_record(record: &NvdataRecord) -> Self {
        Self {
            recovery: record.recovery,
            prior_outcome: record.try_result,
            try_b: record.try_b,
            try_count: record.try_count,
        }
    }
}

/// Slot to boot, together with the counters to persist for the next attempt.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Selection {
    pub choice: SlotChoice,
    pub try_count: TryCount,
    pub outcome: TryOutcome,
}

/// Decide which slot to boot.
///
/// Rules apply in order, first match wins:
/// 1. recovery requested: boot recovery.
/// 2. B was being tried and has no attempts left: fall back to A and mark the try bad.
/// 3. B requested: boot B, consuming one attempt.
/// 4. otherwise boot A.
pub fn select(input: SelectorInput) -> Selection {
    let unchanged = |choice| Selection {
        choice,
        try_count: input.try_count,
        outcome: input.prior_outcome,
    };

    if input.recovery {
        unchanged(SlotChoice::Recovery)
    } else if input.prior_outcome == TryOutcome::Trying && input.try_count.is_exhausted() {
        Selection {
            choice: SlotChoice::A,
            try_count: input.try_count,
            outcome: TryOutcome::Bad,
        }
    } else if input.try_b {
        Selection {
            choice: SlotChoice::B,
            try_count: input.try_count.decrement(),
            outcome: TryOutcome::Trying,
        }
    } else {
        unchanged(SlotChoice::A)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(recovery: bool, prior_outcome: TryOutcome, try_b: bool, try_count: u8) -> SelectorInput {
        SelectorInput {
            recovery,
            prior_outcome,
            try_b,
            try_count: TryCount::new(try_count).unwrap(),
        }
    }

    #[test]
    fn try_b_consumes_attempt() {
        let selection = select(input(false, TryOutcome::Trying, true, 1));

        assert_eq!(selection.choice, SlotChoice::B);
        assert_eq!(selection.try_count.get(), 0);
        assert_eq!(selection.outcome, TryOutcome::Trying);
    }

    #[test]
    fn exhausted_try_falls_back_to_a() {
        let selection = select(input(false, TryOutcome::Trying, true, 0));

        assert_eq!(selection.choice, SlotChoice::A);
        assert_eq!(selection.try_count.get(), 0);
        assert_eq!(selection.outcome, TryOutcome::Bad);
    }

    #[test]
    fn recovery_wins() {
        let selection = select(input(true, TryOutcome::Trying, true, 0));

        assert_eq!(selection.choice, SlotChoice::Recovery);
        assert_eq!(selection.outcome, TryOutcome::Trying);
    }

    #[test]
    fn default_record_boots_a() {
        let selection = select(SelectorInput::from_record(&NvdataRecord::default()));

        assert_eq!(selection.choice, SlotChoice::A);
        assert_eq!(selection.try_count.get(), 0);
        assert_eq!(selection.outcome, TryOutcome::None);
    }

    #[test]
    fn every_state_has_one_outcome() {
        let outcomes = [TryOutcome::None, TryOutcome::Trying, TryOutcome::Bad];
        let mut visited = 0;

        for recovery in [false, true] {
            for prior_outcome in outcomes {
                for try_b in [false, true] {
                    for try_count in 0..=15 {
                        let state = input(recovery, prior_outcome, try_b, try_count);
                        let selection = select(state);
                        visited += 1;

                        let expected = if recovery {
                            SlotChoice::Recovery
                        } else if prior_outcome == TryOutcome::Trying && try_count == 0 {
                            SlotChoice::A
                        } else if try_b {
                            SlotChoice::B
                        } else {
                            SlotChoice::A
                        };
                        assert_eq!(selection.choice, expected, "{state:?}");

                        // Counters only ever stay put or drop by one.
                        let count = selection.try_count.get();
                        assert!(count == try_count || count + 1 == try_count, "{state:?}");
                        if selection.choice != SlotChoice::B {
                            assert_eq!(count, try_count, "{state:?}");
                        }

                        // Deterministic.
                        assert_eq!(select(state), selection);
                    }
                }
            }
        }

        assert_eq!(visited, 192);
    }
}
