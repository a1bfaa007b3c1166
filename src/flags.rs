//! Arena and allocation flags (spec §6.2).

use bitflags::bitflags;

bitflags! {
    /// Behavioral bits passed to `Arena::create`, `Arena::add_span`, and
    /// `Arena::xalloc`.
    ///
    /// Exactly one of `INSTANTFIT`/`BESTFIT` must be set on a call to
    /// `xalloc`; the others are reserved (spec §4.6, §6.2).
    pub struct Flags: u32 {
        /// Caller tolerates a segment-pool refill happening inside the call.
        const BOOTSTRAP  = 1 << 0;
        /// Policy selector: first feasible fit, walking buckets upward from
        /// `size`'s own bucket (or the next one up for non-powers-of-two).
        const INSTANTFIT = 1 << 1;
        /// Policy selector: smallest feasible fit within the first bucket
        /// that yields any candidate.
        const BESTFIT    = 1 << 2;
        /// Reserved blocking discipline; unused in the core (spec §6.2).
        const SLEEP      = 1 << 3;
        /// Reserved blocking discipline; unused in the core (spec §6.2).
        const NOSLEEP    = 1 << 4;
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::INSTANTFIT
    }
}

impl Flags {
    /// `true` if exactly one of `INSTANTFIT`/`BESTFIT` is set.
    pub(crate) fn has_single_policy(self) -> bool {
        self.contains(Flags::INSTANTFIT) ^ self.contains(Flags::BESTFIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_instantfit() {
        assert_eq!(Flags::default(), Flags::INSTANTFIT);
    }

    #[test]
    fn single_policy_detection() {
        assert!(Flags::INSTANTFIT.has_single_policy());
        assert!(Flags::BESTFIT.has_single_policy());
        assert!(!(Flags::INSTANTFIT | Flags::BESTFIT).has_single_policy());
        assert!(!Flags::BOOTSTRAP.has_single_policy());
    }
}
