//! The fit engine (spec §4.5): decides whether, and where, a constraint
//! tuple can be satisfied inside one FREE segment.
//!
//! Grounded in `original_source/src/vmem.c`'s `seg_fit`, with the window
//! clamp corrected to the intersection the spec calls out as the reference's
//! bug (spec §9, "Open question"): `[max(seg.base, minaddr),
//! min(seg.base+seg.size, maxaddr)]`, not the union the C computes by
//! swapping `MIN`/`MAX`.

use crate::os::align_up;

/// The constraint tuple passed to `xalloc` (spec §4.5/§6.1).
#[derive(Debug, Clone, Copy)]
pub struct Constraints {
    pub size: u64,
    pub align: u64,
    pub phase: u64,
    pub nocross: u64,
    pub minaddr: u64,
    pub maxaddr: u64,
}

impl Constraints {
    /// `minaddr`/`maxaddr` of zero mean "unconstrained" (spec §6.1).
    pub fn window(&self) -> (u64, u64) {
        let minaddr = if self.minaddr == 0 { 0 } else { self.minaddr };
        let maxaddr = if self.maxaddr == 0 { u64::MAX } else { self.maxaddr };
        (minaddr, maxaddr)
    }
}

/// Try to fit `constraints` inside a FREE segment spanning `[seg_base,
/// seg_base + seg_size)`. Returns the chosen start address, or `None` if the
/// segment cannot satisfy the constraints.
///
/// Mirrors `seg_fit`'s five steps (spec §4.5) exactly, including the
/// intersection-window resolution of the reference's open question.
pub fn seg_fit(seg_base: u64, seg_size: u64, constraints: &Constraints) -> Option<u64> {
    if constraints.nocross != 0 {
        // Reserved (spec §4.5 step 4, §9): no known caller, reject rather
        // than silently ignore.
        return None;
    }

    let seg_end = seg_base.checked_add(seg_size)?;
    let (minaddr, maxaddr) = constraints.window();

    // Step 1: clamp to the intersection of the segment and the caller's window.
    let window_start = seg_base.max(minaddr);
    let window_end = seg_end.min(maxaddr);
    if window_start >= window_end {
        return None;
    }

    let align = if constraints.align == 0 { 1 } else { constraints.align };
    debug_assert!(align.is_power_of_two(), "align must be a power of two");
    let phase = constraints.phase % align;

    // Step 2: aligned start satisfying the phase constraint.
    let mut start = align_up(window_start.saturating_sub(phase), align).checked_add(phase)?;
    if start < window_start {
        start = start.checked_add(align)?;
    }

    // Step 3: does the candidate range fit before the window end?
    let end = start.checked_add(constraints.size)?;
    if end > window_end {
        return None;
    }

    Some(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(size: u64, align: u64, phase: u64, minaddr: u64, maxaddr: u64) -> Constraints {
        Constraints {
            size,
            align,
            phase,
            nocross: 0,
            minaddr,
            maxaddr,
        }
    }

    #[test]
    fn unconstrained_fit_starts_at_segment_base() {
        let got = seg_fit(0x1000, 0x10000, &c(0x1000, 0, 0, 0, 0));
        assert_eq!(got, Some(0x1000));
    }

    #[test]
    fn alignment_bumps_start_forward() {
        let got = seg_fit(0x1000, 0x10000, &c(0x1000, 0x2000, 0, 0, 0));
        assert_eq!(got, Some(0x2000));
    }

    #[test]
    fn phase_offsets_within_alignment() {
        // Fresh 64 KiB arena at base 0, align=0x1000, phase=0x8 -> 0x8 (spec §8 scenario 3).
        let got = seg_fit(0, 0x10000, &c(0x100, 0x1000, 0x8, 0, 0));
        assert_eq!(got, Some(0x8));
    }

    #[test]
    fn rejects_when_window_empty() {
        // minaddr/maxaddr place the window entirely outside the segment.
        let got = seg_fit(0x1000, 0x1000, &c(0x100, 0, 0, 0x5000, 0x6000));
        assert_eq!(got, None);
    }

    #[test]
    fn rejects_when_too_small_for_request() {
        let got = seg_fit(0x1000, 0x100, &c(0x1000, 0, 0, 0, 0));
        assert_eq!(got, None);
    }

    #[test]
    fn rejects_nocross_as_reserved() {
        let got = seg_fit(0x1000, 0x10000, &c(0x100, 0, 0, 0, 0)).map(|_| ());
        assert!(got.is_some());
        let mut constraints = c(0x100, 0, 0, 0, 0);
        constraints.nocross = 0x1000;
        assert_eq!(seg_fit(0x1000, 0x10000, &constraints), None);
    }

    #[test]
    fn respects_minaddr_within_segment() {
        // Window clamped to the intersection; start must land at/after minaddr.
        let got = seg_fit(0x1000, 0x10000, &c(0x1000, 0x1000, 0, 0x5000, 0));
        assert_eq!(got, Some(0x5000));
    }
}
