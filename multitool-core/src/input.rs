//! Operator input: encoder detents and the debounced push button.

/// Raw encoder counts per detent. Quadrature encoders report four edges per
/// click, so dividing keeps one click = one menu step.
pub const COUNTS_PER_DETENT: i32 = 4;

/// Quiet interval after an accepted button edge.
pub const DEBOUNCE_MS: u64 = 250;

/// Convert an accumulated encoder count to whole detents (floors toward -inf
/// so a half turn backwards does not read as zero).
pub const fn detents(count: i32) -> i32 {
    count.div_euclid(COUNTS_PER_DETENT)
}

/// Count change for a transition between two quadrature states, each packed
/// as `(a << 1) | b`. Invalid jumps (both lines changed) count as zero.
pub const fn quadrature_step(prev: u8, next: u8) -> i8 {
    const TABLE: [i8; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];
    TABLE[(((prev & 0b11) << 2) | (next & 0b11)) as usize]
}

/// Turns raw button levels into press edges.
///
/// A press is accepted only when at least [`DEBOUNCE_MS`] have passed since
/// the previous accepted press; presses inside the window are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Debouncer {
    was_pressed: bool,
    last_accepted_ms: Option<u64>,
}

impl Debouncer {
    pub const fn new() -> Self {
        Self {
            was_pressed: false,
            last_accepted_ms: None,
        }
    }

    /// Feed the current level; returns `true` on an accepted press edge.
    pub fn edge(&mut self, pressed: bool, now_ms: u64) -> bool {
        let rising = pressed && !self.was_pressed;
        self.was_pressed = pressed;
        if !rising {
            return false;
        }
        let quiet = match self.last_accepted_ms {
            Some(last) => now_ms.saturating_sub(last) >= DEBOUNCE_MS,
            None => true,
        };
        if quiet {
            self.last_accepted_ms = Some(now_ms);
        }
        quiet
    }
}
