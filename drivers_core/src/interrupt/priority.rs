//! Driver for the Integrator/CP primary interrupt controller, with software priority masking.
//!
//! The hardware has a flat set of 32 lines with no notion of priority. Priorities are layered on
//! top in software: when a line fires, every enabled line of the same or lower urgency is disabled
//! at the controller until the interrupt ends.
//!
//! # Reference Documentation
//! - ARM Integrator/CP User Guide (DUI 0159), section 4.9 "Interrupt controllers".

use log::{debug, trace};
use snafu::ensure;
use spin::Mutex;

use super::{
    Error, InterruptCause, InterruptSource, InvalidLineSnafu, InvalidPrioritySnafu, Line,
    LineState,
};
use crate::registers::RegisterAccess;

/// Number of lines on the primary controller.
pub const LINE_COUNT: usize = 32;

/// Number of software priorities. Priority 0 is the most urgent.
pub const PRIORITY_COUNT: usize = 16;

/// The priority recorded while no interrupt is being serviced.
const IDLE_PRIORITY: u8 = PRIORITY_COUNT as u8;

#[allow(unused, missing_docs)]
mod regs {
    pub const IRQ_STATUS: usize = 0x00;
    pub const RAW_STATUS: usize = 0x04;
    pub const ENABLE_SET: usize = 0x08;
    pub const ENABLE_CLEAR: usize = 0x0C;
    pub const SOFT_SET: usize = 0x10;
    pub const SOFT_CLEAR: usize = 0x14;
}

/// Continuation state from [`PriorityController::begin`] to its end-of-interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PriorityToken {
    /// The priority that was current before the interrupt.
    pub prior: u8,
    /// The priority of the line that fired.
    pub fired: u8,
    /// The line that fired.
    pub line: Line,
}

struct State {
    line_priority: [u8; LINE_COUNT],
    /// `masks[p]` holds every enabled line with priority >= p. The extra entry at
    /// `PRIORITY_COUNT` is always empty.
    masks: [u32; PRIORITY_COUNT + 1],
    enabled: u32,
    current_priority: u8,
}

impl State {
    const fn new() -> Self {
        Self {
            line_priority: [0; LINE_COUNT],
            masks: [0; PRIORITY_COUNT + 1],
            enabled: 0,
            current_priority: IDLE_PRIORITY,
        }
    }

    fn enable(&mut self, line: usize, priority: u8) {
        let bit = 1 << line;
        self.line_priority[line] = priority;
        for mask in &mut self.masks[..=usize::from(priority)] {
            *mask |= bit;
        }
        self.enabled |= bit;
    }

    fn disable(&mut self, line: usize) {
        let bit = 1 << line;
        for mask in &mut self.masks {
            *mask &= !bit;
        }
        self.enabled &= !bit;
    }
}

/// An Integrator/CP style interrupt controller with priority masking.
pub struct PriorityController<R> {
    registers: R,
    state: Mutex<State>,
}

impl<R: RegisterAccess> PriorityController<R> {
    /// Create a controller over its register window. Hardware is untouched until
    /// [`InterruptSource::initialize_io_unit`].
    pub fn new(registers: R) -> Self {
        Self {
            registers,
            state: Mutex::new(State::new()),
        }
    }

    /// The priority of the interrupt currently being serviced, or `None` when idle.
    pub fn current_priority(&self) -> Option<u8> {
        let p = self.state.lock().current_priority;
        (p != IDLE_PRIORITY).then_some(p)
    }

    /// The set of lines enabled through [`InterruptSource::set_line_state`].
    pub fn enabled_lines(&self) -> u32 {
        self.state.lock().enabled
    }

    /// The lines that must be disabled while an interrupt at `priority` is serviced.
    pub fn mask_for_priority(&self, priority: u8) -> u32 {
        self.state
            .lock()
            .masks
            .get(usize::from(priority))
            .copied()
            .unwrap_or(0)
    }

    fn check_line(line: Line) -> Result<usize, Error> {
        let index = line as usize;
        ensure!(index < LINE_COUNT, InvalidLineSnafu { line });
        Ok(index)
    }
}

impl<R: RegisterAccess> InterruptSource for PriorityController<R> {
    type Token = PriorityToken;

    fn initialize_io_unit(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        *state = State::new();
        self.registers.write32(regs::ENABLE_CLEAR, u32::MAX);
        self.registers.write32(regs::SOFT_CLEAR, u32::MAX);
        debug!("priority interrupt controller initialized");
        Ok(())
    }

    fn set_line_state(&self, line: Line, line_state: &LineState) -> Result<(), Error> {
        let index = Self::check_line(line)?;
        let priority = line_state.priority;
        ensure!(
            usize::from(priority) < PRIORITY_COUNT,
            InvalidPrioritySnafu { priority }
        );

        let mut state = self.state.lock();
        state.disable(index);
        if line_state.enabled {
            state.enable(index, priority);
            self.registers.write32(regs::ENABLE_SET, 1 << index);
        } else {
            self.registers.write32(regs::ENABLE_CLEAR, 1 << index);
        }
        trace!(
            "line {line} {} at priority {priority}",
            if line_state.enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    fn mask_line(&self, line: Line, enable: bool) {
        let Ok(index) = Self::check_line(line) else {
            return;
        };
        let register = if enable {
            regs::ENABLE_SET
        } else {
            regs::ENABLE_CLEAR
        };
        self.registers.write32(register, 1 << index);
    }

    fn begin(&self) -> InterruptCause<PriorityToken> {
        let status = self.registers.read32(regs::IRQ_STATUS);
        if status == 0 {
            return InterruptCause::NoInterruptHere;
        }

        let line = status.trailing_zeros();
        let mut state = self.state.lock();
        let fired = state.line_priority[line as usize];
        self.registers
            .write32(regs::ENABLE_CLEAR, state.masks[usize::from(fired)]);
        let prior = core::mem::replace(&mut state.current_priority, fired);
        InterruptCause::LineFired {
            line,
            token: PriorityToken { prior, fired, line },
        }
    }

    fn end_of_interrupt(&self, token: PriorityToken) {
        let mut state = self.state.lock();
        state.current_priority = token.prior;
        // Only lines this interrupt disabled come back, and only those live at the prior level.
        let restore =
            state.masks[usize::from(token.fired)] & !state.masks[usize::from(token.prior)];
        self.registers.write32(regs::SOFT_CLEAR, 1 << token.line);
        self.registers
            .write32(regs::ENABLE_SET, restore & state.enabled);
    }

    fn request_interrupt(&self, line: Line) -> Result<(), Error> {
        let index = Self::check_line(line)?;
        self.registers.write32(regs::SOFT_SET, 1 << index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::{regs, PriorityController, LINE_COUNT, PRIORITY_COUNT};
    use crate::{
        interrupt::{Error, InterruptCause, InterruptSource, LineState},
        registers::fake::FakeRegisters,
    };

    fn enabled(priority: u8) -> LineState {
        LineState {
            enabled: true,
            priority,
            ..LineState::default()
        }
    }

    fn three_line_controller() -> PriorityController<FakeRegisters> {
        let pic = PriorityController::new(FakeRegisters::new());
        pic.initialize_io_unit().unwrap();
        for (line, priority) in [(0, 0), (1, 1), (2, 2)] {
            pic.set_line_state(line, &enabled(priority)).unwrap();
        }
        pic.registers.clear_log();
        pic
    }

    #[test]
    fn masks_cover_equal_and_lower_urgency() {
        let pic = three_line_controller();
        assert_eq!(pic.mask_for_priority(0), 0b111);
        assert_eq!(pic.mask_for_priority(1), 0b110);
        assert_eq!(pic.mask_for_priority(2), 0b100);
        assert_eq!(pic.mask_for_priority(3), 0);
        assert_eq!(pic.enabled_lines(), 0b111);
    }

    #[test]
    fn firing_middle_priority_masks_and_restores_exactly() {
        let pic = three_line_controller();
        pic.registers.hold(regs::IRQ_STATUS, 0b010);

        let InterruptCause::LineFired { line, token } = pic.begin() else {
            panic!("expected a line");
        };
        assert_eq!(line, 1);
        assert_eq!(pic.registers.writes_to(regs::ENABLE_CLEAR), [0b110]);
        assert_eq!(pic.current_priority(), Some(1));

        pic.registers.clear_log();
        pic.end_of_interrupt(token);
        assert_eq!(pic.registers.writes_to(regs::ENABLE_SET), [0b110]);
        assert!(pic.registers.writes_to(regs::ENABLE_CLEAR).is_empty());
        assert_eq!(pic.current_priority(), None);
    }

    #[test]
    fn nested_interrupts_restore_in_order() {
        let pic = three_line_controller();

        pic.registers.hold(regs::IRQ_STATUS, 0b100);
        let InterruptCause::LineFired { token: outer, .. } = pic.begin() else {
            panic!("expected outer line");
        };
        assert_eq!(pic.current_priority(), Some(2));

        pic.registers.hold(regs::IRQ_STATUS, 0b001);
        let InterruptCause::LineFired { token: inner, .. } = pic.begin() else {
            panic!("expected inner line");
        };
        assert_eq!(pic.current_priority(), Some(0));

        pic.registers.clear_log();
        pic.end_of_interrupt(inner);
        assert_eq!(pic.current_priority(), Some(2));
        // line 2 stays off until the outer interrupt ends
        assert_eq!(pic.registers.writes_to(regs::ENABLE_SET), [0b011]);

        pic.registers.clear_log();
        pic.end_of_interrupt(outer);
        assert_eq!(pic.current_priority(), None);
        assert_eq!(pic.registers.writes_to(regs::ENABLE_SET), [0b100]);
    }

    #[test]
    fn disabled_line_not_reenabled() {
        let pic = three_line_controller();
        pic.registers.hold(regs::IRQ_STATUS, 0b001);
        let InterruptCause::LineFired { token, .. } = pic.begin() else {
            panic!("expected a line");
        };
        pic.set_line_state(2, &LineState::default()).unwrap();
        pic.registers.clear_log();
        pic.end_of_interrupt(token);
        assert_eq!(pic.registers.writes_to(regs::ENABLE_SET), [0b011]);
    }

    #[test]
    fn nothing_pending() {
        let pic = three_line_controller();
        assert_eq!(pic.begin(), InterruptCause::NoInterruptHere);
        assert!(pic.registers.writes().is_empty());
    }

    #[test]
    fn out_of_range_rejected() {
        let pic = PriorityController::new(FakeRegisters::new());
        assert!(matches!(
            pic.set_line_state(32, &enabled(0)),
            Err(Error::InvalidLine { line: 32 })
        ));
        assert!(matches!(
            pic.set_line_state(3, &enabled(16)),
            Err(Error::InvalidPriority { priority: 16 })
        ));
    }

    #[test]
    fn software_interrupt() {
        let pic = PriorityController::new(FakeRegisters::new());
        pic.request_interrupt(5).unwrap();
        assert_eq!(pic.registers.writes_to(regs::SOFT_SET), [1 << 5]);
    }

    #[test]
    fn enable_disable_round_trip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let pic = PriorityController::new(FakeRegisters::new());
        pic.initialize_io_unit().unwrap();
        for _ in 0..12 {
            let line = rng.gen_range(0..LINE_COUNT as u32);
            let priority = rng.gen_range(0..PRIORITY_COUNT as u8);
            pic.set_line_state(line, &enabled(priority)).unwrap();
        }

        for _ in 0..200 {
            let before_masks = pic.state.lock().masks;
            let before_enabled = pic.enabled_lines();

            let line = loop {
                let candidate = rng.gen_range(0..LINE_COUNT as u32);
                if before_enabled & (1 << candidate) == 0 {
                    break candidate;
                }
            };
            let priority = rng.gen_range(0..PRIORITY_COUNT as u8);
            pic.set_line_state(line, &enabled(priority)).unwrap();
            pic.set_line_state(line, &LineState::default()).unwrap();

            assert_eq!(pic.state.lock().masks, before_masks);
            assert_eq!(pic.enabled_lines(), before_enabled);
        }
    }
}
