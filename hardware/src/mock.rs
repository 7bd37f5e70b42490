//! Simulated stepper for tests and hardware-free runs.
//!
//! [`MockStepper`] keeps its state behind an `Arc`, so a clone can be handed to
//! the code under test while the test keeps another clone to inspect the
//! recorded calls. Every call is checked against concurrently running calls;
//! any overlap is counted and can be asserted on with
//! [`overlaps`](MockStepper::overlaps).
//!
//! The call log keeps the most recent [`CALL_LOG_CAPACITY`] calls, so a mock
//! driving a long-running server does not grow without bound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::stepper::{Capabilities, StepMode, StepperDriver, StepperError, StepperResult};

/// Calls retained by [`MockStepper::calls`]; older calls are discarded.
pub const CALL_LOG_CAPACITY: usize = 4096;

/// A call received by the mock, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    ExitSafeStart,
    SetCurrentLimit(u32),
    SetStepMode(StepMode),
    SetMaxAccel(u32),
    SetMaxDecel(u32),
    Energize,
    Deenergize,
    SetTargetVelocity(i32),
    SetTargetPosition(i32),
    GetCurrentPosition,
    GetTargetPosition,
    HaltAndSetPosition(i32),
}

/// How the simulated position follows the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionModel {
    /// Position jumps to the target as soon as it is commanded.
    Instant,
    /// Each position read moves this many steps toward the target.
    Stepping(i32),
    /// The motor never moves.
    Stalled,
}

struct MockState {
    calls: VecDeque<MockCall>,
    capabilities: Capabilities,
    motion: MotionModel,
    call_latency: Duration,
    failing: bool,
    energized: bool,
    velocity: i32,
    target: i32,
    current: i32,
}

struct Shared {
    state: Mutex<MockState>,
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
}

/// In-memory [`StepperDriver`] that records every call.
///
/// # Example
///
/// ```
/// use hardware::mock::{MockCall, MockStepper};
/// use hardware::stepper::StepperDriver;
///
/// let mock = MockStepper::new();
/// let mut driver: Box<dyn StepperDriver> = Box::new(mock.clone());
///
/// driver.set_target_position(250).unwrap();
/// assert_eq!(mock.calls(), vec![MockCall::SetTargetPosition(250)]);
/// assert_eq!(mock.current_position(), 250);
/// ```
#[derive(Clone)]
pub struct MockStepper {
    shared: Arc<Shared>,
}

impl Default for MockStepper {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStepper {
    /// Mock with every capability and instant motion.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    calls: VecDeque::with_capacity(CALL_LOG_CAPACITY),
                    capabilities: Capabilities::all(),
                    motion: MotionModel::Instant,
                    call_latency: Duration::ZERO,
                    failing: false,
                    energized: false,
                    velocity: 0,
                    target: 0,
                    current: 0,
                }),
                in_flight: AtomicBool::new(false),
                overlaps: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        self.state().capabilities = capabilities;
        self
    }

    pub fn with_motion(self, motion: MotionModel) -> Self {
        self.state().motion = motion;
        self
    }

    /// Make every call take at least `latency`, widening the window in which
    /// unsynchronized callers would overlap.
    pub fn with_call_latency(self, latency: Duration) -> Self {
        self.state().call_latency = latency;
        self
    }

    /// When set, every call fails with an I/O error (it is still recorded).
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Teleport the simulated motor.
    pub fn set_current_position(&self, position: i32) {
        self.state().current = position;
    }

    /// Recorded calls, oldest first.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.iter().copied().collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of calls that started while another call was still running.
    pub fn overlaps(&self) -> usize {
        self.shared.overlaps.load(Ordering::SeqCst)
    }

    pub fn is_energized(&self) -> bool {
        self.state().energized
    }

    pub fn target_velocity(&self) -> i32 {
        self.state().velocity
    }

    pub fn target_position(&self) -> i32 {
        self.state().target
    }

    pub fn current_position(&self) -> i32 {
        self.state().current
    }

    /// Target positions in the order they were commanded.
    pub fn commanded_positions(&self) -> Vec<i32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::SetTargetPosition(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn invoke<R>(
        &self,
        call: MockCall,
        apply: impl FnOnce(&mut MockState) -> R,
    ) -> StepperResult<R> {
        if self.shared.in_flight.swap(true, Ordering::SeqCst) {
            self.shared.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        let latency = self.state().call_latency;
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let result = {
            let mut state = self.state();
            if state.calls.len() == CALL_LOG_CAPACITY {
                state.calls.pop_front();
            }
            state.calls.push_back(call);
            if state.failing {
                Err(StepperError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock stepper failure",
                )))
            } else {
                Ok(apply(&mut state))
            }
        };

        self.shared.in_flight.store(false, Ordering::SeqCst);
        result
    }
}

impl StepperDriver for MockStepper {
    fn capabilities(&self) -> Capabilities {
        self.state().capabilities
    }

    fn exit_safe_start(&mut self) -> StepperResult<()> {
        self.invoke(MockCall::ExitSafeStart, |_| ())
    }

    fn set_current_limit(&mut self, milliamps: u32) -> StepperResult<()> {
        self.invoke(MockCall::SetCurrentLimit(milliamps), |_| ())
    }

    fn set_step_mode(&mut self, mode: StepMode) -> StepperResult<()> {
        self.invoke(MockCall::SetStepMode(mode), |_| ())
    }

    fn set_max_accel(&mut self, accel: u32) -> StepperResult<()> {
        if !self.capabilities().contains(Capabilities::MAX_ACCEL) {
            return Err(StepperError::Unsupported("set_max_accel"));
        }
        self.invoke(MockCall::SetMaxAccel(accel), |_| ())
    }

    fn set_max_decel(&mut self, decel: u32) -> StepperResult<()> {
        if !self.capabilities().contains(Capabilities::MAX_DECEL) {
            return Err(StepperError::Unsupported("set_max_decel"));
        }
        self.invoke(MockCall::SetMaxDecel(decel), |_| ())
    }

    fn energize(&mut self) -> StepperResult<()> {
        self.invoke(MockCall::Energize, |s| s.energized = true)
    }

    fn deenergize(&mut self) -> StepperResult<()> {
        self.invoke(MockCall::Deenergize, |s| s.energized = false)
    }

    fn set_target_velocity(&mut self, velocity: i32) -> StepperResult<()> {
        self.invoke(MockCall::SetTargetVelocity(velocity), |s| s.velocity = velocity)
    }

    fn set_target_position(&mut self, position: i32) -> StepperResult<()> {
        self.invoke(MockCall::SetTargetPosition(position), |s| {
            s.target = position;
            s.velocity = 0;
            if s.motion == MotionModel::Instant {
                s.current = position;
            }
        })
    }

    fn get_current_position(&mut self) -> StepperResult<i32> {
        self.invoke(MockCall::GetCurrentPosition, |s| {
            if let MotionModel::Stepping(step) = s.motion {
                // i64 so that far-apart positions cannot overflow
                let delta = i64::from(s.target) - i64::from(s.current);
                let moved = delta.signum() * delta.abs().min(i64::from(step).abs());
                // Lands between current and target, so it fits in i32
                s.current = (i64::from(s.current) + moved) as i32;
            }
            s.current
        })
    }

    fn get_target_position(&mut self) -> StepperResult<i32> {
        self.invoke(MockCall::GetTargetPosition, |s| s.target)
    }

    fn halt_and_set_position(&mut self, position: i32) -> StepperResult<()> {
        self.invoke(MockCall::HaltAndSetPosition(position), |s| {
            s.velocity = 0;
            s.target = position;
            s.current = position;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stepping_motion_converges() {
        let mock = MockStepper::new().with_motion(MotionModel::Stepping(40));
        let mut driver = mock.clone();

        driver.set_target_position(100).unwrap();
        assert_eq!(driver.get_current_position().unwrap(), 40);
        assert_eq!(driver.get_current_position().unwrap(), 80);
        assert_eq!(driver.get_current_position().unwrap(), 100);
        assert_eq!(driver.get_current_position().unwrap(), 100);
    }

    #[test]
    fn test_stepping_motion_across_full_range() {
        let mock = MockStepper::new().with_motion(MotionModel::Stepping(i32::MAX));
        let mut driver = mock.clone();

        mock.set_current_position(i32::MIN);
        driver.set_target_position(i32::MAX).unwrap();
        assert_eq!(driver.get_current_position().unwrap(), -1);
        assert_eq!(driver.get_current_position().unwrap(), i32::MAX - 1);
        assert_eq!(driver.get_current_position().unwrap(), i32::MAX);
    }

    #[test]
    fn test_call_log_keeps_most_recent_calls() {
        let mock = MockStepper::new();
        let mut driver = mock.clone();

        for v in 0..(CALL_LOG_CAPACITY as i32 + 10) {
            driver.set_target_velocity(v).unwrap();
        }

        let calls = mock.calls();
        assert_eq!(calls.len(), CALL_LOG_CAPACITY);
        assert_eq!(calls[0], MockCall::SetTargetVelocity(10));
        assert_eq!(
            calls.last(),
            Some(&MockCall::SetTargetVelocity(CALL_LOG_CAPACITY as i32 + 9))
        );
    }

    #[test]
    fn test_stalled_motion_never_moves() {
        let mock = MockStepper::new().with_motion(MotionModel::Stalled);
        let mut driver = mock.clone();

        driver.set_target_position(-300).unwrap();
        assert_eq!(driver.get_current_position().unwrap(), 0);
        assert_eq!(driver.get_target_position().unwrap(), -300);
    }

    #[test]
    fn test_halt_and_set_position_redefines_origin() {
        let mock = MockStepper::new();
        let mut driver = mock.clone();

        driver.set_target_velocity(5000).unwrap();
        driver.halt_and_set_position(0).unwrap();
        assert_eq!(mock.target_velocity(), 0);
        assert_eq!(mock.current_position(), 0);
        assert_eq!(mock.target_position(), 0);
    }

    #[test]
    fn test_missing_capability_is_unsupported() {
        let mock = MockStepper::new().with_capabilities(Capabilities::empty());
        let mut driver = mock.clone();

        assert!(matches!(
            driver.set_max_accel(3000),
            Err(StepperError::Unsupported(_))
        ));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_failing_calls_are_recorded() {
        let mock = MockStepper::new();
        let mut driver = mock.clone();
        mock.set_failing(true);

        assert!(driver.energize().is_err());
        assert!(!mock.is_energized());
        assert_eq!(mock.calls(), vec![MockCall::Energize]);
    }

    #[test]
    fn test_unsynchronized_callers_overlap() {
        let mock = MockStepper::new().with_call_latency(Duration::from_millis(20));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let mut driver = mock.clone();
                thread::spawn(move || driver.set_target_velocity(i).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(mock.overlaps() > 0);
    }
}
