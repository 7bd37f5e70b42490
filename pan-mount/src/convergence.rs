//! Waiting for the stepper to arrive at its target.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::coordinator::MotionCoordinator;
use crate::error::MountResult;

/// Arrival tolerance in microsteps.
pub const DEFAULT_TOLERANCE: u32 = 2;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceParams {
    /// Largest |current - target| that counts as arrived.
    pub tolerance: u32,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ConvergenceParams {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// How a wait ended. A timeout is reported, not treated as an error: a
/// slipped or obstructed motor should not take the caller down with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    Reached { position: i32 },
    TimedOut { current: i32, target: i32 },
    Cancelled,
}

impl MotionCoordinator {
    /// Poll until the motor is within tolerance of its target or the timeout
    /// passes.
    ///
    /// Returns without sleeping when the motor is already there. Each poll
    /// reads both positions under a single lock acquisition; the lock is
    /// released while sleeping so other callers can reach the device.
    pub fn wait_until_reached(&self, params: &ConvergenceParams) -> MountResult<Convergence> {
        self.poll_convergence(params, None)
    }

    /// Like [`wait_until_reached`](Self::wait_until_reached) but returns
    /// [`Convergence::Cancelled`] as soon as `cancel` fires.
    pub fn wait_until_reached_or_cancelled(
        &self,
        params: &ConvergenceParams,
        cancel: &CancelToken,
    ) -> MountResult<Convergence> {
        self.poll_convergence(params, Some(cancel))
    }

    fn poll_convergence(
        &self,
        params: &ConvergenceParams,
        cancel: Option<&CancelToken>,
    ) -> MountResult<Convergence> {
        let start = Instant::now();
        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Ok(Convergence::Cancelled);
            }

            let (current, target) =
                self.with_device(|d| Ok((d.get_current_position()?, d.get_target_position()?)))?;
            if current.abs_diff(target) <= params.tolerance {
                debug!("Arrived at {} (target {})", current, target);
                return Ok(Convergence::Reached { position: current });
            }

            let elapsed = start.elapsed();
            if elapsed >= params.timeout {
                warn!(
                    "Timed out after {:.1}s waiting for target {} (at {})",
                    elapsed.as_secs_f64(),
                    target,
                    current
                );
                return Ok(Convergence::TimedOut { current, target });
            }

            let nap = params.poll_interval.min(params.timeout - elapsed);
            match cancel {
                Some(c) => {
                    if !c.sleep(nap) {
                        return Ok(Convergence::Cancelled);
                    }
                }
                None => std::thread::sleep(nap),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::config::MotionConfig;
    use crate::presets::{PresetMap, PresetStore};
    use hardware::mock::{MockCall, MockStepper, MotionModel};
    use hardware::stepper::StepperDriver;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn fast_params(timeout_ms: u64) -> ConvergenceParams {
        ConvergenceParams {
            tolerance: 2,
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn create_test_coordinator(mock: &MockStepper) -> (TempDir, MotionCoordinator) {
        let dir = TempDir::new().unwrap();
        let coordinator = MotionCoordinator::with_driver(
            mock.clone(),
            PresetStore::new(dir.path().join("presets.json")),
            MotionConfig::default(),
        );
        coordinator.initialize().unwrap();
        mock.clear_calls();
        (dir, coordinator)
    }

    #[test]
    fn test_already_there_returns_without_sleeping() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        let start = Instant::now();
        let result = coordinator
            .wait_until_reached(&ConvergenceParams {
                poll_interval: Duration::from_secs(5),
                ..ConvergenceParams::default()
            })
            .unwrap();

        assert_eq!(result, Convergence::Reached { position: 0 });
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(
            mock.calls(),
            vec![MockCall::GetCurrentPosition, MockCall::GetTargetPosition]
        );
    }

    #[test]
    fn test_within_tolerance_counts_as_reached() {
        let mock = MockStepper::new().with_motion(MotionModel::Stalled);
        let (_dir, coordinator) = create_test_coordinator(&mock);

        mock.clone().set_target_position(102).unwrap();
        mock.set_current_position(100);
        let result = coordinator.wait_until_reached(&fast_params(100)).unwrap();
        assert_eq!(result, Convergence::Reached { position: 100 });
    }

    #[test]
    fn test_stepping_motor_converges() {
        let mock = MockStepper::new().with_motion(MotionModel::Stepping(100));
        let (_dir, coordinator) = create_test_coordinator(&mock);

        mock.clone().set_target_position(1000).unwrap();
        let result = coordinator.wait_until_reached(&fast_params(2000)).unwrap();
        assert_eq!(result, Convergence::Reached { position: 1000 });
    }

    #[test]
    fn test_stalled_motor_times_out() {
        let mock = MockStepper::new().with_motion(MotionModel::Stalled);
        let (_dir, coordinator) = create_test_coordinator(&mock);

        mock.clone().set_target_position(500).unwrap();
        let start = Instant::now();
        let result = coordinator.wait_until_reached(&fast_params(100)).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(
            result,
            Convergence::TimedOut {
                current: 0,
                target: 500
            }
        );
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[test]
    fn test_extreme_preset_times_out_cleanly() {
        let mock = MockStepper::new().with_motion(MotionModel::Stalled);
        let dir = TempDir::new().unwrap();
        let store = PresetStore::new(dir.path().join("presets.json"));
        store.save_all(&PresetMap::from([(1, i32::MAX)])).unwrap();
        let coordinator =
            MotionCoordinator::with_driver(mock.clone(), store, MotionConfig::default());

        mock.set_current_position(-5);
        assert_eq!(coordinator.goto(1).unwrap(), Some(i32::MAX));

        let result = coordinator.wait_until_reached(&fast_params(50)).unwrap();
        assert_eq!(
            result,
            Convergence::TimedOut {
                current: -5,
                target: i32::MAX
            }
        );
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let mock = MockStepper::new().with_motion(MotionModel::Stalled);
        let (_dir, coordinator) = create_test_coordinator(&mock);
        let coordinator = Arc::new(coordinator);

        mock.clone().set_target_position(500).unwrap();
        let (mut source, token) = cancel_pair();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                coordinator
                    .wait_until_reached_or_cancelled(&fast_params(10_000), &token)
                    .unwrap()
            })
        };

        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        source.cancel();

        assert_eq!(waiter.join().unwrap(), Convergence::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_device_failure_is_an_error() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        mock.set_failing(true);
        assert!(coordinator.wait_until_reached(&fast_params(100)).is_err());
    }
}
