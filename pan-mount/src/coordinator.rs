//! Serialized access to the pan stepper.
//!
//! Several independent callers drive the same motor: HTTP handlers on the
//! tokio blocking pool and the tour worker thread. The serial protocol cannot
//! interleave requests, so every device operation goes through one mutex
//! inside [`MotionCoordinator`]. The lock is held for a single logical
//! operation (one command, or the paired position reads of a convergence
//! poll) and never across a sleep.
//!
//! The device is opened lazily by the first operation that needs it. Opening
//! runs the one-time setup (safe-start exit, current limit, step mode and,
//! when the driver supports them, ramp limits) while the lock is held, so
//! concurrent first callers open it exactly once.

use std::sync::{Mutex, MutexGuard, PoisonError};

use hardware::stepper::{Capabilities, StepperDriver, StepperError, StepperResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MotionConfig;
use crate::error::{MountError, MountResult};
use crate::presets::{PresetMap, PresetStore};

/// Opens a fresh connection to the stepper.
pub type DeviceOpener = dyn Fn() -> StepperResult<Box<dyn StepperDriver>> + Send + Sync;

/// Requested pan motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanDirection {
    Reverse,
    Stop,
    Forward,
}

impl PanDirection {
    /// -1, 0 or +1.
    pub fn sign(self) -> i32 {
        match self {
            PanDirection::Reverse => -1,
            PanDirection::Stop => 0,
            PanDirection::Forward => 1,
        }
    }
}

impl TryFrom<i32> for PanDirection {
    type Error = MountError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(PanDirection::Reverse),
            0 => Ok(PanDirection::Stop),
            1 => Ok(PanDirection::Forward),
            other => Err(MountError::InvalidDirection(other)),
        }
    }
}

/// Snapshot reported by [`MotionCoordinator::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountStatus {
    pub initialized: bool,
    pub current_position: Option<i32>,
    pub target_position: Option<i32>,
}

struct ReadyDevice {
    driver: Box<dyn StepperDriver>,
    capabilities: Capabilities,
}

/// Owner of the stepper and the preset store.
pub struct MotionCoordinator {
    device: Mutex<Option<ReadyDevice>>,
    opener: Box<DeviceOpener>,
    presets: PresetStore,
    config: MotionConfig,
}

impl MotionCoordinator {
    /// Coordinator that calls `opener` whenever the device needs opening.
    ///
    /// If setup fails the half-opened device is dropped and the next
    /// operation calls `opener` again.
    pub fn new(
        opener: impl Fn() -> StepperResult<Box<dyn StepperDriver>> + Send + Sync + 'static,
        presets: PresetStore,
        config: MotionConfig,
    ) -> Self {
        Self {
            device: Mutex::new(None),
            opener: Box::new(opener),
            presets,
            config,
        }
    }

    /// Coordinator around an already constructed driver.
    ///
    /// The driver can only be handed over once; if its setup fails, later
    /// operations report a connection failure.
    pub fn with_driver(
        driver: impl StepperDriver + 'static,
        presets: PresetStore,
        config: MotionConfig,
    ) -> Self {
        let slot: Mutex<Option<Box<dyn StepperDriver>>> = Mutex::new(Some(Box::new(driver)));
        Self::new(
            move || {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .ok_or_else(|| {
                        StepperError::ConnectionFailed("stepper handle already consumed".into())
                    })
            },
            presets,
            config,
        )
    }

    /// Open and configure the device if that has not happened yet.
    pub fn initialize(&self) -> MountResult<Capabilities> {
        let mut slot = self.lock_device();
        Ok(self.ready(&mut slot)?.capabilities)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_device().is_some()
    }

    /// Capabilities probed at initialization, if the device is open.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.lock_device().as_ref().map(|d| d.capabilities)
    }

    /// Run `f` against the device with exclusive access, opening it first if
    /// needed.
    pub fn with_device<R>(
        &self,
        f: impl FnOnce(&mut dyn StepperDriver) -> StepperResult<R>,
    ) -> MountResult<R> {
        let mut slot = self.lock_device();
        let device = self.ready(&mut slot)?;
        Ok(f(&mut *device.driver)?)
    }

    /// Start panning in `direction`, or stop with [`PanDirection::Stop`].
    pub fn pan(&self, direction: PanDirection) -> MountResult<()> {
        let velocity = self
            .config
            .pan_speed
            .checked_mul(direction.sign())
            .ok_or_else(|| {
                MountError::InvalidConfig(format!(
                    "pan speed {} out of range",
                    self.config.pan_speed
                ))
            })?;
        self.with_device(|d| d.set_target_velocity(velocity))?;
        debug!("Pan velocity set to {}", velocity);
        Ok(())
    }

    /// Stop continuous motion.
    pub fn stop(&self) -> MountResult<()> {
        self.pan(PanDirection::Stop)
    }

    pub fn energize(&self) -> MountResult<()> {
        self.with_device(|d| d.energize())?;
        info!("Stepper energized");
        Ok(())
    }

    pub fn deenergize(&self) -> MountResult<()> {
        self.with_device(|d| d.deenergize())?;
        info!("Stepper de-energized");
        Ok(())
    }

    /// Halt and declare the current position to be 0.
    pub fn reset_position(&self) -> MountResult<()> {
        self.with_device(|d| d.halt_and_set_position(0))?;
        info!("Position reset to 0");
        Ok(())
    }

    /// Store the current position in `slot`, replacing any previous value.
    pub fn learn(&self, slot: u32) -> MountResult<i32> {
        let position = self.with_device(|d| d.get_current_position())?;
        let previous = self.presets.update(|p| p.insert(slot, position))?;
        match previous {
            Some(old) if old != position => {
                info!("Preset {} moved from {} to {}", slot, old, position)
            }
            _ => info!("Preset {} saved at {}", slot, position),
        }
        Ok(position)
    }

    /// Move to the position stored in `slot`.
    ///
    /// Returns the commanded position, or `None` without touching the device
    /// when the slot is empty.
    pub fn goto(&self, slot: u32) -> MountResult<Option<i32>> {
        let Some(position) = self.presets.get(slot)? else {
            warn!("No preset in slot {}, ignoring goto", slot);
            return Ok(None);
        };
        self.with_device(|d| d.set_target_position(position))?;
        info!("Moving to preset {} at {}", slot, position);
        Ok(Some(position))
    }

    /// Delete the preset in `slot`. Returns whether it existed.
    pub fn forget(&self, slot: u32) -> MountResult<bool> {
        let removed = self.presets.update(|p| p.remove(&slot))?.is_some();
        if removed {
            info!("Preset {} deleted", slot);
        }
        Ok(removed)
    }

    pub fn presets(&self) -> MountResult<PresetMap> {
        Ok(self.presets.load_all()?)
    }

    /// Current and target positions. Does not open the device.
    pub fn status(&self) -> MountResult<MountStatus> {
        let mut slot = self.lock_device();
        match slot.as_mut() {
            None => Ok(MountStatus {
                initialized: false,
                current_position: None,
                target_position: None,
            }),
            Some(device) => {
                let current = device.driver.get_current_position()?;
                let target = device.driver.get_target_position()?;
                Ok(MountStatus {
                    initialized: true,
                    current_position: Some(current),
                    target_position: Some(target),
                })
            }
        }
    }

    fn lock_device(&self) -> MutexGuard<'_, Option<ReadyDevice>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready<'a>(&self, slot: &'a mut Option<ReadyDevice>) -> MountResult<&'a mut ReadyDevice> {
        let device = match slot.take() {
            Some(device) => device,
            None => self.open_and_configure()?,
        };
        Ok(slot.insert(device))
    }

    fn open_and_configure(&self) -> MountResult<ReadyDevice> {
        info!("Opening stepper...");
        let mut driver = (self.opener)()?;
        let config = &self.config;

        driver.exit_safe_start()?;
        driver.set_current_limit(config.current_limit_ma)?;
        driver.set_step_mode(config.step_mode)?;

        let capabilities = driver.capabilities();
        if capabilities.has_accel_limits() {
            match driver
                .set_max_accel(config.max_accel)
                .and_then(|_| driver.set_max_decel(config.max_decel))
            {
                Ok(()) => info!(
                    "Ramp limits applied: accel {}, decel {}",
                    config.max_accel, config.max_decel
                ),
                Err(e) => warn!("Could not apply ramp limits, using controller defaults: {e}"),
            }
        } else {
            info!("Driver has no ramp limit support, using controller defaults");
        }

        info!(
            "Stepper ready: {} mA, {} stepping",
            config.current_limit_ma, config.step_mode
        );
        Ok(ReadyDevice {
            driver,
            capabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::mock::{MockCall, MockStepper, MotionModel};
    use hardware::stepper::StepMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn create_test_coordinator(mock: &MockStepper) -> (TempDir, MotionCoordinator) {
        let dir = TempDir::new().unwrap();
        let store = PresetStore::new(dir.path().join("presets.json"));
        let coordinator =
            MotionCoordinator::with_driver(mock.clone(), store, MotionConfig::default());
        (dir, coordinator)
    }

    #[test]
    fn test_direction_from_int() {
        assert_eq!(PanDirection::try_from(-1).unwrap(), PanDirection::Reverse);
        assert_eq!(PanDirection::try_from(0).unwrap(), PanDirection::Stop);
        assert_eq!(PanDirection::try_from(1).unwrap(), PanDirection::Forward);
        assert!(matches!(
            PanDirection::try_from(2),
            Err(MountError::InvalidDirection(2))
        ));
    }

    #[test]
    fn test_initialize_sequence() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        assert!(!coordinator.is_initialized());
        let caps = coordinator.initialize().unwrap();
        assert!(caps.has_accel_limits());
        assert_eq!(
            mock.calls(),
            vec![
                MockCall::ExitSafeStart,
                MockCall::SetCurrentLimit(1000),
                MockCall::SetStepMode(StepMode::Half),
                MockCall::SetMaxAccel(3000),
                MockCall::SetMaxDecel(3000),
            ]
        );

        // Idempotent
        coordinator.initialize().unwrap();
        assert_eq!(mock.calls().len(), 5);
    }

    #[test]
    fn test_ramp_limits_skipped_without_capability() {
        let mock = MockStepper::new().with_capabilities(Capabilities::empty());
        let (_dir, coordinator) = create_test_coordinator(&mock);

        coordinator.initialize().unwrap();
        assert_eq!(coordinator.capabilities(), Some(Capabilities::empty()));
        assert!(!mock
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::SetMaxAccel(_) | MockCall::SetMaxDecel(_))));
    }

    #[test]
    fn test_first_command_opens_device() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        coordinator.energize().unwrap();
        assert!(coordinator.is_initialized());
        assert_eq!(mock.calls()[0], MockCall::ExitSafeStart);
        assert_eq!(mock.calls().last(), Some(&MockCall::Energize));
        assert!(mock.is_energized());
    }

    #[test]
    fn test_failed_open_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mock = MockStepper::new();
        let dir = TempDir::new().unwrap();

        let opener_attempts = Arc::clone(&attempts);
        let opener_probe = mock.clone();
        let coordinator = MotionCoordinator::new(
            move || {
                if opener_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StepperError::ConnectionFailed("no such port".into()))
                } else {
                    Ok(Box::new(opener_probe.clone()) as Box<dyn StepperDriver>)
                }
            },
            PresetStore::new(dir.path().join("presets.json")),
            MotionConfig::default(),
        );

        assert!(matches!(
            coordinator.energize(),
            Err(MountError::Device(StepperError::ConnectionFailed(_)))
        ));
        assert!(!coordinator.is_initialized());

        coordinator.energize().unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_first_use_opens_once() {
        let opens = Arc::new(AtomicUsize::new(0));
        let mock = MockStepper::new().with_call_latency(std::time::Duration::from_millis(2));
        let dir = TempDir::new().unwrap();

        let opener_opens = Arc::clone(&opens);
        let opener_probe = mock.clone();
        let coordinator = Arc::new(MotionCoordinator::new(
            move || {
                opener_opens.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(opener_probe.clone()) as Box<dyn StepperDriver>)
            },
            PresetStore::new(dir.path().join("presets.json")),
            MotionConfig::default(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                thread::spawn(move || coordinator.stop().unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(mock.overlaps(), 0);
    }

    #[test]
    fn test_pan_velocities() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        coordinator.pan(PanDirection::Forward).unwrap();
        assert_eq!(mock.target_velocity(), 25_000);
        coordinator.pan(PanDirection::Reverse).unwrap();
        assert_eq!(mock.target_velocity(), -25_000);
        coordinator.pan(PanDirection::Stop).unwrap();
        assert_eq!(mock.target_velocity(), 0);

        coordinator.pan(PanDirection::Forward).unwrap();
        coordinator.stop().unwrap();
        assert_eq!(mock.target_velocity(), 0);
    }

    #[test]
    fn test_reset_position() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        mock.set_current_position(4321);
        coordinator.reset_position().unwrap();
        assert_eq!(mock.current_position(), 0);
        assert_eq!(mock.calls().last(), Some(&MockCall::HaltAndSetPosition(0)));
    }

    #[test]
    fn test_learn_then_goto() {
        let mock = MockStepper::new().with_motion(MotionModel::Stalled);
        let (_dir, coordinator) = create_test_coordinator(&mock);

        mock.set_current_position(1200);
        assert_eq!(coordinator.learn(1).unwrap(), 1200);

        // Motor wanders off before the recall
        mock.set_current_position(-50);
        assert_eq!(coordinator.goto(1).unwrap(), Some(1200));
        assert_eq!(mock.target_position(), 1200);
        assert_eq!(coordinator.presets().unwrap(), PresetMap::from([(1, 1200)]));
    }

    #[test]
    fn test_learn_overwrites_slot() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        mock.set_current_position(10);
        coordinator.learn(2).unwrap();
        mock.set_current_position(20);
        coordinator.learn(2).unwrap();
        assert_eq!(coordinator.presets().unwrap(), PresetMap::from([(2, 20)]));
    }

    #[test]
    fn test_goto_missing_slot_is_noop() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        coordinator.initialize().unwrap();
        mock.clear_calls();

        assert_eq!(coordinator.goto(9).unwrap(), None);
        assert!(mock.calls().is_empty());
        assert_eq!(mock.target_position(), 0);
    }

    #[test]
    fn test_forget() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        coordinator.learn(5).unwrap();
        assert!(coordinator.forget(5).unwrap());
        assert!(!coordinator.forget(5).unwrap());
        assert!(coordinator.presets().unwrap().is_empty());
    }

    #[test]
    fn test_status_does_not_open_device() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        let status = coordinator.status().unwrap();
        assert!(!status.initialized);
        assert_eq!(status.current_position, None);
        assert!(mock.calls().is_empty());

        coordinator.initialize().unwrap();
        mock.set_current_position(42);
        let status = coordinator.status().unwrap();
        assert!(status.initialized);
        assert_eq!(status.current_position, Some(42));
        assert_eq!(status.target_position, Some(0));
    }

    #[test]
    fn test_device_error_propagates() {
        let mock = MockStepper::new();
        let (_dir, coordinator) = create_test_coordinator(&mock);

        coordinator.initialize().unwrap();
        mock.set_failing(true);
        assert!(matches!(
            coordinator.pan(PanDirection::Forward),
            Err(MountError::Device(StepperError::Io(_)))
        ));
        // A failed learn leaves the store untouched
        assert!(coordinator.learn(1).is_err());
        assert!(coordinator.presets().unwrap().is_empty());
    }

    #[test]
    fn test_extreme_pan_speed_does_not_overflow() {
        let mock = MockStepper::new();
        let dir = TempDir::new().unwrap();
        let coordinator = MotionCoordinator::with_driver(
            mock.clone(),
            PresetStore::new(dir.path().join("presets.json")),
            MotionConfig {
                pan_speed: i32::MIN,
                ..MotionConfig::default()
            },
        );

        assert!(matches!(
            coordinator.pan(PanDirection::Reverse),
            Err(MountError::InvalidConfig(_))
        ));
        assert!(!mock
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::SetTargetVelocity(_))));
    }
}
