//! Automatic sweep through the saved presets.
//!
//! A tour visits every preset in ascending slot order, dwells at each for the
//! current tour delay, and starts over until stopped. The sweep runs on its
//! own thread and shares the device with manual commands through the
//! [`MotionCoordinator`], so a manual pan or goto during a tour is serialized
//! with the tour's own commands rather than interleaved with them.
//!
//! Each stop is commanded twice: once, then again after a short settle pause.
//! The Tic's planner can silently drop a target set while it is still busy,
//! so the second command makes sure the stop is actually taken up.
//!
//! Stopping is cooperative. [`TourController::stop_tour`] cancels the run's
//! token, which wakes any sleep in progress, then commands velocity 0. Tour
//! commands check the token while holding the device lock, so once
//! `stop_tour` returns no further tour command reaches the device even if the
//! worker thread is still unwinding.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::cancel::{cancel_pair, CancelSource, CancelToken};
use crate::config::TourConfig;
use crate::convergence::Convergence;
use crate::coordinator::MotionCoordinator;
use crate::error::{MountError, MountResult};

/// Outcome of [`TourController::start_tour`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TourStart {
    Started { stops: usize },
    AlreadyRunning,
    NoPresets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TourState {
    Idle,
    Running,
    /// Stop requested; the worker has not exited yet.
    Stopping,
}

struct ActiveTour {
    cancel: CancelSource,
    worker: JoinHandle<()>,
}

impl ActiveTour {
    fn state(&self) -> TourState {
        if self.worker.is_finished() {
            TourState::Idle
        } else if self.cancel.is_cancelled() {
            TourState::Stopping
        } else {
            TourState::Running
        }
    }
}

/// Starts, stops and paces the preset tour.
pub struct TourController {
    coordinator: Arc<MotionCoordinator>,
    config: TourConfig,
    delay_s: Arc<Mutex<f64>>,
    active: Mutex<Option<ActiveTour>>,
}

impl TourController {
    pub fn new(coordinator: Arc<MotionCoordinator>, config: TourConfig) -> MountResult<Self> {
        config.validate()?;
        let delay_s = config.clamp_delay(config.initial_delay_s);
        Ok(Self {
            coordinator,
            config,
            delay_s: Arc::new(Mutex::new(delay_s)),
            active: Mutex::new(None),
        })
    }

    pub fn coordinator(&self) -> &Arc<MotionCoordinator> {
        &self.coordinator
    }

    /// Energize the motor and begin touring the saved presets.
    ///
    /// The preset list is read once here; presets learned during the tour are
    /// picked up on the next start. Energize and preset-load failures are
    /// returned to the caller and no tour is started.
    pub fn start_tour(&self) -> MountResult<TourStart> {
        let mut active = self.lock_active();
        if active.as_ref().map(ActiveTour::state) == Some(TourState::Running) {
            info!("Tour already running");
            return Ok(TourStart::AlreadyRunning);
        }

        self.coordinator.energize()?;
        let stops: Vec<i32> = self.coordinator.presets()?.into_values().collect();
        if stops.is_empty() {
            info!("No presets saved, tour not started");
            return Ok(TourStart::NoPresets);
        }

        let count = stops.len();
        let (cancel, token) = cancel_pair();
        let run = TourRun {
            coordinator: Arc::clone(&self.coordinator),
            stops,
            delay_s: Arc::clone(&self.delay_s),
            config: self.config.clone(),
            token,
        };
        let worker = thread::Builder::new()
            .name("pan-tour".into())
            .spawn(move || run.run())
            .map_err(MountError::Io)?;

        // A previous run that is still unwinding is detached; its token is
        // already cancelled so it can no longer command the device.
        *active = Some(ActiveTour { cancel, worker });
        info!("Tour started with {} stops", count);
        Ok(TourStart::Started { stops: count })
    }

    /// Cancel the tour (if any) and stop the motor.
    ///
    /// Returns without waiting for the worker to exit. Returns whether a tour
    /// was running.
    pub fn stop_tour(&self) -> MountResult<bool> {
        let was_running = {
            let mut active = self.lock_active();
            match active.as_mut() {
                Some(tour) if tour.state() == TourState::Running => {
                    tour.cancel.cancel();
                    true
                }
                _ => false,
            }
        };

        self.coordinator.stop()?;
        if was_running {
            info!("Tour stopped");
        }
        Ok(was_running)
    }

    /// Set the dwell at each stop, clamped to the configured bounds.
    ///
    /// Takes effect at the next dwell of a running tour. Returns the value
    /// actually applied.
    pub fn set_tour_delay(&self, seconds: f64) -> MountResult<f64> {
        if !seconds.is_finite() {
            return Err(MountError::InvalidDelay(seconds));
        }
        let clamped = self.config.clamp_delay(seconds);
        *self.delay_s.lock().unwrap_or_else(PoisonError::into_inner) = clamped;
        info!("Tour delay set to {:.1}s", clamped);
        Ok(clamped)
    }

    pub fn tour_delay(&self) -> f64 {
        *self.delay_s.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TourState {
        self.lock_active()
            .as_ref()
            .map_or(TourState::Idle, ActiveTour::state)
    }

    pub fn is_tour_running(&self) -> bool {
        self.state() == TourState::Running
    }

    /// Block until the worker has exited or `timeout` passes. Returns whether
    /// the tour is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.state() == TourState::Idle {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveTour>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State owned by one tour worker thread.
struct TourRun {
    coordinator: Arc<MotionCoordinator>,
    stops: Vec<i32>,
    delay_s: Arc<Mutex<f64>>,
    config: TourConfig,
    token: CancelToken,
}

impl TourRun {
    fn run(self) {
        match self.sweep() {
            Ok(()) => debug!("Tour worker exiting"),
            Err(e) => error!("Tour aborted: {e}"),
        }
    }

    fn sweep(&self) -> MountResult<()> {
        while !self.token.is_cancelled() {
            for &position in &self.stops {
                if !self.visit(position)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Move to one stop and dwell there. Returns `false` once cancelled.
    fn visit(&self, position: i32) -> MountResult<bool> {
        info!("Tour moving to {}", position);
        if !self.command(position)? || !self.token.sleep(self.config.settle) {
            return Ok(false);
        }
        if !self.command(position)? {
            return Ok(false);
        }

        match self
            .coordinator
            .wait_until_reached_or_cancelled(&self.config.convergence, &self.token)?
        {
            Convergence::Cancelled => return Ok(false),
            Convergence::Reached { position } => debug!("Tour arrived at {}", position),
            Convergence::TimedOut { .. } => {}
        }

        let delay_s = *self.delay_s.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.token.sleep(Duration::from_secs_f64(delay_s)))
    }

    /// Command `position` unless cancelled, checking under the device lock.
    fn command(&self, position: i32) -> MountResult<bool> {
        self.coordinator.with_device(|d| {
            if self.token.is_cancelled() {
                return Ok(false);
            }
            d.set_target_position(position)?;
            Ok(true)
        })
    }
}
