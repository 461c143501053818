//! CPU speed governor: mirrors `minarch.c`'s `setOverclock()`/`useAutoCpu`
//! state machine. The actual CPU-speed syscalls are platform-specific (the
//! `PWR` external collaborator), so this module only owns the tier state
//! and, in `Auto`, a background thread that samples load and calls through
//! a [`PowerGovernor`] the platform implements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverclockTier {
    PowerSave,
    Normal,
    Performance,
    Auto,
}

/// What the platform's power-management layer actually does with a tier
/// change. A real implementation would call down into a vendor SDK; tests
/// and hosts without one can use a no-op.
pub trait PowerGovernor: Send + Sync {
    fn set_cpu_speed(&self, tier: OverclockTier);

    /// `Auto` mode's sampling hook: return the tier to apply this tick
    /// given the current frame-time headroom (1.0 = exactly on budget,
    /// >1.0 = core is running slower than real time and needs more
    /// headroom, <1.0 = comfortably ahead of schedule).
    fn sample_auto_tier(&self, frame_time_ratio: f32) -> OverclockTier {
        if frame_time_ratio > 1.05 {
            OverclockTier::Performance
        } else if frame_time_ratio < 0.6 {
            OverclockTier::PowerSave
        } else {
            OverclockTier::Normal
        }
    }
}

/// A governor that does nothing, for hosts with no platform CPU-speed API
/// wired up.
pub struct NullGovernor;

impl PowerGovernor for NullGovernor {
    fn set_cpu_speed(&self, _tier: OverclockTier) {}
}

pub struct Overclock {
    tier: OverclockTier,
    governor: Arc<dyn PowerGovernor>,
    auto_thread: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl Overclock {
    pub fn new(governor: Arc<dyn PowerGovernor>) -> Self {
        let tier = OverclockTier::Normal;
        governor.set_cpu_speed(tier);
        Overclock { tier, governor, auto_thread: None }
    }

    pub fn tier(&self) -> OverclockTier {
        self.tier
    }

    /// Switches tiers, spawning (or tearing down) the `Auto` monitor
    /// thread as needed. `sample_frame_time_ratio` is called by the
    /// monitor thread once per tick to decide what tier to apply next;
    /// it is expected to read shared state the host loop updates every
    /// frame (e.g. an `Arc<AtomicU32>` of recent frame times).
    pub fn set_tier<F>(&mut self, tier: OverclockTier, sample_frame_time_ratio: F)
    where
        F: Fn() -> f32 + Send + 'static,
    {
        if tier != OverclockTier::Auto {
            self.stop_auto();
            self.tier = tier;
            self.governor.set_cpu_speed(tier);
            return;
        }

        if self.tier == OverclockTier::Auto {
            return;
        }

        self.tier = OverclockTier::Auto;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let governor = self.governor.clone();
        let handle = std::thread::Builder::new()
            .name("overclock-auto".into())
            .spawn(move || {
                while !stop_clone.load(Ordering::Relaxed) {
                    let ratio = sample_frame_time_ratio();
                    let next = governor.sample_auto_tier(ratio);
                    governor.set_cpu_speed(next);
                    std::thread::sleep(Duration::from_millis(500));
                }
            })
            .expect("spawning the overclock monitor thread");
        self.auto_thread = Some((stop, handle));
    }

    fn stop_auto(&mut self) {
        if let Some((stop, handle)) = self.auto_thread.take() {
            stop.store(true, Ordering::Relaxed);
            let _ = handle.join();
        }
    }
}

impl Drop for Overclock {
    fn drop(&mut self) {
        self.stop_auto();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct RecordingGovernor {
        calls: std::sync::Mutex<Vec<OverclockTier>>,
    }

    impl PowerGovernor for RecordingGovernor {
        fn set_cpu_speed(&self, tier: OverclockTier) {
            self.calls.lock().unwrap().push(tier);
        }
    }

    #[test]
    fn new_overclock_starts_at_normal() {
        let governor = Arc::new(RecordingGovernor { calls: Default::default() });
        let oc = Overclock::new(governor.clone());
        assert_eq!(oc.tier(), OverclockTier::Normal);
        assert_eq!(governor.calls.lock().unwrap().as_slice(), &[OverclockTier::Normal]);
    }

    #[test]
    fn switching_away_from_auto_stops_the_monitor_thread() {
        let governor = Arc::new(RecordingGovernor { calls: Default::default() });
        let mut oc = Overclock::new(governor.clone());
        let ratio = Arc::new(AtomicU32::new(100));
        let ratio_clone = ratio.clone();
        oc.set_tier(OverclockTier::Auto, move || ratio_clone.load(Ordering::Relaxed) as f32 / 100.0);
        assert_eq!(oc.tier(), OverclockTier::Auto);
        assert!(oc.auto_thread.is_some());

        oc.set_tier(OverclockTier::PowerSave, || 1.0);
        assert_eq!(oc.tier(), OverclockTier::PowerSave);
        assert!(oc.auto_thread.is_none());
    }
}
