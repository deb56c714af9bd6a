//! Synthetic in-memory ranging adapters (spec §6.3's `RangingAdapter`
//! contract), standing in for the real UWB/CS/RTT/RSSI hardware stacks the
//! core is deliberately agnostic to (spec §1 "out of scope... external
//! collaborators"). Used by the demo binary and available to integration
//! tests that want a real `tokio::spawn`-driven adapter rather than a
//! hand-cranked fake.

use ahash::AHashMap;
use codec::{ConfigBlock, Technology};
use engine::{AdapterCallback, AdapterClosedReason, Confidence, PeerId, RangingAdapter, RangingMeasurement};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::oneshot;

/// One technology's loopback adapter: `start` spawns a task that emits a
/// synthetic measurement on a fixed period until `stop` fires its
/// per-peer cancellation channel.
pub struct LoopbackAdapter {
    technology: Technology,
    period: Duration,
    cancel: Mutex<AHashMap<PeerId, oneshot::Sender<()>>>,
}

impl LoopbackAdapter {
    pub fn new(technology: Technology, period: Duration) -> Arc<Self> {
        Arc::new(Self { technology, period, cancel: Mutex::new(AHashMap::new()) })
    }
}

impl RangingAdapter for LoopbackAdapter {
    fn technology(&self) -> Technology {
        self.technology
    }

    fn start(&self, peer: PeerId, _config: ConfigBlock, callback: Arc<dyn AdapterCallback>) {
        let (tx, mut rx) = oneshot::channel();
        self.cancel.lock().insert(peer, tx);

        let technology = self.technology;
        let period = self.period;

        tokio::spawn(async move {
            callback.on_started(peer);

            let start = Instant::now();
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately; skip it so `on_started` always
            // precedes the first `on_ranging_data` with a nonzero gap.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = &mut rx => {
                        callback.on_stopped(peer);
                        callback.on_closed(peer, AdapterClosedReason::Requested);
                        return;
                    }
                    _ = interval.tick() => {
                        let elapsed = start.elapsed().as_nanos() as u64;
                        callback.on_ranging_data(peer, RangingMeasurement {
                            technology,
                            peer,
                            distance_m: synthetic_distance(technology, elapsed),
                            azimuth_deg: None,
                            elevation_deg: None,
                            rssi: Some(-55),
                            timestamp_ns: elapsed,
                            confidence: Confidence::Medium,
                        });
                    }
                }
            }
        });
    }

    fn stop(&self, peer: PeerId) {
        if let Some(tx) = self.cancel.lock().remove(&peer) {
            let _ = tx.send(());
        }
    }

    fn is_supported(&self) -> bool {
        true
    }
}

/// A deterministic, gently-varying distance so the demo's `on_data` log
/// lines aren't just a constant.
fn synthetic_distance(technology: Technology, elapsed_ns: u64) -> f64 {
    let base = match technology {
        Technology::Uwb => 1.5,
        Technology::Cs => 1.8,
        Technology::Rtt => 2.2,
        Technology::Rssi => 2.6,
    };
    let phase = (elapsed_ns as f64 / 1_000_000_000.0).sin() * 0.2;
    base + phase
}
