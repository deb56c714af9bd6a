//! The sensor-fusion filter is an external collaborator (spec §1 "out of
//! scope... named where relevant"); the session only needs this narrow
//! trait boundary to hand it raw measurements and get fused ones back.

use crate::{measurement::RangingMeasurement, peer::PeerId};

pub trait FusionFilter: Send + Sync {
    /// Feeds one raw measurement in; returns zero or more fused
    /// measurements to forward in its place (the filter may batch, delay,
    /// or drop).
    fn feed(&self, peer: PeerId, measurement: RangingMeasurement) -> Vec<RangingMeasurement>;
}
