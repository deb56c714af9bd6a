//! A fixed, in-process `CapabilityProvider`: what this process advertises
//! for each technology. A real deployment would query the UWB/CS/RTT/RSSI
//! hardware stacks directly; this is a stub wired against in-memory
//! adapters for local testing.

use engine::{CapabilityDescriptor, CapabilityProvider};
use codec::{CapabilityBlock, CsCapability, RssiCapability, RttCapability, UwbCapability};

/// Builds the descriptor this demo process advertises: every technology,
/// with a permissive parameter range so any peer advertising the same
/// fixed set negotiates successfully.
pub fn local_descriptor(device_address: [u8; 2], bluetooth_address: [u8; 6]) -> CapabilityDescriptor {
    CapabilityDescriptor::new(vec![
        CapabilityBlock::Uwb(UwbCapability {
            channels: vec![5, 9],
            preambles: vec![9, 11],
            config_ids: vec![1, 2, 3],
            slot_duration_mask: 0b11,
            min_interval_ms: 100,
            max_interval_ms: 5000,
            device_address,
        }),
        CapabilityBlock::Cs(CsCapability {
            security_level_mask: 0b11,
            update_rate_mask: 0b1111,
            location_type: 0,
            sight_type: 0,
        }),
        CapabilityBlock::Rtt(RttCapability {
            service_name: "ranging-core".to_string(),
            match_filter: vec![0xff],
            max_bandwidth_mhz: 80,
            rx_chains: 2,
        }),
        CapabilityBlock::Rssi(RssiCapability { bluetooth_address }),
    ])
}

pub struct DemoCapabilityProvider {
    descriptor: CapabilityDescriptor,
}

impl DemoCapabilityProvider {
    pub fn new(device_address: [u8; 2], bluetooth_address: [u8; 6]) -> Self {
        Self { descriptor: local_descriptor(device_address, bluetooth_address) }
    }
}

impl CapabilityProvider for DemoCapabilityProvider {
    fn local_capabilities(&self) -> CapabilityDescriptor {
        self.descriptor.clone()
    }
}
