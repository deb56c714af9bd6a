//! Capability descriptors: what a device (local or peer) advertises it can
//! do per technology. Structural equality, as required by the config
//! selector's determinism guarantee (spec §4.3/§8).

use codec::{CapabilityBlock, Technology};

/// The capabilities one side (local device or a peer) advertises, one block
/// per supported technology. Equality is structural: two descriptors with
/// the same blocks in the same order compare equal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityDescriptor {
    blocks: Vec<CapabilityBlock>,
}

impl CapabilityDescriptor {
    pub fn new(blocks: Vec<CapabilityBlock>) -> Self {
        Self { blocks }
    }

    pub fn blocks(&self) -> &[CapabilityBlock] {
        &self.blocks
    }

    pub fn supports(&self, tech: Technology) -> bool {
        self.blocks.iter().any(|b| b.technology() == tech)
    }

    pub fn get(&self, tech: Technology) -> Option<&CapabilityBlock> {
        self.blocks.iter().find(|b| b.technology() == tech)
    }
}

/// Surfaces the local device's own capabilities to the Config Selector
/// (spec §6.5/Design Notes: "replace static per-class singletons with an
/// explicit `CapabilityProvider` struct owned by the Session Manager and
/// passed by reference into the Config Selector; no globals").
pub trait CapabilityProvider: Send + Sync {
    fn local_capabilities(&self) -> CapabilityDescriptor;
}

/// A capability provider backed by a fixed descriptor, useful for tests and
/// for the demo binary where capabilities don't change at runtime.
pub struct StaticCapabilityProvider(CapabilityDescriptor);

impl StaticCapabilityProvider {
    pub fn new(descriptor: CapabilityDescriptor) -> Self {
        Self(descriptor)
    }
}

impl CapabilityProvider for StaticCapabilityProvider {
    fn local_capabilities(&self) -> CapabilityDescriptor {
        self.0.clone()
    }
}
