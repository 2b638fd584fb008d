//! Read-only metadata for the hosted SP, its identity providers, and the
//! circles of trust that bind them.
//!
//! Readers take an immutable [`Snapshot`]; a file-watching loader outside
//! the core swaps the snapshot atomically, so no reader ever observes a
//! half-updated configuration.

pub mod descriptor;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub use descriptor::{
    AuthnContextMapping, Binding, CircleOfTrust, Endpoint, ExtendedConfig, IdpDescriptor,
    SpDescriptor,
};

use crate::error::SpResult;

/// One immutable view of the deployment's configuration.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub sp: SpDescriptor,
    pub config: ExtendedConfig,
    pub idps: HashMap<String, IdpDescriptor>,
    pub circles_of_trust: Vec<CircleOfTrust>,
}

impl Snapshot {
    pub fn new(sp: SpDescriptor, config: ExtendedConfig) -> Self {
        Self {
            sp,
            config,
            idps: HashMap::new(),
            circles_of_trust: Vec::new(),
        }
    }

    /// Parse a full configuration set from its XML documents.
    pub fn from_documents(
        sp_xml: &str,
        config_xml: &str,
        idp_xmls: &[&str],
        cot_xmls: &[&str],
    ) -> SpResult<Self> {
        let mut snapshot = Self::new(
            SpDescriptor::from_xml(sp_xml)?,
            ExtendedConfig::from_xml(config_xml)?,
        );
        for xml in idp_xmls {
            snapshot = snapshot.with_idp(IdpDescriptor::from_xml(xml)?);
        }
        for xml in cot_xmls {
            snapshot = snapshot.with_circle_of_trust(CircleOfTrust::from_xml(xml)?);
        }
        Ok(snapshot)
    }

    pub fn with_idp(mut self, idp: IdpDescriptor) -> Self {
        self.idps.insert(idp.entity_id.clone(), idp);
        self
    }

    pub fn with_circle_of_trust(mut self, cot: CircleOfTrust) -> Self {
        self.circles_of_trust.push(cot);
        self
    }

    pub fn idp(&self, entity_id: &str) -> Option<&IdpDescriptor> {
        self.idps.get(entity_id)
    }

    /// Whether some configured circle of trust contains both the SP and the
    /// given issuer.
    pub fn shares_circle_of_trust(&self, idp_entity_id: &str) -> bool {
        self.circles_of_trust
            .iter()
            .any(|cot| cot.contains_pair(&self.sp.entity_id, idp_entity_id))
    }
}

/// Holder of the current snapshot. Reads are lock-cheap Arc clones; the
/// external loader replaces the whole snapshot on refresh.
pub struct MetadataStore {
    current: RwLock<Arc<Snapshot>>,
}

impl MetadataStore {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn swap(&self, snapshot: Snapshot) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(snapshot);
    }
}
