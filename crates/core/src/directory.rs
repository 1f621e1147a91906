//! Read-only prospect directory lookups.

use dashmap::DashMap;

use crate::types::Prospect;

/// Source of prospect records. The engine never writes through this trait.
pub trait ProspectDirectory: Send + Sync {
    fn get_prospect(&self, id: &str) -> Option<Prospect>;
}

/// Directory held in memory, loaded by the host application.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    prospects: DashMap<String, Prospect>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prospects(prospects: impl IntoIterator<Item = Prospect>) -> Self {
        let directory = Self::new();
        for prospect in prospects {
            directory.upsert(prospect);
        }
        directory
    }

    pub fn upsert(&self, prospect: Prospect) {
        self.prospects.insert(prospect.id.clone(), prospect);
    }

    pub fn len(&self) -> usize {
        self.prospects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prospects.is_empty()
    }
}

impl ProspectDirectory for InMemoryDirectory {
    fn get_prospect(&self, id: &str) -> Option<Prospect> {
        self.prospects.get(id).map(|p| p.clone())
    }
}
