use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::offset::{MemberId, OffsetStrategy};

/// Member offsets known ahead of time for one driver build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticOffsets {
    pub version: String,
    pub offsets: BTreeMap<MemberId, u64>,
}

impl StaticOffsets {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            offsets: BTreeMap::new(),
        }
    }

    pub fn with(mut self, member: MemberId, offset: u64) -> Self {
        self.offsets.insert(member, offset);
        self
    }

    /// All members the request path cannot work without are present.
    pub fn is_valid(&self) -> bool {
        !self.version.is_empty()
            && MemberId::REQUIRED
                .iter()
                .all(|m| self.offsets.get(m).is_some_and(|&o| o != 0))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl OffsetStrategy for StaticOffsets {
    fn name(&self) -> &'static str {
        "static table"
    }

    fn discover(&self, member: MemberId, _accessor: Option<u64>) -> Option<u64> {
        self.offsets.get(&member).copied().filter(|&o| o != 0)
    }
}
