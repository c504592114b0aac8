use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Per-device register categories the stream and optimizer consult.
///
/// The table is immutable once built; streams share it through an `Arc`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterTable {
    /// Registers with write side effects. Writes to them are never elided.
    non_cacheable: BTreeSet<u32>,
    /// Config registers that can only be written through the `COPY_DATA` backdoor.
    privileged_config: BTreeSet<u32>,
}

impl RegisterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_non_cacheable(mut self, regs: impl IntoIterator<Item = u32>) -> Self {
        self.non_cacheable.extend(regs);
        self
    }

    pub fn with_privileged_config(mut self, regs: impl IntoIterator<Item = u32>) -> Self {
        self.privileged_config.extend(regs);
        self
    }

    pub fn is_non_cacheable(&self, reg: u32) -> bool {
        self.non_cacheable.contains(&reg)
    }

    pub fn is_privileged_config(&self, reg: u32) -> bool {
        self.privileged_config.contains(&reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_from_json() {
        let table: RegisterTable =
            serde_json::from_str(r#"{ "non_cacheable": [41472], "privileged_config": [8448] }"#)
                .unwrap();
        assert!(table.is_non_cacheable(0xA200));
        assert!(table.is_privileged_config(0x2100));
        assert!(!table.is_privileged_config(0xA200));
    }
}
