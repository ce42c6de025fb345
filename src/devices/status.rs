//! Status-word decision table.

use serde::{Deserialize, Serialize};

/// Mode class a status word can decode to. Faults get their code attached later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeClass {
    Stopped,
    Running,
    Faulted,
}

/// One row of the table: `word & mask == value` selects `mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRule {
    pub mask: u16,
    pub value: u16,
    pub mode: ModeClass,
}

impl StatusRule {
    pub const fn new(mask: u16, value: u16, mode: ModeClass) -> Self {
        Self { mask, value, mode }
    }

    pub fn matches(&self, word: u16) -> bool {
        word & self.mask == self.value
    }
}

/// Ordered rule list; first match wins, no match means the pattern is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusDecodeTable {
    rules: Vec<StatusRule>,
}

// ZSW1 bits: 0 ready to switch on, 1 ready to operate, 2 operation enabled,
// 3 fault present, 6 switching on inhibited.
const PROFIDRIVE_ZSW1: [StatusRule; 4] = [
    StatusRule::new(0x0008, 0x0008, ModeClass::Faulted),
    StatusRule::new(0x000F, 0x0007, ModeClass::Running),
    StatusRule::new(0x000D, 0x0001, ModeClass::Stopped),
    StatusRule::new(0x004F, 0x0040, ModeClass::Stopped),
];

impl StatusDecodeTable {
    pub fn new(rules: Vec<StatusRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[StatusRule] {
        &self.rules
    }

    pub fn classify(&self, word: u16) -> Option<ModeClass> {
        self.rules.iter().find(|rule| rule.matches(word)).map(|rule| rule.mode)
    }
}

impl Default for StatusDecodeTable {
    fn default() -> Self {
        Self::new(PROFIDRIVE_ZSW1.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_decodes_profidrive_words() {
        let table = StatusDecodeTable::default();
        assert_eq!(table.classify(0xEF37), Some(ModeClass::Running));
        assert_eq!(table.classify(0xEB31), Some(ModeClass::Stopped));
        assert_eq!(table.classify(0xEA38), Some(ModeClass::Faulted));
        assert_eq!(table.classify(0x0040), Some(ModeClass::Stopped));
    }

    #[test]
    fn fault_bit_wins_over_running_bits() {
        let table = StatusDecodeTable::default();
        assert_eq!(table.classify(0x000F), Some(ModeClass::Faulted));
    }

    #[test]
    fn unseen_patterns_are_not_guessed() {
        let table = StatusDecodeTable::default();
        assert_eq!(table.classify(0x0000), None);
        assert_eq!(table.classify(0x0006), None);
    }
}
