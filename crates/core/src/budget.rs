use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-turn resource ceiling handed to an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub max_input_units: u32,
    pub max_output_units: u32,
    pub max_tools: u32,
}

impl Budget {
    pub const fn new(max_input_units: u32, max_output_units: u32, max_tools: u32) -> Self {
        Self { max_input_units, max_output_units, max_tools }
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::new(2000, 1000, 2)
    }
}

/// Budgets keyed by agent name, optionally narrowed to a policy bundle with a
/// `"<bundle>:<agent>"` key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetTable {
    pub default: Budget,
    #[serde(default)]
    pub agents: BTreeMap<String, Budget>,
}

impl BudgetTable {
    pub fn resolve(&self, agent: &str, policy_bundle: &str) -> Budget {
        self.agents
            .get(&format!("{policy_bundle}:{agent}"))
            .or_else(|| self.agents.get(agent))
            .copied()
            .unwrap_or(self.default)
    }

    pub fn with_agent(mut self, key: impl Into<String>, budget: Budget) -> Self {
        self.agents.insert(key.into(), budget);
        self
    }
}

impl Default for BudgetTable {
    fn default() -> Self {
        let mut agents = BTreeMap::new();
        agents.insert("main".to_owned(), Budget::new(2000, 1000, 2));
        agents.insert("crisis".to_owned(), Budget::new(2000, 600, 1));
        agents.insert("assessment".to_owned(), Budget::new(1000, 800, 2));
        Self { default: Budget::default(), agents }
    }
}

/// Rough token-like unit count, four characters per unit rounded up.
pub fn estimate_units(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::{estimate_units, Budget, BudgetTable};

    #[test]
    fn resolve_prefers_bundle_specific_entry() {
        let table = BudgetTable::default().with_agent("pilot:main", Budget::new(10, 10, 0));

        assert_eq!(table.resolve("main", "pilot"), Budget::new(10, 10, 0));
        assert_eq!(table.resolve("main", "default"), Budget::new(2000, 1000, 2));
        assert_eq!(table.resolve("crisis", "pilot").max_tools, 1);
    }

    #[test]
    fn unknown_agent_falls_back_to_default() {
        let table = BudgetTable::default();
        assert_eq!(table.resolve("unknown", "default"), Budget::default());
    }

    #[test]
    fn unit_estimate_rounds_up() {
        assert_eq!(estimate_units(""), 0);
        assert_eq!(estimate_units("abc"), 1);
        assert_eq!(estimate_units("abcd"), 1);
        assert_eq!(estimate_units("abcde"), 2);
    }
}
