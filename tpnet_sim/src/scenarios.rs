//! Simulation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: observers join, one player discovers a node
    FirstContact,

    /// SIM-002: lossy links, then a full resync
    LossyResync,

    /// SIM-003: one observer partitioned away during changes
    PartitionHeal,

    /// SIM-004: legacy save loaded, replicated and rewritten
    LegacyMigration,

    /// SIM-005: jumps with exhausted stability land displaced
    UnstableJump,

    /// SIM-006: renames honour land claims
    ClaimEnforcement,
}

impl ScenarioId {
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::FirstContact,
            ScenarioId::LossyResync,
            ScenarioId::PartitionHeal,
            ScenarioId::LegacyMigration,
            ScenarioId::UnstableJump,
            ScenarioId::ClaimEnforcement,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::FirstContact => "first_contact",
            ScenarioId::LossyResync => "lossy_resync",
            ScenarioId::PartitionHeal => "partition_heal",
            ScenarioId::LegacyMigration => "legacy_migration",
            ScenarioId::UnstableJump => "unstable_jump",
            ScenarioId::ClaimEnforcement => "claim_enforcement",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::FirstContact => "Observers join a populated network; a player holds a pad until the choice opens",
            ScenarioId::LossyResync => "30% loss towards observers during churn, then full resync",
            ScenarioId::PartitionHeal => "One observer partitioned during renames and removals, healed and resynced",
            ScenarioId::LegacyMigration => "Legacy save blob loaded, replicated, saved in the current format",
            ScenarioId::UnstableJump => "Player with 0.2 stability jumps at cost 0.3 and lands displaced",
            ScenarioId::ClaimEnforcement => "Rename by a non-owner is dropped; the owner's rename replicates",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first_contact" | "firstcontact" | "sim-001" => Ok(ScenarioId::FirstContact),
            "lossy_resync" | "lossyresync" | "sim-002" => Ok(ScenarioId::LossyResync),
            "partition_heal" | "partitionheal" | "sim-003" => Ok(ScenarioId::PartitionHeal),
            "legacy_migration" | "legacymigration" | "sim-004" => Ok(ScenarioId::LegacyMigration),
            "unstable_jump" | "unstablejump" | "sim-005" => Ok(ScenarioId::UnstableJump),
            "claim_enforcement" | "claimenforcement" | "sim-006" => Ok(ScenarioId::ClaimEnforcement),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
