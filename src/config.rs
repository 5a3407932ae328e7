//! Configuration recognized by the adapt control plane.

use serde::{Deserialize, Serialize};

/// Settings for the adapt phase. Loadable from RON through serde, or built
/// in code; unspecified fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmrConfig {
    /// Upper bound on refinement level. Zero disables refinement entirely.
    pub mesh_max_level: i32,
    /// The adapt phase runs on cycles divisible by this interval. Zero
    /// disables adaptation.
    pub mesh_adapt_interval: u32,
    /// Cycle on which the simulation starts. On this cycle leaves may only
    /// refine, and the adapt loop repeats up to `mesh_max_level` times to
    /// grow the initial hierarchy.
    pub initial_cycle: u32,
}

impl AmrConfig {
    /// Whether the adapt phase should run on the given cycle.
    pub fn do_adapt(&self, cycle: u32) -> bool {
        self.mesh_adapt_interval > 0 && cycle % self.mesh_adapt_interval == 0
    }

    /// Whether the given cycle is the simulation's first.
    pub fn is_first_cycle(&self, cycle: u32) -> bool {
        cycle == self.initial_cycle
    }
}

impl Default for AmrConfig {
    fn default() -> Self {
        Self {
            mesh_max_level: 0,
            mesh_adapt_interval: 1,
            initial_cycle: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapt_gating() {
        let config = AmrConfig {
            mesh_adapt_interval: 3,
            ..Default::default()
        };

        assert!(config.do_adapt(0));
        assert!(!config.do_adapt(1));
        assert!(config.do_adapt(6));

        let disabled = AmrConfig {
            mesh_adapt_interval: 0,
            ..Default::default()
        };

        assert!(!disabled.do_adapt(0));
    }

    #[test]
    fn parse_partial_ron() -> eyre::Result<()> {
        let config: AmrConfig = ron::from_str("(mesh_max_level: 4)")?;

        assert_eq!(config.mesh_max_level, 4);
        assert_eq!(config.mesh_adapt_interval, 1);
        assert_eq!(config.initial_cycle, 0);

        Ok(())
    }
}
