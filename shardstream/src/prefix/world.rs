//! Process-group topology.

use std::env;

use crate::config::ConfigError;

/// Where this process sits in its process group.
///
/// Ranks are laid out node by node: ranks `0..ranks_per_node` run on the
/// first machine, and so on. The lowest rank of each machine is its local
/// leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct World {
    rank: usize,
    num_ranks: usize,
    ranks_per_node: usize,
}

impl World {
    /// A single process on a single machine.
    pub const SINGLE: World = World {
        rank: 0,
        num_ranks: 1,
        ranks_per_node: 1,
    };

    pub fn new(rank: usize, num_ranks: usize, ranks_per_node: usize) -> Result<Self, ConfigError> {
        if num_ranks == 0 || ranks_per_node == 0 {
            return Err(ConfigError::InvalidTopology(
                "world size and ranks per node must be positive".to_string(),
            ));
        }
        if rank >= num_ranks {
            return Err(ConfigError::InvalidTopology(format!(
                "rank {} is outside a world of {}",
                rank, num_ranks
            )));
        }
        if num_ranks % ranks_per_node != 0 {
            return Err(ConfigError::InvalidTopology(format!(
                "world size {} is not a multiple of {} ranks per node",
                num_ranks, ranks_per_node
            )));
        }
        Ok(Self {
            rank,
            num_ranks,
            ranks_per_node,
        })
    }

    /// Read `RANK`, `WORLD_SIZE` and `LOCAL_WORLD_SIZE`, defaulting to a
    /// single process.
    pub fn from_env() -> Result<Self, ConfigError> {
        let rank = env_usize("RANK")?.unwrap_or(0);
        let num_ranks = env_usize("WORLD_SIZE")?.unwrap_or(1);
        let ranks_per_node = env_usize("LOCAL_WORLD_SIZE")?.unwrap_or(num_ranks);
        Self::new(rank, num_ranks, ranks_per_node)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    pub fn ranks_per_node(&self) -> usize {
        self.ranks_per_node
    }

    pub fn num_nodes(&self) -> usize {
        self.num_ranks / self.ranks_per_node
    }

    pub fn node(&self) -> usize {
        self.rank / self.ranks_per_node
    }

    pub fn is_local_leader(&self) -> bool {
        self.rank % self.ranks_per_node == 0
    }
}

impl Default for World {
    fn default() -> Self {
        Self::SINGLE
    }
}

fn env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("'{}' is not a non-negative integer", value),
            }),
        Err(_) => Ok(None),
    }
}
