//! Sector identity and the vocabulary of sealing tasks.

use std::fmt;

use serde::{Deserialize, Serialize};

pub type ActorId = u64;
pub type SectorNumber = u64;

/// A sector, identified by the miner that owns it and its number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectorId {
    pub miner: ActorId,
    pub number: SectorNumber,
}

impl SectorId {
    pub fn new(miner: ActorId, number: SectorNumber) -> Self {
        Self { miner, number }
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-t0{}-{}", self.miner, self.number)
    }
}

/// Proof variant a sector is sealed with. Determines the sector size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisteredSealProof {
    StackedDrg2KiBV1_1,
    StackedDrg8MiBV1_1,
    StackedDrg512MiBV1_1,
    StackedDrg32GiBV1_1,
    StackedDrg64GiBV1_1,
}

impl RegisteredSealProof {
    pub fn sector_size(&self) -> u64 {
        match self {
            RegisteredSealProof::StackedDrg2KiBV1_1 => 2 << 10,
            RegisteredSealProof::StackedDrg8MiBV1_1 => 8 << 20,
            RegisteredSealProof::StackedDrg512MiBV1_1 => 512 << 20,
            RegisteredSealProof::StackedDrg32GiBV1_1 => 32 << 30,
            RegisteredSealProof::StackedDrg64GiBV1_1 => 64 << 30,
        }
    }
}

/// Reference to a sector together with its proof variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorRef {
    pub id: SectorId,
    pub proof_type: RegisteredSealProof,
}

impl SectorRef {
    pub fn new(id: SectorId, proof_type: RegisteredSealProof) -> Self {
        Self { id, proof_type }
    }
}

/// One stage of the sealing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskType {
    AddPiece,
    PreCommit1,
    PreCommit2,
    Commit1,
    Commit2,
    Finalize,
    Fetch,
    Unseal,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        TaskType::AddPiece,
        TaskType::PreCommit1,
        TaskType::PreCommit2,
        TaskType::Commit1,
        TaskType::Commit2,
        TaskType::Finalize,
        TaskType::Fetch,
        TaskType::Unseal,
    ];

    pub fn short(&self) -> &'static str {
        match self {
            TaskType::AddPiece => "AP",
            TaskType::PreCommit1 => "PC1",
            TaskType::PreCommit2 => "PC2",
            TaskType::Commit1 => "C1",
            TaskType::Commit2 => "C2",
            TaskType::Finalize => "FIN",
            TaskType::Fetch => "GET",
            TaskType::Unseal => "UNS",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::AddPiece => "seal/v0/addpiece",
            TaskType::PreCommit1 => "seal/v0/precommit/1",
            TaskType::PreCommit2 => "seal/v0/precommit/2",
            TaskType::Commit1 => "seal/v0/commit/1",
            TaskType::Commit2 => "seal/v0/commit/2",
            TaskType::Finalize => "seal/v0/finalize",
            TaskType::Fetch => "seal/v0/fetch",
            TaskType::Unseal => "seal/v0/unseal",
        };
        write!(f, "{}", name)
    }
}

/// A task type bound to a proof variant; the unit resource requirements are keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SealTaskType {
    pub task_type: TaskType,
    pub proof: RegisteredSealProof,
}

/// Kind of file a sector has on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectorFileType {
    Unsealed,
    Sealed,
    Cache,
}

/// What a storage path is being chosen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathType {
    Sealing,
    Storage,
}
