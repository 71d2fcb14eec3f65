use std::fmt;

use serde::{Deserialize, Serialize};

/// Typed steps of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Reads,
    FilteredReads,
    Alignment,
    VariantCalls,
    Protein,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Reads,
        StageKind::FilteredReads,
        StageKind::Alignment,
        StageKind::VariantCalls,
        StageKind::Protein,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Reads => "reads",
            StageKind::FilteredReads => "filtered_reads",
            StageKind::Alignment => "alignment",
            StageKind::VariantCalls => "variant_calls",
            StageKind::Protein => "protein",
        }
    }

    pub fn previous(&self) -> Option<StageKind> {
        match self {
            StageKind::Reads => None,
            StageKind::FilteredReads => Some(StageKind::Reads),
            StageKind::Alignment => Some(StageKind::FilteredReads),
            StageKind::VariantCalls => Some(StageKind::Alignment),
            StageKind::Protein => Some(StageKind::VariantCalls),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic type of a file attached to a stage entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileRole {
    Read1,
    Read2,
    Report,
    Intermediate,
    Primary,
    Index,
    Genes,
}

impl FileRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileRole::Read1 => "read1",
            FileRole::Read2 => "read2",
            FileRole::Report => "report",
            FileRole::Intermediate => "intermediate",
            FileRole::Primary => "primary",
            FileRole::Index => "index",
            FileRole::Genes => "genes",
        }
    }
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Mate {
    R1,
    R2,
}

impl Mate {
    /// Only the bare tokens `1` and `2` name a mate.
    pub fn from_token(token: &str) -> Option<Mate> {
        match token {
            "1" => Some(Mate::R1),
            "2" => Some(Mate::R2),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Mate::R1 => "1",
            Mate::R2 => "2",
        }
    }

    pub fn role(&self) -> FileRole {
        match self {
            Mate::R1 => FileRole::Read1,
            Mate::R2 => FileRole::Read2,
        }
    }
}

impl fmt::Display for Mate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}
