//! Rank fusion of already-retrieved result lists.

pub mod rrf;

pub use rrf::{
    merge, top_hits, FusedResult, FusionDiagnostics, FusionOutcome, RankSource, RankedHit,
};
