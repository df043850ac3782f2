//! 辩证评审：记录类型与评审器

pub mod dialectical;
pub mod types;

pub use dialectical::{parse_critique, DialecticalReviewer, ReviewOutcome, ReviewRequest};
pub use types::{Critique, ReviewRecord, ReviewRound, ReviewStatus, Severity, Synthesis};
