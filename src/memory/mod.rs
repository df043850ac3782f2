//! 记忆层：Token 预算、上下文组装（裁剪）、知识库与分词

pub mod context;
pub mod knowledge;
pub mod token_budget;
pub mod tokenizer;

pub use context::{ContextAssembler, ContextBundle, ContextFragment, PriorityTag};
pub use knowledge::KnowledgeBase;
pub use token_budget::{
    BudgetError, BudgetScope, Reservation, ReserveDecision, TokenBudgetManager, TokenEstimator,
    TokenLedger,
};
