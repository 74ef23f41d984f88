pub mod priority;
pub mod queue;

pub use priority::{NeutralPriority, PriorityContext, PriorityPolicy, RecentEditBoost};
pub use queue::{run_embedding_batch, DrainReport, EmbeddingQueue, Embedder};
