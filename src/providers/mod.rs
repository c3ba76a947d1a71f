pub mod offline;
pub mod openai;
pub mod router;
pub mod traits;
pub mod types;

pub use router::ProviderRouter;
pub use traits::CompletionProvider;
pub use types::{ChatMessage, ChatRequest, ChatResponse, ProviderError, StreamEvent};
