pub mod attachments;
pub mod backend;
pub mod chat;
pub mod conversation;
pub mod database;
pub mod endpoints;
pub mod events;
pub mod export;
pub mod images;
pub mod pipeline;
pub mod prompts;
pub mod rag;
pub mod session;
pub mod settings;
pub mod speech;
pub mod store;

pub use backend::BackendStore;
pub use conversation::ConversationStore;
pub use database::Database;
pub use endpoints::EndpointRegistry;
pub use events::{ChatEvent, EventSink, Severity};
pub use pipeline::MessagePipeline;
pub use session::ChatSession;
pub use settings::SettingsService;
pub use store::{ConversationRepository, LocalStore, StorageVariant};
