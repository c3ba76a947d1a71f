pub mod attachment;
pub mod conversation;
pub mod endpoint;
pub mod message;
pub mod prompt;

pub use attachment::{AttachmentSource, FileAttachment, PendingFile};
pub use conversation::{Conversation, DEFAULT_TITLE};
pub use endpoint::{Endpoint, EndpointUpdate, NewEndpoint, ProviderKind, RagSettings};
pub use message::{Message, MessageVersion, Role};
pub use prompt::SavedPrompt;
