pub mod chats;
pub mod dispatch;
pub mod suggestions;

pub use chats::ChatService;
pub use dispatch::{DispatchError, DispatchService};
pub use suggestions::{CycleReport, SuggestionService, ThreadOutcome};
