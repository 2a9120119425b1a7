pub mod chat_completions;
pub mod count_tokens;
pub mod messages;

pub use chat_completions::chat_completions;
pub use count_tokens::count_tokens;
pub use messages::{messages, unified};
