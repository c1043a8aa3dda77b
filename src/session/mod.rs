pub mod chat;
pub mod observer;
pub mod stream;

pub use chat::{ChatCommand, ChatSession};
pub use stream::StreamSession;
