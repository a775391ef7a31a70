pub mod local;
pub mod provider;
pub mod remote;
pub mod roles;
pub mod stream;

pub use provider::{ChatRequest, LlmProvider, Message, ProviderError, Role};
pub use roles::{RoleClient, RoleSet};
pub use stream::StreamEvent;
