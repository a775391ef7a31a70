pub mod background;
pub mod engine;
pub mod format;
pub mod orchestrator;
pub mod prompts;
pub mod util;

pub use engine::{ActiveSession, Engine};
pub use orchestrator::ChatOptions;
