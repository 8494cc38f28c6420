pub mod anthropic;
pub mod chat;
pub mod collect;
pub mod emit_anthropic;
pub mod emit_openai;
pub mod eventstream;
pub mod model_map;
pub mod notice;
pub mod openai;
pub mod thinking;
pub mod tools;

pub use chat::{ChatExchange, ChatMessage, ImageBlock, Role, ToolResult, ToolSpec, ToolUse};
pub use eventstream::{Frame, FrameDecoder, UpstreamEvent};
pub use thinking::{Channel, TagScanner, ThinkingMode};
