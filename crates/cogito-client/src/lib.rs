pub mod inflight;
pub mod orchestrator;
pub mod prompt;
pub mod retry;
pub mod transport;

pub use orchestrator::{
    CacheStatsReport, ClientConfig, ContractCaches, Conversation, Orchestrator,
    DEFAULT_MAX_TOKENS, DEFAULT_MODEL,
};
pub use retry::{CancelToken, RetryPolicy, Sleeper, TokenSleeper};
pub use transport::{
    HttpSettings, HttpTransport, Message, MessagesRequest, MessagesResponse, Transport,
    DEFAULT_ANTHROPIC_VERSION, DEFAULT_BASE_URL,
};
