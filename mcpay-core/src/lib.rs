pub mod config;
pub mod error;
pub mod model;

pub use config::McpayConfig;
pub use error::McpayError;
pub use model::{
    AuthMethod, CacheEntry, Network, PaymentRecord, PaymentStatus, PricingEntry, RegisteredServer,
    ServerStatus, TokenBucket, Tool, ToolCall, UsageEvent, User,
};
