pub mod client;
pub mod error;
pub mod market_cache;
pub mod rate_limit;

pub use client::{ExchangeClient, OrderRequest, OrderResponse};
pub use error::ExchangeError;
pub use market_cache::MarketCache;
