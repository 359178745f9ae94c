pub mod candle_cache;
pub mod ticker_feed;

// Re-export for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_cache::{Candle, CandleCache, CandleKey};
pub use ticker_feed::TickerFeed;
