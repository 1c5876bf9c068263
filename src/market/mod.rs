pub mod price;
pub mod spec_cache;

pub use price::{MarketSnapshot, PriceView};
pub use spec_cache::SpecCache;
