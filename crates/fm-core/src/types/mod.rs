//! Core data types: resolutions, candles, trades and shared enums.

pub mod candle;
pub mod enums;
pub mod resolution;
pub mod trade;

pub use candle::*;
pub use enums::*;
pub use resolution::*;
pub use trade::*;
