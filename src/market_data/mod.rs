pub mod series_buffer;
pub mod symbol_filter;
pub mod wire;

pub use series_buffer::SeriesBuffer;
pub use wire::WireEvent;
