pub mod frame;
pub mod synthetic;

pub use frame::Frame;
pub use frame::Image;
pub use frame::PixelFormat;
pub use synthetic::SyntheticSensor;
