pub mod app;
pub mod format;
pub mod panel;
pub mod poller;

mod error;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
