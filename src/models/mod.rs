//! Data models and types used throughout labflash

pub mod artifact;
pub mod build;
pub mod device;
pub mod flash;
pub mod port;
pub mod responses;
pub mod stream;

// Re-export commonly used types
pub use artifact::*;
pub use build::*;
pub use device::*;
pub use flash::*;
pub use port::*;
pub use responses::*;
pub use stream::*;
