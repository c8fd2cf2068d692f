pub mod connection;
pub mod frames;
pub mod permission_cache;
pub mod registry;
pub mod sink;
pub mod subscription;

pub use connection::run_connection;
pub use permission_cache::PermissionCache;
pub use registry::{StreamClass, StreamHandle, StreamRegistry};
pub use sink::FrameSink;
pub use subscription::run_subscription;
