pub mod auth;
pub mod rate_limit;
pub mod rbac;
pub mod request_id;
pub mod yaml_body;

pub use auth::{auth_middleware, user_rate_limit};
pub use rate_limit::{AddrRateLimiter, UserRateLimiter};
pub use rbac::rbac_middleware;
pub use request_id::request_id_middleware;
pub use yaml_body::yaml_body_middleware;
