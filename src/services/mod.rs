pub mod application_service;
pub mod label_service;
pub mod node_service;
pub mod role_service;
pub mod token_service;
pub mod user_service;

pub use application_service::ApplicationService;
pub use label_service::LabelService;
pub use node_service::NodeService;
pub use role_service::RoleService;
pub use token_service::TokenService;
pub use user_service::UserService;
