pub mod application;
pub mod change;
pub mod label;
pub mod node;
pub mod role;
pub mod user;

pub use application::{
    Application, ApplicationResource, ApplicationState, ApplicationStatus, ApplicationTask,
};
pub use change::{ChangeEvent, ChangeKind, ObjectKind};
pub use label::Label;
pub use node::Node;
pub use role::{Permission, Role};
pub use user::{User, UserConfig};
