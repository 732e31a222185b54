mod handler;
mod model;

pub use handler::{create_message, get_message, list_tenant_messages};
pub use model::{CreateMessageRequest, ROLES};
