use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// 允许的消息角色
pub const ROLES: &[&str] = &["user", "assistant", "system"];

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub tenant_id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl CreateMessageRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.tenant_id.trim().is_empty() {
            return Err(AppError::Validation("tenant_id must not be empty".to_string()));
        }
        if self.conversation_id.trim().is_empty() {
            return Err(AppError::Validation(
                "conversation_id must not be empty".to_string(),
            ));
        }
        if !ROLES.contains(&self.role.as_str()) {
            return Err(AppError::Validation(format!(
                "role must be one of: {}",
                ROLES.join(", ")
            )));
        }
        if self.content.trim().is_empty() {
            return Err(AppError::Validation("content must not be empty".to_string()));
        }
        if let Some(metadata) = &self.metadata {
            if !metadata.is_object() {
                return Err(AppError::Validation("metadata must be an object".to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub conversation_id: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct MessageList<T> {
    pub total: usize,
    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(role: &str, content: &str) -> CreateMessageRequest {
        CreateMessageRequest {
            tenant_id: "t".to_string(),
            conversation_id: "c".to_string(),
            role: role.to_string(),
            content: content.to_string(),
            metadata: None,
        }
    }

    #[test]
    fn rejects_unknown_role_and_blank_content() {
        assert!(request("user", "hi").validate().is_ok());
        assert!(matches!(request("robot", "hi").validate(), Err(AppError::Validation(_))));
        assert!(matches!(request("user", "  ").validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn metadata_must_be_object() {
        let mut req = request("user", "hi");
        req.metadata = Some(serde_json::json!([1, 2]));
        assert!(req.validate().is_err());
        req.metadata = Some(serde_json::json!({"source": "chat"}));
        assert!(req.validate().is_ok());
    }
}
