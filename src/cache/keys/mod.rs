/// 缓存键模块
/// 检索结果与向量的指纹键生成
use sha2::{Digest, Sha256};

/// 检索缓存键前缀
const SEARCH_PREFIX: &str = "search:";

/// 向量缓存键前缀
const EMBEDDING_PREFIX: &str = "embedding:";

/// 未指定会话时的通配符
pub const ANY_CONVERSATION: &str = "*";

/// 限流计数键前缀（共享存储）
pub const RATE_LIMIT_PREFIX: &str = "memory-mesh:ratelimit";

/// 共享缓存键前缀
pub const CACHE_PREFIX: &str = "memory-mesh:cache";

fn sha256_hex(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

/// 生成检索缓存键
///
/// 摘要覆盖租户、会话、top_k、候选数与查询原文；键本身保留租户和会话前缀，
/// 失效时按前缀删除即可，无需解析摘要。
pub fn search_key(
    tenant_id: &str,
    conversation_id: Option<&str>,
    query: &str,
    top_k: u32,
    candidate_limit: u32,
) -> String {
    let conversation = conversation_id.unwrap_or(ANY_CONVERSATION);
    let raw = [
        tenant_id,
        conversation,
        &top_k.to_string(),
        &candidate_limit.to_string(),
        query,
    ]
    .join("|");
    format!(
        "{}{}:{}:{}",
        SEARCH_PREFIX,
        tenant_id,
        conversation,
        sha256_hex(&raw)
    )
}

/// 租户下全部检索缓存的前缀
pub fn tenant_search_prefix(tenant_id: &str) -> String {
    format!("{}{}:", SEARCH_PREFIX, tenant_id)
}

/// 单个会话范围（`None` 为跨会话检索）的检索缓存前缀
pub fn scope_search_prefix(tenant_id: &str, conversation_id: Option<&str>) -> String {
    format!(
        "{}{}:",
        tenant_search_prefix(tenant_id),
        conversation_id.unwrap_or(ANY_CONVERSATION)
    )
}

/// 生成向量缓存键（按内容寻址，跨租户共享）
pub fn embedding_key(text: &str) -> String {
    format!("{}{}", EMBEDDING_PREFIX, sha256_hex(text))
}

/// 限流计数键
pub fn rate_limit_key(amount: u64, window_seconds: u64, identifier: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        RATE_LIMIT_PREFIX, amount, window_seconds, identifier
    )
}
