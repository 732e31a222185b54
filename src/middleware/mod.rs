mod error_handler;
mod rate_limit;
mod request_id;

pub use error_handler::{log_errors, track_requests};
pub use rate_limit::{
    AdmissionControl, BODY_LIMIT, EXEMPT_PATHS, TenantLookupError, admission, tenant_from_body,
};
pub use request_id::{REQUEST_ID_HEADER, RequestId, request_id};
