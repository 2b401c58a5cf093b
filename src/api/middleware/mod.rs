pub mod admin_auth;
pub mod trace_id;

pub use admin_auth::AdminContext;
pub use trace_id::{trace_id_middleware, TraceId, TRACE_ID_HEADER};
