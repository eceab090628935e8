//! Outbound HTTP gateway for sandboxed guests.
//!
//! Every request passes admission control (rate pool, concurrency cap and a
//! bounded wait queue) and destination policy (domain patterns, CIDR masks,
//! resolved addresses) before the injected [`Transport`] is allowed to open a
//! connection. Responses are shaped into text, JSON, bytes or form entries.

mod abort;
pub mod admission;
pub mod error;
pub mod form;
mod gateway;
pub mod net;
pub mod request;
pub mod response;
pub mod transport;

pub const TRACE_TARGET_FETCH: &str = "egress::fetch";

pub use abort::{AbortController, AbortReason, AbortSignal};
pub use admission::{AdmissionController, AdmissionLimits, AdmissionSnapshot, Permit, RateLimit};
pub use error::{BoxError, ContentLengthError, Error, ErrorKind, Limit, Result};
pub use form::{FileEntry, FormEntry, FormValue};
pub use gateway::{Gateway, GatewayBuilder, StaticHeaders};
pub use net::{
    AddressPolicy, AddressPolicyBuilder, BlockReason, DomainPattern, Resolver, TokioResolver,
    resolver_fn,
};
pub use request::{
    CredentialsPolicy, FetchParams, RedirectPolicy, RequestBody, RequestMode, ResponseType,
};
pub use response::{Body, FetchResult};
pub use transport::{Transport, TransportRequest, TransportResponse, transport_fn};
#[cfg(feature = "reqwest")]
pub use transport::{ReqwestTransport, ResponseTooLarge};
