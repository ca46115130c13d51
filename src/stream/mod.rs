// Streaming session layer - admission, tokens, and event-stream delivery to observers

mod admission;
pub mod http;
mod origin;
mod rate_limit;
mod session;
pub mod token;

pub use admission::{
    AdmissionRequest, Admitted, ConnectionCounters, Gatekeeper, IssuedToken, SessionPermit,
    FALLBACK_SUBJECT,
};
pub use http::{client_ip, router, serve, HttpError, TOKEN_COOKIE};
pub use origin::OriginPolicy;
pub use rate_limit::{RateDecision, RateLimiter, WindowState};
pub use session::{SessionStream, StreamHub};
pub use token::{TokenClaims, TokenSigner, ALL_SCOPE, DEFAULT_SCOPE, TOKEN_VERSION};
