//! Authentication: password hashing, token issuance and revocation,
//! verification rate limiting and the HTTP handlers on top of them.

pub mod blacklist;
pub mod extractor;
pub mod handlers;
pub mod password;
pub mod rate_limit;
pub mod service;
pub mod token;

pub use blacklist::{InMemoryBlacklist, RedisBlacklist, TokenBlacklist};
pub use extractor::AuthenticatedUser;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use service::{AuthService, AuthSession, NewRegistration, Registration};
pub use token::{Claims, SignedToken, TokenKind, TokenPair, TokenService};
