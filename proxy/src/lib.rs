//! LDAP-Proxy library

pub mod config;
pub mod error;
pub mod frontend;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod otp;
pub mod proto;
pub mod registry;
pub mod relay;
pub mod reshape;
pub mod selection;
pub mod session;
pub mod store;
pub mod upstream;

// Re-export commonly used types
pub use config::Config;
pub use error::{ConfigError, RelayError, RelayResult};
pub use handler::{Group, Handler, HandlerChain, User, UserLookup};
pub use metrics::Metrics;
pub use proto::{Attribute, Entry, ResultCode, SearchRequest, SearchResult};
pub use registry::{Endpoint, Registry, Scheme, Status};
pub use relay::{LdapRelay, RelaySettings};
pub use session::{ClientConn, SessionPool};
pub use store::ConfigUserStore;
pub use upstream::{Connector, Ldap3Connector, UpstreamConnection, UpstreamSearch};
