pub mod ber;
pub mod config;
pub mod conn;
pub mod error;
pub mod filter;
pub mod ldap_protocol;
pub mod metrics;
pub mod observer;
pub mod registry;
pub mod tls;
pub mod transport;

pub use ber::Packet;
pub use config::ClientConfig;
pub use conn::{Conn, ConnOptions, PendingResponse, RequestState};
pub use error::{LdapError, Result};
pub use filter::{compile_filter, decompile_filter};
pub use metrics::Metrics;
pub use observer::{NoopObserver, PacketObserver, TracingObserver};
