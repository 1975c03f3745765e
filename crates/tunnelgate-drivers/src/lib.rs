//! Narrow capability interfaces over the external tools the coordinator drives
//!
//! - [`interface`]: the live WireGuard peer table (`wg`)
//! - [`proxy`]: generated reverse-proxy routes and proxy reloads (nginx)
//!
//! Production drivers shell out through [`exec`] with a bounded timeout; the
//! in-memory drivers back the test suites.

pub mod exec;
pub mod interface;
pub mod keys;
pub mod proxy;

pub use exec::{CommandOutput, ExecError};
pub use interface::{
    InterfaceDriver, InterfaceError, LivePeer, MemoryInterfaceDriver, WgCommandDriver,
};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use proxy::{MemoryProxyDriver, NginxDriver, ProxyDriver, ProxyError, RouteSpec};

#[cfg(feature = "mock")]
pub use interface::MockInterfaceDriver;
#[cfg(feature = "mock")]
pub use proxy::MockProxyDriver;
