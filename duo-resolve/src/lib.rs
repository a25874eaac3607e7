//! duo-resolve - address resolution for dual-stack sockets
//!
//! Turns the strings a socket owner hands over into socket addresses:
//! - host names and literals (`lookup_host`), split by family so both can
//!   be raced at connect time
//! - interface descriptors (`resolve_interface`): `"en0"`, `"lo:8080"`,
//!   `"192.168.1.4"`, `"[fe80::1]:53"`, `"localhost"`
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> duo_resolve::Result<()> {
//! let resolved = duo_resolve::lookup_host("example.com", 443).await?;
//! if let Some(v6) = resolved.first_v6() {
//!     println!("IPv6 candidate: {}", v6);
//! }
//!
//! let local = duo_resolve::resolve_interface("localhost:0", 0)?;
//! assert!(local.v4.is_some());
//! # Ok(())
//! # }
//! ```

pub mod error;
mod interface;
mod lookup;

pub use error::{Error, Result};
pub use interface::{
    interfaces, resolve_interface, split_descriptor, InterfaceAddresses, InterfaceInfo,
};
pub use lookup::{any_addresses, loopback_addresses, lookup_host, numeric_host, ResolvedAddresses};
