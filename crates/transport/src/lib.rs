//! Remote blob transport.
//!
//! The sync pipelines only ever see [`RemoteTransport`]: store a payload,
//! fetch it back by locator, delete it. Implementations classify every
//! failure into [`ErrorKind`] and expose a cooperative rate-limit hint; they
//! never queue or retry on their own.
//!
//! - [`TelegramTransport`] stores chunks as documents in a Telegram chat.
//! - [`MemoryTransport`] keeps chunks in process, with fault injection for
//!   tests.

pub mod error;
pub mod memory;
pub mod rate;
pub mod telegram;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use televault_types::{Digest, RemoteLocator};

pub use error::{ErrorKind, TransportError};
pub use memory::MemoryTransport;
pub use rate::RateWindow;
pub use telegram::{BotIdentity, TelegramConfig, TelegramTransport};

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Uniform interface over the remote platform's send/fetch primitives.
///
/// Each call is one attempt with its own internal timeout. Using a trait
/// keeps the pipelines independent of the platform and testable with
/// [`MemoryTransport`].
pub trait RemoteTransport: Send + Sync {
    /// Stores `payload` (whose digest is `digest`) and returns its locator.
    fn put<'a>(&'a self, digest: &'a Digest, payload: &'a [u8])
    -> TransportFuture<'a, RemoteLocator>;

    /// Fetches the payload behind `locator`.
    fn get<'a>(&'a self, locator: &'a RemoteLocator) -> TransportFuture<'a, Vec<u8>>;

    /// Removes the payload behind `locator` from the remote.
    fn delete<'a>(&'a self, locator: &'a RemoteLocator) -> TransportFuture<'a, ()>;

    /// How long callers should wait before issuing their next request.
    fn next_available_slot(&self) -> Duration;

    /// Largest payload `put` and `get` can handle.
    fn max_payload_size(&self) -> usize;
}
