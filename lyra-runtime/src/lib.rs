//!
//! The GPU runtime facade.
//!
//! The instrumentation core talks to the GPU runtime exclusively through
//! the trait objects in this crate, captured as an immutable API-table
//! snapshot at tool-configure time. The interception layer that produces
//! the snapshot is an external collaborator; the `host` module provides an
//! in-process implementation that loads code objects into host memory for
//! embedders and tests. Nothing in this crate executes GPU code.
//!

pub mod api;
pub mod error;
pub mod events;
pub mod handle;
pub mod host;
pub mod packet;

pub use self::api::ApiTable;
pub use self::api::CoreApi;
pub use self::api::LoaderApi;
pub use self::error::RuntimeError;
pub use self::events::RuntimeEventObserver;
pub use self::events::RuntimeEvents;
pub use self::handle::Agent;
pub use self::handle::ExecutableHandle;
pub use self::handle::ExecutableSymbolHandle;
pub use self::handle::LoadedCodeObjectHandle;
pub use self::host::HostRuntime;
pub use self::packet::AqlDispatchPacket;
