pub mod memory;
pub mod mirror;
pub mod transport;

pub use memory::{ScriptedResult, ScriptedTransport, StaticAccounts};
pub use mirror::MirrorTransport;
pub use transport::{
    progress_channel, AccountResolver, ProgressListener, Transport, TransportContext,
    TransportError,
};
