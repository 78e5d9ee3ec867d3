//! The secure peer as seen from behind either transport.
//!
//! Both transports decode their native parameter layout back into [`Param`]
//! before handing a request to the [`SecurePeer`], so a peer implementation
//! never knows which client library was used.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use tnpu_chip::ta::MAX_PARAMS;

/// One invoke parameter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Param {
    /// Unused slot
    #[default]
    None,
    /// Two input words
    ValueIn {
        /// First word
        a: u32,
        /// Second word
        b: u32,
    },
    /// Two output words, filled by the peer
    ValueOut {
        /// First word
        a: u32,
        /// Second word
        b: u32,
    },
    /// Read-only shared-memory block
    MemrefIn(Bytes),
}

impl Param {
    /// Output slot with both words cleared.
    pub const fn output() -> Self {
        Self::ValueOut { a: 0, b: 0 }
    }

    /// Words of a value parameter, input or output.
    pub fn values(&self) -> Option<(u32, u32)> {
        match *self {
            Self::ValueIn { a, b } | Self::ValueOut { a, b } => Some((a, b)),
            _ => None,
        }
    }

    /// Contents of a memref parameter.
    pub fn memref(&self) -> Option<&Bytes> {
        match self {
            Self::MemrefIn(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Parameter slots of one invoke.
pub type Params = [Param; MAX_PARAMS];

/// A Trusted Application reachable through a transport.
pub trait SecurePeer: Debug + Send + Sync {
    /// Open a session; returns the session id or a result code.
    ///
    /// # Errors
    ///
    /// Returns the peer's result code when the session is refused.
    fn open_session(&self, uuid: &[u8; 16], params: &mut Params) -> Result<u32, u32>;

    /// Run command `func` on `session`, writing `ValueOut` slots in place.
    /// Returns the result code.
    fn invoke(&self, session: u32, func: u32, params: &mut Params) -> u32;

    /// Close a session. Unknown sessions are ignored.
    fn close_session(&self, session: u32);
}

/// One call observed by a [`RecordingPeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    /// Session open with its parameters
    Open(Params),
    /// Command invoke with its parameters as received
    Invoke {
        /// Command id
        func: u32,
        /// Parameters before the peer ran
        params: Params,
    },
    /// Session close
    Close,
}

/// Pass-through peer that records every request it forwards.
#[derive(Debug)]
pub struct RecordingPeer {
    inner: Arc<dyn SecurePeer>,
    calls: Mutex<Vec<PeerCall>>,
}

impl RecordingPeer {
    /// Record requests on their way to `inner`.
    pub fn new(inner: Arc<dyn SecurePeer>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    /// Forget the recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl SecurePeer for RecordingPeer {
    fn open_session(&self, uuid: &[u8; 16], params: &mut Params) -> Result<u32, u32> {
        self.calls.lock().push(PeerCall::Open(params.clone()));
        self.inner.open_session(uuid, params)
    }

    fn invoke(&self, session: u32, func: u32, params: &mut Params) -> u32 {
        self.calls.lock().push(PeerCall::Invoke {
            func,
            params: params.clone(),
        });
        self.inner.invoke(session, func, params)
    }

    fn close_session(&self, session: u32) {
        self.calls.lock().push(PeerCall::Close);
        self.inner.close_session(session);
    }
}
