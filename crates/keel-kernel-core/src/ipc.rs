//! IPC message buffers and the per-thread IPC state machine
//!
//! Every thread owns one [`IpcNode`] holding an outgoing and an incoming
//! [`MsgBuf`]. The node tracks both roles a thread can play:
//!
//! ```text
//!   client:  Idle ──call──▶ Sending ──accepted──▶ AwaitingReply ──reply──▶ Idle
//!                              └──────────── cancel ───────────────────────▶ Idle
//!
//!   server:  Idle ──wait──▶ AwaitingRequest ──request──▶ Processing
//!                 ▲                                         │ reply
//!                 └──────────── ReplyPending ◀──────────────┘
//! ```
//!
//! The transitions here are pure bookkeeping. Moving data between threads,
//! translating capabilities and blocking/unblocking in the scheduler is the
//! kernel's job; it drives these transitions at its suspension points.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::types::{Badge, CapId, JobId};

/// Maximum payload size in bytes
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Maximum capabilities carried by one message
pub const MAX_CAPS_PER_MESSAGE: usize = 4;

/// Errors surfaced by IPC operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum IpcError {
    /// The blocking operation was aborted by the kernel or the peer
    #[error("ipc cancelled")]
    Cancelled,
    /// Not enough kernel metadata to receive the expected capabilities
    #[error("out of ipc metadata")]
    OutOfMetadata,
    /// Destination capability does not name a thread
    #[error("invalid ipc destination")]
    InvalidDestination,
    /// A capability in the message is not held by the sender
    #[error("invalid capability in message")]
    InvalidCapability,
    /// Payload exceeds `MAX_MESSAGE_SIZE`
    #[error("message too large")]
    MessageTooLarge,
    /// More than `MAX_CAPS_PER_MESSAGE` capabilities
    #[error("too many capabilities")]
    TooManyCaps,
    /// Read past the end of the message
    #[error("message buffer underrun")]
    BufferUnderrun,
    /// Operation not allowed in the thread's current IPC state
    #[error("invalid ipc state")]
    InvalidState,
}

// ============================================================================
// Message buffer
// ============================================================================

/// In-place message buffer with read/write cursors.
///
/// Capability slots hold ids in the owner's capability space. After receipt
/// a slot is `None` when the kernel could not deliver that capability.
#[derive(Clone, Debug, Default)]
pub struct MsgBuf {
    data: Vec<u8>,
    read_pos: usize,
    caps: [Option<CapId>; MAX_CAPS_PER_MESSAGE],
    cap_count: usize,
    cap_read: usize,
}

impl MsgBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message with `bytes` as payload.
    pub fn with_data(bytes: &[u8]) -> Result<Self, IpcError> {
        let mut msg = Self::new();
        msg.write_bytes(bytes)?;
        Ok(msg)
    }

    /// Empty the buffer and rewind both cursors.
    pub fn reset(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.caps = [None; MAX_CAPS_PER_MESSAGE];
        self.cap_count = 0;
        self.cap_read = 0;
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), IpcError> {
        if self.data.len() + bytes.len() > MAX_MESSAGE_SIZE {
            return Err(IpcError::MessageTooLarge);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append one little-endian word.
    pub fn write_u64(&mut self, word: u64) -> Result<(), IpcError> {
        self.write_bytes(&word.to_le_bytes())
    }

    /// Consume `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8], IpcError> {
        let end = self
            .read_pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(IpcError::BufferUnderrun)?;
        let start = self.read_pos;
        self.read_pos = end;
        Ok(&self.data[start..end])
    }

    /// Consume one little-endian word.
    pub fn read_u64(&mut self) -> Result<u64, IpcError> {
        let bytes = self.read_bytes(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    /// Append a capability slot.
    pub fn insert_cap(&mut self, id: CapId) -> Result<(), IpcError> {
        self.push_slot(Some(id))
    }

    /// Append a slot marking a capability that could not be delivered.
    pub fn insert_invalid_cap(&mut self) -> Result<(), IpcError> {
        self.push_slot(None)
    }

    fn push_slot(&mut self, slot: Option<CapId>) -> Result<(), IpcError> {
        if self.cap_count == MAX_CAPS_PER_MESSAGE {
            return Err(IpcError::TooManyCaps);
        }
        self.caps[self.cap_count] = slot;
        self.cap_count += 1;
        Ok(())
    }

    /// Consume the next capability slot.
    pub fn read_cap(&mut self) -> Result<Option<CapId>, IpcError> {
        if self.cap_read >= self.cap_count {
            return Err(IpcError::BufferUnderrun);
        }
        let slot = self.caps[self.cap_read];
        self.cap_read += 1;
        Ok(slot)
    }

    /// Whole payload, independent of the read cursor.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Capability slots in insertion order.
    pub fn cap_slots(&self) -> &[Option<CapId>] {
        &self.caps[..self.cap_count]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ============================================================================
// Per-thread state machine
// ============================================================================

/// Client role state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Idle,
    /// Request queued at a server that has not accepted it yet
    Sending,
    /// Server accepted the request; waiting for its reply
    AwaitingReply,
}

/// Server role state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    Idle,
    AwaitingRequest,
    /// A request was delivered and its caller awaits the reply
    Processing,
    /// The reply is being delivered to the caller
    ReplyPending,
}

/// What a blocked thread finds when it resumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    /// Reply to this thread's call, in the incoming buffer
    Reply,
    /// New request, in the incoming buffer
    Request { badge: Badge },
}

/// IPC bookkeeping of one thread.
#[derive(Debug)]
pub struct IpcNode {
    client: ClientState,
    server: ServerState,
    /// Server this thread called
    callee: Option<JobId>,
    /// Client owed a reply
    caller: Option<JobId>,
    /// Clients whose requests wait for this thread to accept them
    queue: VecDeque<JobId>,
    /// Metadata reserved for capabilities expected by the pending call
    reserved: usize,
    outcome: Option<Result<Delivery, IpcError>>,
    /// Outgoing message
    pub out: MsgBuf,
    /// Incoming message
    pub inbuf: MsgBuf,
}

impl Default for IpcNode {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcNode {
    pub fn new() -> Self {
        Self {
            client: ClientState::Idle,
            server: ServerState::Idle,
            callee: None,
            caller: None,
            queue: VecDeque::new(),
            reserved: 0,
            outcome: None,
            out: MsgBuf::new(),
            inbuf: MsgBuf::new(),
        }
    }

    pub fn client_state(&self) -> ClientState {
        self.client
    }

    pub fn server_state(&self) -> ServerState {
        self.server
    }

    pub fn callee(&self) -> Option<JobId> {
        self.callee
    }

    pub fn caller(&self) -> Option<JobId> {
        self.caller
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Whether the thread is suspended in an IPC operation.
    pub fn is_blocked(&self) -> bool {
        self.client != ClientState::Idle || self.server == ServerState::AwaitingRequest
    }

    // === Client ===

    /// Begin a call to `callee`, reserving metadata for `reserved` caps.
    pub fn start_call(&mut self, callee: JobId, reserved: usize) -> Result<(), IpcError> {
        if self.is_blocked() {
            return Err(IpcError::InvalidState);
        }
        self.client = ClientState::Sending;
        self.callee = Some(callee);
        self.reserved = reserved;
        self.outcome = None;
        self.inbuf.reset();
        Ok(())
    }

    /// The callee accepted the request.
    pub fn request_accepted(&mut self) -> Result<(), IpcError> {
        if self.client != ClientState::Sending {
            return Err(IpcError::InvalidState);
        }
        self.client = ClientState::AwaitingReply;
        Ok(())
    }

    /// Finish the call with a reply or an error.
    ///
    /// Returns the metadata reservation that is released by this.
    pub fn complete_call(&mut self, result: Result<(), IpcError>) -> Result<usize, IpcError> {
        if self.client == ClientState::Idle {
            return Err(IpcError::InvalidState);
        }
        self.client = ClientState::Idle;
        self.callee = None;
        self.outcome = Some(result.map(|()| Delivery::Reply));
        Ok(core::mem::take(&mut self.reserved))
    }

    // === Server ===

    /// Start waiting for the next request.
    pub fn begin_wait(&mut self) -> Result<(), IpcError> {
        if self.client != ClientState::Idle
            || !matches!(self.server, ServerState::Idle | ServerState::ReplyPending)
        {
            return Err(IpcError::InvalidState);
        }
        self.server = ServerState::AwaitingRequest;
        self.outcome = None;
        Ok(())
    }

    /// Take a request from `caller`, delivered into the incoming buffer.
    pub fn accept_request(&mut self, caller: JobId, badge: Badge) -> Result<(), IpcError> {
        if self.server != ServerState::AwaitingRequest {
            return Err(IpcError::InvalidState);
        }
        self.server = ServerState::Processing;
        self.caller = Some(caller);
        self.outcome = Some(Ok(Delivery::Request { badge }));
        Ok(())
    }

    /// Start replying; returns the caller owed the reply.
    pub fn begin_reply(&mut self) -> Result<JobId, IpcError> {
        if self.server != ServerState::Processing {
            return Err(IpcError::InvalidState);
        }
        let caller = self.caller.take().ok_or(IpcError::InvalidState)?;
        self.server = ServerState::ReplyPending;
        Ok(caller)
    }

    /// Reply handed over; the server is free again.
    pub fn finish_reply(&mut self) {
        if self.server == ServerState::ReplyPending {
            self.server = ServerState::Idle;
        }
    }

    /// Forget the owed caller without replying.
    pub fn drop_caller(&mut self) -> Option<JobId> {
        let caller = self.caller.take();
        if self.server == ServerState::Processing {
            self.server = ServerState::Idle;
        }
        caller
    }

    /// Abort a wait for requests.
    pub fn cancel_wait(&mut self) -> Result<(), IpcError> {
        if self.server != ServerState::AwaitingRequest {
            return Err(IpcError::InvalidState);
        }
        self.server = ServerState::Idle;
        self.outcome = Some(Err(IpcError::Cancelled));
        Ok(())
    }

    // === Request queue ===

    pub fn enqueue(&mut self, caller: JobId) {
        self.queue.push_back(caller);
    }

    pub fn dequeue(&mut self) -> Option<JobId> {
        self.queue.pop_front()
    }

    /// Remove a specific caller; returns whether it was queued.
    pub fn withdraw(&mut self, caller: JobId) -> bool {
        match self.queue.iter().position(|j| *j == caller) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Take every queued caller.
    pub fn drain_queue(&mut self) -> Vec<JobId> {
        self.queue.drain(..).collect()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    // === Outcome ===

    /// Result of the last completed blocking operation, once.
    pub fn take_outcome(&mut self) -> Option<Result<Delivery, IpcError>> {
        self.outcome.take()
    }

    pub fn has_outcome(&self) -> bool {
        self.outcome.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // MsgBuf
    // ========================================================================

    #[test]
    fn test_msgbuf_words_and_bytes() {
        let mut msg = MsgBuf::new();
        msg.write_u64(0xdead_beef).unwrap();
        msg.write_bytes(b"hi").unwrap();
        assert_eq!(msg.len(), 10);

        assert_eq!(msg.read_u64(), Ok(0xdead_beef));
        assert_eq!(msg.read_bytes(2), Ok(&b"hi"[..]));
        assert_eq!(msg.read_bytes(1), Err(IpcError::BufferUnderrun));
    }

    #[test]
    fn test_msgbuf_oversized_read_rejected() {
        let mut msg = MsgBuf::with_data(b"abc").unwrap();
        assert_eq!(msg.read_bytes(1), Ok(&b"a"[..]));
        assert_eq!(msg.read_bytes(usize::MAX), Err(IpcError::BufferUnderrun));
        // The failed read consumed nothing
        assert_eq!(msg.read_bytes(2), Ok(&b"bc"[..]));
    }

    #[test]
    fn test_msgbuf_size_limit() {
        let mut msg = MsgBuf::new();
        msg.write_bytes(&[0u8; MAX_MESSAGE_SIZE]).unwrap();
        assert_eq!(msg.write_bytes(&[1]), Err(IpcError::MessageTooLarge));
        assert_eq!(msg.len(), MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_msgbuf_cap_limit() {
        let mut msg = MsgBuf::new();
        for i in 0..MAX_CAPS_PER_MESSAGE {
            msg.insert_cap(CapId(i as u64)).unwrap();
        }
        assert_eq!(msg.insert_cap(CapId(9)), Err(IpcError::TooManyCaps));
        assert_eq!(msg.read_cap(), Ok(Some(CapId(0))));
    }

    #[test]
    fn test_msgbuf_reset() {
        let mut msg = MsgBuf::with_data(b"abc").unwrap();
        msg.insert_invalid_cap().unwrap();
        msg.reset();
        assert!(msg.is_empty());
        assert!(msg.cap_slots().is_empty());
        assert_eq!(msg.read_cap(), Err(IpcError::BufferUnderrun));
    }

    // ========================================================================
    // Node transitions
    // ========================================================================

    #[test]
    fn test_client_round() {
        let mut node = IpcNode::new();
        node.start_call(JobId(2), 1).unwrap();
        assert_eq!(node.client_state(), ClientState::Sending);
        assert!(node.is_blocked());

        node.request_accepted().unwrap();
        assert_eq!(node.client_state(), ClientState::AwaitingReply);

        assert_eq!(node.complete_call(Ok(())), Ok(1));
        assert_eq!(node.client_state(), ClientState::Idle);
        assert_eq!(node.take_outcome(), Some(Ok(Delivery::Reply)));
        assert_eq!(node.take_outcome(), None);
    }

    #[test]
    fn test_one_outstanding_call() {
        let mut node = IpcNode::new();
        node.start_call(JobId(2), 0).unwrap();
        assert_eq!(node.start_call(JobId(3), 0), Err(IpcError::InvalidState));
        assert_eq!(node.begin_wait(), Err(IpcError::InvalidState));
    }

    #[test]
    fn test_server_round() {
        let mut node = IpcNode::new();
        node.begin_wait().unwrap();
        node.accept_request(JobId(5), Badge(5)).unwrap();
        assert_eq!(node.server_state(), ServerState::Processing);
        assert_eq!(
            node.take_outcome(),
            Some(Ok(Delivery::Request { badge: Badge(5) }))
        );

        assert_eq!(node.begin_reply(), Ok(JobId(5)));
        assert_eq!(node.server_state(), ServerState::ReplyPending);
        node.begin_wait().unwrap();
        assert_eq!(node.server_state(), ServerState::AwaitingRequest);
    }

    #[test]
    fn test_cancelled_wait() {
        let mut node = IpcNode::new();
        node.begin_wait().unwrap();
        node.cancel_wait().unwrap();
        assert_eq!(node.server_state(), ServerState::Idle);
        assert_eq!(node.take_outcome(), Some(Err(IpcError::Cancelled)));
        assert_eq!(node.cancel_wait(), Err(IpcError::InvalidState));
    }

    #[test]
    fn test_queue_withdraw() {
        let mut node = IpcNode::new();
        node.enqueue(JobId(1));
        node.enqueue(JobId(2));
        node.enqueue(JobId(3));
        assert!(node.withdraw(JobId(2)));
        assert!(!node.withdraw(JobId(2)));
        assert_eq!(node.dequeue(), Some(JobId(1)));
        assert_eq!(node.drain_queue(), alloc::vec![JobId(3)]);
    }
}
