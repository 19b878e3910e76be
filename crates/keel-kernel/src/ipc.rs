//! Synchronous IPC transport
//!
//! A client [`call`](Kernel::call)s a thread capability and blocks until the
//! server replies or the call is cancelled. A server alternates between
//! [`reply_wait`](Kernel::reply_wait) (answer the current caller, then take
//! the next request) and processing.
//!
//! Capabilities travel in the message's cap slots, named by the sender's
//! [`CapId`]s. The kernel resolves each to its object, places it in a receive
//! window of the receiving domain and lets the receiver's capability space
//! adopt it with `insert_map`. Requests carry the caller's [`Badge`], which
//! only the kernel sets.
//!
//! A call reserves kernel metadata for the capabilities it expects back. If
//! the caller's domain has none left the call fails with `OutOfMetadata`;
//! [`Kernel::call`] then upgrades the domain's metadata and retries, a
//! bounded number of times.

use core::mem;

use keel_hal::Hal;
use keel_kernel_core::{
    Badge, CapId, ClientState, Delivery, DomainId, IpcError, JobId, MsgBuf, ServerState,
    MAX_CAPS_PER_MESSAGE,
};

use crate::audit::AuditKind;
use crate::domain::KernelObject;
use crate::error::KernelError;
use crate::thread::ThreadState;
use crate::Kernel;

/// A completed receive: a reply or a request with its badge, and the message.
#[derive(Clone, Debug)]
pub struct Received {
    pub delivery: Delivery,
    pub msg: MsgBuf,
}

impl Received {
    /// Caller identity of a request.
    pub fn badge(&self) -> Option<Badge> {
        match self.delivery {
            Delivery::Request { badge } => Some(badge),
            Delivery::Reply => None,
        }
    }
}

impl<H: Hal> Kernel<H> {
    /// Send `msg` to the thread named by `dest` and block for the reply.
    ///
    /// `rcv_caps` is the number of capabilities the caller is prepared to
    /// receive with the reply. On `Ok` the caller is blocked; its result is
    /// collected with [`Kernel::ipc_result`] once it runs again.
    pub fn call(
        &mut self,
        client: JobId,
        dest: CapId,
        msg: &MsgBuf,
        rcv_caps: usize,
    ) -> Result<(), KernelError> {
        self.entered(client, |k| {
            let attempts = k.config().upgrade_attempts;
            let mut upgrades = 0;
            loop {
                match k.send_request(client, dest, msg, rcv_caps) {
                    Err(KernelError::Ipc(IpcError::OutOfMetadata)) if upgrades < attempts => {
                        upgrades += 1;
                        let domain = k.thread(client)?.domain;
                        if let Err(e) = k.upgrade_metadata(domain) {
                            log::warn!("{:?}: metadata upgrade failed: {}", client, e);
                            return Err(IpcError::OutOfMetadata.into());
                        }
                    }
                    Err(KernelError::Ipc(IpcError::OutOfMetadata)) => {
                        log::warn!("{:?}: out of metadata after {} upgrades", client, upgrades);
                        return Err(IpcError::OutOfMetadata.into());
                    }
                    other => return other,
                }
            }
        })
    }

    /// Reply to the current caller (if `reply` is given) and wait for the
    /// next request.
    ///
    /// A server that waits without replying to an owed caller abandons it;
    /// that caller sees `Cancelled`.
    pub fn reply_wait(&mut self, server: JobId, reply: Option<&MsgBuf>) -> Result<(), KernelError> {
        self.entered(server, |k| {
            let thread = k.thread(server)?;
            if !thread.is_active() {
                return Err(KernelError::InvalidState);
            }
            let processing = thread.ipc.server_state() == ServerState::Processing;
            match (reply, processing) {
                (Some(msg), true) => k.deliver_reply(server, msg)?,
                (Some(_), false) => log::debug!("{:?}: reply without caller dropped", server),
                (None, true) => {
                    if let Some(caller) = k.thread_mut(server)?.ipc.drop_caller() {
                        k.cancel_and_wake(caller)?;
                    }
                }
                (None, false) => {}
            }
            k.wait_request(server)
        })
    }

    /// Reply to the current caller without waiting.
    pub fn reply(&mut self, server: JobId, msg: &MsgBuf) -> Result<(), KernelError> {
        self.entered(server, |k| {
            if k.thread(server)?.ipc.server_state() != ServerState::Processing {
                return Err(KernelError::InvalidState);
            }
            k.deliver_reply(server, msg)
        })
    }

    /// Collect the outcome of the last blocking IPC operation of `job`.
    ///
    /// Fails with `WouldBlock` while nothing was delivered and with
    /// `Cancelled` if the operation was aborted.
    pub fn ipc_result(&mut self, job: JobId) -> Result<Received, KernelError> {
        let thread = self.thread_mut(job)?;
        match thread.ipc.take_outcome() {
            None => Err(KernelError::WouldBlock),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(delivery)) => Ok(Received {
                delivery,
                msg: mem::take(&mut thread.ipc.inbuf),
            }),
        }
    }

    // ========================================================================
    // Client side
    // ========================================================================

    fn send_request(
        &mut self,
        client: JobId,
        dest: CapId,
        msg: &MsgBuf,
        rcv_caps: usize,
    ) -> Result<(), KernelError> {
        if rcv_caps > MAX_CAPS_PER_MESSAGE {
            return Err(IpcError::TooManyCaps.into());
        }
        let thread = self.thread(client)?;
        if !thread.is_active() || thread.ipc.is_blocked() {
            return Err(KernelError::InvalidState);
        }
        let domain_id = thread.domain;
        let domain = self.domain(domain_id)?;

        for id in msg.cap_slots().iter().flatten() {
            if domain.resolve(*id, &self.objects).is_none() {
                return Err(IpcError::InvalidCapability.into());
            }
        }
        let server = match domain
            .resolve(dest, &self.objects)
            .and_then(|object| self.objects.get(&object))
        {
            Some(KernelObject::Thread(server))
                if *server != client && self.threads.contains_key(server) =>
            {
                *server
            }
            _ => return Err(IpcError::InvalidDestination.into()),
        };

        self.domain_mut(domain_id)?.table.reserve(rcv_caps)?;
        let thread = self.thread_mut(client)?;
        thread.ipc.out = msg.clone();
        if let Err(e) = thread.ipc.start_call(server, rcv_caps) {
            self.domain_mut(domain_id)?.table.release(rcv_caps);
            return Err(e.into());
        }
        self.deactivate(client, ThreadState::AwaitsIpc)?;
        self.record(AuditKind::IpcCall { client, server });

        if self.thread(server)?.ipc.server_state() == ServerState::AwaitingRequest {
            self.deliver_request(client, server)
        } else {
            self.thread_mut(server)?.ipc.enqueue(client);
            Ok(())
        }
    }

    /// Abort `job`'s pending call, if any, without waking it.
    ///
    /// Returns whether a call was pending.
    pub(crate) fn cancel_client(&mut self, job: JobId) -> Result<bool, KernelError> {
        let thread = self.thread(job)?;
        let state = thread.ipc.client_state();
        if state == ClientState::Idle {
            return Ok(false);
        }
        if let Some(server) = thread.ipc.callee().and_then(|s| self.threads.get_mut(&s)) {
            match state {
                ClientState::Sending => {
                    server.ipc.withdraw(job);
                }
                ClientState::AwaitingReply if server.ipc.caller() == Some(job) => {
                    server.ipc.drop_caller();
                }
                _ => {}
            }
        }
        let thread = self.thread_mut(job)?;
        let released = thread.ipc.complete_call(Err(IpcError::Cancelled))?;
        let domain = thread.domain;
        self.domain_mut(domain)?.table.release(released);
        Ok(true)
    }

    /// Fail `job`'s pending call with `Cancelled` and let it run again.
    pub(crate) fn cancel_and_wake(&mut self, job: JobId) -> Result<(), KernelError> {
        if self.cancel_client(job)? {
            self.activate(job)?;
            log::debug!("{:?}: call cancelled", job);
            self.record(AuditKind::IpcCancelled { job });
        }
        Ok(())
    }

    // ========================================================================
    // Server side
    // ========================================================================

    fn wait_request(&mut self, server: JobId) -> Result<(), KernelError> {
        self.thread_mut(server)?.ipc.begin_wait()?;
        while let Some(client) = self.thread_mut(server)?.ipc.dequeue() {
            let pending = self.threads.get(&client).is_some_and(|c| {
                c.ipc.client_state() == ClientState::Sending && c.ipc.callee() == Some(server)
            });
            if pending {
                return self.deliver_request(client, server);
            }
        }
        self.deactivate(server, ThreadState::AwaitsIpc)
    }

    /// Hand `client`'s request to the waiting `server`.
    fn deliver_request(&mut self, client: JobId, server: JobId) -> Result<(), KernelError> {
        let from = self.thread(client)?.domain;
        let to = self.thread(server)?.domain;
        let out = mem::take(&mut self.thread_mut(client)?.ipc.out);
        let inbuf = self.transfer(&out, from, to, None)?;

        let badge = Badge::from(client);
        let s = self.thread_mut(server)?;
        s.ipc.inbuf = inbuf;
        s.ipc.accept_request(client, badge)?;
        self.thread_mut(client)?.ipc.request_accepted()?;
        self.activate(server)?;
        self.record(AuditKind::IpcRequest { server, badge });
        Ok(())
    }

    fn deliver_reply(&mut self, server: JobId, msg: &MsgBuf) -> Result<(), KernelError> {
        let caller = self.thread_mut(server)?.ipc.begin_reply()?;
        let waiting = self.threads.get(&caller).is_some_and(|c| {
            c.ipc.client_state() == ClientState::AwaitingReply && c.ipc.callee() == Some(server)
        });
        if waiting {
            let from = self.thread(server)?.domain;
            let c = self.thread(caller)?;
            let (to, reserved) = (c.domain, c.ipc.reserved());
            let inbuf = self.transfer(msg, from, to, Some(reserved))?;
            let c = self.thread_mut(caller)?;
            c.ipc.inbuf = inbuf;
            let released = c.ipc.complete_call(Ok(()))?;
            self.domain_mut(to)?.table.release(released);
            self.activate(caller)?;
            self.record(AuditKind::IpcReply {
                server,
                client: caller,
            });
        } else {
            log::debug!("{:?}: caller {:?} gone, reply dropped", server, caller);
        }
        self.thread_mut(server)?.ipc.finish_reply();
        Ok(())
    }

    /// Copy `msg` from domain `from` into a buffer for domain `to`,
    /// translating every capability. Capabilities that cannot be delivered
    /// arrive as invalid slots.
    ///
    /// A reply passes the caller's metadata reservation as `reserved`; only
    /// that many capabilities are delivered. Requests draw on the receiving
    /// table's free metadata instead.
    fn transfer(
        &mut self,
        msg: &MsgBuf,
        from: DomainId,
        to: DomainId,
        reserved: Option<usize>,
    ) -> Result<MsgBuf, KernelError> {
        let mut out = MsgBuf::with_data(msg.data())?;
        for (i, slot) in msg.cap_slots().iter().enumerate() {
            if reserved.is_some_and(|n| i >= n) {
                if let Some(id) = slot {
                    log::warn!("{:?}: capability {:?} exceeds the reservation", to, id);
                    self.record(AuditKind::CapRejected { domain: to, id: *id });
                }
                out.insert_invalid_cap()?;
                continue;
            }
            let object = slot.and_then(|id| {
                self.domains
                    .get(&from)
                    .and_then(|d| d.resolve(id, &self.objects))
            });
            let Some(object) = object else {
                out.insert_invalid_cap()?;
                continue;
            };
            match self.install_received(to, object, reserved.is_some()) {
                Ok(index) => out.insert_cap(index.id)?,
                Err(e) => {
                    log::warn!("{:?} rejected {:?}: {}", to, object, e);
                    self.record(AuditKind::CapRejected { domain: to, id: object });
                    out.insert_invalid_cap()?;
                }
            }
        }
        Ok(out)
    }
}
