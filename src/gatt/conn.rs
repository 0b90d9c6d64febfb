use std::collections::VecDeque;
use std::time::Instant;

use structbuf::StructBuf;
use tracing::warn;

use crate::att::{Handle, HandleRange, Opcode, DEFAULT_MTU};
use crate::uuid::Uuid;
use crate::{BdAddr, LinkId};

use super::*;

/// Procedure record identifier, unique within a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) struct ProcId(u32);

/// Per-connection client state (the transport control block). Owns the
/// command queue and every live procedure record; nothing else holds
/// references into them.
pub(super) struct Connection {
    pub link: LinkId,
    pub peer: BdAddr,
    /// Negotiated ATT payload size. Starts at [`DEFAULT_MTU`] and never
    /// decreases for the lifetime of the connection.
    pub payload_size: u16,
    /// Indications delivered to applications and not yet acknowledged.
    pub ind_count: u16,
    pub encryption: LinkEncryption,
    pub queue: CommandQueue,
    procs: Vec<Procedure>,
    next_proc: u32,
    /// Deadline for the outstanding request's response.
    pub rsp_deadline: Option<Instant>,
    /// Deadline for application indication acknowledgements.
    pub ind_ack_deadline: Option<Instant>,
}

impl Connection {
    pub fn new(link: LinkId, peer: BdAddr) -> Self {
        Self {
            link,
            peer,
            payload_size: DEFAULT_MTU,
            ind_count: 0,
            encryption: LinkEncryption::default(),
            queue: CommandQueue::default(),
            procs: Vec::new(),
            next_proc: 0,
            rsp_deadline: None,
            ind_ack_deadline: None,
        }
    }

    /// Allocates a new procedure record.
    pub fn add_proc(&mut self, conn_id: ConnId, kind: ProcKind) -> ProcId {
        let id = ProcId(self.next_proc);
        self.next_proc = self.next_proc.wrapping_add(1);
        self.procs.push(Procedure {
            id,
            conn_id,
            kind,
            status: Status::Success,
            cancelled: false,
            retry_count: 0,
        });
        id
    }

    pub fn proc(&self, id: ProcId) -> Option<&Procedure> {
        self.procs.iter().find(|p| p.id == id)
    }

    pub fn proc_mut(&mut self, id: ProcId) -> Option<&mut Procedure> {
        self.procs.iter_mut().find(|p| p.id == id)
    }

    /// Releases a procedure record.
    pub fn remove_proc(&mut self, id: ProcId) -> Option<Procedure> {
        let i = self.procs.iter().position(|p| p.id == id)?;
        Some(self.procs.swap_remove(i))
    }

    /// Removes every live procedure record for connection teardown.
    pub fn take_procs(&mut self) -> Vec<Procedure> {
        self.queue.0.clear();
        self.rsp_deadline = None;
        self.ind_ack_deadline = None;
        std::mem::take(&mut self.procs)
    }

    /// Returns the identifiers of every live procedure issued by `conn_id`.
    pub fn procs_of(&self, conn_id: ConnId) -> Vec<ProcId> {
        (self.procs.iter())
            .filter(|p| !p.cancelled && p.conn_id == conn_id)
            .map(|p| p.id)
            .collect()
    }

    /// Silently drops every procedure belonging to a deregistered
    /// application. Requests already on the air stay marked so the router can
    /// drain their responses.
    pub fn cancel_app(&mut self, app: AppId) {
        for p in &mut self.procs {
            if p.conn_id.app() == app {
                p.cancelled = true;
            }
        }
        let outstanding = self.queue.outstanding();
        let cancelled: Vec<ProcId> = (self.procs.iter())
            .filter(|p| p.cancelled)
            .map(|p| p.id)
            .collect();
        self.queue.0.retain(|cmd| {
            !cmd.to_send || !matches!(cmd.proc, Some(id) if cancelled.contains(&id))
        });
        self.procs.retain(|p| {
            !p.cancelled || matches!(outstanding, Some(id) if id == p.id)
        });
    }
}

/// One queued client PDU.
pub(super) struct Command {
    pub op: Opcode,
    /// Encoded PDU; taken when handed to the transport.
    pub pdu: Option<StructBuf>,
    pub proc: Option<ProcId>,
    pub to_send: bool,
}

/// Per-connection FIFO of outstanding and pending client commands. The head
/// entry with `to_send == false` is the single outstanding request.
#[derive(Default)]
pub(super) struct CommandQueue(VecDeque<Command>);

impl CommandQueue {
    pub fn push(&mut self, op: Opcode, pdu: StructBuf, proc: Option<ProcId>) {
        self.0.push_back(Command {
            op,
            pdu: Some(pdu),
            proc,
            to_send: true,
        });
    }

    pub fn head(&self) -> Option<&Command> {
        self.0.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Command> {
        self.0.front_mut()
    }

    pub fn pop(&mut self) -> Option<Command> {
        self.0.pop_front()
    }

    /// Returns the procedure bound to the in-flight request, if any.
    pub fn outstanding(&self) -> Option<ProcId> {
        match self.0.front() {
            Some(cmd) if !cmd.to_send => cmd.proc,
            _ => None,
        }
    }

    /// Removes queued commands for a procedure that have not been sent.
    pub fn remove_unsent(&mut self, id: ProcId) {
        self.0.retain(|cmd| !cmd.to_send || cmd.proc != Some(id));
    }
}

/// Client procedure record. One is created per application request and
/// released exactly once when the procedure terminates.
pub(super) struct Procedure {
    pub id: ProcId,
    pub conn_id: ConnId,
    pub kind: ProcKind,
    /// Accumulated status, surfaced when an Execute Write response ends the
    /// procedure.
    pub status: Status,
    /// Set when the application cancelled the procedure; the eventual
    /// response is drained without a callback.
    pub cancelled: bool,
    /// Cleared on every accepted response. Incremented by higher layers on
    /// transient congestion; the engine itself never retries.
    pub retry_count: u8,
}

impl Procedure {
    /// Returns the operation reported through the completion callback.
    pub fn op(&self) -> ClientOp {
        match self.kind {
            ProcKind::Discovery(_) => ClientOp::Discovery,
            ProcKind::Read(_) => ClientOp::Read,
            ProcKind::Write(_) => ClientOp::Write,
            ProcKind::Mtu(_) => ClientOp::MtuExchange,
        }
    }
}

pub(super) enum ProcKind {
    Discovery(DiscoveryState),
    Read(ReadState),
    Write(WriteState),
    Mtu(MtuState),
}

pub(super) struct DiscoveryState {
    pub kind: DiscoveryKind,
    /// Remaining discovery window. `None` once the range is exhausted,
    /// including advancement past handle 0xFFFF.
    pub window: Option<HandleRange>,
    /// Target UUID for by-UUID discovery, or the optional characteristic
    /// filter.
    pub filter: Option<Uuid>,
    /// Included-service declaration awaiting 128-bit UUID resolution.
    pub pending_uuid128: Option<PendingInclude>,
}

/// Include declaration whose 4-byte value omitted the service UUID. The
/// parked record is completed by a separate Read of the included service
/// declaration, after which discovery resumes from `resume`.
pub(super) struct PendingInclude {
    pub decl: Handle,
    pub start: Handle,
    pub end: Handle,
    pub resume: Option<Handle>,
}

pub(super) enum ReadState {
    /// Read By Type issued; the first matching record decides between a
    /// direct result and a switch to [`ReadState::ByHandle`].
    ByType,
    /// Single-handle read, continuing with blob reads for long values.
    ByHandle(LongRead),
    /// One blob read at an application-supplied offset.
    Partial { handle: Handle, offset: u16 },
    /// One request carrying several handles; the response is delivered
    /// verbatim.
    Multiple { handles: Vec<Handle> },
}

/// Long-read reassembly state.
pub(super) struct LongRead {
    pub handle: Handle,
    /// Reassembly buffer, bounded by [`MAX_ATTR_LEN`].
    pub buf: Vec<u8>,
    pub phase: ReadPhase,
    /// Payload size snapshot taken when the last read was issued, used to
    /// recognize full fragments across a mid-procedure MTU change.
    pub mtu: u16,
}

/// Progress of a Read / Read Blob sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum ReadPhase {
    /// The initial Read request is outstanding.
    Initial,
    /// The first Read Blob after the initial Read is outstanding. An
    /// `AttributeNotLong` error in this phase completes the procedure with
    /// the buffered prefix.
    FirstBlob,
    /// A subsequent Read Blob is outstanding.
    Blob,
}

pub(super) struct WriteState {
    pub kind: WriteOp,
    pub handle: Handle,
    /// Source attribute value.
    pub value: Vec<u8>,
    /// Bytes of `value` already confirmed by the server.
    pub offset: usize,
    /// Application-supplied base offset for prepared writes.
    pub base_offset: u16,
    /// Length of the last prepare fragment sent, checked against the echo.
    pub last_len: usize,
}

impl WriteState {
    pub fn new(kind: WriteOp, handle: Handle, value: &[u8], base_offset: u16) -> Self {
        Self {
            kind,
            handle,
            value: value.to_vec(),
            offset: 0,
            base_offset,
            last_len: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum WriteOp {
    /// Write Command or Signed Write Command; completes on transmission.
    Command,
    /// Write Request, falling back to prepare/execute for long values.
    Write,
    /// Application-driven prepare writes; never auto-executes.
    Prepare,
    /// Standalone Execute Write.
    Execute,
}

pub(super) struct MtuState {
    /// Requested local receive MTU.
    pub req: u16,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.procs.is_empty() {
            warn!(
                "{} dropped with {} live procedure(s)",
                self.link,
                self.procs.len()
            );
        }
    }
}
