use std::time::Instant;

use structbuf::{StructBuf, Unpacker};
use tracing::{debug, warn};

use crate::att::{
    self, DecodeError, ErrRsp, ErrorCode, FindInfoRsp, FindByTypeValueRsp, Handle, HandleRange,
    MtuRsp, Opcode, PrepareWriteRsp, ReadByTypeRsp, Transport, TxStatus, CID_ATT, DEFAULT_MTU,
    HDR_SIZE, WRITE_LONG_HDR_SIZE,
};
use crate::uuid::{Uuid, Uuid16};

use super::*;

/// Protocol engine operating on one connection at a time. Borrows the
/// transport, application registry, and configuration from the [`Client`];
/// the connection is always passed explicitly.
pub(super) struct Engine<'a, T: Transport> {
    pub(super) tr: &'a mut T,
    pub(super) apps: &'a AppRegistry,
    pub(super) cfg: &'a Config,
}

/// Queue control.
impl<T: Transport> Engine<'_, T> {
    /// Appends a command to the queue and tries to progress transmission.
    pub fn enqueue(
        &mut self,
        conn: &mut Connection,
        op: Opcode,
        pdu: StructBuf,
        proc: Option<ProcId>,
        now: Instant,
    ) {
        conn.queue.push(op, pdu, proc);
        self.send_next(conn, now);
    }

    /// Transmits queued commands until a request goes on the air or the
    /// queue drains. No-response commands complete immediately with the
    /// transport status; congestion is left to the transport to resolve.
    pub fn send_next(&mut self, conn: &mut Connection, now: Instant) {
        let link = conn.link;
        loop {
            let (op, proc, pdu) = match conn.queue.head_mut() {
                None => return,
                Some(cmd) if !cmd.to_send => return, // response outstanding
                Some(cmd) => {
                    cmd.to_send = false;
                    (cmd.op, cmd.proc, cmd.pdu.take())
                }
            };
            let Some(pdu) = pdu else {
                conn.queue.pop();
                continue;
            };
            let st = self.tr.send(link, pdu.as_ref());
            if st == TxStatus::Error {
                warn!("{link}: transport rejected {op}");
                conn.queue.pop();
                if let Some(id) = proc {
                    self.end_operation(conn, id, Status::Error, CompleteData::None);
                }
                continue;
            }
            if matches!(
                op,
                Opcode::WriteCmd | Opcode::SignedWriteCmd | Opcode::HandleValueCfm
            ) {
                conn.queue.pop();
                if let Some(id) = proc {
                    let status = match st {
                        TxStatus::Congested => Status::Congested,
                        _ => Status::Success,
                    };
                    self.end_operation(conn, id, status, CompleteData::None);
                }
                if st == TxStatus::Success {
                    continue;
                }
                return;
            }
            conn.rsp_deadline = Some(now + self.cfg.rsp_timeout);
            return;
        }
    }

    /// Ends a procedure, releasing its record and firing the terminal
    /// callback unless the procedure was cancelled. A long read ending
    /// without explicit data returns the reassembly buffer.
    pub fn end_operation(
        &mut self,
        conn: &mut Connection,
        id: ProcId,
        status: Status,
        data: CompleteData<'_>,
    ) {
        let Some(p) = conn.remove_proc(id) else { return };
        if p.cancelled {
            return;
        }
        debug!("{}: {} ended with {status}", conn.link, p.op());
        let Some(cb) = self.apps.get(p.conn_id.app()) else {
            return;
        };
        match &p.kind {
            ProcKind::Discovery(d) => cb.on_discovery_complete(p.conn_id, d.kind, status),
            ProcKind::Read(ReadState::ByHandle(lr)) if matches!(data, CompleteData::None) => {
                let value = AttValue {
                    handle: lr.handle,
                    offset: 0,
                    value: &lr.buf,
                };
                cb.on_complete(
                    p.conn_id,
                    ClientOp::Read,
                    status,
                    conn.encryption,
                    CompleteData::Value(value),
                );
            }
            _ => cb.on_complete(p.conn_id, p.op(), status, conn.encryption, data),
        }
    }

    fn emit_disc(&self, conn_id: ConnId, kind: DiscoveryKind, rec: &DiscoveryRecord) {
        if let Some(cb) = self.apps.get(conn_id.app()) {
            cb.on_discovery(conn_id, kind, rec);
        }
    }

    /// Advances the discovery window past the last reported handle. A
    /// response with no parsable records exhausts the window.
    fn advance_window(&mut self, conn: &mut Connection, id: ProcId, last: Option<Handle>) {
        let Some(p) = conn.proc_mut(id) else { return };
        if let ProcKind::Discovery(d) = &mut p.kind {
            d.window = match (d.window, last) {
                (Some(w), Some(h)) => w.after(h),
                _ => None,
            };
        }
    }
}

/// Procedure actions.
impl<T: Transport> Engine<'_, T> {
    /// Issues the next round of a discovery procedure, or ends it once the
    /// window is exhausted.
    pub fn act_discovery(&mut self, conn: &mut Connection, id: ProcId, now: Instant) {
        enum Step {
            Send(Opcode, StructBuf),
            Done,
            Fail,
        }
        let payload = conn.payload_size;
        let step = {
            let Some(p) = conn.proc(id) else { return };
            let ProcKind::Discovery(d) = &p.kind else {
                return;
            };
            match d.window {
                None => Step::Done,
                Some(w) => match d.kind {
                    DiscoveryKind::PrimaryServices => Step::Send(
                        Opcode::ReadByGroupTypeReq,
                        att::read_by_type_req(payload, true, w, Declaration::PrimaryService.uuid()),
                    ),
                    DiscoveryKind::PrimaryServicesByUuid => match d.filter {
                        Some(uuid) => Step::Send(
                            Opcode::FindByTypeValueReq,
                            att::find_by_type_value_req(
                                payload,
                                w,
                                Declaration::PrimaryService.uuid16(),
                                uuid,
                            ),
                        ),
                        None => Step::Fail,
                    },
                    DiscoveryKind::IncludedServices => Step::Send(
                        Opcode::ReadByTypeReq,
                        att::read_by_type_req(payload, false, w, Declaration::Include.uuid()),
                    ),
                    DiscoveryKind::Characteristics => Step::Send(
                        Opcode::ReadByTypeReq,
                        att::read_by_type_req(payload, false, w, Declaration::Characteristic.uuid()),
                    ),
                    DiscoveryKind::Descriptors => {
                        Step::Send(Opcode::FindInformationReq, att::find_information_req(payload, w))
                    }
                },
            }
        };
        match step {
            Step::Send(op, pdu) => self.enqueue(conn, op, pdu, Some(id), now),
            Step::Done => self.end_operation(conn, id, Status::Success, CompleteData::None),
            Step::Fail => self.end_operation(conn, id, Status::Error, CompleteData::None),
        }
    }

    /// Starts a read procedure.
    pub fn act_read(&mut self, conn: &mut Connection, conn_id: ConnId, kind: ReadKind, now: Instant) {
        let payload = conn.payload_size;
        match kind {
            ReadKind::ByType { range, uuid } => {
                let pdu = att::read_by_type_req(payload, false, range, uuid);
                let id = conn.add_proc(conn_id, ProcKind::Read(ReadState::ByType));
                self.enqueue(conn, Opcode::ReadByTypeReq, pdu, Some(id), now);
            }
            ReadKind::ByHandle { handle } => {
                let id = conn.add_proc(
                    conn_id,
                    ProcKind::Read(ReadState::ByHandle(LongRead {
                        handle,
                        buf: Vec::new(),
                        phase: ReadPhase::Initial,
                        mtu: payload,
                    })),
                );
                self.enqueue(conn, Opcode::ReadReq, att::read_req(payload, handle), Some(id), now);
            }
            ReadKind::Partial { handle, offset } => {
                let id = conn.add_proc(conn_id, ProcKind::Read(ReadState::Partial { handle, offset }));
                let pdu = att::read_blob_req(payload, handle, offset);
                self.enqueue(conn, Opcode::ReadBlobReq, pdu, Some(id), now);
            }
            ReadKind::Multiple { handles } => {
                let pdu = att::read_multiple_req(payload, &handles);
                let id = conn.add_proc(conn_id, ProcKind::Read(ReadState::Multiple { handles }));
                self.enqueue(conn, Opcode::ReadMultipleReq, pdu, Some(id), now);
            }
        }
    }

    /// Starts a write or prepare-write procedure.
    pub fn act_write(
        &mut self,
        conn: &mut Connection,
        conn_id: ConnId,
        op: WriteOp,
        handle: Handle,
        value: &[u8],
        base_offset: u16,
        now: Instant,
    ) {
        let payload = conn.payload_size;
        match op {
            WriteOp::Write if value.len() <= usize::from(payload - HDR_SIZE) => {
                let pdu = att::write_req(payload, Opcode::WriteReq, handle, value);
                let id = conn.add_proc(
                    conn_id,
                    ProcKind::Write(WriteState::new(WriteOp::Write, handle, value, 0)),
                );
                self.enqueue(conn, Opcode::WriteReq, pdu, Some(id), now);
            }
            WriteOp::Write | WriteOp::Prepare => {
                let id = conn.add_proc(
                    conn_id,
                    ProcKind::Write(WriteState::new(op, handle, value, base_offset)),
                );
                self.send_prepare_write(conn, id, now);
            }
            WriteOp::Command | WriteOp::Execute => debug_assert!(false, "queued directly"),
        }
    }

    /// Sends the next prepare-write fragment:
    /// `min(remaining, payload_size - 5)` bytes at the current cursor.
    fn send_prepare_write(&mut self, conn: &mut Connection, id: ProcId, now: Instant) {
        let payload = conn.payload_size;
        let pdu = {
            let Some(p) = conn.proc_mut(id) else { return };
            let ProcKind::Write(w) = &mut p.kind else {
                return;
            };
            let remaining = w.value.len() - w.offset;
            let to_send = remaining.min(usize::from(payload - WRITE_LONG_HDR_SIZE));
            #[allow(clippy::cast_possible_truncation)]
            let mut offset = w.offset as u16;
            if w.kind == WriteOp::Prepare {
                offset = offset.wrapping_add(w.base_offset);
            }
            w.last_len = to_send;
            att::prepare_write_req(payload, w.handle, offset, &w.value[w.offset..w.offset + to_send])
        };
        self.enqueue(conn, Opcode::PrepareWriteReq, pdu, Some(id), now);
    }

    /// Commits or cancels the server's prepared write queue.
    fn send_execute_write(&mut self, conn: &mut Connection, id: ProcId, commit: bool, now: Instant) {
        let pdu = att::execute_write_req(conn.payload_size, commit);
        self.enqueue(conn, Opcode::ExecuteWriteReq, pdu, Some(id), now);
    }

    /// Queues one Handle Value Confirmation.
    pub fn send_confirmation(&mut self, conn: &mut Connection, now: Instant) {
        let pdu = att::handle_value_cfm(conn.payload_size);
        self.enqueue(conn, Opcode::HandleValueCfm, pdu, None, now);
    }

    /// Cancels every live procedure issued by `conn_id`.
    pub fn cancel(&mut self, conn: &mut Connection, conn_id: ConnId, now: Instant) {
        let outstanding = conn.queue.outstanding();
        for id in conn.procs_of(conn_id) {
            if outstanding == Some(id) {
                // The response is still expected; the router drains it.
                let Some(p) = conn.proc_mut(id) else { continue };
                let disc = match &p.kind {
                    ProcKind::Discovery(d) => Some(d.kind),
                    _ => None,
                };
                let op = p.op();
                p.cancelled = true;
                if let Some(cb) = self.apps.get(conn_id.app()) {
                    match disc {
                        Some(kind) => cb.on_discovery_complete(conn_id, kind, Status::Cancelled),
                        None => cb.on_complete(
                            conn_id,
                            op,
                            Status::Cancelled,
                            conn.encryption,
                            CompleteData::None,
                        ),
                    }
                }
            } else {
                conn.queue.remove_unsent(id);
                self.end_operation(conn, id, Status::Cancelled, CompleteData::None);
            }
        }
        self.send_next(conn, now);
    }

    /// Fires expired timers for one connection.
    pub fn handle_timeout(&mut self, conn: &mut Connection, now: Instant) {
        if conn.rsp_deadline.is_some_and(|t| t <= now) {
            conn.rsp_deadline = None;
            let proc = conn.queue.pop().and_then(|cmd| cmd.proc);
            if let Some(id) = proc {
                let retries = conn.proc(id).map_or(0, |p| p.retry_count);
                warn!("{}: ATT response timeout (retries: {retries})", conn.link);
                self.end_operation(conn, id, Status::Timeout, CompleteData::None);
            } else {
                warn!("{}: ATT response timeout", conn.link);
            }
            self.send_next(conn, now);
        }
        if conn.ind_ack_deadline.is_some_and(|t| t <= now) {
            conn.ind_ack_deadline = None;
            warn!(
                "{}: indication not confirmed by {} application(s), acking",
                conn.link, conn.ind_count
            );
            conn.ind_count = 0;
            self.send_confirmation(conn, now);
        }
    }
}

/// Response router.
impl<T: Transport> Engine<'_, T> {
    /// Processes one inbound PDU.
    pub fn deliver(&mut self, conn: &mut Connection, pdu: &[u8], now: Instant) {
        let Some(&op) = pdu.first() else {
            warn!("{}: empty PDU", conn.link);
            return;
        };
        let Ok(op) = Opcode::try_from(op) else {
            warn!("{}: unknown opcode {op:#04X}", conn.link);
            return;
        };
        let body = &pdu[1..];
        match op.typ() {
            att::PduType::Ntf | att::PduType::Ind => {
                // The PDU must be smaller than the agreed MTU
                if body.len() >= usize::from(conn.payload_size) {
                    warn!("{}: {op} exceeds the agreed MTU", conn.link);
                    return;
                }
                notify::process(self, conn, op, body, now);
            }
            att::PduType::Rsp => self.route_rsp(conn, op, body, now),
            _ => warn!("{}: unexpected {op}", conn.link),
        }
    }

    /// Pairs a response with the outstanding request and routes it to the
    /// owning procedure. A response is accepted only if its opcode matches
    /// the expected one or is an Error Response; anything else is dropped
    /// without disturbing the outstanding state.
    fn route_rsp(&mut self, conn: &mut Connection, op: Opcode, body: &[u8], now: Instant) {
        let expected = match conn.queue.head() {
            Some(cmd) if !cmd.to_send => cmd.op.rsp(),
            _ => None,
        };
        let Some(expected) = expected else {
            warn!("{}: {op} with no outstanding request", conn.link);
            return;
        };
        if op != expected && op != Opcode::ErrorRsp {
            warn!("{}: ignoring {op} while awaiting {expected}", conn.link);
            return;
        }
        let Some(cmd) = conn.queue.pop() else { return };
        conn.rsp_deadline = None;
        let Some(id) = cmd.proc else {
            self.send_next(conn, now);
            return;
        };
        match conn.proc_mut(id) {
            None => {
                self.send_next(conn, now);
                return;
            }
            Some(p) if p.cancelled => {
                conn.remove_proc(id);
                self.send_next(conn, now);
                return;
            }
            Some(p) => p.retry_count = 0,
        }
        if body.len() >= usize::from(conn.payload_size) {
            warn!("{}: {op} exceeds the agreed MTU", conn.link);
            self.end_operation(conn, id, Status::Error, CompleteData::None);
            self.send_next(conn, now);
            return;
        }
        match op {
            Opcode::ErrorRsp => self.on_error_rsp(conn, id, cmd.op, body, now),
            Opcode::ExchangeMtuRsp => self.on_mtu_rsp(conn, id, body),
            Opcode::FindInformationRsp => self.on_find_info_rsp(conn, id, body, now),
            Opcode::FindByTypeValueRsp => self.on_find_type_value_rsp(conn, id, body, now),
            Opcode::ReadByTypeRsp | Opcode::ReadByGroupTypeRsp => {
                self.on_read_by_type_rsp(conn, id, op == Opcode::ReadByGroupTypeRsp, body, now);
            }
            Opcode::ReadRsp | Opcode::ReadBlobRsp | Opcode::ReadMultipleRsp => {
                self.on_read_rsp(conn, id, body, now);
            }
            Opcode::WriteRsp => self.on_write_rsp(conn, id),
            Opcode::PrepareWriteRsp => self.on_prepare_write_rsp(conn, id, body, now),
            Opcode::ExecuteWriteRsp => {
                let status = conn.proc(id).map_or(Status::Error, |p| p.status);
                self.end_operation(conn, id, status, CompleteData::None);
            }
            _ => {
                warn!("{}: unhandled {op}", conn.link);
                self.end_operation(conn, id, Status::Error, CompleteData::None);
            }
        }
        self.send_next(conn, now);
    }

    /// Applies the Error Response remap rules: ranging procedures treat
    /// `AttributeNotFound` as end-of-list, the first blob after a read treats
    /// `AttributeNotLong` as a complete short attribute, and a failed prepare
    /// during a plain write cancels the server's prepare queue.
    fn on_error_rsp(
        &mut self,
        conn: &mut Connection,
        id: ProcId,
        req: Opcode,
        body: &[u8],
        now: Instant,
    ) {
        enum Act {
            End(Status),
            Cancel(Status),
        }
        let e = ErrRsp::decode(body);
        let link = conn.link;
        if e.request_opcode != u8::from(req) {
            debug!(
                "{link}: error response names opcode {:#04X}, expected {req}",
                e.request_opcode
            );
        }
        let act = {
            let Some(p) = conn.proc(id) else { return };
            match &p.kind {
                ProcKind::Discovery(_) => {
                    let ranging = matches!(
                        req,
                        Opcode::ReadByGroupTypeReq
                            | Opcode::FindByTypeValueReq
                            | Opcode::ReadByTypeReq
                            | Opcode::FindInformationReq
                    );
                    if ranging && e.reason == ErrorCode::AttributeNotFound {
                        debug!("{link}: discovery completed");
                        Act::End(Status::Success)
                    } else {
                        Act::End(Status::Att(e.reason))
                    }
                }
                ProcKind::Write(w)
                    if w.kind == WriteOp::Write
                        && req == Opcode::PrepareWriteReq
                        && e.handle == u16::from(w.handle) =>
                {
                    Act::Cancel(Status::Att(e.reason))
                }
                ProcKind::Read(ReadState::ByHandle(lr))
                    if req == Opcode::ReadBlobReq
                        && lr.phase == ReadPhase::FirstBlob
                        && e.reason == ErrorCode::AttributeNotLong =>
                {
                    // The attribute was short after all
                    Act::End(Status::Success)
                }
                _ => Act::End(Status::Att(e.reason)),
            }
        };
        match act {
            Act::End(status) => self.end_operation(conn, id, status, CompleteData::None),
            Act::Cancel(status) => {
                if let Some(p) = conn.proc_mut(id) {
                    p.status = status;
                }
                self.send_execute_write(conn, id, false, now);
            }
        }
    }

    /// Adopts `min(requested, server)` as the new payload size if it raises
    /// the current one, then aligns the fixed-channel TX data length.
    fn on_mtu_rsp(&mut self, conn: &mut Connection, id: ProcId, body: &[u8]) {
        let status = match MtuRsp::decode(body) {
            Err(_) => {
                warn!("{}: invalid MTU response, discard", conn.link);
                Status::InvalidPdu
            }
            Ok(MtuRsp(server)) => {
                let req = match conn.proc(id) {
                    Some(Procedure {
                        kind: ProcKind::Mtu(m),
                        ..
                    }) => m.req,
                    _ => DEFAULT_MTU,
                };
                let mtu = server.min(req);
                if mtu >= DEFAULT_MTU && mtu > conn.payload_size {
                    debug!("{}: ATT payload size {} -> {mtu}", conn.link, conn.payload_size);
                    conn.payload_size = mtu;
                }
                Status::Success
            }
        };
        self.tr.set_tx_data_length(conn.peer, CID_ATT, conn.payload_size);
        let data = if status.is_success() {
            CompleteData::Mtu(conn.payload_size)
        } else {
            CompleteData::None
        };
        self.end_operation(conn, id, status, data);
    }

    fn on_find_info_rsp(&mut self, conn: &mut Connection, id: ProcId, body: &[u8], now: Instant) {
        let rsp = match FindInfoRsp::decode(body) {
            Ok(r) => r,
            Err(_) => {
                warn!("{}: invalid Find Information response, discard", conn.link);
                return self.end_operation(conn, id, Status::InvalidPdu, CompleteData::None);
            }
        };
        let (conn_id, ok) = {
            let Some(p) = conn.proc(id) else { return };
            let ok = matches!(&p.kind, ProcKind::Discovery(d) if d.kind == DiscoveryKind::Descriptors);
            (p.conn_id, ok)
        };
        if !ok {
            return self.end_operation(conn, id, Status::Error, CompleteData::None);
        }
        let mut last = None;
        for (handle, uuid) in rsp {
            self.emit_disc(
                conn_id,
                DiscoveryKind::Descriptors,
                &DiscoveryRecord::Descriptor { handle, uuid },
            );
            last = Some(handle);
        }
        self.advance_window(conn, id, last);
        self.act_discovery(conn, id, now);
    }

    fn on_find_type_value_rsp(
        &mut self,
        conn: &mut Connection,
        id: ProcId,
        body: &[u8],
        now: Instant,
    ) {
        let (conn_id, uuid) = {
            let Some(p) = conn.proc(id) else { return };
            let uuid = match &p.kind {
                ProcKind::Discovery(d) if d.kind == DiscoveryKind::PrimaryServicesByUuid => d.filter,
                _ => None,
            };
            (p.conn_id, uuid)
        };
        let Some(uuid) = uuid else {
            return self.end_operation(conn, id, Status::Error, CompleteData::None);
        };
        let mut last_end = None;
        for (handle, end) in FindByTypeValueRsp::decode(body) {
            self.emit_disc(
                conn_id,
                DiscoveryKind::PrimaryServicesByUuid,
                &DiscoveryRecord::PrimaryService { handle, end, uuid },
            );
            last_end = Some(end);
        }
        self.advance_window(conn, id, last_end);
        self.act_discovery(conn, id, now);
    }

    /// Handles Read By Type / Read By Group Type responses, which serve
    /// primary service, included service, and characteristic discovery as
    /// well as reads by attribute type.
    fn on_read_by_type_rsp(
        &mut self,
        conn: &mut Connection,
        id: ProcId,
        grouped: bool,
        body: &[u8],
        now: Instant,
    ) {
        enum Path {
            DiscPrimary,
            DiscInclude,
            DiscChar(Option<Uuid>),
            ReadByType,
            Bad,
        }
        let payload = conn.payload_size;
        let link = conn.link;
        let rsp = match ReadByTypeRsp::decode(body, payload, grouped) {
            Ok(r) => r,
            Err(DecodeError::Truncated) => {
                warn!("{link}: invalid Read By Type response, discard");
                return self.end_operation(conn, id, Status::InvalidPdu, CompleteData::None);
            }
            Err(_) => {
                warn!("{link}: Read By Type element length exceeds MTU-2 or the response, discard");
                return self.end_operation(conn, id, Status::Error, CompleteData::None);
            }
        };
        let (conn_id, path) = {
            let Some(p) = conn.proc(id) else { return };
            let path = match &p.kind {
                ProcKind::Discovery(d) => match d.kind {
                    DiscoveryKind::PrimaryServices if grouped => Path::DiscPrimary,
                    DiscoveryKind::IncludedServices if !grouped => Path::DiscInclude,
                    DiscoveryKind::Characteristics if !grouped => Path::DiscChar(d.filter),
                    _ => Path::Bad,
                },
                ProcKind::Read(ReadState::ByType) if !grouped => Path::ReadByType,
                _ => Path::Bad,
            };
            (p.conn_id, path)
        };
        match path {
            Path::Bad => self.end_operation(conn, id, Status::Error, CompleteData::None),
            Path::ReadByType => self.read_by_type_value(conn, id, rsp, now),
            Path::DiscPrimary => {
                let mut last_end = None;
                let mut fail = None;
                for rec in rsp {
                    let Ok(tv) = rec else {
                        fail = Some(Status::InvalidHandle);
                        break;
                    };
                    let Some(end) = tv.group_end else {
                        fail = Some(Status::InvalidHandle);
                        break;
                    };
                    let Ok(uuid) = Uuid::try_from(tv.value) else {
                        warn!("{link}: unparsable service UUID at {}", tv.handle);
                        last_end = Some(end);
                        break;
                    };
                    self.emit_disc(
                        conn_id,
                        DiscoveryKind::PrimaryServices,
                        &DiscoveryRecord::PrimaryService {
                            handle: tv.handle,
                            end,
                            uuid,
                        },
                    );
                    last_end = Some(end);
                }
                if let Some(status) = fail {
                    return self.end_operation(conn, id, status, CompleteData::None);
                }
                self.advance_window(conn, id, last_end);
                self.act_discovery(conn, id, now);
            }
            Path::DiscInclude => self.disc_include(conn, id, conn_id, rsp, now),
            Path::DiscChar(filter) => self.disc_characteristics(conn, id, conn_id, filter, rsp, now),
        }
    }

    /// Read by attribute type: the first record is the result. A record that
    /// fills the response switches to blob reads, since the value may
    /// continue past the MTU.
    fn read_by_type_value(
        &mut self,
        conn: &mut Connection,
        id: ProcId,
        rsp: ReadByTypeRsp<'_>,
        now: Instant,
    ) {
        let payload = conn.payload_size;
        match rsp.read_value() {
            Err(DecodeError::InvalidHandle) => {
                self.end_operation(conn, id, Status::InvalidHandle, CompleteData::None);
            }
            Err(_) => self.end_operation(conn, id, Status::InvalidPdu, CompleteData::None),
            Ok((handle, value)) if value.len() == usize::from(payload) - 4 => {
                if value.len() > MAX_ATTR_LEN {
                    return self.end_operation(conn, id, Status::Error, CompleteData::None);
                }
                {
                    let Some(p) = conn.proc_mut(id) else { return };
                    if let ProcKind::Read(rs) = &mut p.kind {
                        *rs = ReadState::ByHandle(LongRead {
                            handle,
                            buf: value.to_vec(),
                            phase: ReadPhase::FirstBlob,
                            mtu: payload,
                        });
                    }
                }
                #[allow(clippy::cast_possible_truncation)]
                let pdu = att::read_blob_req(payload, handle, value.len() as u16);
                self.enqueue(conn, Opcode::ReadBlobReq, pdu, Some(id), now);
            }
            Ok((handle, value)) => {
                let data = CompleteData::Value(AttValue {
                    handle,
                    offset: 0,
                    value,
                });
                self.end_operation(conn, id, Status::Success, data);
            }
        }
    }

    /// Included service discovery. A 6-byte value carries the 16-bit service
    /// UUID inline; a 4-byte value omits it, and the engine reads the
    /// included service declaration to fetch the 128-bit UUID before
    /// resuming.
    fn disc_include(
        &mut self,
        conn: &mut Connection,
        id: ProcId,
        conn_id: ConnId,
        rsp: ReadByTypeRsp<'_>,
        now: Instant,
    ) {
        let payload = conn.payload_size;
        let mut last = None;
        let mut fail = None;
        let mut pending = None;
        for rec in rsp {
            let Ok(tv) = rec else {
                fail = Some(Status::InvalidHandle);
                break;
            };
            match tv.value.len() {
                6 => {
                    let mut p = Unpacker::new(tv.value);
                    let (Some(start), Some(end)) = (Handle::new(p.u16()), Handle::new(p.u16()))
                    else {
                        fail = Some(Status::InvalidHandle);
                        break;
                    };
                    let Some(uuid) = Uuid16::new(p.u16()) else {
                        fail = Some(Status::InvalidPdu);
                        break;
                    };
                    self.emit_disc(
                        conn_id,
                        DiscoveryKind::IncludedServices,
                        &DiscoveryRecord::IncludedService {
                            handle: tv.handle,
                            start,
                            end,
                            uuid: uuid.as_uuid(),
                        },
                    );
                    last = Some(tv.handle);
                }
                4 => {
                    let mut p = Unpacker::new(tv.value);
                    let (Some(start), Some(end)) = (Handle::new(p.u16()), Handle::new(p.u16()))
                    else {
                        fail = Some(Status::InvalidHandle);
                        break;
                    };
                    pending = Some(PendingInclude {
                        decl: tv.handle,
                        start,
                        end,
                        resume: tv.handle.next(),
                    });
                    break;
                }
                _ => {
                    warn!("{}: include value must be 4 or 6 bytes", conn.link);
                    fail = Some(Status::InvalidPdu);
                    break;
                }
            }
        }
        if let Some(status) = fail {
            return self.end_operation(conn, id, status, CompleteData::None);
        }
        if let Some(pend) = pending {
            let start = pend.start;
            {
                let Some(p) = conn.proc_mut(id) else { return };
                if let ProcKind::Discovery(d) = &mut p.kind {
                    d.pending_uuid128 = Some(pend);
                }
            }
            let pdu = att::read_req(payload, start);
            self.enqueue(conn, Opcode::ReadReq, pdu, Some(id), now);
            return;
        }
        self.advance_window(conn, id, last);
        self.act_discovery(conn, id, now);
    }

    /// Characteristic discovery. Records that do not match the application's
    /// UUID filter are skipped silently.
    fn disc_characteristics(
        &mut self,
        conn: &mut Connection,
        id: ProcId,
        conn_id: ConnId,
        filter: Option<Uuid>,
        rsp: ReadByTypeRsp<'_>,
        now: Instant,
    ) {
        let mut last = None;
        let mut fail = None;
        let mut stop = false;
        for rec in rsp {
            let Ok(tv) = rec else {
                fail = Some(Status::InvalidHandle);
                break;
            };
            if tv.value.len() < 3 {
                warn!("{}: characteristic value must be at least 3 bytes", conn.link);
                fail = Some(Status::InvalidPdu);
                break;
            }
            let mut p = Unpacker::new(tv.value);
            let props = CharProps::from_bits_truncate(p.u8());
            let Some(value_handle) = Handle::new(p.u16()) else {
                fail = Some(Status::InvalidHandle);
                break;
            };
            let Ok(uuid) = Uuid::try_from(p.into_inner()) else {
                // Invalid format: skip the result
                stop = true;
                break;
            };
            last = Some(tv.handle);
            if matches!(filter, Some(f) if f != uuid) {
                continue;
            }
            self.emit_disc(
                conn_id,
                DiscoveryKind::Characteristics,
                &DiscoveryRecord::Characteristic {
                    handle: tv.handle,
                    props,
                    value_handle,
                    uuid,
                },
            );
        }
        if let Some(status) = fail {
            return self.end_operation(conn, id, status, CompleteData::None);
        }
        if stop {
            return self.end_operation(conn, id, Status::Success, CompleteData::None);
        }
        self.advance_window(conn, id, last);
        self.act_discovery(conn, id, now);
    }

    /// Handles Read, Read Blob, and Read Multiple responses, including
    /// long-read reassembly and included-service UUID resolution.
    fn on_read_rsp(&mut self, conn: &mut Connection, id: ProcId, body: &[u8], now: Instant) {
        enum Act<'a> {
            End(Status, CompleteData<'a>),
            Blob(Handle, u16),
            Include(PendingInclude, Uuid),
        }
        let payload = conn.payload_size;
        let (conn_id, act) = {
            let Some(p) = conn.proc_mut(id) else { return };
            let conn_id = p.conn_id;
            let act = match &mut p.kind {
                ProcKind::Discovery(d) => match d.pending_uuid128.take() {
                    None => Act::End(Status::Error, CompleteData::None),
                    Some(pend) => {
                        d.window = match (d.window, pend.resume) {
                            (Some(w), Some(r)) if r <= w.end() => HandleRange::new(r, w.end()),
                            _ => None,
                        };
                        match (body.len() == Uuid::BYTES).then(|| Uuid::try_from(body)) {
                            Some(Ok(uuid)) => Act::Include(pend, uuid),
                            _ => Act::End(Status::InvalidPdu, CompleteData::None),
                        }
                    }
                },
                ProcKind::Read(ReadState::ByHandle(lr)) => {
                    let offset = lr.buf.len();
                    if offset >= MAX_ATTR_LEN {
                        Act::End(Status::NoResources, CompleteData::None)
                    } else {
                        // Reassembly is bounded; excess bytes are truncated
                        let n = body.len().min(MAX_ATTR_LEN - offset);
                        lr.buf.extend_from_slice(&body[..n]);
                        let full = if payload == lr.mtu {
                            n == usize::from(payload) - 1
                        } else {
                            // MTU changed mid-procedure: a fragment filling
                            // either the old or the new payload counts
                            let f = n == usize::from(lr.mtu) - 1 || n == usize::from(payload) - 1;
                            lr.mtu = payload;
                            f
                        };
                        if full && lr.buf.len() < MAX_ATTR_LEN {
                            lr.phase = match lr.phase {
                                ReadPhase::Initial => ReadPhase::FirstBlob,
                                _ => ReadPhase::Blob,
                            };
                            #[allow(clippy::cast_possible_truncation)]
                            let offset = lr.buf.len() as u16;
                            Act::Blob(lr.handle, offset)
                        } else {
                            Act::End(Status::Success, CompleteData::None)
                        }
                    }
                }
                ProcKind::Read(ReadState::Partial { handle, offset }) => Act::End(
                    Status::Success,
                    CompleteData::Value(AttValue {
                        handle: *handle,
                        offset: *offset,
                        value: body,
                    }),
                ),
                ProcKind::Read(ReadState::Multiple { handles }) => match handles.first() {
                    Some(&handle) => Act::End(
                        Status::Success,
                        CompleteData::Value(AttValue {
                            handle,
                            offset: 0,
                            value: body,
                        }),
                    ),
                    None => Act::End(Status::Error, CompleteData::None),
                },
                _ => Act::End(Status::Error, CompleteData::None),
            };
            (conn_id, act)
        };
        match act {
            Act::End(status, data) => self.end_operation(conn, id, status, data),
            Act::Blob(handle, offset) => {
                let pdu = att::read_blob_req(payload, handle, offset);
                self.enqueue(conn, Opcode::ReadBlobReq, pdu, Some(id), now);
            }
            Act::Include(pend, uuid) => {
                self.emit_disc(
                    conn_id,
                    DiscoveryKind::IncludedServices,
                    &DiscoveryRecord::IncludedService {
                        handle: pend.decl,
                        start: pend.start,
                        end: pend.end,
                        uuid,
                    },
                );
                self.act_discovery(conn, id, now);
            }
        }
    }

    fn on_write_rsp(&mut self, conn: &mut Connection, id: ProcId) {
        let status = match conn.proc(id) {
            Some(Procedure {
                kind: ProcKind::Write(_),
                ..
            }) => Status::Success,
            _ => Status::Error,
        };
        self.end_operation(conn, id, status, CompleteData::None);
    }

    /// Verifies a prepare-write echo against the source fragment. Any
    /// mismatch cancels the server's prepare queue for plain writes.
    fn on_prepare_write_rsp(
        &mut self,
        conn: &mut Connection,
        id: ProcId,
        body: &[u8],
        now: Instant,
    ) {
        enum Act<'a> {
            Next,
            Exec,
            Cancel(Status),
            End(Status, CompleteData<'a>),
        }
        let link = conn.link;
        let act = {
            let Some(p) = conn.proc_mut(id) else { return };
            match &mut p.kind {
                ProcKind::Write(w) => match PrepareWriteRsp::decode(body) {
                    Err(_) => {
                        warn!("{link}: illegal prepare write response, discard");
                        if w.kind == WriteOp::Write {
                            Act::Cancel(Status::InvalidPdu)
                        } else {
                            Act::End(Status::InvalidPdu, CompleteData::None)
                        }
                    }
                    Ok(rsp) => {
                        let echo = AttValue {
                            handle: rsp.handle,
                            offset: rsp.offset,
                            value: rsp.value,
                        };
                        let echo_ok = rsp.handle == w.handle
                            && rsp.value.len() == w.last_len
                            && w.value.get(w.offset..w.offset + w.last_len) == Some(rsp.value);
                        if !echo_ok {
                            if w.kind == WriteOp::Write {
                                Act::Cancel(Status::Error)
                            } else {
                                Act::End(Status::Error, CompleteData::Value(echo))
                            }
                        } else {
                            w.offset += w.last_len;
                            if w.offset >= w.value.len() {
                                if w.kind == WriteOp::Write {
                                    Act::Exec
                                } else {
                                    Act::End(Status::Success, CompleteData::Value(echo))
                                }
                            } else {
                                Act::Next
                            }
                        }
                    }
                },
                _ => Act::End(Status::Error, CompleteData::None),
            }
        };
        match act {
            Act::Next => self.send_prepare_write(conn, id, now),
            Act::Exec => {
                if let Some(p) = conn.proc_mut(id) {
                    p.status = Status::Success;
                }
                self.send_execute_write(conn, id, true, now);
            }
            Act::Cancel(status) => {
                if let Some(p) = conn.proc_mut(id) {
                    p.status = status;
                }
                self.send_execute_write(conn, id, false, now);
            }
            Act::End(status, data) => self.end_operation(conn, id, status, data),
        }
    }
}
