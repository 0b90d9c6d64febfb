//! Generic Attribute Profile client ([Vol 3] Part G).
//!
//! [`Client`] owns all per-connection client state and is driven by three
//! serialized event sources: application API calls, transport deliveries
//! ([`Client::deliver`]), and timer expirations ([`Client::handle_timeout`]).
//! Procedure outcomes are reported through the registered [`Callbacks`].

use std::fmt::{Debug, Formatter};
use std::num::NonZeroU8;
use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

pub use consts::*;

use crate::att::{
    ErrorCode, Handle, HandleRange, Opcode, Transport, DEFAULT_MTU, MAX_MTU, SIG_LEN,
};
use crate::uuid::Uuid;
use crate::{name_of, BdAddr, LinkId};

use {client::Engine, conn::*};

mod client;
mod conn;
mod consts;
mod notify;
#[cfg(test)]
mod tests;

/// Application registration identifier.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct AppId(NonZeroU8);

impl AppId {
    #[inline]
    fn from_idx(i: usize) -> Option<Self> {
        #[allow(clippy::cast_possible_truncation)]
        let id = i.wrapping_add(1) as u8;
        NonZeroU8::new(id).map(Self)
    }

    #[inline(always)]
    fn idx(self) -> usize {
        usize::from(self.0.get()) - 1
    }
}

impl Debug for AppId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", name_of!(AppId), self.0.get())
    }
}

crate::impl_display_via_debug! { AppId }

/// Client connection identifier: one transport link as seen by one registered
/// application.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct ConnId {
    link: LinkId,
    app: AppId,
}

impl ConnId {
    /// Creates a connection identifier.
    #[inline(always)]
    #[must_use]
    pub const fn new(link: LinkId, app: AppId) -> Self {
        Self { link, app }
    }

    /// Returns the transport link index.
    #[inline(always)]
    #[must_use]
    pub const fn link(self) -> LinkId {
        self.link
    }

    /// Returns the application identifier.
    #[inline(always)]
    #[must_use]
    pub const fn app(self) -> AppId {
        self.app
    }
}

impl Debug for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", u8::from(self.link), self.app.0.get())
    }
}

crate::impl_display_via_debug! { ConnId }

/// Terminal status of a client procedure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Status {
    /// Procedure completed successfully.
    Success,
    /// Server-reported ATT error, after the remap rules for ranging and
    /// long-read procedures have been applied.
    Att(ErrorCode),
    /// A response failed validation before any field could be used.
    InvalidPdu,
    /// A response carried the invalid handle 0.
    InvalidHandle,
    /// Reassembly would exceed [`MAX_ATTR_LEN`].
    NoResources,
    /// The response timer expired.
    Timeout,
    /// The transport accepted the PDU but reported congestion.
    Congested,
    /// The application cancelled the procedure.
    Cancelled,
    /// The connection was torn down while the procedure was live.
    LinkLost,
    /// Generic failure.
    Error,
}

impl Status {
    /// Returns whether the procedure succeeded.
    #[inline(always)]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

crate::impl_display_via_debug! { Status }

/// Link encryption status attached to server-initiated value events.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LinkEncryption {
    /// The link is not encrypted.
    #[default]
    None,
    /// The link is encrypted without MITM protection.
    Encrypted,
    /// The link is encrypted with an authenticated key.
    EncryptedMitm,
}

/// Policy for an indication that arrives while a previous one has not been
/// acknowledged by every application.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StaleIndicationPolicy {
    /// Log, reset the acknowledgement count, and deliver the new indication.
    #[default]
    Reset,
    /// Drop the indication and request link teardown from the transport.
    Disconnect,
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// ATT transaction timeout.
    pub rsp_timeout: std::time::Duration,
    /// Application indication-acknowledgement deadline.
    pub ind_ack_timeout: std::time::Duration,
    /// Stale indication handling.
    pub stale_indication: StaleIndicationPolicy,
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            rsp_timeout: RSP_TIMEOUT,
            ind_ack_timeout: IND_ACK_TIMEOUT,
            stale_indication: StaleIndicationPolicy::default(),
        }
    }
}

/// Client operation reported through [`Callbacks::on_complete`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientOp {
    Discovery,
    Read,
    Write,
    MtuExchange,
    Notification,
    Indication,
    Confirm,
}

crate::impl_display_via_debug! { ClientOp }

/// Discovery procedure variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiscoveryKind {
    /// Discover all primary services (Read By Group Type).
    PrimaryServices,
    /// Discover primary services by service UUID (Find By Type Value).
    PrimaryServicesByUuid,
    /// Find included services (Read By Type).
    IncludedServices,
    /// Discover all characteristics, optionally filtered by UUID
    /// (Read By Type).
    Characteristics,
    /// Discover characteristic descriptors (Find Information).
    Descriptors,
}

crate::impl_display_via_debug! { DiscoveryKind }

/// One record produced by a discovery procedure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiscoveryRecord {
    /// Primary service declaration and its group range.
    PrimaryService { handle: Handle, end: Handle, uuid: Uuid },
    /// Include declaration referencing another service.
    IncludedService {
        handle: Handle,
        start: Handle,
        end: Handle,
        uuid: Uuid,
    },
    /// Characteristic declaration.
    Characteristic {
        handle: Handle,
        props: CharProps,
        value_handle: Handle,
        uuid: Uuid,
    },
    /// Characteristic descriptor.
    Descriptor { handle: Handle, uuid: Uuid },
}

/// Attribute value carried by a completion event.
#[derive(Clone, Copy, Debug)]
pub struct AttValue<'a> {
    pub handle: Handle,
    pub offset: u16,
    pub value: &'a [u8],
}

/// Payload of a completion event.
#[derive(Clone, Copy, Debug, Default)]
pub enum CompleteData<'a> {
    #[default]
    None,
    /// Attribute value: a read result, a prepare-write echo, or a
    /// notification/indication value.
    Value(AttValue<'a>),
    /// Negotiated ATT payload size.
    Mtu(u16),
}

/// Read procedure variant.
#[derive(Clone, Debug)]
pub enum ReadKind {
    /// Read the value of the first attribute of the given type within the
    /// range, switching to blob reads if the value may be long. Reads a
    /// characteristic value by UUID when `uuid` is a characteristic type.
    ByType { range: HandleRange, uuid: Uuid },
    /// Read one attribute value, continuing with blob reads if it fills the
    /// payload.
    ByHandle { handle: Handle },
    /// Read part of an attribute value at an explicit offset. No loop.
    Partial { handle: Handle, offset: u16 },
    /// Read several complete attribute values in one request.
    Multiple { handles: Vec<Handle> },
}

/// Delivery mode for a write without response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteMode {
    /// Plain Write Command.
    Command,
    /// Signed Write Command carrying an authentication signature produced by
    /// the security manager.
    Signed([u8; SIG_LEN]),
}

/// Error returned when a client request cannot be accepted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum RequestError {
    #[error("unknown connection")]
    UnknownConnection,
    #[error("application not registered")]
    UnknownApplication,
    #[error("application registry is full")]
    RegistryFull,
    #[error("attribute value exceeds {MAX_ATTR_LEN} bytes")]
    ValueTooLong,
    #[error("invalid request parameter")]
    InvalidParameter,
}

/// Application-facing event sink. All methods are invoked from within the
/// engine's driving calls, on the driver's thread.
pub trait Callbacks: Send + Sync {
    /// Reports one record produced by a discovery procedure.
    fn on_discovery(&self, conn: ConnId, kind: DiscoveryKind, rec: &DiscoveryRecord);

    /// Reports discovery procedure termination. Called exactly once per
    /// discovery request.
    fn on_discovery_complete(&self, conn: ConnId, kind: DiscoveryKind, status: Status);

    /// Reports termination of a non-discovery procedure (exactly once per
    /// request) and every server-initiated value push.
    fn on_complete(
        &self,
        conn: ConnId,
        op: ClientOp,
        status: Status,
        enc: LinkEncryption,
        data: CompleteData<'_>,
    );
}

/// Registered application table, indexed by [`AppId`].
pub(super) struct AppRegistry {
    apps: Vec<Option<Arc<dyn Callbacks>>>,
}

impl AppRegistry {
    #[inline]
    const fn new() -> Self {
        Self { apps: Vec::new() }
    }

    fn insert(&mut self, cb: Arc<dyn Callbacks>) -> Option<AppId> {
        let i = match self.apps.iter().position(Option::is_none) {
            Some(i) => i,
            None if self.apps.len() < MAX_APPS => {
                self.apps.push(None);
                self.apps.len() - 1
            }
            None => return None,
        };
        self.apps[i] = Some(cb);
        AppId::from_idx(i)
    }

    fn remove(&mut self, id: AppId) -> bool {
        match self.apps.get_mut(id.idx()) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    pub(super) fn get(&self, id: AppId) -> Option<&Arc<dyn Callbacks>> {
        self.apps.get(id.idx()).and_then(Option::as_ref)
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = (AppId, &Arc<dyn Callbacks>)> {
        (self.apps.iter().enumerate()).filter_map(|(i, slot)| {
            slot.as_ref().and_then(|cb| Some((AppId::from_idx(i)?, cb)))
        })
    }

    /// Returns the number of registered applications.
    pub(super) fn count(&self) -> usize {
        self.apps.iter().filter(|s| s.is_some()).count()
    }
}

/// GATT client protocol engine for any number of connections.
pub struct Client<T: Transport> {
    cfg: Config,
    transport: T,
    apps: AppRegistry,
    conns: Vec<Option<Connection>>,
}

impl<T: Transport> Client<T> {
    /// Creates a new client engine over `transport`.
    #[inline]
    #[must_use]
    pub fn new(transport: T, cfg: Config) -> Self {
        Self {
            cfg,
            transport,
            apps: AppRegistry::new(),
            conns: Vec::new(),
        }
    }

    /// Returns the transport.
    #[inline(always)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the transport.
    #[inline(always)]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Registers an application.
    pub fn register(&mut self, cb: Arc<dyn Callbacks>) -> Result<AppId, RequestError> {
        self.apps.insert(cb).ok_or(RequestError::RegistryFull)
    }

    /// Deregisters an application, cancelling its live procedures without
    /// further callbacks.
    pub fn deregister(&mut self, app: AppId) {
        if !self.apps.remove(app) {
            return;
        }
        for conn in self.conns.iter_mut().flatten() {
            conn.cancel_app(app);
        }
    }

    /// Creates client state for a new connection. The negotiated payload size
    /// starts at [`DEFAULT_MTU`].
    pub fn connect(&mut self, link: LinkId, peer: BdAddr) {
        let i = link.idx();
        if self.conns.len() <= i {
            self.conns.resize_with(i + 1, || None);
        }
        if self.conns[i].is_some() {
            warn!("{link} already connected, resetting client state");
        }
        self.conns[i] = Some(Connection::new(link, peer));
    }

    /// Tears down a connection, ending every live procedure with
    /// [`Status::LinkLost`].
    pub fn disconnect(&mut self, link: LinkId) {
        let Some(mut conn) = self.conns.get_mut(link.idx()).and_then(Option::take) else {
            return;
        };
        for p in conn.take_procs() {
            if p.cancelled {
                continue;
            }
            let Some(cb) = self.apps.get(p.conn_id.app()) else {
                continue;
            };
            match &p.kind {
                ProcKind::Discovery(d) => {
                    cb.on_discovery_complete(p.conn_id, d.kind, Status::LinkLost);
                }
                _ => cb.on_complete(
                    p.conn_id,
                    p.op(),
                    Status::LinkLost,
                    conn.encryption,
                    CompleteData::None,
                ),
            }
        }
    }

    /// Updates the link encryption status supplied by the security manager.
    pub fn set_encryption(&mut self, link: LinkId, enc: LinkEncryption) {
        if let Some(conn) = self.conns.get_mut(link.idx()).and_then(Option::as_mut) {
            conn.encryption = enc;
        }
    }

    /// Returns the negotiated ATT payload size for a connection.
    #[must_use]
    pub fn payload_size(&self, link: LinkId) -> Option<u16> {
        (self.conns.get(link.idx()).and_then(Option::as_ref)).map(|c| c.payload_size)
    }

    /// Starts an MTU exchange requesting `rx_mtu` as the local receive MTU.
    pub fn configure_mtu(
        &mut self,
        conn_id: ConnId,
        rx_mtu: u16,
        now: Instant,
    ) -> Result<(), RequestError> {
        if !(DEFAULT_MTU..=MAX_MTU).contains(&rx_mtu) {
            return Err(RequestError::InvalidParameter);
        }
        self.check_app(conn_id)?;
        let (mut e, conn) = self.parts(conn_id.link())?;
        let pdu = crate::att::exchange_mtu_req(conn.payload_size, rx_mtu);
        let id = conn.add_proc(conn_id, ProcKind::Mtu(MtuState { req: rx_mtu }));
        e.enqueue(conn, Opcode::ExchangeMtuReq, pdu, Some(id), now);
        Ok(())
    }

    /// Starts a discovery procedure over `range`. `filter` is required for
    /// [`DiscoveryKind::PrimaryServicesByUuid`] and optional for
    /// [`DiscoveryKind::Characteristics`].
    pub fn discover(
        &mut self,
        conn_id: ConnId,
        kind: DiscoveryKind,
        range: HandleRange,
        filter: Option<Uuid>,
        now: Instant,
    ) -> Result<(), RequestError> {
        if kind == DiscoveryKind::PrimaryServicesByUuid && filter.is_none() {
            return Err(RequestError::InvalidParameter);
        }
        self.check_app(conn_id)?;
        let (mut e, conn) = self.parts(conn_id.link())?;
        let id = conn.add_proc(
            conn_id,
            ProcKind::Discovery(DiscoveryState {
                kind,
                window: Some(range),
                filter,
                pending_uuid128: None,
            }),
        );
        e.act_discovery(conn, id, now);
        Ok(())
    }

    /// Starts a read procedure.
    pub fn read(&mut self, conn_id: ConnId, kind: ReadKind, now: Instant) -> Result<(), RequestError> {
        if let ReadKind::Multiple { handles } = &kind {
            if handles.is_empty() || handles.len() > MAX_READ_MULTI_HANDLES {
                return Err(RequestError::InvalidParameter);
            }
        }
        self.check_app(conn_id)?;
        let (mut e, conn) = self.parts(conn_id.link())?;
        e.act_read(conn, conn_id, kind, now);
        Ok(())
    }

    /// Writes an attribute value with response, transparently using the
    /// prepare/execute procedure for values longer than `payload_size - 3`.
    pub fn write(
        &mut self,
        conn_id: ConnId,
        handle: Handle,
        value: &[u8],
        now: Instant,
    ) -> Result<(), RequestError> {
        if value.len() > MAX_ATTR_LEN {
            return Err(RequestError::ValueTooLong);
        }
        self.check_app(conn_id)?;
        let (mut e, conn) = self.parts(conn_id.link())?;
        e.act_write(conn, conn_id, WriteOp::Write, handle, value, 0, now);
        Ok(())
    }

    /// Writes an attribute value without response. The value and any
    /// signature must fit a single PDU.
    pub fn write_without_rsp(
        &mut self,
        conn_id: ConnId,
        handle: Handle,
        value: &[u8],
        mode: WriteMode,
        now: Instant,
    ) -> Result<(), RequestError> {
        self.check_app(conn_id)?;
        let (mut e, conn) = self.parts(conn_id.link())?;
        let hdr = match mode {
            WriteMode::Command => 3,
            WriteMode::Signed(_) => 3 + SIG_LEN,
        };
        if value.len() + hdr > usize::from(conn.payload_size) {
            return Err(RequestError::InvalidParameter);
        }
        let (op, pdu) = match mode {
            WriteMode::Command => (
                Opcode::WriteCmd,
                crate::att::write_req(conn.payload_size, Opcode::WriteCmd, handle, value),
            ),
            WriteMode::Signed(sig) => (
                Opcode::SignedWriteCmd,
                crate::att::signed_write_cmd(conn.payload_size, handle, value, &sig),
            ),
        };
        let id = conn.add_proc(
            conn_id,
            ProcKind::Write(WriteState::new(WriteOp::Command, handle, value, 0)),
        );
        e.enqueue(conn, op, pdu, Some(id), now);
        Ok(())
    }

    /// Queues prepare-write fragments of `value` at the server-side `offset`
    /// without executing. Each fragment's echo is verified; the final echo is
    /// returned through the completion callback. The application commits or
    /// cancels with [`Client::execute_write`].
    pub fn prepare_write(
        &mut self,
        conn_id: ConnId,
        handle: Handle,
        offset: u16,
        value: &[u8],
        now: Instant,
    ) -> Result<(), RequestError> {
        if value.is_empty() {
            return Err(RequestError::InvalidParameter);
        }
        if value.len() > MAX_ATTR_LEN {
            return Err(RequestError::ValueTooLong);
        }
        self.check_app(conn_id)?;
        let (mut e, conn) = self.parts(conn_id.link())?;
        e.act_write(conn, conn_id, WriteOp::Prepare, handle, value, offset, now);
        Ok(())
    }

    /// Commits or cancels the server's prepared write queue.
    pub fn execute_write(
        &mut self,
        conn_id: ConnId,
        commit: bool,
        now: Instant,
    ) -> Result<(), RequestError> {
        self.check_app(conn_id)?;
        let (mut e, conn) = self.parts(conn_id.link())?;
        let pdu = crate::att::execute_write_req(conn.payload_size, commit);
        let id = conn.add_proc(
            conn_id,
            ProcKind::Write(WriteState::new(WriteOp::Execute, Handle::MIN, &[], 0)),
        );
        e.enqueue(conn, Opcode::ExecuteWriteReq, pdu, Some(id), now);
        Ok(())
    }

    /// Acknowledges the pending indication on behalf of one application. The
    /// confirmation PDU is sent once every notified application has
    /// acknowledged.
    pub fn confirm_indication(&mut self, conn_id: ConnId, now: Instant) -> Result<(), RequestError> {
        self.check_app(conn_id)?;
        let (mut e, conn) = self.parts(conn_id.link())?;
        if conn.ind_count == 0 {
            warn!("{conn_id}: confirmation with no pending indication");
            return Ok(());
        }
        conn.ind_count -= 1;
        if conn.ind_count > 0 {
            return Ok(());
        }
        conn.ind_ack_deadline = None;
        let enc = conn.encryption;
        e.send_confirmation(conn, now);
        if let Some(cb) = self.apps.get(conn_id.app()) {
            cb.on_complete(conn_id, ClientOp::Confirm, Status::Success, enc, CompleteData::None);
        }
        Ok(())
    }

    /// Cancels all live procedures issued by `conn_id`, ending each with
    /// [`Status::Cancelled`]. A procedure whose request is already on the air
    /// stays allocated until its response arrives and is then dropped
    /// silently.
    pub fn cancel(&mut self, conn_id: ConnId, now: Instant) -> Result<(), RequestError> {
        self.check_app(conn_id)?;
        let (mut e, conn) = self.parts(conn_id.link())?;
        e.cancel(conn, conn_id, now);
        Ok(())
    }

    /// Processes one inbound PDU from the transport.
    pub fn deliver(&mut self, link: LinkId, pdu: &[u8], now: Instant) {
        let Ok((mut e, conn)) = self.parts(link) else {
            warn!("PDU for unknown {link}");
            return;
        };
        e.deliver(conn, pdu, now);
    }

    /// Returns the next timer deadline, if any.
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Instant> {
        (self.conns.iter().flatten())
            .flat_map(|c| [c.rsp_deadline, c.ind_ack_deadline])
            .flatten()
            .min()
    }

    /// Fires every expired timer.
    pub fn handle_timeout(&mut self, now: Instant) {
        for i in 0..self.conns.len() {
            let Some(conn) = self.conns[i].as_mut() else {
                continue;
            };
            let mut e = Engine {
                tr: &mut self.transport,
                apps: &self.apps,
                cfg: &self.cfg,
            };
            e.handle_timeout(conn, now);
        }
    }

    #[inline]
    fn check_app(&self, conn_id: ConnId) -> Result<(), RequestError> {
        match self.apps.get(conn_id.app()) {
            Some(_) => Ok(()),
            None => Err(RequestError::UnknownApplication),
        }
    }

    fn parts(&mut self, link: LinkId) -> Result<(Engine<'_, T>, &mut Connection), RequestError> {
        let conn = (self.conns.get_mut(link.idx()).and_then(Option::as_mut))
            .ok_or(RequestError::UnknownConnection)?;
        Ok((
            Engine {
                tr: &mut self.transport,
                apps: &self.apps,
                cfg: &self.cfg,
            },
            conn,
        ))
    }
}

impl<T: Transport + Debug> Debug for Client<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_struct("Client"))
            .field("transport", &self.transport)
            .field("apps", &self.apps.count())
            .field("conns", &self.conns.iter().flatten().count())
            .finish()
    }
}
