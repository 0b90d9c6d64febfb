use structbuf::{Pack, Packer, StructBuf, Unpacker};
use tracing::trace;

use crate::uuid::{Uuid, Uuid16};

use super::*;

/// Response decoding failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DecodeError {
    /// PDU shorter than the opcode-specific minimum.
    Truncated,
    /// A declared length field exceeds the MTU or the remaining bytes.
    BadLength,
    /// A handle field contains the invalid handle 0.
    InvalidHandle,
}

/// Returns an encoded PDU, calling `f` to fill in the parameters after the
/// opcode. The buffer is bounded by the negotiated payload size.
#[inline]
fn pack(mtu: u16, op: Opcode, f: impl FnOnce(&mut Packer)) -> StructBuf {
    let mut pdu = StructBuf::new(mtu as usize);
    f(pdu.append().u8(op));
    trace!("{op}: {:02X?}", pdu.as_ref());
    pdu
}

/// Writes a UUID in its shortest wire form (16-bit as two bytes, 32-bit
/// promoted to 128-bit, 128-bit as-is, all little-endian).
#[inline]
fn put_uuid(p: &mut Packer, uuid: Uuid) {
    match uuid.as_u16() {
        Some(v) => p.u16(v),
        None => p.u128(uuid),
    };
}

/// `ATT_EXCHANGE_MTU_REQ` ([Vol 3] Part F, Section 3.4.2.1).
pub(crate) fn exchange_mtu_req(mtu: u16, client_rx_mtu: u16) -> StructBuf {
    pack(mtu, Opcode::ExchangeMtuReq, |p| {
        p.u16(client_rx_mtu);
    })
}

/// `ATT_FIND_INFORMATION_REQ` ([Vol 3] Part F, Section 3.4.3.1).
pub(crate) fn find_information_req(mtu: u16, range: HandleRange) -> StructBuf {
    pack(mtu, Opcode::FindInformationReq, |p| {
        p.u16(range.start()).u16(range.end());
    })
}

/// `ATT_FIND_BY_TYPE_VALUE_REQ` ([Vol 3] Part F, Section 3.4.3.3). The
/// attribute type is always a 16-bit UUID; the match value is the target UUID
/// in its promoted wire form.
pub(crate) fn find_by_type_value_req(
    mtu: u16,
    range: HandleRange,
    typ: Uuid16,
    value: Uuid,
) -> StructBuf {
    pack(mtu, Opcode::FindByTypeValueReq, |p| {
        p.u16(range.start()).u16(range.end()).u16(typ);
        put_uuid(p, value);
    })
}

/// `ATT_READ_BY_TYPE_REQ` or `ATT_READ_BY_GROUP_TYPE_REQ`
/// ([Vol 3] Part F, Sections 3.4.4.1 and 3.4.4.9).
pub(crate) fn read_by_type_req(mtu: u16, grouped: bool, range: HandleRange, typ: Uuid) -> StructBuf {
    let op = if grouped {
        Opcode::ReadByGroupTypeReq
    } else {
        Opcode::ReadByTypeReq
    };
    pack(mtu, op, |p| {
        p.u16(range.start()).u16(range.end());
        put_uuid(p, typ);
    })
}

/// `ATT_READ_REQ` ([Vol 3] Part F, Section 3.4.4.3).
pub(crate) fn read_req(mtu: u16, hdl: Handle) -> StructBuf {
    pack(mtu, Opcode::ReadReq, |p| {
        p.u16(hdl);
    })
}

/// `ATT_READ_BLOB_REQ` ([Vol 3] Part F, Section 3.4.4.5).
pub(crate) fn read_blob_req(mtu: u16, hdl: Handle, offset: u16) -> StructBuf {
    pack(mtu, Opcode::ReadBlobReq, |p| {
        p.u16(hdl).u16(offset);
    })
}

/// `ATT_READ_MULTIPLE_REQ` ([Vol 3] Part F, Section 3.4.4.7).
pub(crate) fn read_multiple_req(mtu: u16, hdls: &[Handle]) -> StructBuf {
    pack(mtu, Opcode::ReadMultipleReq, |p| {
        for &hdl in hdls {
            p.u16(hdl);
        }
    })
}

/// `ATT_WRITE_REQ` or `ATT_WRITE_CMD`
/// ([Vol 3] Part F, Sections 3.4.5.1 and 3.4.5.3).
pub(crate) fn write_req(mtu: u16, op: Opcode, hdl: Handle, value: &[u8]) -> StructBuf {
    debug_assert!(matches!(op, Opcode::WriteReq | Opcode::WriteCmd));
    pack(mtu, op, |p| {
        p.u16(hdl).put(value);
    })
}

/// `ATT_SIGNED_WRITE_CMD` ([Vol 3] Part F, Section 3.4.5.4).
pub(crate) fn signed_write_cmd(mtu: u16, hdl: Handle, value: &[u8], sig: &[u8; SIG_LEN]) -> StructBuf {
    pack(mtu, Opcode::SignedWriteCmd, |p| {
        p.u16(hdl).put(value).put(sig);
    })
}

/// `ATT_PREPARE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.1).
pub(crate) fn prepare_write_req(mtu: u16, hdl: Handle, offset: u16, value: &[u8]) -> StructBuf {
    pack(mtu, Opcode::PrepareWriteReq, |p| {
        p.u16(hdl).u16(offset).put(value);
    })
}

/// `ATT_EXECUTE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.3).
pub(crate) fn execute_write_req(mtu: u16, commit: bool) -> StructBuf {
    pack(mtu, Opcode::ExecuteWriteReq, |p| {
        p.bool(commit);
    })
}

/// `ATT_HANDLE_VALUE_CFM` ([Vol 3] Part F, Section 3.4.7.3).
pub(crate) fn handle_value_cfm(mtu: u16) -> StructBuf {
    pack(mtu, Opcode::HandleValueCfm, |_| {})
}

/// `ATT_EXCHANGE_MTU_RSP` parameters ([Vol 3] Part F, Section 3.4.2.2).
#[derive(Clone, Copy, Debug)]
pub(crate) struct MtuRsp(pub u16);

impl MtuRsp {
    pub fn decode(b: &[u8]) -> Result<Self, DecodeError> {
        if b.len() < MTU_RSP_MIN_LEN {
            return Err(DecodeError::Truncated);
        }
        Ok(Self(Unpacker::new(b).u16()))
    }
}

/// `ATT_FIND_INFORMATION_RSP` ([Vol 3] Part F, Section 3.4.3.2). Iterates
/// over `(handle, uuid)` pairs; iteration stops at the first pair that cannot
/// be parsed.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FindInfoRsp<'a> {
    uuid_len: usize,
    p: Unpacker<'a>,
}

impl<'a> FindInfoRsp<'a> {
    const FORMAT_UUID16: u8 = 0x01;
    const FORMAT_UUID128: u8 = 0x02;

    pub fn decode(b: &'a [u8]) -> Result<Self, DecodeError> {
        if b.len() < FIND_INFO_RSP_MIN_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut p = Unpacker::new(b);
        let uuid_len = match p.u8() {
            Self::FORMAT_UUID16 => Uuid16::BYTES,
            Self::FORMAT_UUID128 => Uuid::BYTES,
            _ => 0, // Unknown format yields no records
        };
        Ok(Self { uuid_len, p })
    }
}

impl Iterator for FindInfoRsp<'_> {
    type Item = (Handle, Uuid);

    fn next(&mut self) -> Option<Self::Item> {
        if self.uuid_len == 0 || self.p.len() < 2 + self.uuid_len {
            return None;
        }
        let hdl = Handle::new(self.p.u16())?;
        let uuid = match self.uuid_len {
            Uuid16::BYTES => Uuid16::new(self.p.u16()).map(Uuid16::as_uuid),
            _ => Uuid::new(self.p.u128()),
        }?;
        Some((hdl, uuid))
    }
}

/// `ATT_FIND_BY_TYPE_VALUE_RSP` ([Vol 3] Part F, Section 3.4.3.4). Iterates
/// over `(found_handle, group_end_handle)` pairs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FindByTypeValueRsp<'a>(Unpacker<'a>);

impl<'a> FindByTypeValueRsp<'a> {
    #[inline]
    pub fn decode(b: &'a [u8]) -> Self {
        Self(Unpacker::new(b))
    }
}

impl Iterator for FindByTypeValueRsp<'_> {
    type Item = (Handle, Handle);

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.len() < 4 {
            return None;
        }
        let found = Handle::new(self.0.u16())?;
        let end = Handle::new(self.0.u16())?;
        Some((found, end))
    }
}

/// One `ATT_READ_BY_TYPE_RSP` / `ATT_READ_BY_GROUP_TYPE_RSP` record.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TypeValue<'a> {
    pub handle: Handle,
    /// Group end handle; present only in grouped responses.
    pub group_end: Option<Handle>,
    pub value: &'a [u8],
}

/// `ATT_READ_BY_TYPE_RSP` or `ATT_READ_BY_GROUP_TYPE_RSP`
/// ([Vol 3] Part F, Sections 3.4.4.2 and 3.4.4.10). The declared element
/// length is validated against both `payload_size - 2` and the remaining
/// bytes before any record is read.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReadByTypeRsp<'a> {
    p: Unpacker<'a>,
    val_len: usize,
    grouped: bool,
}

impl<'a> ReadByTypeRsp<'a> {
    pub fn decode(b: &'a [u8], payload_size: u16, grouped: bool) -> Result<Self, DecodeError> {
        if b.len() < READ_BY_TYPE_RSP_MIN_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut p = Unpacker::new(b);
        let elen = p.u8() as usize;
        if elen > usize::from(payload_size).saturating_sub(2) || elen > b.len() - 1 {
            return Err(DecodeError::BadLength);
        }
        let hdr = if grouped { 4 } else { 2 };
        if elen < hdr {
            return Err(DecodeError::BadLength);
        }
        Ok(Self {
            p,
            val_len: elen - hdr,
            grouped,
        })
    }

    /// Consumes the response as a single-value read: the first record's
    /// handle, and every remaining byte as the attribute value.
    pub fn read_value(mut self) -> Result<(Handle, &'a [u8]), DecodeError> {
        if self.p.len() < 2 {
            return Err(DecodeError::Truncated);
        }
        let hdl = Handle::new(self.p.u16()).ok_or(DecodeError::InvalidHandle)?;
        Ok((hdl, self.p.into_inner()))
    }
}

impl<'a> Iterator for ReadByTypeRsp<'a> {
    type Item = Result<TypeValue<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hdr = if self.grouped { 4 } else { 2 };
        if self.p.len() < hdr + self.val_len {
            return None;
        }
        let Some(handle) = Handle::new(self.p.u16()) else {
            return Some(Err(DecodeError::InvalidHandle));
        };
        let group_end = if self.grouped {
            match Handle::new(self.p.u16()) {
                Some(h) => Some(h),
                None => return Some(Err(DecodeError::InvalidHandle)),
            }
        } else {
            None
        };
        // Length was checked above
        let value = self.p.skip(self.val_len)?;
        Some(Ok(TypeValue {
            handle,
            group_end,
            value: value.into_inner(),
        }))
    }
}

/// `ATT_PREPARE_WRITE_RSP` parameters ([Vol 3] Part F, Section 3.4.6.2).
#[derive(Clone, Copy, Debug)]
pub(crate) struct PrepareWriteRsp<'a> {
    pub handle: Handle,
    pub offset: u16,
    pub value: &'a [u8],
}

impl<'a> PrepareWriteRsp<'a> {
    pub fn decode(b: &'a [u8]) -> Result<Self, DecodeError> {
        if b.len() < PREPARE_WRITE_RSP_MIN_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut p = Unpacker::new(b);
        let handle = Handle::new(p.u16()).ok_or(DecodeError::InvalidHandle)?;
        let offset = p.u16();
        Ok(Self {
            handle,
            offset,
            value: p.into_inner(),
        })
    }
}

/// `ATT_ERROR_RSP` parameters ([Vol 3] Part F, Section 3.4.1.1).
#[derive(Clone, Copy, Debug)]
pub(crate) struct ErrRsp {
    pub request_opcode: u8,
    pub handle: u16,
    pub reason: ErrorCode,
}

impl ErrRsp {
    /// Decodes an error response. A response shorter than 4 bytes, or one
    /// carrying an unrecognized reason code, yields
    /// [`ErrorCode::UnlikelyError`]: the request cannot be performed for an
    /// unknown reason ([Vol 3] Part F, Section 3.4.1.1).
    pub fn decode(b: &[u8]) -> Self {
        if b.len() < ERROR_RSP_LEN {
            return Self {
                request_opcode: 0,
                handle: 0,
                reason: ErrorCode::UnlikelyError,
            };
        }
        let mut p = Unpacker::new(b);
        Self {
            request_opcode: p.u8(),
            handle: p.u16(),
            reason: ErrorCode::try_from(p.u8()).unwrap_or(ErrorCode::UnlikelyError),
        }
    }
}

/// `ATT_HANDLE_VALUE_NTF` / `ATT_HANDLE_VALUE_IND` parameters
/// ([Vol 3] Part F, Sections 3.4.7.1 and 3.4.7.2).
#[derive(Clone, Copy, Debug)]
pub(crate) struct ValueNtf<'a> {
    /// `None` if the server sent the invalid handle 0.
    pub handle: Option<Handle>,
    pub value: &'a [u8],
}

impl<'a> ValueNtf<'a> {
    pub fn decode(b: &'a [u8]) -> Result<Self, DecodeError> {
        if b.len() < NOTIFICATION_MIN_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut p = Unpacker::new(b);
        Ok(Self {
            handle: Handle::new(p.u16()),
            value: p.into_inner(),
        })
    }
}
