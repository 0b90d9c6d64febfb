//! Attribute Protocol, client role ([Vol 3] Part F).

use crate::{BdAddr, LinkId};

pub use {consts::*, handle::*};
pub(crate) use pdu::*;

mod consts;
mod handle;
mod pdu;

/// Result of submitting a PDU to the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxStatus {
    /// The PDU was accepted for transmission.
    Success,
    /// The channel is congested. The transport retains the PDU and will
    /// transmit it once the congestion clears; the caller must not resubmit.
    Congested,
    /// The PDU was rejected and will not be transmitted.
    Error,
}

/// ATT bearer contract. The bearer is assumed to be an in-order, reliable,
/// segment-free byte channel carrying one complete ATT PDU per
/// [`send`](Self::send) / delivery.
pub trait Transport {
    /// Submits one outbound PDU for the specified link.
    fn send(&mut self, link: LinkId, pdu: &[u8]) -> TxStatus;

    /// Aligns the fixed-channel TX data length with a newly negotiated ATT
    /// payload size.
    fn set_tx_data_length(&mut self, peer: BdAddr, cid: u16, mtu: u16);

    /// Requests teardown of the underlying link following a protocol
    /// violation.
    fn disconnect(&mut self, link: LinkId);
}
