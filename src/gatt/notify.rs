use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::warn;

use crate::att::{Opcode, Transport, ValueNtf};

use super::client::Engine;
use super::*;

/// Handles one Handle Value Notification or Indication: validates the PDU,
/// manages the indication acknowledgement count and timer, and fans the value
/// out to every registered application with the link encryption status
/// attached.
pub(super) fn process<T: Transport>(
    e: &mut Engine<'_, T>,
    conn: &mut Connection,
    op: Opcode,
    body: &[u8],
    now: Instant,
) {
    let Ok(ntf) = ValueNtf::decode(body) else {
        warn!("{}: illegal notification PDU length, discard", conn.link);
        return;
    };
    if ntf.value.len() > MAX_ATTR_LEN {
        warn!("{}: notification value exceeds {MAX_ATTR_LEN} bytes, discard", conn.link);
        return;
    }
    let ind = op == Opcode::HandleValueInd;
    let Some(handle) = ntf.handle else {
        // Illegal handle; ack indications anyway so the server is not stuck
        warn!("{}: {op} for invalid handle, discard", conn.link);
        if ind {
            e.send_confirmation(conn, now);
        }
        return;
    };

    let apps = e.apps;
    let recipients: SmallVec<[(AppId, &Arc<dyn Callbacks>); 4]> = apps.iter().collect();
    if ind {
        if conn.ind_count > 0 {
            match e.cfg.stale_indication {
                StaleIndicationPolicy::Reset => {
                    warn!(
                        "{}: indication while {} ack(s) pending, resetting",
                        conn.link, conn.ind_count
                    );
                }
                StaleIndicationPolicy::Disconnect => {
                    warn!(
                        "{}: indication while {} ack(s) pending, disconnecting",
                        conn.link, conn.ind_count
                    );
                    e.tr.disconnect(conn.link);
                    return;
                }
            }
        }
        // Count and arm the timer before any callback runs
        #[allow(clippy::cast_possible_truncation)]
        {
            conn.ind_count = recipients.len() as u16;
        }
        if recipients.is_empty() {
            e.send_confirmation(conn, now);
        } else {
            conn.ind_ack_deadline = Some(now + e.cfg.ind_ack_timeout);
        }
    }

    let enc = conn.encryption;
    let op = if ind {
        ClientOp::Indication
    } else {
        ClientOp::Notification
    };
    let value = AttValue {
        handle,
        offset: 0,
        value: ntf.value,
    };
    for (app, cb) in recipients {
        cb.on_complete(
            ConnId::new(conn.link, app),
            op,
            Status::Success,
            enc,
            CompleteData::Value(value),
        );
    }
}
