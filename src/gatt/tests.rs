use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use matches::assert_matches;

use crate::att::{ErrorCode, Handle, HandleRange, Transport, TxStatus, SIG_LEN};
use crate::{BdAddr, LinkId, Uuid};

use super::*;

fn h(v: u16) -> Handle {
    Handle::new(v).unwrap()
}

fn uuid16(v: u16) -> Uuid {
    crate::Uuid16::new(v).unwrap().as_uuid()
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Event {
    Disc(ConnId, DiscoveryKind, DiscoveryRecord),
    DiscDone(ConnId, DiscoveryKind, Status),
    Done(ConnId, ClientOp, Status, Data),
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Data {
    None,
    Value(u16, u16, Vec<u8>),
    Mtu(u16),
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl Recorder {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl Callbacks for Recorder {
    fn on_discovery(&self, conn: ConnId, kind: DiscoveryKind, rec: &DiscoveryRecord) {
        (self.0.lock().unwrap()).push(Event::Disc(conn, kind, *rec));
    }

    fn on_discovery_complete(&self, conn: ConnId, kind: DiscoveryKind, status: Status) {
        (self.0.lock().unwrap()).push(Event::DiscDone(conn, kind, status));
    }

    fn on_complete(
        &self,
        conn: ConnId,
        op: ClientOp,
        status: Status,
        _enc: LinkEncryption,
        data: CompleteData<'_>,
    ) {
        let data = match data {
            CompleteData::None => Data::None,
            CompleteData::Value(v) => Data::Value(v.handle.raw(), v.offset, v.value.to_vec()),
            CompleteData::Mtu(m) => Data::Mtu(m),
        };
        (self.0.lock().unwrap()).push(Event::Done(conn, op, status, data));
    }
}

#[derive(Debug, Default)]
struct Mock {
    sent: Vec<Vec<u8>>,
    next_status: Option<TxStatus>,
    tx_len: Vec<(BdAddr, u16, u16)>,
    disconnected: Vec<LinkId>,
}

impl Transport for Mock {
    fn send(&mut self, _link: LinkId, pdu: &[u8]) -> TxStatus {
        self.sent.push(pdu.to_vec());
        self.next_status.take().unwrap_or(TxStatus::Success)
    }

    fn set_tx_data_length(&mut self, peer: BdAddr, cid: u16, mtu: u16) {
        self.tx_len.push((peer, cid, mtu));
    }

    fn disconnect(&mut self, link: LinkId) {
        self.disconnected.push(link);
    }
}

const PEER: BdAddr = BdAddr::new([1, 2, 3, 4, 5, 6]);

struct Fix {
    cl: Client<Mock>,
    conn: ConnId,
    rec: Arc<Recorder>,
    t0: Instant,
}

fn fix() -> Fix {
    fix_with(Config::default())
}

fn fix_with(cfg: Config) -> Fix {
    let mut cl = Client::new(Mock::default(), cfg);
    let rec = Arc::new(Recorder::default());
    let app = cl.register(rec.clone()).unwrap();
    let link = LinkId::new(0);
    cl.connect(link, PEER);
    Fix {
        conn: ConnId::new(link, app),
        cl,
        rec,
        t0: Instant::now(),
    }
}

impl Fix {
    fn sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.cl.transport_mut().sent)
    }

    fn rx(&mut self, pdu: &[u8]) {
        self.cl.deliver(self.conn.link(), pdu, self.t0);
    }

    fn events(&self) -> Vec<Event> {
        self.rec.take()
    }
}

#[test]
fn mtu_exchange() {
    let mut f = fix();
    f.cl.configure_mtu(f.conn, 100, f.t0).unwrap();
    assert_eq!(f.sent(), vec![vec![0x02, 100, 0]]);

    f.rx(&[0x03, 64, 0]);
    assert_eq!(f.cl.payload_size(f.conn.link()), Some(64));
    assert_eq!(
        f.events(),
        vec![Event::Done(f.conn, ClientOp::MtuExchange, Status::Success, Data::Mtu(64))]
    );
    assert_eq!(f.cl.transport().tx_len, vec![(PEER, 0x0004, 64)]);
}

#[test]
fn mtu_never_decreases() {
    let mut f = fix();
    f.cl.configure_mtu(f.conn, 100, f.t0).unwrap();
    f.rx(&[0x03, 64, 0]);
    f.events();

    f.cl.configure_mtu(f.conn, 100, f.t0).unwrap();
    f.rx(&[0x03, 32, 0]);
    assert_eq!(f.cl.payload_size(f.conn.link()), Some(64));
    assert_eq!(
        f.events(),
        vec![Event::Done(f.conn, ClientOp::MtuExchange, Status::Success, Data::Mtu(64))]
    );
}

#[test]
fn mtu_short_response() {
    let mut f = fix();
    f.cl.configure_mtu(f.conn, 100, f.t0).unwrap();
    f.sent();
    f.rx(&[0x03, 64]);
    assert_eq!(
        f.events(),
        vec![Event::Done(f.conn, ClientOp::MtuExchange, Status::InvalidPdu, Data::None)]
    );
    assert_eq!(f.cl.payload_size(f.conn.link()), Some(23));
}

#[test]
fn mtu_request_validation() {
    let mut f = fix();
    assert_eq!(
        f.cl.configure_mtu(f.conn, 22, f.t0),
        Err(RequestError::InvalidParameter)
    );
    assert_eq!(
        f.cl.configure_mtu(f.conn, 518, f.t0),
        Err(RequestError::InvalidParameter)
    );
}

#[test]
fn discover_primary_services() {
    let mut f = fix();
    f.cl.discover(f.conn, DiscoveryKind::PrimaryServices, HandleRange::ALL, None, f.t0)
        .unwrap();
    assert_eq!(f.sent(), vec![vec![0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]]);

    #[rustfmt::skip]
    f.rx(&[
        0x11, 6,
        0x01, 0x00, 0x05, 0x00, 0x00, 0x18,
        0x10, 0x00, 0x18, 0x00, 0x0A, 0x18,
    ]);
    assert_eq!(
        f.events(),
        vec![
            Event::Disc(
                f.conn,
                DiscoveryKind::PrimaryServices,
                DiscoveryRecord::PrimaryService {
                    handle: h(0x0001),
                    end: h(0x0005),
                    uuid: uuid16(0x1800),
                },
            ),
            Event::Disc(
                f.conn,
                DiscoveryKind::PrimaryServices,
                DiscoveryRecord::PrimaryService {
                    handle: h(0x0010),
                    end: h(0x0018),
                    uuid: uuid16(0x180A),
                },
            ),
        ]
    );
    // Window advanced past the last group end handle
    assert_eq!(f.sent(), vec![vec![0x10, 0x19, 0x00, 0xFF, 0xFF, 0x00, 0x28]]);

    f.rx(&[0x01, 0x10, 0x19, 0x00, 0x0A]);
    assert_eq!(
        f.events(),
        vec![Event::DiscDone(f.conn, DiscoveryKind::PrimaryServices, Status::Success)]
    );
    assert!(f.sent().is_empty());
}

#[test]
fn discover_primary_services_by_uuid() {
    let mut f = fix();
    f.cl.discover(
        f.conn,
        DiscoveryKind::PrimaryServicesByUuid,
        HandleRange::ALL,
        Some(uuid16(0x1800)),
        f.t0,
    )
    .unwrap();
    assert_eq!(
        f.sent(),
        vec![vec![0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x00, 0x18]]
    );

    f.rx(&[0x07, 0x01, 0x00, 0x05, 0x00]);
    assert_eq!(
        f.events(),
        vec![Event::Disc(
            f.conn,
            DiscoveryKind::PrimaryServicesByUuid,
            DiscoveryRecord::PrimaryService {
                handle: h(0x0001),
                end: h(0x0005),
                uuid: uuid16(0x1800),
            },
        )]
    );
    assert_eq!(
        f.sent(),
        vec![vec![0x06, 0x06, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x00, 0x18]]
    );

    f.rx(&[0x01, 0x06, 0x06, 0x00, 0x0A]);
    assert_eq!(
        f.events(),
        vec![Event::DiscDone(f.conn, DiscoveryKind::PrimaryServicesByUuid, Status::Success)]
    );
}

#[test]
fn discover_by_uuid_requires_filter() {
    let mut f = fix();
    assert_eq!(
        f.cl.discover(f.conn, DiscoveryKind::PrimaryServicesByUuid, HandleRange::ALL, None, f.t0),
        Err(RequestError::InvalidParameter)
    );
}

#[test]
fn discover_characteristics() {
    let mut f = fix();
    f.cl.discover(f.conn, DiscoveryKind::Characteristics, HandleRange::ALL, None, f.t0)
        .unwrap();
    assert_eq!(f.sent(), vec![vec![0x08, 0x01, 0x00, 0xFF, 0xFF, 0x03, 0x28]]);

    // decl 0x0002: props READ|NOTIFY, value handle 0x0003, UUID 0x2A00
    f.rx(&[0x09, 7, 0x02, 0x00, 0x12, 0x03, 0x00, 0x00, 0x2A]);
    assert_eq!(
        f.events(),
        vec![Event::Disc(
            f.conn,
            DiscoveryKind::Characteristics,
            DiscoveryRecord::Characteristic {
                handle: h(0x0002),
                props: CharProps::READ | CharProps::NOTIFY,
                value_handle: h(0x0003),
                uuid: uuid16(0x2A00),
            },
        )]
    );
    assert_eq!(f.sent(), vec![vec![0x08, 0x03, 0x00, 0xFF, 0xFF, 0x03, 0x28]]);

    f.rx(&[0x01, 0x08, 0x03, 0x00, 0x0A]);
    assert_eq!(
        f.events(),
        vec![Event::DiscDone(f.conn, DiscoveryKind::Characteristics, Status::Success)]
    );
}

#[test]
fn characteristic_uuid_filter_skips_silently() {
    let mut f = fix();
    f.cl.discover(
        f.conn,
        DiscoveryKind::Characteristics,
        HandleRange::ALL,
        Some(uuid16(0x2A01)),
        f.t0,
    )
    .unwrap();
    f.sent();

    f.rx(&[0x09, 7, 0x02, 0x00, 0x02, 0x03, 0x00, 0x00, 0x2A]);
    // Record skipped, but the window still advances
    assert!(f.events().is_empty());
    assert_eq!(f.sent(), vec![vec![0x08, 0x03, 0x00, 0xFF, 0xFF, 0x03, 0x28]]);
}

#[test]
fn discover_descriptors() {
    let mut f = fix();
    let range = HandleRange::new(h(0x0004), h(0x0006)).unwrap();
    f.cl.discover(f.conn, DiscoveryKind::Descriptors, range, None, f.t0)
        .unwrap();
    assert_eq!(f.sent(), vec![vec![0x04, 0x04, 0x00, 0x06, 0x00]]);

    f.rx(&[0x05, 0x01, 0x04, 0x00, 0x02, 0x29]);
    assert_eq!(
        f.events(),
        vec![Event::Disc(
            f.conn,
            DiscoveryKind::Descriptors,
            DiscoveryRecord::Descriptor {
                handle: h(0x0004),
                uuid: uuid16(0x2902),
            },
        )]
    );
    assert_eq!(f.sent(), vec![vec![0x04, 0x05, 0x00, 0x06, 0x00]]);

    f.rx(&[0x01, 0x04, 0x05, 0x00, 0x0A]);
    assert_eq!(
        f.events(),
        vec![Event::DiscDone(f.conn, DiscoveryKind::Descriptors, Status::Success)]
    );
}

#[test]
fn included_service_with_inline_uuid() {
    let mut f = fix();
    f.cl.discover(f.conn, DiscoveryKind::IncludedServices, HandleRange::ALL, None, f.t0)
        .unwrap();
    f.sent();

    // decl 0x0050 -> included 0x0060..0x0068, UUID 0x1800
    f.rx(&[0x09, 8, 0x50, 0x00, 0x60, 0x00, 0x68, 0x00, 0x00, 0x18]);
    assert_eq!(
        f.events(),
        vec![Event::Disc(
            f.conn,
            DiscoveryKind::IncludedServices,
            DiscoveryRecord::IncludedService {
                handle: h(0x0050),
                start: h(0x0060),
                end: h(0x0068),
                uuid: uuid16(0x1800),
            },
        )]
    );
    assert_eq!(f.sent(), vec![vec![0x08, 0x51, 0x00, 0xFF, 0xFF, 0x02, 0x28]]);
}

#[test]
fn included_service_resolves_128bit_uuid() {
    let mut f = fix();
    f.cl.discover(f.conn, DiscoveryKind::IncludedServices, HandleRange::ALL, None, f.t0)
        .unwrap();
    f.sent();

    // 4-byte value: the 128-bit service UUID does not fit
    f.rx(&[0x09, 6, 0x50, 0x00, 0x60, 0x00, 0x68, 0x00]);
    assert!(f.events().is_empty());
    // The engine reads the included service declaration
    assert_eq!(f.sent(), vec![vec![0x0A, 0x60, 0x00]]);

    let uuid = Uuid::new(0x0011_2233_4455_6677_8899_AABB_CCDD_EEFF).unwrap();
    let mut rsp = vec![0x0B];
    rsp.extend_from_slice(&uuid.to_bytes());
    f.rx(&rsp);
    assert_eq!(
        f.events(),
        vec![Event::Disc(
            f.conn,
            DiscoveryKind::IncludedServices,
            DiscoveryRecord::IncludedService {
                handle: h(0x0050),
                start: h(0x0060),
                end: h(0x0068),
                uuid,
            },
        )]
    );
    // Discovery resumes after the include declaration
    assert_eq!(f.sent(), vec![vec![0x08, 0x51, 0x00, 0xFF, 0xFF, 0x02, 0x28]]);

    f.rx(&[0x01, 0x08, 0x51, 0x00, 0x0A]);
    assert_eq!(
        f.events(),
        vec![Event::DiscDone(f.conn, DiscoveryKind::IncludedServices, Status::Success)]
    );
}

#[test]
fn included_service_bad_read_length() {
    let mut f = fix();
    f.cl.discover(f.conn, DiscoveryKind::IncludedServices, HandleRange::ALL, None, f.t0)
        .unwrap();
    f.sent();
    f.rx(&[0x09, 6, 0x50, 0x00, 0x60, 0x00, 0x68, 0x00]);
    // The resolving read must return exactly 16 bytes
    f.rx(&[0x0B, 0x01, 0x02]);
    assert_eq!(
        f.events(),
        vec![Event::DiscDone(f.conn, DiscoveryKind::IncludedServices, Status::InvalidPdu)]
    );
}

#[test]
fn discovery_stops_at_handle_space_end() {
    let mut f = fix();
    f.cl.discover(f.conn, DiscoveryKind::PrimaryServices, HandleRange::ALL, None, f.t0)
        .unwrap();
    f.sent();

    f.rx(&[0x11, 6, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x18]);
    let ev = f.events();
    assert_matches!(ev[0], Event::Disc(..));
    assert_eq!(
        ev[1],
        Event::DiscDone(f.conn, DiscoveryKind::PrimaryServices, Status::Success)
    );
    // No wraparound request past 0xFFFF
    assert!(f.sent().is_empty());
}

#[test]
fn discovery_rejects_handle_zero() {
    let mut f = fix();
    f.cl.discover(f.conn, DiscoveryKind::PrimaryServices, HandleRange::ALL, None, f.t0)
        .unwrap();
    f.sent();
    f.rx(&[0x11, 6, 0x00, 0x00, 0x05, 0x00, 0x00, 0x18]);
    assert_eq!(
        f.events(),
        vec![Event::DiscDone(f.conn, DiscoveryKind::PrimaryServices, Status::InvalidHandle)]
    );
}

#[test]
fn long_read_reassembly() {
    let src: Vec<u8> = (0..60u8).collect();
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    assert_eq!(f.sent(), vec![vec![0x0A, 0x21, 0x00]]);

    let mut rsp = vec![0x0B];
    rsp.extend_from_slice(&src[..22]);
    f.rx(&rsp);
    assert_eq!(f.sent(), vec![vec![0x0C, 0x21, 0x00, 22, 0x00]]);

    let mut rsp = vec![0x0D];
    rsp.extend_from_slice(&src[22..44]);
    f.rx(&rsp);
    assert_eq!(f.sent(), vec![vec![0x0C, 0x21, 0x00, 44, 0x00]]);

    let mut rsp = vec![0x0D];
    rsp.extend_from_slice(&src[44..]);
    f.rx(&rsp);
    assert!(f.sent().is_empty());
    assert_eq!(
        f.events(),
        vec![Event::Done(
            f.conn,
            ClientOp::Read,
            Status::Success,
            Data::Value(0x0021, 0, src),
        )]
    );
}

#[test]
fn long_read_not_long_on_first_blob() {
    let src: Vec<u8> = (0..22u8).collect();
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.sent();

    let mut rsp = vec![0x0B];
    rsp.extend_from_slice(&src);
    f.rx(&rsp);
    assert_eq!(f.sent(), vec![vec![0x0C, 0x21, 0x00, 22, 0x00]]);

    // AttributeNotLong on the first blob: the attribute was short after all
    f.rx(&[0x01, 0x0C, 0x21, 0x00, 0x0B]);
    assert_eq!(
        f.events(),
        vec![Event::Done(
            f.conn,
            ClientOp::Read,
            Status::Success,
            Data::Value(0x0021, 0, src),
        )]
    );
}

#[test]
fn long_read_not_long_on_later_blob_fails() {
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.sent();
    f.rx(&[0x0B; 23]); // 22 value bytes
    f.sent();
    f.rx(&[0x0D; 23]); // another full blob
    f.sent();
    f.rx(&[0x01, 0x0C, 0x21, 0x00, 0x0B]);
    assert_matches!(
        f.events()[..],
        [Event::Done(_, ClientOp::Read, Status::Att(ErrorCode::AttributeNotLong), _)]
    );
}

#[test]
fn short_read() {
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.sent();
    f.rx(&[0x0B, 0xAA, 0xBB]);
    assert_eq!(
        f.events(),
        vec![Event::Done(
            f.conn,
            ClientOp::Read,
            Status::Success,
            Data::Value(0x0021, 0, vec![0xAA, 0xBB]),
        )]
    );
}

#[test]
fn read_by_type_short_value() {
    let mut f = fix();
    f.cl.read(
        f.conn,
        ReadKind::ByType {
            range: HandleRange::ALL,
            uuid: uuid16(0x2A00),
        },
        f.t0,
    )
    .unwrap();
    assert_eq!(f.sent(), vec![vec![0x08, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x2A]]);

    f.rx(&[0x09, 4, 0x25, 0x00, 0xAA, 0xBB]);
    assert_eq!(
        f.events(),
        vec![Event::Done(
            f.conn,
            ClientOp::Read,
            Status::Success,
            Data::Value(0x0025, 0, vec![0xAA, 0xBB]),
        )]
    );
}

#[test]
fn read_by_type_switches_to_blob() {
    let mut f = fix();
    f.cl.read(
        f.conn,
        ReadKind::ByType {
            range: HandleRange::ALL,
            uuid: uuid16(0x2A00),
        },
        f.t0,
    )
    .unwrap();
    f.sent();

    // The entry fills payload_size - 4: the value may continue
    let first: Vec<u8> = (0..19u8).collect();
    let mut rsp = vec![0x09, 21, 0x25, 0x00];
    rsp.extend_from_slice(&first);
    f.rx(&rsp);
    assert!(f.events().is_empty());
    assert_eq!(f.sent(), vec![vec![0x0C, 0x25, 0x00, 19, 0x00]]);

    f.rx(&[0x0D, 0x13, 0x14]);
    let mut full = first;
    full.extend_from_slice(&[0x13, 0x14]);
    assert_eq!(
        f.events(),
        vec![Event::Done(
            f.conn,
            ClientOp::Read,
            Status::Success,
            Data::Value(0x0025, 0, full),
        )]
    );
}

#[test]
fn read_partial() {
    let mut f = fix();
    f.cl.read(
        f.conn,
        ReadKind::Partial {
            handle: h(0x0021),
            offset: 7,
        },
        f.t0,
    )
    .unwrap();
    assert_eq!(f.sent(), vec![vec![0x0C, 0x21, 0x00, 0x07, 0x00]]);
    f.rx(&[0x0D, 0x01, 0x02, 0x03]);
    assert_eq!(
        f.events(),
        vec![Event::Done(
            f.conn,
            ClientOp::Read,
            Status::Success,
            Data::Value(0x0021, 7, vec![0x01, 0x02, 0x03]),
        )]
    );
}

#[test]
fn read_multiple() {
    let mut f = fix();
    f.cl.read(
        f.conn,
        ReadKind::Multiple {
            handles: vec![h(0x0003), h(0x0005)],
        },
        f.t0,
    )
    .unwrap();
    assert_eq!(f.sent(), vec![vec![0x0E, 0x03, 0x00, 0x05, 0x00]]);
    f.rx(&[0x0F, 0x01, 0x02, 0x03]);
    assert_eq!(
        f.events(),
        vec![Event::Done(
            f.conn,
            ClientOp::Read,
            Status::Success,
            Data::Value(0x0003, 0, vec![0x01, 0x02, 0x03]),
        )]
    );
}

#[test]
fn read_multiple_validation() {
    let mut f = fix();
    assert_eq!(
        f.cl.read(f.conn, ReadKind::Multiple { handles: vec![] }, f.t0),
        Err(RequestError::InvalidParameter)
    );
    assert_eq!(
        f.cl.read(
            f.conn,
            ReadKind::Multiple {
                handles: vec![h(1); MAX_READ_MULTI_HANDLES + 1],
            },
            f.t0,
        ),
        Err(RequestError::InvalidParameter)
    );
}

#[test]
fn oversized_element_length_rejected() {
    let mut f = fix();
    f.cl.read(
        f.conn,
        ReadKind::ByType {
            range: HandleRange::ALL,
            uuid: uuid16(0x2A00),
        },
        f.t0,
    )
    .unwrap();
    f.sent();
    // Declared element length 22 > payload_size - 2
    f.rx(&[0x09, 22, 0x25, 0x00, 0xAA]);
    assert_matches!(
        f.events()[..],
        [Event::Done(_, ClientOp::Read, Status::Error, Data::None)]
    );
}

#[test]
fn write_short() {
    let mut f = fix();
    f.cl.write(f.conn, h(0x0031), &[0xAA, 0xBB], f.t0).unwrap();
    assert_eq!(f.sent(), vec![vec![0x12, 0x31, 0x00, 0xAA, 0xBB]]);
    f.rx(&[0x13]);
    assert_eq!(
        f.events(),
        vec![Event::Done(f.conn, ClientOp::Write, Status::Success, Data::None)]
    );
}

#[test]
fn write_without_response() {
    let mut f = fix();
    f.cl.write_without_rsp(f.conn, h(0x0031), &[0xAA], WriteMode::Command, f.t0)
        .unwrap();
    assert_eq!(f.sent(), vec![vec![0x52, 0x31, 0x00, 0xAA]]);
    // Completes as soon as the transport accepts it
    assert_eq!(
        f.events(),
        vec![Event::Done(f.conn, ClientOp::Write, Status::Success, Data::None)]
    );
}

#[test]
fn signed_write_without_response() {
    let mut f = fix();
    let sig = [0x5A; SIG_LEN];
    f.cl.write_without_rsp(f.conn, h(0x0031), &[0xAA], WriteMode::Signed(sig), f.t0)
        .unwrap();
    let sent = f.sent();
    assert_eq!(&sent[0][..4], &[0xD2, 0x31, 0x00, 0xAA]);
    assert_eq!(&sent[0][4..], &sig);
}

#[test]
fn reliable_write_commit() {
    let src = [0xAA; 40];
    let mut f = fix();
    f.cl.write(f.conn, h(0x0031), &src, f.t0).unwrap();

    // 40 bytes at payload 23: fragments of 18, 18, 4
    let mut exp = vec![0x16, 0x31, 0x00, 0x00, 0x00];
    exp.extend_from_slice(&src[..18]);
    assert_eq!(f.sent(), vec![exp.clone()]);

    let mut echo = exp;
    echo[0] = 0x17;
    f.rx(&echo);
    let mut exp = vec![0x16, 0x31, 0x00, 18, 0x00];
    exp.extend_from_slice(&src[18..36]);
    assert_eq!(f.sent(), vec![exp.clone()]);

    let mut echo = exp;
    echo[0] = 0x17;
    f.rx(&echo);
    let mut exp = vec![0x16, 0x31, 0x00, 36, 0x00];
    exp.extend_from_slice(&src[36..]);
    assert_eq!(f.sent(), vec![exp.clone()]);

    let mut echo = exp;
    echo[0] = 0x17;
    f.rx(&echo);
    // All fragments confirmed: commit
    assert_eq!(f.sent(), vec![vec![0x18, 0x01]]);
    assert!(f.events().is_empty());

    f.rx(&[0x19]);
    assert_eq!(
        f.events(),
        vec![Event::Done(f.conn, ClientOp::Write, Status::Success, Data::None)]
    );
}

#[test]
fn reliable_write_echo_mismatch_cancels() {
    let mut f = fix();
    f.cl.write(f.conn, h(0x0031), &[0xAA; 40], f.t0).unwrap();
    f.sent();

    let mut echo = vec![0x17, 0x31, 0x00, 0x00, 0x00];
    echo.extend_from_slice(&[0xBB; 18]);
    f.rx(&echo);
    assert_eq!(f.sent(), vec![vec![0x18, 0x00]]);

    f.rx(&[0x19]);
    assert_eq!(
        f.events(),
        vec![Event::Done(f.conn, ClientOp::Write, Status::Error, Data::None)]
    );
}

#[test]
fn reliable_write_server_error_cancels() {
    let mut f = fix();
    f.cl.write(f.conn, h(0x0031), &[0xAA; 40], f.t0).unwrap();
    f.sent();

    f.rx(&[0x01, 0x16, 0x31, 0x00, 0x09]);
    assert_eq!(f.sent(), vec![vec![0x18, 0x00]]);
    f.rx(&[0x19]);
    assert_eq!(
        f.events(),
        vec![Event::Done(
            f.conn,
            ClientOp::Write,
            Status::Att(ErrorCode::PrepareQueueFull),
            Data::None,
        )]
    );
}

#[test]
fn reliable_write_malformed_echo_cancels() {
    let mut f = fix();
    f.cl.write(f.conn, h(0x0031), &[0xAA; 40], f.t0).unwrap();
    f.sent();
    f.rx(&[0x17, 0x31, 0x00]);
    assert_eq!(f.sent(), vec![vec![0x18, 0x00]]);
    f.rx(&[0x19]);
    assert_eq!(
        f.events(),
        vec![Event::Done(f.conn, ClientOp::Write, Status::InvalidPdu, Data::None)]
    );
}

#[test]
fn prepare_write_returns_echo_without_execute() {
    let mut f = fix();
    f.cl.prepare_write(f.conn, h(0x0031), 100, &[0xAA; 4], f.t0)
        .unwrap();
    // Fragment offset includes the application-supplied base
    let mut exp = vec![0x16, 0x31, 0x00, 100, 0x00];
    exp.extend_from_slice(&[0xAA; 4]);
    assert_eq!(f.sent(), vec![exp.clone()]);

    let mut echo = exp;
    echo[0] = 0x17;
    f.rx(&echo);
    // No automatic ExecuteWrite
    assert!(f.sent().is_empty());
    assert_eq!(
        f.events(),
        vec![Event::Done(
            f.conn,
            ClientOp::Write,
            Status::Success,
            Data::Value(0x0031, 100, vec![0xAA; 4]),
        )]
    );

    f.cl.execute_write(f.conn, true, f.t0).unwrap();
    assert_eq!(f.sent(), vec![vec![0x18, 0x01]]);
    f.rx(&[0x19]);
    assert_eq!(
        f.events(),
        vec![Event::Done(f.conn, ClientOp::Write, Status::Success, Data::None)]
    );
}

#[test]
fn notification_fan_out() {
    let mut f = fix();
    let rec2 = Arc::new(Recorder::default());
    let app2 = f.cl.register(rec2.clone()).unwrap();
    let conn2 = ConnId::new(f.conn.link(), app2);

    f.rx(&[0x1B, 0x42, 0x00, 0x01, 0x02]);
    assert_eq!(
        f.events(),
        vec![Event::Done(
            f.conn,
            ClientOp::Notification,
            Status::Success,
            Data::Value(0x0042, 0, vec![0x01, 0x02]),
        )]
    );
    assert_eq!(
        rec2.take(),
        vec![Event::Done(
            conn2,
            ClientOp::Notification,
            Status::Success,
            Data::Value(0x0042, 0, vec![0x01, 0x02]),
        )]
    );
    // Notifications are not confirmed
    assert!(f.sent().is_empty());
}

#[test]
fn indication_confirmed_after_all_apps_ack() {
    let mut f = fix();
    let rec2 = Arc::new(Recorder::default());
    let app2 = f.cl.register(rec2.clone()).unwrap();
    let conn2 = ConnId::new(f.conn.link(), app2);

    f.rx(&[0x1D, 0x42, 0x00, 0x01, 0x02]);
    assert_matches!(
        f.events()[..],
        [Event::Done(_, ClientOp::Indication, Status::Success, _)]
    );
    assert_matches!(
        rec2.take()[..],
        [Event::Done(_, ClientOp::Indication, Status::Success, _)]
    );
    assert!(f.sent().is_empty());

    f.cl.confirm_indication(f.conn, f.t0).unwrap();
    assert!(f.sent().is_empty());

    f.cl.confirm_indication(conn2, f.t0).unwrap();
    assert_eq!(f.sent(), vec![vec![0x1E]]);
    assert_eq!(
        rec2.take(),
        vec![Event::Done(conn2, ClientOp::Confirm, Status::Success, Data::None)]
    );
}

#[test]
fn indication_without_apps_confirmed_immediately() {
    let mut cl = Client::new(Mock::default(), Config::default());
    cl.connect(LinkId::new(0), PEER);
    cl.deliver(LinkId::new(0), &[0x1D, 0x42, 0x00, 0x01], Instant::now());
    assert_eq!(cl.transport().sent, vec![vec![0x1E]]);
}

#[test]
fn indication_invalid_handle_still_confirmed() {
    let mut f = fix();
    f.rx(&[0x1D, 0x00, 0x00, 0x01]);
    assert!(f.events().is_empty());
    assert_eq!(f.sent(), vec![vec![0x1E]]);

    // Invalid-handle notifications are dropped without a confirmation
    f.rx(&[0x1B, 0x00, 0x00, 0x01]);
    assert!(f.events().is_empty());
    assert!(f.sent().is_empty());
}

#[test]
fn notification_exceeding_mtu_dropped() {
    let mut f = fix();
    let mut pdu = vec![0x1B];
    pdu.extend_from_slice(&[0u8; 23]); // body length == payload_size
    f.rx(&pdu);
    assert!(f.events().is_empty());
}

#[test]
fn stale_indication_reset_policy() {
    let mut f = fix();
    f.rx(&[0x1D, 0x42, 0x00, 0x01]);
    // Second indication before the first is acked: counter resets
    f.rx(&[0x1D, 0x42, 0x00, 0x02]);
    assert_eq!(f.events().len(), 2);

    f.cl.confirm_indication(f.conn, f.t0).unwrap();
    assert_eq!(f.sent(), vec![vec![0x1E]]);
}

#[test]
fn stale_indication_disconnect_policy() {
    let mut f = fix_with(Config {
        stale_indication: StaleIndicationPolicy::Disconnect,
        ..Config::default()
    });
    f.rx(&[0x1D, 0x42, 0x00, 0x01]);
    f.rx(&[0x1D, 0x42, 0x00, 0x02]);
    assert_eq!(f.events().len(), 1);
    assert_eq!(f.cl.transport().disconnected, vec![f.conn.link()]);
}

#[test]
fn indication_ack_timeout_sends_confirmation() {
    let mut f = fix();
    f.rx(&[0x1D, 0x42, 0x00, 0x01]);
    f.events();
    let deadline = f.cl.poll_timeout().unwrap();
    f.cl.handle_timeout(deadline);
    assert_eq!(f.sent(), vec![vec![0x1E]]);
    assert_eq!(f.cl.poll_timeout(), None);
}

#[test]
fn response_timeout_ends_procedure() {
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.sent();
    let deadline = f.cl.poll_timeout().unwrap();
    assert_eq!(deadline, f.t0 + Duration::from_secs(30));

    f.cl.handle_timeout(deadline);
    assert_matches!(
        f.events()[..],
        [Event::Done(_, ClientOp::Read, Status::Timeout, _)]
    );
    assert_eq!(f.cl.poll_timeout(), None);
}

#[test]
fn one_outstanding_request() {
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0022) }, f.t0)
        .unwrap();
    // Only the first request is on the air
    assert_eq!(f.sent(), vec![vec![0x0A, 0x21, 0x00]]);

    f.rx(&[0x0B, 0xAA]);
    assert_matches!(
        f.events()[..],
        [Event::Done(_, ClientOp::Read, Status::Success, _)]
    );
    assert_eq!(f.sent(), vec![vec![0x0A, 0x22, 0x00]]);
}

#[test]
fn commands_queue_behind_outstanding_request() {
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.sent();
    f.cl.write_without_rsp(f.conn, h(0x0031), &[0xAA], WriteMode::Command, f.t0)
        .unwrap();
    assert!(f.sent().is_empty());
    assert!(f.events().is_empty());

    f.rx(&[0x0B, 0xAA]);
    let ev = f.events();
    assert_matches!(ev[0], Event::Done(_, ClientOp::Read, Status::Success, _));
    assert_matches!(ev[1], Event::Done(_, ClientOp::Write, Status::Success, Data::None));
    assert_eq!(f.sent(), vec![vec![0x52, 0x31, 0x00, 0xAA]]);
}

#[test]
fn mismatched_response_dropped() {
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.sent();

    f.rx(&[0x13]); // Write Response while awaiting Read Response
    assert!(f.events().is_empty());
    // The outstanding state is undisturbed
    assert!(f.cl.poll_timeout().is_some());

    f.rx(&[0x0B, 0xAA]);
    assert_matches!(
        f.events()[..],
        [Event::Done(_, ClientOp::Read, Status::Success, _)]
    );
}

#[test]
fn response_exceeding_mtu_fails_procedure() {
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.sent();
    let mut pdu = vec![0x0B];
    pdu.extend_from_slice(&[0u8; 23]);
    f.rx(&pdu);
    assert_matches!(
        f.events()[..],
        [Event::Done(_, ClientOp::Read, Status::Error, _)]
    );
}

#[test]
fn cancel_drops_eventual_response() {
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.sent();
    f.cl.cancel(f.conn, f.t0).unwrap();
    assert_matches!(
        f.events()[..],
        [Event::Done(_, ClientOp::Read, Status::Cancelled, Data::None)]
    );

    // The response is drained without another callback
    f.rx(&[0x0B, 0xAA]);
    assert!(f.events().is_empty());
}

#[test]
fn cancel_removes_queued_request() {
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0022) }, f.t0)
        .unwrap();
    f.sent();
    f.cl.cancel(f.conn, f.t0).unwrap();
    assert_eq!(f.events().len(), 2);

    // Neither the drained response nor the queue produces further traffic
    f.rx(&[0x0B, 0xAA]);
    assert!(f.events().is_empty());
    assert!(f.sent().is_empty());
}

#[test]
fn teardown_ends_procedures_with_link_lost() {
    let mut f = fix();
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    f.sent();
    f.cl.disconnect(f.conn.link());
    assert_matches!(
        f.events()[..],
        [Event::Done(_, ClientOp::Read, Status::LinkLost, _)]
    );
    assert_eq!(f.cl.payload_size(f.conn.link()), None);
}

#[test]
fn transport_error_fails_procedure_and_continues() {
    let mut f = fix();
    f.cl.transport_mut().next_status = Some(TxStatus::Error);
    f.cl.read(f.conn, ReadKind::ByHandle { handle: h(0x0021) }, f.t0)
        .unwrap();
    assert_matches!(
        f.events()[..],
        [Event::Done(_, ClientOp::Read, Status::Error, _)]
    );
}

#[test]
fn unknown_opcode_dropped() {
    let mut f = fix();
    f.rx(&[0xEE, 0x01, 0x02]);
    f.rx(&[]);
    assert!(f.events().is_empty());
}
