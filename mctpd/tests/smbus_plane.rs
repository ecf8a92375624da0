// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! End-to-end SMBus plane tests against a fake kernel driver and a
//! sysfs/dev fixture tree: root and mux-leaf scanning with suppression,
//! bus-owner EID assignment, and bandwidth reservation windows.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use smol::channel::{unbounded, Receiver, Sender};
use smol::{LocalExecutor, Timer};

use mctp_ctrl::control::{
    encode_message, ControlHeader, GetEndpointIdResp, SetEndpointIdReq,
    SetEndpointIdResp,
};
use mctp_ctrl::prv::SmbusPktPrv;
use mctp_ctrl::{CommandCode, CompletionCode, Eid, Error, Result, MCTP_EID_NULL};

use mctpd::config::{PhysicalMediumId, SmbusConfig};
use mctpd::publisher::{DeviceAttrs, EndpointMode, EndpointPublisher};
use mctpd::smbus::{SmbusDriver, SmbusPlane};
use mctpd::BindingRole;

fn start_log() {
    let _ = env_logger::Builder::new()
        .filter(None, log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

type Frame = (Eid, Vec<u8>, SmbusPktPrv);

/// Fake kernel plumbing: scripted probe results and an auto-responding
/// MCTP device model behind every present address.
struct FakeSmbus {
    root: File,
    /// 7-bit addresses answering on the root bus.
    root_present: BTreeSet<u8>,
    /// 7-bit addresses answering on mux leaves.
    mux_present: BTreeSet<u8>,
    /// EIDs assigned to devices so far, by identity.
    assigned: RefCell<BTreeMap<(i32, u8), u8>>,
    inbound_tx: Sender<Frame>,
    inbound_rx: Receiver<Frame>,
    pull_model_inits: Cell<u32>,
    pull_model_exits: Cell<u32>,
}

impl FakeSmbus {
    fn new(
        root_path: &Path,
        root_present: impl IntoIterator<Item = u8>,
        mux_present: impl IntoIterator<Item = u8>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        Self {
            root: File::open(root_path).unwrap(),
            root_present: root_present.into_iter().collect(),
            mux_present: mux_present.into_iter().collect(),
            assigned: RefCell::new(BTreeMap::new()),
            inbound_tx,
            inbound_rx,
            pull_model_inits: Cell::new(0),
            pull_model_exits: Cell::new(0),
        }
    }

    fn present(&self, fd: RawFd, addr: u8) -> bool {
        if fd == self.root.as_raw_fd() {
            self.root_present.contains(&addr)
        } else {
            self.mux_present.contains(&addr)
        }
    }

    /// Models the probed device answering a control request.
    fn respond(&self, msg: &[u8], prv: &SmbusPktPrv) {
        let Ok(hdr) = ControlHeader::decode(msg) else { return };
        if !hdr.rq {
            return;
        }
        let identity = (prv.fd, prv.slave_addr);

        let body = match hdr.command {
            CommandCode::GetEndpointId => GetEndpointIdResp {
                cc: CompletionCode::Success as u8,
                eid: Eid(self
                    .assigned
                    .borrow()
                    .get(&identity)
                    .copied()
                    .unwrap_or(0)),
                endpoint_type: 0,
                medium_specific: 0,
            }
            .encode(),
            CommandCode::SetEndpointId => {
                let req =
                    SetEndpointIdReq::decode(&msg[ControlHeader::LEN..])
                        .unwrap();
                self.assigned.borrow_mut().insert(identity, req.eid.0);
                SetEndpointIdResp {
                    cc: CompletionCode::Success as u8,
                    status: 0,
                    eid: req.eid,
                    eid_pool_size: 0,
                }
                .encode()
            }
            _ => return,
        };

        let resp = encode_message(&hdr.response(), &body).unwrap();
        let _ = self.inbound_tx.try_send((MCTP_EID_NULL, resp, *prv));
    }
}

/// Newtype around `Rc<FakeSmbus>` so the foreign-trait-for-foreign-type
/// orphan rule doesn't block implementing `SmbusDriver` here.
#[derive(Clone)]
struct Driver(Rc<FakeSmbus>);

impl std::ops::Deref for Driver {
    type Target = FakeSmbus;
    fn deref(&self) -> &FakeSmbus {
        &self.0
    }
}

impl SmbusDriver for Driver {
    fn root_fd(&self) -> RawFd {
        self.root.as_raw_fd()
    }

    fn send(&self, _dest: Eid, msg: &[u8], prv: &SmbusPktPrv) -> Result<()> {
        self.respond(msg, prv);
        Ok(())
    }

    async fn recv(&self) -> Result<Frame> {
        self.inbound_rx.recv().await.map_err(|_| Error::RxFailure)
    }

    fn probe_read_byte(&self, fd: RawFd, addr: u8) -> bool {
        self.present(fd, addr)
    }

    fn probe_write_quick(&self, fd: RawFd, addr: u8) -> bool {
        self.present(fd, addr)
    }

    fn init_pull_model(&self, _prv: &SmbusPktPrv) -> Result<()> {
        self.pull_model_inits.set(self.pull_model_inits.get() + 1);
        Ok(())
    }

    fn exit_pull_model(&self, _prv: &SmbusPktPrv) -> Result<()> {
        self.pull_model_exits.set(self.pull_model_exits.get() + 1);
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Event {
    Added(u8, EndpointMode, DeviceAttrs),
    Removed(u8),
}

#[derive(Default)]
struct Recorder(RefCell<Vec<Event>>);

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    fn added_eids(&self) -> Vec<u8> {
        self.0
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Added(eid, ..) => Some(*eid),
                _ => None,
            })
            .collect()
    }
}

impl EndpointPublisher for Recorder {
    fn endpoint_added(&self, eid: Eid, mode: EndpointMode, attrs: DeviceAttrs) {
        self.0.borrow_mut().push(Event::Added(eid.0, mode, attrs));
    }

    fn endpoint_removed(&self, eid: Eid) {
        self.0.borrow_mut().push(Event::Removed(eid.0));
    }
}

/// Fixture: a root bus `i2c-2` with one mux leaf `i2c-3`, one mux device
/// `2-0071` whose `idle_state` starts at "0".
struct Fixture {
    _dir: tempfile::TempDir,
    dev: PathBuf,
    sysfs: PathBuf,
    idle_state: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let dev = dir.path().join("dev");
    let sysfs = dir.path().join("sysfs");

    std::fs::create_dir_all(&dev).unwrap();
    std::fs::write(dev.join("i2c-2"), b"").unwrap();
    std::fs::write(dev.join("i2c-3"), b"").unwrap();

    // Leaf classification: sysfs mux_device symlink names the root device
    let leaf = sysfs.join("i2c-3");
    std::fs::create_dir_all(&leaf).unwrap();
    std::os::unix::fs::symlink("../2-0071", leaf.join("mux_device")).unwrap();

    let mux_dev = sysfs.join("i2c-2").join("2-0071");
    std::fs::create_dir_all(&mux_dev).unwrap();
    let idle_state = mux_dev.join("idle_state");
    std::fs::write(&idle_state, "0").unwrap();

    Fixture { _dir: dir, dev, sysfs, idle_state }
}

fn test_config(fix: &Fixture) -> SmbusConfig {
    SmbusConfig {
        medium_id: PhysicalMediumId::SmbusI2c,
        role: BindingRole::BusOwner,
        default_eid: 8,
        bus: fix.dev.join("i2c-2"),
        arp_master_support: false,
        bmc_slave_addr: 0x20,
        req_to_resp_time_ms: 50,
        req_retry_count: 1,
        scan_interval_s: 600,
        routing_interval_s: 0,
        eid_pool: (0x09..=0x20).collect(),
        supported_endpoint_slave_address: [0x30, 0x50, 0x61].into(),
        allowed_buses: BTreeSet::new(),
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        Timer::after(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn mux_probe_and_registration() {
    start_log();
    let fix = fixture();

    // Root answers only 0x50 (EEPROM read); the leaf answers 0x30 and
    // 0x61, and would also answer 0x50 leaking through the mux.
    let driver = Driver(Rc::new(FakeSmbus::new(
        &fix.dev.join("i2c-2"),
        [0x50],
        [0x30, 0x50, 0x61],
    )));
    let publisher = Rc::new(Recorder::default());
    let plane = SmbusPlane::new(
        test_config(&fix),
        driver.clone(),
        publisher.clone(),
        fix.dev.clone(),
        fix.sysfs.clone(),
    )
    .unwrap();
    plane.init().unwrap();

    let root_fd = driver.root.as_raw_fd();
    assert_eq!(plane.root_device_map(), [(root_fd, 0x50)].into());

    // Scanning set the mux idle mode to disconnect, saving the original
    assert_eq!(std::fs::read_to_string(&fix.idle_state).unwrap(), "-2");

    let ex = LocalExecutor::new();
    let run = ex.spawn(plane.clone().run());

    smol::block_on(ex.run(async {
        wait_until("three registrations", || {
            publisher.added_eids().len() == 3
        })
        .await;

        // Pool assigns lowest-first in scan order
        let table = plane.device_table();
        assert_eq!(table.len(), 3);

        // 0x50 is reported once, on the root bus; 0x30 and 0x61 belong
        // to the mux leaf fd
        let by_addr: BTreeMap<u8, i32> =
            table.iter().map(|(_, fd, addr)| (*addr, *fd)).collect();
        assert_eq!(by_addr[&(0x50 << 1)], root_fd);
        assert_ne!(by_addr[&(0x30 << 1)], root_fd);
        assert_eq!(by_addr[&(0x30 << 1)], by_addr[&(0x61 << 1)]);

        // Every assigned EID came from the pool
        for (eid, _, _) in &table {
            assert!((0x09..=0x20).contains(&eid.0));
        }

        // A second pass with identical presence is idempotent
        let before = publisher.events();
        plane.init_endpoint_discovery().await;
        assert_eq!(publisher.events(), before);
    }));
    drop(run);

    // Shutdown restores the recorded idle mode
    plane.shutdown();
    assert_eq!(std::fs::read_to_string(&fix.idle_state).unwrap(), "0");
}

#[test]
fn reservation_window() {
    start_log();
    let fix = fixture();

    let driver = Driver(Rc::new(FakeSmbus::new(
        &fix.dev.join("i2c-2"),
        [],
        [0x30],
    )));
    let publisher = Rc::new(Recorder::default());
    let plane = SmbusPlane::new(
        test_config(&fix),
        driver.clone(),
        publisher.clone(),
        fix.dev.clone(),
        fix.sysfs.clone(),
    )
    .unwrap();
    plane.init().unwrap();

    let ex = LocalExecutor::new();
    let run = ex.spawn(plane.clone().run());

    smol::block_on(ex.run(async {
        wait_until("registration", || publisher.added_eids().len() == 1)
            .await;
        let eid = Eid(publisher.added_eids()[0]);

        // Reserve, then re-reserve before expiry: the enter sequence runs
        // exactly once across the pair
        plane.reserve_bandwidth(eid, 1).unwrap();
        assert_eq!(plane.reservation(), (true, eid.0));
        assert_eq!(driver.pull_model_inits.get(), 1);
        assert_eq!(
            std::fs::read_to_string(&fix.idle_state).unwrap(),
            "-1",
            "mux connected during reservation"
        );

        Timer::after(Duration::from_millis(300)).await;
        plane.reserve_bandwidth(eid, 1).unwrap();
        assert_eq!(driver.pull_model_inits.get(), 1, "timer restart only");

        // A different EID is refused while active
        let other = Eid(0xb0);
        assert!(matches!(
            plane.reserve_bandwidth(other, 1),
            Err(Error::ResourceBusy)
        ));

        // Expiry runs the exit path exactly once
        wait_until("reservation expiry", || !plane.reservation().0).await;
        assert_eq!(driver.pull_model_exits.get(), 1);
        assert_eq!(plane.reservation(), (false, 0));
        assert_eq!(std::fs::read_to_string(&fix.idle_state).unwrap(), "-2");

        // Late release is an error
        plane.release_bandwidth(eid).unwrap_err();

        // Reserve/release cycle: exit path again exactly once
        plane.reserve_bandwidth(eid, 30).unwrap();
        assert_eq!(driver.pull_model_inits.get(), 2);
        plane.release_bandwidth(eid).unwrap();
        wait_until("release", || !plane.reservation().0).await;
        assert_eq!(driver.pull_model_exits.get(), 2);
    }));
    drop(run);
}

#[test]
fn reservation_requires_mux_path() {
    start_log();
    let fix = fixture();

    // Device on the root bus only
    let driver =
        Driver(Rc::new(FakeSmbus::new(&fix.dev.join("i2c-2"), [0x50], [])));
    let publisher = Rc::new(Recorder::default());
    let plane = SmbusPlane::new(
        test_config(&fix),
        driver.clone(),
        publisher.clone(),
        fix.dev.clone(),
        fix.sysfs.clone(),
    )
    .unwrap();
    plane.init().unwrap();

    let ex = LocalExecutor::new();
    let run = ex.spawn(plane.clone().run());

    smol::block_on(ex.run(async {
        wait_until("registration", || publisher.added_eids().len() == 1)
            .await;
        let eid = Eid(publisher.added_eids()[0]);

        // Reservation is meaningless on the root bus
        plane.reserve_bandwidth(eid, 1).unwrap_err();
        assert_eq!(plane.reservation(), (false, 0));
        assert_eq!(driver.pull_model_inits.get(), 0);

        // And unknown EIDs have no route at all
        assert!(matches!(
            plane.reserve_bandwidth(Eid(0x77), 1),
            Err(Error::NoRoute)
        ));
    }));
    drop(run);
}
