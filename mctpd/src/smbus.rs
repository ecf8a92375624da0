// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! SMBus/I2C transport binding.
//!
//! The plane owns the root bus and every mux leaf below it: it probes
//! slave addresses for MCTP-capable devices, arbitrates mux idle modes,
//! watches `/dev` for bus hot-plug, and gates bandwidth reservation for
//! long transactions. In the bus-owner role it assigns EIDs to probed
//! devices; in the endpoint role it accepts an EID and mirrors the bus
//! owner's routing table into the device table.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use smol::channel::{bounded, Receiver, Sender};
use smol::future::FutureExt;
use smol::Timer;

use mctp_ctrl::control::{
    GetEndpointIdResp, GetMsgTypeSupportResp, GetVdmSupportReq,
    GetVdmSupportResp, GetVersionSupportReq, GetVersionSupportResp, SetEidOp,
    SetEndpointIdReq, SetEndpointIdResp, VENDOR_ID_FORMAT_PCI,
    VENDOR_ID_NO_MORE_SETS,
};
use mctp_ctrl::prv::{SmbusPktPrv, IS_MUX_PORT};
use mctp_ctrl::{
    cc_result, CommandCode, CompletionCode, Eid, Error, Result,
    MCTP_BINDING_SMBUS, MCTP_EID_NULL, MCTP_TYPE_CONTROL,
};

use crate::config::SmbusConfig;
use crate::control::{ControlEngine, Inbound, RequestHandler};
use crate::eids::{DeviceTable, EidPool};
use crate::publisher::{DeviceAttrs, EndpointMode, EndpointPublisher};
use crate::{BindingRole, DiscoveryFlag, VdmSet};

mod inotify;
pub mod kernel;

use inotify::Inotify;

/// MCTP base specification version reported by Get Version Support: 1.3.1.
const MCTP_VERSION_1_3_1: u32 = 0xf1f3_f100;

/// Command-specific completion code: version query for unsupported type.
const CC_VERSION_TYPE_UNSUPPORTED: u8 = 0x80;

/// Mux hold applied to frames towards devices behind a mux leaf.
const MUX_HOLD_TIMEOUT_MS: u16 = 1000;

/// Hot-plug debounce; multiple i2c nodes appear when a mux is probed.
const MUX_REFRESH_DEBOUNCE: Duration = Duration::from_secs(1);

/// Addresses probed with a byte read; a write-quick would corrupt EEPROM
/// write pointers.
fn is_eeprom_addr(addr: u8) -> bool {
    (0x30..=0x37).contains(&addr) || (0x50..=0x5f).contains(&addr)
}

/// Mux leaf idle states, as written to the kernel `idle_state` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxIdleMode {
    /// Leaf stays electrically connected when idle.
    Connect,
    /// Leaf disconnects when idle.
    Disconnect,
}

impl MuxIdleMode {
    fn as_sysfs(&self) -> &'static str {
        match self {
            Self::Connect => "-1",
            Self::Disconnect => "-2",
        }
    }
}

/// Parses the trailing bus number from an `i2c-N` path or filename.
pub fn bus_num_from_path(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let num = name.strip_prefix("i2c-")?;
    (!num.is_empty() && num.bytes().all(|b| b.is_ascii_digit()))
        .then(|| num.parse().ok())?
}

/// Interface to the SMBus MCTP kernel plumbing.
///
/// `recv` yields whole reassembled MCTP messages (first byte is the
/// message type) with the source EID and the frame's binding-private
/// record; message assembly happens below this interface.
pub trait SmbusDriver {
    /// Open fd of the root bus device.
    fn root_fd(&self) -> RawFd;

    /// Sends one message using the addressing in `prv`.
    fn send(&self, dest: Eid, msg: &[u8], prv: &SmbusPktPrv) -> Result<()>;

    /// Receives one message; suspends until traffic arrives.
    fn recv(
        &self,
    ) -> impl std::future::Future<Output = Result<(Eid, Vec<u8>, SmbusPktPrv)>>;

    /// Updates the source EID the driver places in outgoing frames.
    fn set_own_eid(&self, _eid: Eid) {}

    /// Presence probe with a 1-byte read, for EEPROM-class addresses.
    fn probe_read_byte(&self, fd: RawFd, addr: u8) -> bool;

    /// Presence probe with an SMBus write-quick.
    fn probe_write_quick(&self, fd: RawFd, addr: u8) -> bool;

    /// Enters the pull model: the mux leaf in `prv` is held across
    /// transactions until released.
    fn init_pull_model(&self, prv: &SmbusPktPrv) -> Result<()>;

    /// Leaves the pull model.
    fn exit_pull_model(&self, prv: &SmbusPktPrv) -> Result<()>;
}

struct MuxPort {
    file: File,
    bus: u32,
}

enum RsvCtl {
    Start(Instant),
    Cancel,
}

struct SmbusState {
    own_eid: Eid,
    flag: DiscoveryFlag,
    bus_owner_fd: i32,
    bus_owner_slave_addr: u8,
    muxes: Vec<MuxPort>,
    root_device_map: BTreeSet<(i32, u8)>,
    device_table: DeviceTable,
    eid_pool: EidPool,
    add_root_devices: bool,
    rsv_bw_active: bool,
    reserved_eid: u8,
    rsv_prv: Option<SmbusPktPrv>,
    mux_idle_saved: BTreeMap<PathBuf, String>,
    mux_idle_recorded: bool,
    refresh_in_flight: bool,
    vdm_sets: Vec<VdmSet>,
}

/// The SMBus/I2C binding.
pub struct SmbusPlane<D: SmbusDriver> {
    driver: D,
    engine: ControlEngine,
    publisher: Rc<dyn EndpointPublisher>,
    cfg: SmbusConfig,
    root_bus: u32,
    dev_dir: PathBuf,
    sysfs_i2c: PathBuf,
    state: RefCell<SmbusState>,
    scan_tx: Sender<()>,
    scan_rx: Receiver<()>,
    refresh_tx: Sender<()>,
    refresh_rx: Receiver<()>,
    rsv_tx: Sender<RsvCtl>,
    rsv_rx: Receiver<RsvCtl>,
}

impl<D: SmbusDriver> SmbusPlane<D> {
    /// Creates the plane.
    ///
    /// `dev_dir` and `sysfs_i2c` are `/dev` and `/sys/bus/i2c/devices` in
    /// production; tests point them at fixture trees.
    pub fn new(
        cfg: SmbusConfig,
        driver: D,
        publisher: Rc<dyn EndpointPublisher>,
        dev_dir: PathBuf,
        sysfs_i2c: PathBuf,
    ) -> Result<Rc<Self>> {
        let Some(root_bus) = bus_num_from_path(&cfg.bus) else {
            error!("Error in opening smbus rootport");
            return Err(Error::BadArgument);
        };

        let flag = if cfg.role == BindingRole::BusOwner {
            DiscoveryFlag::NotApplicable
        } else {
            DiscoveryFlag::Undiscovered
        };

        let (scan_tx, scan_rx) = bounded(1);
        let (refresh_tx, refresh_rx) = bounded(1);
        let (rsv_tx, rsv_rx) = bounded(4);

        Ok(Rc::new(Self {
            engine: ControlEngine::new(
                cfg.req_to_resp_time_ms,
                cfg.req_retry_count,
            ),
            publisher,
            root_bus,
            dev_dir,
            sysfs_i2c,
            state: RefCell::new(SmbusState {
                own_eid: Eid(cfg.default_eid),
                flag,
                bus_owner_fd: -1,
                bus_owner_slave_addr: 0,
                muxes: Vec::new(),
                root_device_map: BTreeSet::new(),
                device_table: DeviceTable::new(),
                eid_pool: EidPool::new(cfg.eid_pool.iter().copied()),
                add_root_devices: true,
                rsv_bw_active: false,
                reserved_eid: 0,
                rsv_prv: None,
                mux_idle_saved: BTreeMap::new(),
                mux_idle_recorded: false,
                refresh_in_flight: false,
                vdm_sets: vec![VdmSet {
                    vendor_id_format: VENDOR_ID_FORMAT_PCI,
                    vendor_id: 0x8086,
                    command_set_type: 0x0000,
                }],
            }),
            driver,
            cfg,
            scan_tx,
            scan_rx,
            refresh_tx,
            refresh_rx,
            rsv_tx,
            rsv_rx,
        }))
    }

    /// Initializes the bus plane: idle modes, root scan, mux enumeration.
    pub fn init(&self) -> Result<()> {
        self.driver.set_own_eid(self.state.borrow().own_eid);
        self.set_mux_idle_mode(MuxIdleMode::Disconnect);

        info!("Scanning root port");
        let root_fd = self.driver.root_fd();
        let mut root_devices = BTreeSet::new();
        self.scan_port(root_fd, &mut root_devices);

        let muxes = self.enumerate_mux_ports();
        let mut state = self.state.borrow_mut();
        state.root_device_map = root_devices;
        state.muxes = muxes;
        Ok(())
    }

    /// Currently assigned EID.
    pub fn own_eid(&self) -> Eid {
        self.state.borrow().own_eid
    }

    /// Current discovery state.
    pub fn discovered_flag(&self) -> DiscoveryFlag {
        self.state.borrow().flag
    }

    /// Devices found on the root bus, as `(fd, 7-bit address)` pairs.
    pub fn root_device_map(&self) -> BTreeSet<(i32, u8)> {
        self.state.borrow().root_device_map.clone()
    }

    /// Snapshot of the device table as `(eid, fd, 8-bit address)` rows.
    pub fn device_table(&self) -> Vec<(Eid, i32, u8)> {
        self.state
            .borrow()
            .device_table
            .entries()
            .map(|(eid, prv)| (*eid, prv.fd, prv.slave_addr))
            .collect()
    }

    /// Whether a bandwidth reservation is active, and for which EID.
    pub fn reservation(&self) -> (bool, u8) {
        let state = self.state.borrow();
        (state.rsv_bw_active, state.reserved_eid)
    }

    /// Requests an immediate device scan.
    pub fn trigger_device_discovery(&self) {
        let _ = self.scan_tx.try_send(());
    }

    /// Forces the routing refresh to run now.
    pub fn trigger_routing_refresh(&self) {
        let _ = self.refresh_tx.try_send(());
    }

    /// I2C bus number behind an open fd: a mux leaf or the root bus.
    pub fn bus_num_by_fd(&self, fd: RawFd) -> u32 {
        self.state
            .borrow()
            .muxes
            .iter()
            .find(|m| m.file.as_raw_fd() == fd)
            .map(|m| m.bus)
            .unwrap_or(self.root_bus)
    }

    /// Binding-private record for an outgoing frame to `dst`.
    ///
    /// Decorates the device-table record with the mux hold parameters
    /// when the device sits behind a mux leaf.
    pub fn binding_private_for(&self, dst: Eid) -> Result<SmbusPktPrv> {
        let state = self.state.borrow();
        let Some(base) = state.device_table.prv_for(dst) else {
            info!("Eid not found in device table");
            return Err(Error::NoRoute);
        };
        let is_mux =
            state.muxes.iter().any(|m| m.file.as_raw_fd() == base.fd);
        Ok(SmbusPktPrv {
            fd: base.fd,
            mux_hold_timeout: if is_mux { MUX_HOLD_TIMEOUT_MS } else { 0 },
            mux_flags: if is_mux { IS_MUX_PORT } else { 0 },
            slave_addr: base.slave_addr,
        })
    }

    /// Runs the plane: inbound dispatch, scanning, hot-plug monitoring,
    /// bandwidth reservation, routing refresh.
    pub async fn run(self: Rc<Self>) -> Result<()> {
        let rx = self.rx_task();
        let scan = self.scan_task();
        let monitor = self.mux_monitor_task();
        let rsv = self.reservation_task();
        let routing = self.routing_task();

        smol::future::try_zip(
            smol::future::try_zip(rx, scan),
            smol::future::try_zip(monitor, smol::future::try_zip(rsv, routing)),
        )
        .await
        .map(|_| ())
    }

    /// Restores recorded mux idle modes; called at shutdown.
    pub fn shutdown(&self) {
        self.restore_mux_idle_mode();
    }

    // ---- bus and mux plumbing ----

    /// Probes every configured slave address reachable through `fd`.
    ///
    /// A device already present in the root device map is suppressed when
    /// seen again through a mux leaf; it is reported once, on the root bus.
    fn scan_port(&self, fd: RawFd, out: &mut BTreeSet<(i32, u8)>) {
        if fd < 0 {
            error!("Invalid I2C port fd");
            return;
        }
        let root_fd = self.driver.root_fd();

        for addr in &self.cfg.supported_endpoint_slave_address {
            let present = if is_eeprom_addr(*addr) {
                self.driver.probe_read_byte(fd, *addr)
            } else {
                self.driver.probe_write_quick(fd, *addr)
            };
            if !present {
                continue;
            }

            if fd != root_fd
                && self
                    .state
                    .borrow()
                    .root_device_map
                    .contains(&(root_fd, *addr))
            {
                debug!("Skipping device {addr}");
                continue;
            }

            debug!("Adding device {addr}");
            out.insert((fd, *addr));
        }
    }

    /// Finds mux leaves of the configured root bus and opens them.
    ///
    /// A `/dev/i2c-N` node is a leaf iff its sysfs `mux_device` link
    /// exists and points back at a device on the root bus.
    fn enumerate_mux_ports(&self) -> Vec<MuxPort> {
        let mut muxes = Vec::new();

        let Ok(entries) = std::fs::read_dir(&self.dev_dir) else {
            error!("unable to find i2c devices");
            return muxes;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(bus) = bus_num_from_path(&path) else {
                continue;
            };

            let mux_link =
                self.sysfs_i2c.join(format!("i2c-{bus}")).join("mux_device");
            let Ok(target) = std::fs::read_link(&mux_link) else {
                continue; // a regular i2c port
            };
            let Some(root) = target
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.split('-').next())
                .and_then(|n| n.parse::<u32>().ok())
            else {
                error!("Error getting root port for bus {bus}");
                continue;
            };
            if root != self.root_bus {
                continue;
            }

            match File::options()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
                .open(&path)
            {
                Ok(file) => muxes.push(MuxPort { file, bus }),
                Err(e) => {
                    debug!("Cannot open mux leaf {}: {e}", path.display())
                }
            }
        }
        muxes
    }

    /// Writes `mode` to every mux `idle_state` below the root bus.
    ///
    /// The original value of each attribute is recorded once, on the
    /// first call, for restoration at shutdown.
    fn set_mux_idle_mode(&self, mode: MuxIdleMode) {
        let root_dir = self.sysfs_i2c.join(format!("i2c-{}", self.root_bus));
        let Ok(entries) = std::fs::read_dir(&root_dir) else {
            debug!("No mux interfaces found");
            return;
        };

        let prefix = format!("{}-", self.root_bus);
        let mut state = self.state.borrow_mut();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(channel) = name.strip_prefix(&prefix) else { continue };
            if channel.is_empty()
                || !channel.bytes().all(|b| b.is_ascii_digit())
            {
                continue;
            }

            let idle_path = entry.path().join("idle_state");
            if !idle_path.exists() {
                continue;
            }

            if !state.mux_idle_recorded {
                match std::fs::read_to_string(&idle_path) {
                    Ok(current) => {
                        let current = current.trim().to_string();
                        debug!("{} {current}", idle_path.display());
                        state
                            .mux_idle_saved
                            .insert(idle_path.clone(), current);
                    }
                    Err(e) => {
                        error!(
                            "Unable to read idle mode for mux {}: {e}",
                            idle_path.display()
                        );
                    }
                }
            }

            if let Err(e) = std::fs::write(&idle_path, mode.as_sysfs()) {
                error!(
                    "Unable to set idle mode for mux {}: {e}",
                    idle_path.display()
                );
            }
        }
        state.mux_idle_recorded = true;
    }

    fn restore_mux_idle_mode(&self) {
        let state = self.state.borrow();
        for (path, idle_mode) in &state.mux_idle_saved {
            if let Err(e) = std::fs::write(path, idle_mode) {
                warn!("Unable to restore mux idle mode {}: {e}", path.display());
            }
        }
    }

    // ---- device discovery ----

    async fn scan_task(&self) -> Result<()> {
        loop {
            if !self.state.borrow().rsv_bw_active {
                debug!("Scanning devices");
                self.init_endpoint_discovery().await;
            } else {
                debug!("Reserve bandwidth active. Unable to scan devices");
            }

            let tick = async {
                Timer::after(Duration::from_secs(self.cfg.scan_interval_s))
                    .await;
                false
            };
            let triggered = async {
                let _ = self.scan_rx.recv().await;
                true
            };
            if triggered.or(tick).await {
                warn!(
                    "Device scan wait timer aborted. Re-triggering device \
                     discovery"
                );
            }
        }
    }

    /// One full scan-and-register pass.
    pub async fn init_endpoint_discovery(&self) {
        let mut register_map = BTreeSet::new();

        {
            let mut state = self.state.borrow_mut();
            if state.add_root_devices {
                state.add_root_devices = false;
                register_map.extend(state.root_device_map.iter().copied());
            }
        }

        // Scan each mux leaf once
        let mux_fds: Vec<(RawFd, u32)> = self
            .state
            .borrow()
            .muxes
            .iter()
            .map(|m| (m.file.as_raw_fd(), m.bus))
            .collect();
        for (fd, bus) in &mux_fds {
            debug!("Scanning Mux {bus}");
            self.scan_port(*fd, &mut register_map);
        }

        // Muxes admit one in-flight transaction; devices register strictly
        // sequentially.
        for (fd, addr) in &register_map {
            debug!("Device discovery: Checking device {addr}");

            let is_mux = mux_fds.iter().any(|(mfd, _)| mfd == fd);
            let prv = SmbusPktPrv {
                fd: *fd,
                mux_hold_timeout: if is_mux {
                    self.cfg.req_to_resp_time_ms as u16
                } else {
                    0
                },
                mux_flags: if is_mux { IS_MUX_PORT } else { 0 },
                slave_addr: *addr << 1,
            };

            let registered_eid = self.state.borrow().device_table.eid_for(&prv);
            let eid = match self.register_endpoint(&prv, registered_eid).await
            {
                Ok(Some(eid)) => eid,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Device {addr} registration failed: {e}");
                    continue;
                }
            };

            let mut state = self.state.borrow_mut();
            let new_entry = !state.device_table.contains_eid(eid);
            let no_device_update = !new_entry && eid == registered_eid;
            let device_updated = !new_entry && eid != registered_eid;

            if no_device_update {
                continue;
            }
            if device_updated && !registered_eid.is_null() {
                // The device moved; retire its old identity first.
                state.device_table.remove(registered_eid);
                state.eid_pool.release(registered_eid);
                drop(state);
                self.publisher.endpoint_removed(registered_eid);
                state = self.state.borrow_mut();
            }
            if state.device_table.insert(eid, prv).is_err() {
                warn!("EID {eid} already present in device table");
                continue;
            }
            drop(state);

            let bus = self.bus_num_by_fd(*fd);
            info!(
                "SMBus device at bus:{bus}, 8 bit address: {} registered \
                 at EID {eid}",
                prv.slave_addr
            );
            self.publisher.endpoint_added(
                eid,
                EndpointMode::Endpoint,
                DeviceAttrs::Smbus { bus: bus as i32, address: prv.slave_addr },
            );
        }

        // Nothing reachable anywhere: every known device is gone.
        let root_empty = self.state.borrow().root_device_map.is_empty();
        if register_map.is_empty() && root_empty {
            debug!("No device found");
            let removed: Vec<Eid> = {
                let mut state = self.state.borrow_mut();
                let removed: Vec<Eid> = state
                    .device_table
                    .entries()
                    .map(|(eid, _)| *eid)
                    .collect();
                for eid in &removed {
                    state.eid_pool.release(*eid);
                }
                state.device_table.clear();
                removed
            };
            for eid in removed {
                self.publisher.endpoint_removed(eid);
            }
        }
    }

    /// Bus-owner registration exchange with one probed device.
    ///
    /// Queries the device's EID; assigns one from the pool when the
    /// device reports none, or a conflicting one. Returns `None` for
    /// devices that do not answer MCTP control traffic.
    async fn register_endpoint(
        &self,
        prv: &SmbusPktPrv,
        registered_eid: Eid,
    ) -> Result<Option<Eid>> {
        let resp = self
            .engine
            .request(CommandCode::GetEndpointId, &[], |m| {
                self.driver.send(MCTP_EID_NULL, m, prv)
            })
            .await;
        let body = match resp {
            Ok(body) => body,
            Err(Error::TimedOut) => {
                debug!("Get Endpoint ID unanswered, not an MCTP device");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let resp = GetEndpointIdResp::decode(&body)?;
        if cc_result(resp.cc).is_err() {
            return Ok(None);
        }
        let device_eid = resp.eid;

        if self.cfg.role != BindingRole::BusOwner {
            // Cannot assign; accept a device that already has an EID.
            return Ok(Eid::new_normal(device_eid.0).ok());
        }

        let mut assign = Eid::new_normal(device_eid.0).is_err();
        if !assign {
            // EID already claimed by a different device?
            let state = self.state.borrow();
            if let Some(other) = state.device_table.prv_for(device_eid) {
                assign = other.identity() != prv.identity();
            }
        }

        if !assign {
            if device_eid != registered_eid {
                self.state.borrow_mut().eid_pool.claim(device_eid);
            }
            return Ok(Some(device_eid));
        }

        let eid = self.state.borrow_mut().eid_pool.allocate()?;
        let req = SetEndpointIdReq { op: SetEidOp::Set, eid };
        let resp = self
            .engine
            .request(CommandCode::SetEndpointId, &req.encode(), |m| {
                self.driver.send(MCTP_EID_NULL, m, prv)
            })
            .await;
        let body = match resp {
            Ok(body) => body,
            Err(e) => {
                self.state.borrow_mut().eid_pool.release(eid);
                debug!("Set Endpoint ID failed: {e}");
                return Ok(None);
            }
        };
        let resp = SetEndpointIdResp::decode(&body)?;
        if cc_result(resp.cc).is_err() {
            self.state.borrow_mut().eid_pool.release(eid);
            return Ok(None);
        }
        Ok(Some(resp.eid))
    }

    // ---- inbound traffic ----

    async fn rx_task(&self) -> Result<()> {
        loop {
            let (src, msg, prv) = self.driver.recv().await?;

            self.add_unknown_eid(src, &prv);

            if msg.first() != Some(&MCTP_TYPE_CONTROL.0) {
                trace!("Ignoring non-control message from {src}");
                continue;
            }
            match self.engine.inbound(self, &msg, prv) {
                Inbound::Respond(resp, prv) => {
                    if let Err(e) = self.driver.send(src, &resp, &prv) {
                        warn!("Control response send failed: {e}");
                    }
                }
                Inbound::Done => (),
            }
        }
    }

    /// Admits traffic from EIDs assigned outside our view.
    fn add_unknown_eid(&self, eid: Eid, prv: &SmbusPktPrv) {
        if Eid::new_normal(eid.0).is_err() {
            return;
        }
        let mut state = self.state.borrow_mut();
        if state.device_table.contains_eid(eid) {
            return;
        }
        let entry = SmbusPktPrv {
            fd: prv.fd,
            mux_hold_timeout: prv.mux_hold_timeout,
            mux_flags: prv.mux_flags,
            slave_addr: prv.slave_addr & !1,
        };
        if state.device_table.insert(eid, entry).is_ok() {
            info!("New EID added to device table. EID = {eid}");
        }
    }

    fn change_discovered_flag(&self, flag: DiscoveryFlag) {
        self.state.borrow_mut().flag = flag;
        debug!("DiscoveredFlag: {flag}");
        if flag == DiscoveryFlag::Discovered {
            self.trigger_routing_refresh();
        }
    }

    // ---- routing refresh (endpoint role) ----

    async fn routing_task(&self) -> Result<()> {
        if self.cfg.role == BindingRole::BusOwner {
            smol::future::pending::<()>().await;
        }

        loop {
            let tick = async {
                Timer::after(Duration::from_secs(
                    self.cfg.routing_interval_s,
                ))
                .await;
            };
            let fired = async {
                let _ = self.refresh_rx.recv().await;
            };
            tick.or(fired).await;

            if self.state.borrow().flag != DiscoveryFlag::Discovered {
                debug!("SMBus Get Routing Table failed, undiscovered");
                continue;
            }
            if self.state.borrow().refresh_in_flight {
                debug!("Routing refresh already in flight, dropped");
                continue;
            }

            self.state.borrow_mut().refresh_in_flight = true;
            let r = self.update_routing_table().await;
            self.state.borrow_mut().refresh_in_flight = false;
            if let Err(e) = r {
                error!("Get Routing Table failed: {e}");
            }
        }
    }

    /// Mirrors the bus owner's routing table into the device table.
    ///
    /// Only SMBus entries with a single-byte physical address are
    /// admitted; EID ranges expand to one row per EID, all addressed
    /// through the bus owner's fd.
    async fn update_routing_table(&self) -> Result<()> {
        let (bus_owner_fd, bus_owner_slave_addr) = {
            let state = self.state.borrow();
            (state.bus_owner_fd, state.bus_owner_slave_addr)
        };
        let prv = SmbusPktPrv {
            fd: bus_owner_fd,
            mux_hold_timeout: 0,
            mux_flags: 0,
            slave_addr: bus_owner_slave_addr,
        };

        let mut tmp = DeviceTable::new();
        let mut entry_handle = 0x00u8;
        let mut response_count = 0x00u8;
        while entry_handle != 0xff && response_count < 0xff {
            let body = mctp_ctrl::control::GetRoutingTableReq { entry_handle }
                .encode();
            let resp = self
                .engine
                .request(CommandCode::GetRoutingTableEntries, &body, |m| {
                    self.driver.send(MCTP_EID_NULL, m, &prv)
                })
                .await?;
            let resp =
                mctp_ctrl::control::GetRoutingTableResp::decode(&resp)?;
            cc_result(resp.cc)?;

            for entry in &resp.entries {
                if entry.phys_transport_binding_id != MCTP_BINDING_SMBUS
                    || entry.phys_address.len() != 1
                {
                    continue;
                }
                let row = SmbusPktPrv {
                    fd: bus_owner_fd,
                    mux_hold_timeout: 0,
                    mux_flags: 0,
                    slave_addr: entry.phys_address[0] << 1,
                };
                for offset in 0..entry.eid_range_size {
                    let eid = Eid(entry.starting_eid.wrapping_add(offset));
                    if tmp.insert(eid, row).is_err() {
                        debug!("Duplicate EID {eid} in routing table");
                    }
                }
            }
            entry_handle = resp.next_entry_handle;
            response_count += 1;
        }

        if self.state.borrow().device_table.differs_from(&tmp) {
            self.process_device_table_changes(&tmp);
            self.state.borrow_mut().device_table = tmp;
        }
        Ok(())
    }

    /// Applies a new device table, emitting per-EID add/remove events.
    fn process_device_table_changes(&self, new_table: &DeviceTable) {
        let (removed, added): (Vec<Eid>, Vec<(Eid, SmbusPktPrv)>) = {
            let state = self.state.borrow();
            let removed = state
                .device_table
                .entries()
                .filter(|(eid, _)| !new_table.contains_eid(*eid))
                .map(|(eid, _)| *eid)
                .collect();
            let added = new_table
                .entries()
                .filter(|(eid, _)| !state.device_table.contains_eid(*eid))
                .map(|(eid, prv)| (*eid, *prv))
                .collect();
            (removed, added)
        };

        for eid in removed {
            self.publisher.endpoint_removed(eid);
        }
        for (eid, prv) in added {
            self.publisher.endpoint_added(
                eid,
                EndpointMode::Endpoint,
                DeviceAttrs::Smbus {
                    bus: self.bus_num_by_fd(prv.fd) as i32,
                    address: prv.slave_addr,
                },
            );
        }
    }

    // ---- bandwidth reservation ----

    /// Reserves the path to `eid` for a long transaction.
    ///
    /// Re-reserving by the same EID restarts the timer without re-running
    /// the enter sequence; a different EID fails with
    /// [`Error::ResourceBusy`] while a reservation is active.
    pub fn reserve_bandwidth(&self, eid: Eid, timeout_s: u16) -> Result<()> {
        {
            let state = self.state.borrow();
            if state.rsv_bw_active && eid.0 != state.reserved_eid {
                warn!(
                    "reserveBandwidth is not allowed for EID: {eid}. It is \
                     active for EID: {}",
                    state.reserved_eid
                );
                return Err(Error::ResourceBusy);
            }
        }

        let prv = self.binding_private_for(eid).inspect_err(|_| {
            error!("reserveBandwidth failed. Invalid destination EID");
        })?;
        if !prv.is_mux_port() {
            warn!("reserveBandwidth not required, fd is not a mux port");
            return Err(Error::BadArgument);
        }

        if !self.state.borrow().rsv_bw_active {
            self.driver.init_pull_model(&prv).inspect_err(|_| {
                error!("reserveBandwidth: init pull model failed");
            })?;
            self.set_mux_idle_mode(MuxIdleMode::Connect);
            let mut state = self.state.borrow_mut();
            state.rsv_bw_active = true;
            state.reserved_eid = eid.0;
            state.rsv_prv = Some(prv);
        }

        let deadline = Instant::now() + Duration::from_secs(timeout_s.into());
        let _ = self.rsv_tx.try_send(RsvCtl::Start(deadline));
        Ok(())
    }

    /// Releases an active reservation, running the exit path.
    pub fn release_bandwidth(&self, eid: Eid) -> Result<()> {
        let state = self.state.borrow();
        if !state.rsv_bw_active || eid.0 != state.reserved_eid {
            error!("reserveBandwidth is not active for EID: {eid}");
            return Err(Error::BadArgument);
        }
        drop(state);
        let _ = self.rsv_tx.try_send(RsvCtl::Cancel);
        Ok(())
    }

    /// Owns the reservation window: restarts absorb into the same
    /// activation, and the exit path runs exactly once per activation.
    async fn reservation_task(&self) -> Result<()> {
        loop {
            let Ok(ctl) = self.rsv_rx.recv().await else {
                return Ok(());
            };
            let RsvCtl::Start(mut deadline) = ctl else {
                continue;
            };

            loop {
                let expire = async {
                    Timer::at(deadline).await;
                    None
                };
                let ctl = async { self.rsv_rx.recv().await.ok() };
                match ctl.or(expire).await {
                    Some(RsvCtl::Start(next)) => {
                        debug!("reserveBandwidth: timer restarted");
                        deadline = next;
                    }
                    Some(RsvCtl::Cancel) | None => break,
                }
            }

            self.set_mux_idle_mode(MuxIdleMode::Disconnect);
            let prv = self.state.borrow_mut().rsv_prv.take();
            if let Some(prv) = prv {
                if let Err(e) = self.driver.exit_pull_model(&prv) {
                    error!("releaseBandwidth: exit pull model failed: {e}");
                }
            }
            let mut state = self.state.borrow_mut();
            state.rsv_bw_active = false;
            state.reserved_eid = 0;
        }
    }

    // ---- hot-plug ----

    /// Watches `/dev` for i2c node churn; rebuilds the mux map and
    /// rescans after a quiet period.
    async fn mux_monitor_task(&self) -> Result<()> {
        let ino = Inotify::new(&self.dev_dir)?;

        loop {
            // Wait for a relevant event
            loop {
                let names = ino.read_events().await?;
                if names.iter().any(|n| n.starts_with("i2c-")) {
                    debug!("Detected change on bus");
                    break;
                }
            }

            // Debounce; every further i2c event re-arms the window
            let mut deadline = Instant::now() + MUX_REFRESH_DEBOUNCE;
            loop {
                let expire = async {
                    Timer::at(deadline).await;
                    None
                };
                let more = async { Some(ino.read_events().await) };
                match more.or(expire).await {
                    Some(Ok(names)) => {
                        if names.iter().any(|n| n.starts_with("i2c-")) {
                            deadline = Instant::now() + MUX_REFRESH_DEBOUNCE;
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            }

            info!("i2c bus change detected, refreshing muxPortMap");
            let muxes = self.enumerate_mux_ports();
            self.state.borrow_mut().muxes = muxes;
            self.trigger_device_discovery();
        }
    }

    // ---- control request handlers ----

    fn handle_set_endpoint_id(
        &self,
        body: &[u8],
        prv: &SmbusPktPrv,
    ) -> Option<Vec<u8>> {
        let req = SetEndpointIdReq::decode(body).ok()?;

        let assigned = match req.op {
            SetEidOp::Set | SetEidOp::Force => Eid::new_normal(req.eid.0).ok(),
            SetEidOp::Reset => Some(Eid(self.cfg.default_eid)),
            SetEidOp::SetDiscovered => None,
        };
        let Some(eid) = assigned else {
            return Some(
                SetEndpointIdResp {
                    cc: CompletionCode::ErrorInvalidData as u8,
                    status: 0,
                    eid: self.state.borrow().own_eid,
                    eid_pool_size: 0,
                }
                .encode(),
            );
        };

        {
            let mut state = self.state.borrow_mut();
            state.own_eid = eid;
            state.bus_owner_fd = prv.fd;
            state.bus_owner_slave_addr = prv.slave_addr;
        }
        self.driver.set_own_eid(eid);
        info!("Own EID set to {eid}");
        self.change_discovered_flag(DiscoveryFlag::Discovered);

        Some(
            SetEndpointIdResp {
                cc: CompletionCode::Success as u8,
                status: 0,
                eid,
                eid_pool_size: 0,
            }
            .encode(),
        )
    }

    fn handle_get_endpoint_id(&self) -> Option<Vec<u8>> {
        let endpoint_type = match self.cfg.role {
            BindingRole::BusOwner | BindingRole::Bridge => 0b0001_0000,
            BindingRole::Endpoint => 0b0000_0000,
        };
        Some(
            GetEndpointIdResp {
                cc: CompletionCode::Success as u8,
                eid: self.state.borrow().own_eid,
                endpoint_type,
                medium_specific: 0,
            }
            .encode(),
        )
    }

    fn handle_get_version_support(&self, body: &[u8]) -> Option<Vec<u8>> {
        let req = GetVersionSupportReq::decode(body).ok()?;
        match req.msg_type_number {
            0x00 | 0xff => Some(
                GetVersionSupportResp {
                    cc: CompletionCode::Success as u8,
                    versions: vec![MCTP_VERSION_1_3_1],
                }
                .encode(),
            ),
            _ => Some(vec![CC_VERSION_TYPE_UNSUPPORTED]),
        }
    }

    fn handle_get_vdm_support(&self, body: &[u8]) -> Option<Vec<u8>> {
        let req = GetVdmSupportReq::decode(body).ok()?;

        let state = self.state.borrow();
        let index = req.vendor_id_set_selector as usize;
        let Some(set) = state.vdm_sets.get(index) else {
            return Some(vec![CompletionCode::ErrorInvalidData as u8]);
        };
        let next = if index + 1 == state.vdm_sets.len() {
            VENDOR_ID_NO_MORE_SETS
        } else {
            (index + 1) as u8
        };
        Some(
            GetVdmSupportResp {
                cc: CompletionCode::Success as u8,
                vendor_id_set_selector: next,
                vendor_id_format: set.vendor_id_format,
                vendor_id: set.vendor_id,
                command_set_type: set.command_set_type,
            }
            .encode(),
        )
    }
}

impl<D: SmbusDriver> RequestHandler for SmbusPlane<D> {
    type Prv = SmbusPktPrv;

    fn handle_request(
        &self,
        command: CommandCode,
        body: &[u8],
        prv: &mut SmbusPktPrv,
    ) -> Option<Vec<u8>> {
        match command {
            CommandCode::SetEndpointId => {
                self.handle_set_endpoint_id(body, prv)
            }
            CommandCode::GetEndpointId => self.handle_get_endpoint_id(),
            CommandCode::GetVersionSupport => {
                self.handle_get_version_support(body)
            }
            CommandCode::GetMessageTypeSupport => Some(
                GetMsgTypeSupportResp {
                    cc: CompletionCode::Success as u8,
                    types: vec![MCTP_TYPE_CONTROL.0],
                }
                .encode(),
            ),
            CommandCode::GetVdmSupport => self.handle_get_vdm_support(body),
            _ => None,
        }
    }
}

impl<D: SmbusDriver> Drop for SmbusPlane<D> {
    fn drop(&mut self) {
        self.restore_mux_idle_mode();
    }
}
