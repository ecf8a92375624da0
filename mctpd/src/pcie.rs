// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! PCIe VDM transport binding.
//!
//! Frames travel through a vendor kernel driver addressed by requester
//! BDF. In the endpoint role the binding runs the discovery handshake
//! (Discovery Notify, Prepare for Endpoint Discovery, Endpoint Discovery,
//! Set Endpoint ID) and then maintains the routing table by walking the
//! bus owner and recursing into bridges.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

pub mod kernel;

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use smol::channel::{bounded, Receiver, Sender};
use smol::future::FutureExt;
use smol::Timer;

use mctp_ctrl::control::{
    GetEndpointIdResp, GetMsgTypeSupportResp, GetRoutingTableReq,
    GetRoutingTableResp, GetVdmSupportReq, GetVdmSupportResp,
    GetVersionSupportReq, GetVersionSupportResp, SetEidOp, SetEndpointIdReq,
    SetEndpointIdResp, VENDOR_ID_FORMAT_PCI, VENDOR_ID_NO_MORE_SETS,
};
use mctp_ctrl::prv::{PciePktPrv, PcieRouting};
use mctp_ctrl::{
    cc_result, CommandCode, CompletionCode, Eid, Error, Result,
    MCTP_EID_NULL, MCTP_TYPE_CONTROL,
};

use crate::config::PcieConfig;
use crate::control::{ControlEngine, Inbound, RequestHandler};
use crate::publisher::{DeviceAttrs, EndpointPublisher};
use crate::routing::{
    all_bridges_called, entry_mode, is_bridge_called, is_end_of_walk,
    is_entry_bridge, merge_response, table_diff, RoutingEntry,
};
use crate::{BindingRole, DiscoveryFlag, VdmSet};

/// MCTP base specification version reported by Get Version Support: 1.3.1.
const MCTP_VERSION_1_3_1: u32 = 0xf1f3_f100;

/// Command-specific completion code: version query for unsupported type.
const CC_VERSION_TYPE_UNSUPPORTED: u8 = 0x80;

/// BDF field helpers.
pub mod bdf {
    /// Bus number, bits [15:8].
    pub fn bus(bdf: u16) -> u8 {
        (bdf >> 8) as u8
    }

    /// Device number, bits [7:3].
    pub fn device(bdf: u16) -> u8 {
        ((bdf >> 3) & 0x1f) as u8
    }

    /// Function number, bits [2:0].
    pub fn function(bdf: u16) -> u8 {
        (bdf & 0x07) as u8
    }
}

/// Interface to the vendor PCIe MCTP kernel driver.
///
/// `recv` yields whole reassembled MCTP messages (first byte is the
/// message type) together with the source EID and the frame's routing
/// record; message assembly itself happens below this interface.
pub trait PcieDriver {
    /// Brings up the hardware channel.
    fn init(&self) -> Result<()>;

    /// Registers this daemon as the default MCTP control service.
    fn register_as_default(&self) -> Result<()>;

    /// Sends one message with the given routing record.
    fn send(&self, dest: Eid, msg: &[u8], prv: PciePktPrv) -> Result<()>;

    /// Receives one message; suspends until traffic arrives.
    fn recv(
        &self,
    ) -> impl std::future::Future<Output = Result<(Eid, Vec<u8>, PciePktPrv)>>;

    /// Own bus/device/function, when the link is up.
    fn bdf(&self) -> Option<u16>;

    /// DSP0239 medium identifier of the link.
    fn medium_id(&self) -> u8;
}

/// Observer of hardware ready-state changes.
pub trait DeviceReadyObserver {
    /// The device became ready (`true`) or dropped off (`false`).
    fn device_ready_notify(&self, ready: bool);
}

/// Hardware ready-state monitor.
///
/// The binding owns the monitor exclusively; the monitor keeps only a
/// weak observer handle, upgraded for the duration of a callback.
pub struct DeviceMonitor {
    observer: RefCell<Weak<dyn DeviceReadyObserver>>,
}

impl DeviceMonitor {
    /// Creates a monitor with no observer attached.
    pub fn new() -> Self {
        Self { observer: RefCell::new(Weak::<PhantomObserver>::new()) }
    }

    /// Attaches the observer.
    pub fn observe(&self, observer: Weak<dyn DeviceReadyObserver>) {
        *self.observer.borrow_mut() = observer;
    }

    /// Delivers a ready-state change to the observer, if still alive.
    pub fn notify(&self, ready: bool) {
        let observer = self.observer.borrow().upgrade();
        if let Some(observer) = observer {
            observer.device_ready_notify(ready);
        }
    }
}

// Placeholder for the unattached observer slot.
struct PhantomObserver;
impl DeviceReadyObserver for PhantomObserver {
    fn device_ready_notify(&self, _ready: bool) {}
}

struct PcieState {
    bdf: u16,
    bus_owner_bdf: u16,
    bus_owner_eid: Eid,
    own_eid: Eid,
    flag: DiscoveryFlag,
    routing_table: Vec<RoutingEntry>,
    refresh_in_flight: bool,
    vdm_sets: Vec<VdmSet>,
}

/// The PCIe VDM binding.
pub struct PcieBinding<D: PcieDriver> {
    driver: D,
    engine: ControlEngine,
    publisher: Rc<dyn EndpointPublisher>,
    monitor: Rc<DeviceMonitor>,
    role: BindingRole,
    default_eid: u8,
    routing_interval: Duration,
    state: RefCell<PcieState>,
    refresh_tx: Sender<()>,
    refresh_rx: Receiver<()>,
}

impl<D: PcieDriver + 'static> PcieBinding<D> {
    /// Creates the binding and initializes the hardware channel.
    ///
    /// Fatal errors here abort startup.
    pub fn new(
        cfg: &PcieConfig,
        driver: D,
        publisher: Rc<dyn EndpointPublisher>,
    ) -> Result<Rc<Self>> {
        driver.init().inspect_err(|e| {
            error!("Error in MCTP binding init: {e}");
        })?;
        driver.register_as_default().inspect_err(|e| {
            error!("Registration as default control service failed: {e}");
        })?;

        let flag = if cfg.role == BindingRole::BusOwner {
            DiscoveryFlag::NotApplicable
        } else {
            DiscoveryFlag::Undiscovered
        };

        let (refresh_tx, refresh_rx) = bounded(1);

        let binding = Rc::new(Self {
            driver,
            engine: ControlEngine::new(
                cfg.req_to_resp_time_ms,
                cfg.req_retry_count,
            ),
            publisher,
            monitor: Rc::new(DeviceMonitor::new()),
            role: cfg.role,
            default_eid: cfg.default_eid,
            routing_interval: Duration::from_secs(cfg.get_routing_interval_s),
            state: RefCell::new(PcieState {
                bdf: cfg.bdf,
                bus_owner_bdf: 0,
                bus_owner_eid: MCTP_EID_NULL,
                own_eid: Eid(cfg.default_eid),
                flag,
                routing_table: Vec::new(),
                refresh_in_flight: false,
                vdm_sets: vec![VdmSet {
                    vendor_id_format: VENDOR_ID_FORMAT_PCI,
                    vendor_id: 0x8086,
                    command_set_type: 0x0000,
                }],
            }),
            refresh_tx,
            refresh_rx,
        });

        let observer: Rc<dyn DeviceReadyObserver> = binding.clone();
        binding.monitor.observe(Rc::downgrade(&observer));

        Ok(binding)
    }

    /// The hardware ready-state monitor for this binding.
    pub fn monitor(&self) -> Rc<DeviceMonitor> {
        self.monitor.clone()
    }

    /// Current discovery state.
    pub fn discovered_flag(&self) -> DiscoveryFlag {
        self.state.borrow().flag
    }

    /// Currently assigned EID.
    pub fn own_eid(&self) -> Eid {
        self.state.borrow().own_eid
    }

    /// BDF of the segment's bus owner, 0 while undiscovered.
    pub fn bus_owner_bdf(&self) -> u16 {
        self.state.borrow().bus_owner_bdf
    }

    /// Snapshot of the current routing table.
    pub fn routing_table(&self) -> Vec<RoutingEntry> {
        self.state.borrow().routing_table.clone()
    }

    /// Forces the routing refresh to run now.
    pub fn trigger_routing_refresh(&self) {
        let _ = self.refresh_tx.try_send(());
    }

    /// Routing record for an outgoing frame to `dst`.
    ///
    /// Fails with [`Error::NoRoute`] when the destination is not in the
    /// routing table.
    pub fn binding_private_for(&self, dst: Eid) -> Result<PciePktPrv> {
        let state = self.state.borrow();
        let Some(entry) =
            state.routing_table.iter().find(|e| e.eid == dst.0)
        else {
            info!("Eid not found in routing table");
            return Err(Error::NoRoute);
        };
        Ok(PciePktPrv {
            routing: PcieRouting::RouteById,
            remote_id: entry.phys_addr,
        })
    }

    /// Runs the binding: inbound dispatch, discovery, routing refresh.
    pub async fn run(self: Rc<Self>) -> Result<()> {
        let notify = async {
            if self.role == BindingRole::Endpoint {
                self.endpoint_discovery_flow().await;
            }
            Ok(())
        };
        smol::future::try_zip(
            smol::future::try_zip(self.rx_task(), self.routing_task()),
            notify,
        )
        .await
        .map(|_| ())
    }

    /// Startup discovery: announce this endpoint towards the root complex.
    async fn endpoint_discovery_flow(&self) {
        self.change_discovered_flag(DiscoveryFlag::Undiscovered);

        let prv = PciePktPrv {
            routing: PcieRouting::RouteToRc,
            remote_id: self.state.borrow().bdf,
        };
        let r = self
            .engine
            .request(CommandCode::DiscoveryNotify, &[], |m| {
                self.driver.send(MCTP_EID_NULL, m, prv)
            })
            .await
            .and_then(|body| {
                cc_result(*body.first().ok_or(Error::InvalidInput)?)
            });
        if let Err(e) = r {
            error!("Discovery Notify failed: {e}");
        }
    }

    async fn rx_task(&self) -> Result<()> {
        loop {
            let (src, msg, prv) = self.driver.recv().await?;
            if msg.first() != Some(&MCTP_TYPE_CONTROL.0) {
                trace!("Ignoring non-control message from {src}");
                continue;
            }
            match self.engine.inbound(self, &msg, prv) {
                Inbound::Respond(resp, prv) => {
                    if let Err(e) = self.driver.send(src, &resp, prv) {
                        warn!("Control response send failed: {e}");
                    }
                }
                Inbound::Done => (),
            }
        }
    }

    fn change_discovered_flag(&self, flag: DiscoveryFlag) {
        let mut state = self.state.borrow_mut();
        state.flag = flag;
        debug!("DiscoveredFlag: {flag}");
        match flag {
            DiscoveryFlag::Discovered => {
                drop(state);
                // Fire the routing refresh immediately
                self.trigger_routing_refresh();
            }
            DiscoveryFlag::Undiscovered => {
                state.bus_owner_bdf = 0;
            }
            DiscoveryFlag::NotApplicable => (),
        }
    }

    async fn routing_task(&self) -> Result<()> {
        if self.role == BindingRole::BusOwner {
            // The bus owner is the source of the routing table.
            smol::future::pending::<()>().await;
        }

        loop {
            let tick = async {
                Timer::after(self.routing_interval).await;
            };
            let fired = async {
                let _ = self.refresh_rx.recv().await;
            };
            tick.or(fired).await;

            if self.state.borrow().flag != DiscoveryFlag::Discovered {
                debug!("Get Routing Table failed, undiscovered");
                continue;
            }
            if self.state.borrow().refresh_in_flight {
                debug!("Routing refresh already in flight, dropped");
                continue;
            }

            self.state.borrow_mut().refresh_in_flight = true;
            let r = self.refresh_routing_table().await;
            self.state.borrow_mut().refresh_in_flight = false;
            if let Err(e) = r {
                error!("Get Routing Table failed: {e}");
            }
        }
    }

    async fn refresh_routing_table(&self) -> Result<()> {
        let (bus_owner_eid, bus_owner_bdf) = {
            let state = self.state.borrow();
            (state.bus_owner_eid, state.bus_owner_bdf)
        };

        let mut rt = Vec::new();
        let mut called = Vec::new();
        self.read_routing_table(
            &mut rt,
            &mut called,
            bus_owner_eid,
            bus_owner_bdf,
            None,
        )
        .await?;

        while !all_bridges_called(&rt, &called) {
            self.process_bridge_entries(&mut rt, &mut called).await;
        }

        if rt != self.state.borrow().routing_table {
            self.process_routing_table_changes(&rt);
            self.state.borrow_mut().routing_table = rt;
        }
        Ok(())
    }

    /// One issuer's portion of the routing-table walk.
    ///
    /// `entry_index` is the bridge's position in the table for bridge
    /// issuers, `None` for the bus owner.
    async fn read_routing_table(
        &self,
        rt: &mut Vec<RoutingEntry>,
        called: &mut Vec<(u8, u16)>,
        dest_eid: Eid,
        phys_addr: u16,
        entry_index: Option<usize>,
    ) -> Result<()> {
        let prv = PciePktPrv {
            routing: PcieRouting::RouteById,
            remote_id: phys_addr,
        };
        let issuer_is_bus_owner =
            dest_eid == self.state.borrow().bus_owner_eid;
        let mut insert_index = entry_index.map(|i| i + 1).unwrap_or(0);

        let mut entry_handle = 0x00u8;
        let mut response_count = 0x00u8;
        while !is_end_of_walk(entry_handle, response_count) {
            called.push((dest_eid.0, phys_addr));

            let body = GetRoutingTableReq { entry_handle }.encode();
            let resp = self
                .engine
                .request(CommandCode::GetRoutingTableEntries, &body, |m| {
                    self.driver.send(dest_eid, m, prv)
                })
                .await?;
            let resp = GetRoutingTableResp::decode(&resp)?;
            cc_result(resp.cc)?;

            merge_response(
                rt,
                &mut insert_index,
                issuer_is_bus_owner,
                phys_addr,
                &resp.entries,
            );

            entry_handle = resp.next_entry_handle;
            response_count += 1;
        }
        Ok(())
    }

    /// Queries every not-yet-called bridge in the current table.
    ///
    /// Insertion indices refer to the table as it stood when the pass
    /// started, keeping endpoints behind one bridge contiguous. A failing
    /// bridge is skipped; it was recorded as called before the request.
    async fn process_bridge_entries(
        &self,
        rt: &mut Vec<RoutingEntry>,
        called: &mut Vec<(u8, u16)>,
    ) {
        let mut rt_copy = rt.clone();

        for (index, entry) in rt.iter().enumerate() {
            if !is_entry_bridge(entry) || is_bridge_called(entry, called) {
                continue;
            }

            if let Err(e) = self
                .read_routing_table(
                    &mut rt_copy,
                    called,
                    Eid(entry.eid),
                    entry.phys_addr,
                    Some(index),
                )
                .await
            {
                warn!("Bridge {} routing table read failed: {e}", entry.eid);
            }
        }
        *rt = rt_copy;
    }

    /// Applies a new routing table: unregister vanished endpoints,
    /// register new ones, sequentially per refresh.
    fn process_routing_table_changes(&self, new_table: &[RoutingEntry]) {
        let (own_eid, bus_owner_bdf, diff) = {
            let state = self.state.borrow();
            (
                state.own_eid,
                state.bus_owner_bdf,
                table_diff(&state.routing_table, new_table),
            )
        };

        for entry in &diff.removed {
            self.publisher.endpoint_removed(Eid(entry.eid));
        }

        for entry in &diff.added {
            if entry.eid == own_eid.0 {
                continue;
            }
            let attrs = DeviceAttrs::Pcie {
                bus: bdf::bus(entry.phys_addr),
                device: bdf::device(entry.phys_addr),
                function: bdf::function(entry.phys_addr),
            };
            self.publisher.endpoint_added(
                Eid(entry.eid),
                entry_mode(entry, bus_owner_bdf),
                attrs,
            );
        }
    }

    fn handle_prepare_discovery(
        &self,
        prv: &mut PciePktPrv,
    ) -> Option<Vec<u8>> {
        if self.role != BindingRole::Endpoint {
            return None;
        }
        if prv.routing != PcieRouting::BroadcastFromRc {
            info!(
                "Prepare for Endpoint Discovery command can only be \
                 accepted as broadcast."
            );
            return None;
        }
        self.change_discovered_flag(DiscoveryFlag::Undiscovered);
        prv.routing = PcieRouting::RouteToRc;
        Some(vec![CompletionCode::Success as u8])
    }

    fn handle_endpoint_discovery(
        &self,
        prv: &mut PciePktPrv,
    ) -> Option<Vec<u8>> {
        if self.state.borrow().flag == DiscoveryFlag::Discovered {
            return None;
        }
        if prv.routing != PcieRouting::BroadcastFromRc {
            info!(
                "Endpoint Discovery command can only be accepted as \
                 broadcast."
            );
            return None;
        }
        self.state.borrow_mut().bus_owner_bdf = prv.remote_id;
        prv.routing = PcieRouting::RouteToRc;
        Some(vec![CompletionCode::Success as u8])
    }

    fn handle_set_endpoint_id(
        &self,
        body: &[u8],
        prv: &mut PciePktPrv,
    ) -> Option<Vec<u8>> {
        if prv.remote_id != self.state.borrow().bus_owner_bdf {
            info!("Set EID requested from non-bus owner.");
            return None;
        }
        let req = SetEndpointIdReq::decode(body).ok()?;
        prv.routing = PcieRouting::RouteById;

        let assigned = match req.op {
            SetEidOp::Set | SetEidOp::Force => {
                Eid::new_normal(req.eid.0).ok()
            }
            SetEidOp::Reset => Some(Eid(self.default_eid)),
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

        self.state.borrow_mut().own_eid = eid;
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

    fn handle_get_endpoint_id(&self, prv: &mut PciePktPrv) -> Option<Vec<u8>> {
        prv.routing = PcieRouting::RouteById;
        let endpoint_type = match self.role {
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

    fn handle_get_version_support(
        &self,
        body: &[u8],
        prv: &mut PciePktPrv,
    ) -> Option<Vec<u8>> {
        let req = GetVersionSupportReq::decode(body).ok()?;
        prv.routing = PcieRouting::RouteById;

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

    fn handle_get_msg_type_support(
        &self,
        prv: &mut PciePktPrv,
    ) -> Option<Vec<u8>> {
        prv.routing = PcieRouting::RouteById;
        Some(
            GetMsgTypeSupportResp {
                cc: CompletionCode::Success as u8,
                types: vec![MCTP_TYPE_CONTROL.0],
            }
            .encode(),
        )
    }

    fn handle_get_vdm_support(
        &self,
        body: &[u8],
        prv: &mut PciePktPrv,
    ) -> Option<Vec<u8>> {
        let req = GetVdmSupportReq::decode(body).ok()?;
        prv.routing = PcieRouting::RouteToRc;

        let state = self.state.borrow();
        let index = req.vendor_id_set_selector as usize;
        let Some(set) = state.vdm_sets.get(index) else {
            return Some(vec![CompletionCode::ErrorUnsupportedCmd as u8]);
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

impl<D: PcieDriver + 'static> RequestHandler for PcieBinding<D> {
    type Prv = PciePktPrv;

    fn handle_request(
        &self,
        command: CommandCode,
        body: &[u8],
        prv: &mut PciePktPrv,
    ) -> Option<Vec<u8>> {
        if prv.remote_id == 0x00 {
            debug!("Dropping request with null requester ID");
            return None;
        }

        match command {
            CommandCode::PrepareEndpointDiscovery => {
                self.handle_prepare_discovery(prv)
            }
            CommandCode::EndpointDiscovery => {
                self.handle_endpoint_discovery(prv)
            }
            CommandCode::SetEndpointId => {
                self.handle_set_endpoint_id(body, prv)
            }
            CommandCode::GetEndpointId => self.handle_get_endpoint_id(prv),
            CommandCode::GetVersionSupport => {
                self.handle_get_version_support(body, prv)
            }
            CommandCode::GetMessageTypeSupport => {
                self.handle_get_msg_type_support(prv)
            }
            CommandCode::GetVdmSupport => {
                self.handle_get_vdm_support(body, prv)
            }
            _ => None,
        }
    }
}

impl<D: PcieDriver + 'static> DeviceReadyObserver for PcieBinding<D> {
    fn device_ready_notify(&self, _ready: bool) {
        // The driver cannot report a BDF reliably around link changes;
        // clear it unconditionally and rediscover.
        self.state.borrow_mut().bdf = 0;
        if self.role != BindingRole::BusOwner {
            self.change_discovered_flag(DiscoveryFlag::Undiscovered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdf_fields() {
        // Bus - 8 bits, Device - 5 bits, Function - 3 bits
        let v = 0xa1b2;
        assert_eq!(bdf::bus(v), 0xa1);
        assert_eq!(bdf::device(v), 0x16);
        assert_eq!(bdf::function(v), 0x2);
        assert_eq!(
            (bdf::bus(v) as u16) << 8
                | (bdf::device(v) as u16) << 3
                | bdf::function(v) as u16,
            v
        );
    }

    #[test]
    fn monitor_observer_is_weak() {
        struct Flag(std::cell::Cell<bool>);
        impl DeviceReadyObserver for Flag {
            fn device_ready_notify(&self, ready: bool) {
                self.0.set(ready);
            }
        }

        let monitor = DeviceMonitor::new();
        let flag = Rc::new(Flag(std::cell::Cell::new(false)));
        let observer: Rc<dyn DeviceReadyObserver> = flag.clone();
        monitor.observe(Rc::downgrade(&observer));

        monitor.notify(true);
        assert!(flag.0.get());

        drop(observer);
        drop(flag);
        // Observer gone; notify is a no-op rather than a dangling call.
        monitor.notify(false);
    }
}
