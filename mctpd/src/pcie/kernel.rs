// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Kernel-backed PCIe VDM driver.
//!
//! The vendor driver exposes a character device carrying one MCTP message
//! per read/write, each prefixed with the packed routing record and the
//! peer EID. Message assembly happens in the driver, below this interface.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use smol::Async;

use mctp_ctrl::prv::PciePktPrv;
use mctp_ctrl::{Eid, Error, Result};

use super::PcieDriver;

// Vendor driver ioctls
const MCTP_PCIE_REGISTER_DEFAULT_HANDLER: libc::c_ulong = 0x4d01;
const MCTP_PCIE_GET_BDF: libc::c_ulong = 0x4d02;
const MCTP_PCIE_GET_MEDIUM_ID: libc::c_ulong = 0x4d03;

/// PCIe VDM driver over the vendor character device.
pub struct KernelPcie {
    dev: Async<File>,
}

impl KernelPcie {
    /// Opens the vendor MCTP device, typically `/dev/mctp-pcie`.
    pub fn new(path: &Path) -> Result<Self> {
        let dev = File::options()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| {
                error!("Error opening {}: {e}", path.display());
                Error::Io(e)
            })?;
        Ok(Self { dev: Async::new(dev).map_err(Error::Io)? })
    }
}

impl PcieDriver for KernelPcie {
    fn init(&self) -> Result<()> {
        // The channel is live once the device node opens.
        Ok(())
    }

    fn register_as_default(&self) -> Result<()> {
        let rc = unsafe {
            libc::ioctl(
                self.dev.as_raw_fd(),
                MCTP_PCIE_REGISTER_DEFAULT_HANDLER,
                0,
            )
        };
        if rc < 0 {
            Err(Error::Io(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    fn send(&self, dest: Eid, msg: &[u8], prv: PciePktPrv) -> Result<()> {
        let mut frame = Vec::with_capacity(PciePktPrv::LEN + 1 + msg.len());
        frame.extend_from_slice(&prv.encode());
        frame.push(dest.0);
        frame.extend_from_slice(msg);

        let rc = unsafe {
            libc::write(
                self.dev.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
            )
        };
        if rc < 0 {
            Err(Error::Io(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    async fn recv(&self) -> Result<(Eid, Vec<u8>, PciePktPrv)> {
        loop {
            let mut buf = [0u8; 4096];
            let n = self
                .dev
                .read_with(|file| {
                    let rc = unsafe {
                        libc::read(
                            file.as_raw_fd(),
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    };
                    if rc < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(rc as usize)
                    }
                })
                .await
                .map_err(Error::Io)?;

            let frame = &buf[..n];
            if frame.len() < PciePktPrv::LEN + 1 {
                trace!("Runt PCIe frame, {} bytes", frame.len());
                continue;
            }
            let Ok(prv) = PciePktPrv::decode(&frame[..PciePktPrv::LEN]) else {
                trace!("Bad routing record");
                continue;
            };
            let src = Eid(frame[PciePktPrv::LEN]);
            let msg = frame[PciePktPrv::LEN + 1..].to_vec();
            return Ok((src, msg, prv));
        }
    }

    fn bdf(&self) -> Option<u16> {
        let mut bdf: u16 = 0;
        let rc = unsafe {
            libc::ioctl(self.dev.as_raw_fd(), MCTP_PCIE_GET_BDF, &mut bdf)
        };
        (rc >= 0).then_some(bdf)
    }

    fn medium_id(&self) -> u8 {
        let mut id: u8 = 0;
        let rc = unsafe {
            libc::ioctl(self.dev.as_raw_fd(), MCTP_PCIE_GET_MEDIUM_ID, &mut id)
        };
        if rc < 0 {
            0
        } else {
            id
        }
    }
}
