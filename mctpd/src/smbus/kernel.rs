// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Kernel-backed SMBus driver.
//!
//! Outgoing frames go through plain i2c-dev writes on the root bus or a
//! mux leaf; incoming traffic arrives on the `slave-mqueue` sysfs device
//! of the BMC's own slave address. This sits at the daemon's assembler
//! boundary: control messages fit one SMBus frame, so reassembly below
//! this interface is the identity.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use smol::Async;

use mctp_ctrl::prv::SmbusPktPrv;
use mctp_ctrl::{Eid, Error, Result};

use super::{bus_num_from_path, SmbusDriver};

// i2c-dev ioctls
const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_SMBUS: libc::c_ulong = 0x0720;

// i2c_smbus_ioctl_data parameters
const I2C_SMBUS_READ: u8 = 1;
const I2C_SMBUS_WRITE: u8 = 0;
const I2C_SMBUS_QUICK: u32 = 0;
const I2C_SMBUS_BYTE: u32 = 1;

// slave-mqueue pull-model controls, vendor extension of i2c-dev
const I2C_PULL_MODEL_HOLD: libc::c_ulong = 0x0740;
const I2C_PULL_MODEL_FREE: libc::c_ulong = 0x0741;

/// MCTP-over-SMBus command code, first byte of every frame.
const MCTP_I2C_COMMAND_CODE: u8 = 0x0f;

/// SMBus frame header: destination, command, byte count, source.
const MCTP_I2C_HEADER: usize = 4;

/// MCTP transport header inside the frame.
const MCTP_HEADER: usize = 4;

const MCTP_HEADER_VERSION_1: u8 = 0x01;
const MCTP_TO_BIT: u8 = 0x08;
const MCTP_SOM_EOM: u8 = 0xc0;

#[repr(C)]
struct I2cSmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut u8,
}

fn smbus_xfer(fd: RawFd, read_write: u8, command: u8, size: u32) -> bool {
    let mut data = [0u8; 34];
    let mut args = I2cSmbusIoctlData {
        read_write,
        command,
        size,
        data: data.as_mut_ptr(),
    };
    let rc = unsafe { libc::ioctl(fd, I2C_SMBUS, &mut args) };
    rc >= 0
}

fn set_slave(fd: RawFd, addr7: u8) -> bool {
    let rc = unsafe { libc::ioctl(fd, I2C_SLAVE, addr7 as libc::c_ulong) };
    rc >= 0
}

/// SMBus driver over the kernel i2c-dev and slave-mqueue interfaces.
pub struct KernelSmbus {
    out: File,
    mqueue: Async<File>,
    own_addr: u8,
    own_eid: std::cell::Cell<u8>,
}

impl KernelSmbus {
    /// Opens the root bus and the BMC slave-mqueue, creating the mqueue
    /// device if it does not exist yet.
    pub fn new(
        bus: &Path,
        sysfs_i2c: &Path,
        bmc_slave_addr: u8,
    ) -> Result<Self> {
        let Some(root) = bus_num_from_path(bus) else {
            error!("Error in opening smbus rootport");
            return Err(Error::BadArgument);
        };

        let out = File::options()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(bus)
            .map_err(|e| {
                error!("Error in opening smbus binding out bus: {e}");
                Error::Io(e)
            })?;

        let addr7 = bmc_slave_addr >> 1;
        debug!("Slave Address {addr7:02x}");

        // MSB fixed to 10, LSB the 7-bit BMC address
        let mqueue_path = sysfs_i2c
            .join(format!("{root}-10{addr7:02x}"))
            .join("slave-mqueue");
        let mqueue = match Self::open_mqueue(&mqueue_path) {
            Ok(f) => f,
            Err(_) => {
                // Doesn't exist, try to create one
                let new_device =
                    sysfs_i2c.join(format!("i2c-{root}")).join("new_device");
                std::fs::write(
                    &new_device,
                    format!("slave-mqueue 0x10{addr7:02x}"),
                )
                .map_err(Error::Io)?;
                Self::open_mqueue(&mqueue_path).map_err(|e| {
                    error!("Error in opening smbus binding in_bus: {e}");
                    Error::Io(e)
                })?
            }
        };

        Ok(Self {
            out,
            mqueue: Async::new(mqueue).map_err(Error::Io)?,
            own_addr: bmc_slave_addr | 0x01,
            own_eid: std::cell::Cell::new(0),
        })
    }

    fn open_mqueue(path: &PathBuf) -> io::Result<File> {
        File::options()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)
    }

}

impl SmbusDriver for KernelSmbus {
    fn root_fd(&self) -> RawFd {
        self.out.as_raw_fd()
    }

    fn set_own_eid(&self, eid: Eid) {
        self.own_eid.set(eid.0);
    }

    fn send(&self, dest: Eid, msg: &[u8], prv: &SmbusPktPrv) -> Result<()> {
        if !set_slave(prv.fd, prv.slave_addr >> 1) {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // Control traffic only; the tag-owner bit follows the Rq bit.
        let rq = msg.get(1).map(|b| b & 0x80 != 0).unwrap_or(false);
        let flags =
            MCTP_SOM_EOM | if rq { MCTP_TO_BIT } else { 0 };

        let mut frame =
            Vec::with_capacity(MCTP_I2C_HEADER - 1 + MCTP_HEADER + msg.len());
        // Destination address is carried by i2c addressing; the frame
        // starts at the command code.
        frame.push(MCTP_I2C_COMMAND_CODE);
        frame.push((1 + MCTP_HEADER + msg.len()) as u8);
        frame.push(self.own_addr);
        frame.extend_from_slice(&[
            MCTP_HEADER_VERSION_1,
            dest.0,
            self.own_eid.get(),
            flags,
        ]);
        frame.extend_from_slice(msg);

        let rc = unsafe {
            libc::write(
                prv.fd,
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

    async fn recv(&self) -> Result<(Eid, Vec<u8>, SmbusPktPrv)> {
        loop {
            let mut buf = [0u8; 256];
            let n = self
                .mqueue
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

            let packet = &buf[..n];
            if packet.len() < MCTP_I2C_HEADER + MCTP_HEADER {
                trace!("Runt SMBus frame, {} bytes", packet.len());
                continue;
            }
            if packet[1] != MCTP_I2C_COMMAND_CODE {
                trace!("Not an MCTP frame");
                continue;
            }
            let src_addr = packet[3];
            let mctp = &packet[MCTP_I2C_HEADER..];
            if mctp[0] & 0x0f != MCTP_HEADER_VERSION_1 {
                trace!("Bad MCTP version");
                continue;
            }
            let src_eid = Eid(mctp[2]);
            let msg = mctp[MCTP_HEADER..].to_vec();

            let prv = SmbusPktPrv {
                fd: self.out.as_raw_fd(),
                mux_hold_timeout: 0,
                mux_flags: 0,
                slave_addr: src_addr,
            };
            return Ok((src_eid, msg, prv));
        }
    }

    fn probe_read_byte(&self, fd: RawFd, addr: u8) -> bool {
        set_slave(fd, addr)
            && smbus_xfer(fd, I2C_SMBUS_READ, 0, I2C_SMBUS_BYTE)
    }

    fn probe_write_quick(&self, fd: RawFd, addr: u8) -> bool {
        set_slave(fd, addr)
            && smbus_xfer(fd, I2C_SMBUS_WRITE, 0, I2C_SMBUS_QUICK)
    }

    fn init_pull_model(&self, prv: &SmbusPktPrv) -> Result<()> {
        let hold = prv.mux_hold_timeout as libc::c_ulong;
        let rc = unsafe { libc::ioctl(prv.fd, I2C_PULL_MODEL_HOLD, hold) };
        if rc < 0 {
            Err(Error::Io(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    fn exit_pull_model(&self, prv: &SmbusPktPrv) -> Result<()> {
        let rc = unsafe { libc::ioctl(prv.fd, I2C_PULL_MODEL_FREE, 0) };
        if rc < 0 {
            Err(Error::Io(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
}
