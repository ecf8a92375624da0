// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Minimal async inotify wrapper for the `/dev` hot-plug watch.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::Path;

use smol::Async;

use mctp_ctrl::{Error, Result};

const WATCH_MASK: u32 =
    (libc::IN_CREATE | libc::IN_MOVED_TO | libc::IN_DELETE) as u32;

const EVENT_HEADER_LEN: usize = std::mem::size_of::<libc::inotify_event>();

/// An inotify watch on a single directory.
pub struct Inotify {
    file: Async<File>,
}

impl Inotify {
    /// Watches `dir` for create/move-in/delete events.
    pub fn new(dir: &Path) -> Result<Self> {
        let fd = unsafe {
            libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC)
        };
        if fd < 0 {
            error!("inotify_init failed");
            return Err(io::Error::last_os_error().into());
        }
        // File takes ownership of the fd from here on
        let file = unsafe { File::from_raw_fd(fd) };

        let mut dir_bytes = dir.to_string_lossy().into_owned().into_bytes();
        dir_bytes.push(0);
        let watch = unsafe {
            libc::inotify_add_watch(
                file.as_raw_fd(),
                dir_bytes.as_ptr() as *const libc::c_char,
                WATCH_MASK,
            )
        };
        if watch < 0 {
            error!("inotify_add_watch failed");
            return Err(io::Error::last_os_error().into());
        }

        Ok(Self { file: Async::new(file).map_err(Error::Io)? })
    }

    /// Awaits the next batch of events, returning the names that matched
    /// the watch mask.
    pub async fn read_events(&self) -> Result<Vec<String>> {
        let mut buf = [0u8; 4096];
        let n = self
            .file
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

        Ok(parse_events(&buf[..n]))
    }
}

/// Walks a buffer of `inotify_event` records, extracting matching names.
fn parse_events(mut buf: &[u8]) -> Vec<String> {
    let mut names = Vec::new();

    while buf.len() >= EVENT_HEADER_LEN {
        // Fields we need sit at fixed offsets: mask at 4, len at 12.
        let mask = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
        let name_len =
            u32::from_ne_bytes(buf[12..16].try_into().unwrap()) as usize;

        let Some(name) = buf.get(EVENT_HEADER_LEN..EVENT_HEADER_LEN + name_len)
        else {
            debug!("Truncated inotify event");
            break;
        };

        if mask & WATCH_MASK != 0 {
            let name: Vec<u8> =
                name.iter().copied().take_while(|b| *b != 0).collect();
            if let Ok(name) = String::from_utf8(name) {
                names.push(name);
            }
        }

        buf = &buf[EVENT_HEADER_LEN + name_len..];
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(mask: u32, name: &str) -> Vec<u8> {
        let mut padded = name.as_bytes().to_vec();
        padded.push(0);
        while padded.len() % 16 != 0 {
            padded.push(0);
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&1i32.to_ne_bytes()); // wd
        buf.extend_from_slice(&mask.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // cookie
        buf.extend_from_slice(&(padded.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&padded);
        buf
    }

    #[test]
    fn parses_batched_events() {
        let mut buf = event(libc::IN_CREATE as u32, "i2c-5");
        buf.extend(event(libc::IN_ATTRIB as u32, "i2c-6"));
        buf.extend(event(libc::IN_DELETE as u32, "watchdog0"));

        let names = parse_events(&buf);
        assert_eq!(names, vec!["i2c-5".to_string(), "watchdog0".to_string()]);
    }

    #[test]
    fn truncated_buffer() {
        let buf = event(libc::IN_CREATE as u32, "i2c-5");
        assert!(parse_events(&buf[..EVENT_HEADER_LEN + 2]).is_empty());
        assert!(parse_events(&buf[..4]).is_empty());
    }
}
