// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Control-message engine.
//!
//! Outgoing requests are tracked in an explicit table keyed by
//! `(command, instance_id)`; the sender suspends until the table fulfils
//! the entry from an inbound response, or times out. Requests are retried
//! up to the configured count before failing with [`Error::TimedOut`].
//!
//! Inbound requests are dispatched to a per-binding [`RequestHandler`],
//! which may rewrite the frame's binding-private record to select the
//! response routing. A handler returning `None` drops the message.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Duration;

use smol::channel::{bounded, Receiver, Sender};
use smol::future::FutureExt;
use smol::Timer;

use mctp_ctrl::control::{
    encode_message, ControlHeader, INSTANCE_ID_MASK,
};
use mctp_ctrl::{CommandCode, Error, Result};

/// Per-binding handler for inbound control requests.
pub trait RequestHandler {
    /// Binding-private type of the transport.
    type Prv;

    /// Handles a request, returning the response body.
    ///
    /// The handler may rewrite `prv` to select the response routing tag.
    /// `None` rejects the request; no response is emitted.
    fn handle_request(
        &self,
        command: CommandCode,
        body: &[u8],
        prv: &mut Self::Prv,
    ) -> Option<Vec<u8>>;
}

/// What to do with an inbound control message.
#[derive(Debug)]
pub enum Inbound<P> {
    /// A request the handler accepted; send this message back with the
    /// (possibly rewritten) binding-private record.
    Respond(Vec<u8>, P),
    /// Consumed: a matched response, or a dropped message.
    Done,
}

/// Control-message request/response engine for one binding.
pub struct ControlEngine {
    pending: RefCell<HashMap<(u8, u8), Sender<Vec<u8>>>>,
    next_iid: Cell<u8>,
    req_to_resp: Duration,
    retry_count: u8,
}

impl ControlEngine {
    /// Creates an engine with the binding's timeout configuration.
    pub fn new(req_to_resp_time_ms: u64, retry_count: u8) -> Self {
        Self {
            pending: RefCell::new(HashMap::new()),
            next_iid: Cell::new(0),
            req_to_resp: Duration::from_millis(req_to_resp_time_ms),
            retry_count,
        }
    }

    fn alloc_iid(&self) -> u8 {
        let iid = (self.next_iid.get() + 1) & INSTANCE_ID_MASK;
        self.next_iid.set(iid);
        iid
    }

    /// Sends a control request and awaits the matching response body.
    ///
    /// `send` transmits one fully-encoded control message; it is invoked
    /// again for each retry. The returned body starts at the completion
    /// code. Fails with [`Error::TimedOut`] once the retries are exhausted.
    pub async fn request(
        &self,
        command: CommandCode,
        body: &[u8],
        send: impl Fn(&[u8]) -> Result<()>,
    ) -> Result<Vec<u8>> {
        let iid = self.alloc_iid();
        let hdr = ControlHeader::request(command, iid);
        let msg = encode_message(&hdr, body)?;

        let (tx, rx) = bounded(1);
        let key = (command as u8, iid);
        if self.pending.borrow_mut().insert(key, tx).is_some() {
            // A request from 32 instance-ids ago is still pending; it can
            // no longer be matched.
            debug!("Evicted stale pending request {key:?}");
        }

        let result = self.request_attempts(&msg, &rx, &send).await;
        self.pending.borrow_mut().remove(&key);
        result
    }

    async fn request_attempts(
        &self,
        msg: &[u8],
        rx: &Receiver<Vec<u8>>,
        send: &impl Fn(&[u8]) -> Result<()>,
    ) -> Result<Vec<u8>> {
        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                trace!("Control request retry {attempt}");
            }
            send(msg)?;

            let resp = async { rx.recv().await.ok() }
                .or(async {
                    Timer::after(self.req_to_resp).await;
                    None
                })
                .await;

            if let Some(body) = resp {
                return Ok(body);
            }
        }
        Err(Error::TimedOut)
    }

    /// Fulfils a pending request from an inbound response.
    ///
    /// Returns `false` when no request matches `(command, instance_id)`.
    pub fn complete(&self, hdr: &ControlHeader, body: &[u8]) -> bool {
        let key = (hdr.command as u8, hdr.iid);
        let Some(tx) = self.pending.borrow_mut().remove(&key) else {
            debug!("Unmatched control response {key:?}");
            return false;
        };
        tx.try_send(body.to_vec()).is_ok()
    }

    /// Processes one inbound control message.
    ///
    /// Responses fulfil the request table; requests go to `handler`, and an
    /// accepted request produces a response message to transmit.
    pub fn inbound<H: RequestHandler>(
        &self,
        handler: &H,
        msg: &[u8],
        mut prv: H::Prv,
    ) -> Inbound<H::Prv> {
        let Ok(hdr) = ControlHeader::decode(msg) else {
            debug!("Dropping malformed control message");
            return Inbound::Done;
        };
        let body = &msg[ControlHeader::LEN..];

        if !hdr.rq {
            self.complete(&hdr, body);
            return Inbound::Done;
        }
        if hdr.d {
            debug!("Dropping control datagram");
            return Inbound::Done;
        }

        match handler.handle_request(hdr.command, body, &mut prv) {
            Some(resp_body) => {
                // OK unwrap: header fields came from a decoded header
                let resp =
                    encode_message(&hdr.response(), &resp_body).unwrap();
                Inbound::Respond(resp, prv)
            }
            None => {
                info!("Rejected control request {:?}", hdr.command);
                Inbound::Done
            }
        }
    }
}
