use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chdr_packet::{CtrlOpCode, CtrlPayload, CtrlStatus};
use tracing::{debug, error, warn};

use crate::error::{CtrlError, Result};
use crate::regs::RegisterIface;

/// Command-buffer words kept free for each outstanding async message.
pub const ASYNC_MESSAGE_SIZE: usize = 6;

/// Default wait for buffer space or an acknowledgment.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Wait used while a timed command is queued on the device.
pub const MASSIVE_TIMEOUT: Duration = Duration::from_secs(10);

const SEQ_NUM_MODULUS: u8 = 64;

/// Sends one control payload towards the device.
pub type SendFn = Box<dyn Fn(&CtrlPayload, Duration) -> Result<()> + Send + Sync>;

/// Decides whether an async message (address, data) is accepted.
pub type AsyncMsgValidator = Arc<dyn Fn(u32, &[u32]) -> bool + Send + Sync>;

/// Consumes an accepted async message (address, data, timestamp).
pub type AsyncMsgHandler = Arc<dyn Fn(u32, &[u32], Option<u64>) + Send + Sync>;

/// Timing behavior of a ctrlport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlportPolicy {
    /// Wait for buffer space or an acknowledgment.
    pub timeout: Duration,
    /// Wait for an acknowledgment on every write.
    pub force_acks: bool,
}

impl Default for CtrlportPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            force_acks: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RespStatus {
    Valid,
    Dropped,
    SizeErr,
}

struct PortState {
    policy: CtrlportPolicy,
    tx_seq_num: u8,
    buff_occupied: usize,
    req_queue: VecDeque<CtrlPayload>,
    resp_queue: VecDeque<(CtrlPayload, RespStatus)>,
    validator: Option<AsyncMsgValidator>,
    handler: Option<AsyncMsgHandler>,
}

impl PortState {
    fn wait_timeout(&self) -> Duration {
        if self.req_queue.iter().any(|req| req.timestamp.is_some()) {
            MASSIVE_TIMEOUT
        } else {
            self.policy.timeout
        }
    }
}

/// Register access to the block behind one control port.
///
/// Requests are flow-controlled against the device's command buffer
/// (`buff_capacity` 32-bit words, minus room reserved for async messages)
/// and carry a 6-bit sequence number that acknowledgments are matched
/// against.
pub struct CtrlportEndpoint {
    send_fn: SendFn,
    my_epid: u16,
    local_port: u16,
    buff_capacity: usize,
    max_outstanding_async_msgs: usize,
    state: Mutex<PortState>,
    buff_free: Condvar,
    resp_ready: Condvar,
}

impl CtrlportEndpoint {
    /// Create an endpoint that sends through `send_fn`.
    pub fn new(
        send_fn: SendFn,
        my_epid: u16,
        local_port: u16,
        buff_capacity: usize,
        max_outstanding_async_msgs: usize,
        policy: CtrlportPolicy,
    ) -> Self {
        Self {
            send_fn,
            my_epid,
            local_port,
            buff_capacity,
            max_outstanding_async_msgs,
            state: Mutex::new(PortState {
                policy,
                tx_seq_num: 0,
                buff_occupied: 0,
                req_queue: VecDeque::new(),
                resp_queue: VecDeque::new(),
                validator: None,
                handler: None,
            }),
            buff_free: Condvar::new(),
            resp_ready: Condvar::new(),
        }
    }

    /// Endpoint ID requests are sent from.
    pub fn src_epid(&self) -> u16 {
        self.my_epid
    }

    /// Control port this endpoint serves.
    pub fn port_num(&self) -> u16 {
        self.local_port
    }

    /// Replace the timing policy.
    pub fn set_policy(&self, policy: CtrlportPolicy) {
        self.lock().policy = policy;
    }

    /// Current timing policy.
    pub fn policy(&self) -> CtrlportPolicy {
        self.lock().policy
    }

    /// Install the async message validator. Without one every message is
    /// accepted.
    pub fn register_async_msg_validator(&self, validator: AsyncMsgValidator) {
        self.lock().validator = Some(validator);
    }

    /// Install the async message handler.
    pub fn register_async_msg_handler(&self, handler: AsyncMsgHandler) {
        self.lock().handler = Some(handler);
    }

    /// Requests sent but not yet acknowledged.
    pub fn num_outstanding(&self) -> usize {
        self.lock().req_queue.len()
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Command buffer words used by a payload.
    fn payload_size(payload: &CtrlPayload) -> usize {
        2 + if payload.timestamp.is_some() { 2 } else { 0 } + payload.data.len()
    }

    fn usable_capacity(&self) -> usize {
        self.buff_capacity
            .saturating_sub(ASYNC_MESSAGE_SIZE * self.max_outstanding_async_msgs)
    }

    fn send_request(
        &self,
        op_code: CtrlOpCode,
        address: u32,
        data: Vec<u32>,
        timestamp: Option<u64>,
    ) -> Result<CtrlPayload> {
        let mut state = self.lock();
        let request = CtrlPayload {
            dst_port: self.local_port,
            src_port: self.local_port,
            seq_num: state.tx_seq_num,
            timestamp,
            is_ack: false,
            src_epid: self.my_epid,
            address,
            data,
            byte_enable: 0xF,
            op_code,
            status: CtrlStatus::Okay,
        };

        let size = Self::payload_size(&request);
        let capacity = self.usable_capacity();
        if state.buff_occupied + size > capacity {
            let timeout = state.wait_timeout();
            let (guard, result) = self
                .buff_free
                .wait_timeout_while(state, timeout, |s| s.buff_occupied + size > capacity)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if result.timed_out() {
                return Err(CtrlError::Timeout(timeout, "waiting for command buffer space"));
            }
        }

        state.buff_occupied += size;
        state.req_queue.push_back(request.clone());
        if let Err(err) = (self.send_fn)(&request, state.policy.timeout) {
            state.buff_occupied -= size;
            state.req_queue.pop_back();
            return Err(err);
        }
        state.tx_seq_num = (state.tx_seq_num + 1) % SEQ_NUM_MODULUS;
        Ok(request)
    }

    fn wait_for_ack(&self, request: &CtrlPayload) -> Result<CtrlPayload> {
        let mut state = self.lock();
        loop {
            if state.resp_queue.is_empty() {
                let timeout = state.wait_timeout();
                let (guard, result) = self
                    .resp_ready
                    .wait_timeout_while(state, timeout, |s| s.resp_queue.is_empty())
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
                if result.timed_out() {
                    return Err(CtrlError::Timeout(timeout, "waiting for ACK"));
                }
            }

            let Some((response, status)) = state.resp_queue.pop_front() else {
                continue;
            };
            if response.seq_num != request.seq_num
                || response.op_code != request.op_code
                || response.address != request.address
            {
                continue;
            }
            return match (response.status, status) {
                (CtrlStatus::CmdErr, _) => Err(CtrlError::CommandError),
                (CtrlStatus::TsErr, _) => Err(CtrlError::TimestampError),
                _ if response.data.is_empty() => Err(CtrlError::MalformedResponse),
                (_, RespStatus::Dropped) => Err(CtrlError::SequenceError),
                _ => Ok(response),
            };
        }
    }

    fn retire_front(&self, state: &mut PortState) -> Option<CtrlPayload> {
        let request = state.req_queue.pop_front()?;
        state.buff_occupied = state.buff_occupied.saturating_sub(Self::payload_size(&request));
        self.buff_free.notify_one();
        Some(request)
    }

    /// Process a control payload received for this port.
    ///
    /// Acknowledgments complete outstanding requests; requests skipped by
    /// the acknowledgment are completed as dropped. Anything else is an
    /// async message from the block: it is validated, acknowledged with
    /// the outcome, and handed to the handler when accepted.
    pub fn handle_recv(&self, rx: &CtrlPayload) {
        if rx.is_ack {
            self.handle_ack(rx);
        } else {
            self.handle_async_msg(rx);
        }
    }

    fn handle_ack(&self, rx: &CtrlPayload) {
        let mut state = self.lock();
        let Some(front_seq) = state.req_queue.front().map(|req| req.seq_num) else {
            warn!(port = self.local_port, seq = rx.seq_num, "ACK with no outstanding request");
            return;
        };

        let diff = rx.seq_num.wrapping_sub(front_seq) % SEQ_NUM_MODULUS;
        if diff >= SEQ_NUM_MODULUS / 2 {
            debug!(port = self.local_port, seq = rx.seq_num, "ignoring reordered ACK");
            return;
        }

        for _ in 0..diff {
            let Some(lost) = self.retire_front(&mut state) else {
                return;
            };
            warn!(port = self.local_port, seq = lost.seq_num, "control response dropped");
            let response = CtrlPayload {
                is_ack: true,
                ..lost
            };
            state.resp_queue.push_back((response, RespStatus::Dropped));
        }

        let Some(request) = self.retire_front(&mut state) else {
            return;
        };
        let status = if Self::payload_size(&request) == Self::payload_size(rx) {
            RespStatus::Valid
        } else {
            RespStatus::SizeErr
        };
        state.resp_queue.push_back((rx.clone(), status));
        self.resp_ready.notify_all();
    }

    fn handle_async_msg(&self, rx: &CtrlPayload) {
        let (validator, handler, timeout) = {
            let state = self.lock();
            (state.validator.clone(), state.handler.clone(), state.policy.timeout)
        };

        let status = if !matches!(rx.op_code, CtrlOpCode::Write | CtrlOpCode::BlockWrite) {
            error!(port = self.local_port, op = ?rx.op_code, "malformed async message: invalid opcode");
            CtrlStatus::CmdErr
        } else if rx.dst_port != self.local_port {
            error!(port = self.local_port, dst_port = rx.dst_port, "malformed async message: invalid port");
            CtrlStatus::CmdErr
        } else if rx.data.is_empty() {
            error!(port = self.local_port, "malformed async message: no data");
            CtrlStatus::CmdErr
        } else if validator.is_some_and(|validate| !validate(rx.address, &rx.data)) {
            error!(port = self.local_port, addr = rx.address, "async message rejected by validator");
            CtrlStatus::CmdErr
        } else {
            CtrlStatus::Okay
        };

        let ack = CtrlPayload {
            is_ack: true,
            src_epid: self.my_epid,
            status,
            ..rx.clone()
        };
        if let Err(err) = (self.send_fn)(&ack, timeout) {
            error!(port = self.local_port, error = %err, "failed to acknowledge async message");
            return;
        }

        if status == CtrlStatus::Okay {
            if let Some(handle) = handler {
                let outcome = catch_unwind(AssertUnwindSafe(|| handle(rx.address, &rx.data, rx.timestamp)));
                if outcome.is_err() {
                    error!(port = self.local_port, "async message handler panicked");
                }
            }
        }
    }
}

impl RegisterIface for CtrlportEndpoint {
    fn poke32(&self, addr: u32, data: u32, timestamp: Option<u64>, ack: bool) -> Result<()> {
        let request = self.send_request(CtrlOpCode::Write, addr, vec![data], timestamp)?;
        if ack || self.policy().force_acks {
            self.wait_for_ack(&request)?;
        }
        Ok(())
    }

    fn peek32(&self, addr: u32, timestamp: Option<u64>) -> Result<u32> {
        let request = self.send_request(CtrlOpCode::Read, addr, vec![0], timestamp)?;
        let response = self.wait_for_ack(&request)?;
        response.data.first().copied().ok_or(CtrlError::MalformedResponse)
    }

    fn sleep(&self, ticks: u32, ack: bool) -> Result<()> {
        let request = self.send_request(CtrlOpCode::Sleep, 0, vec![ticks], None)?;
        if ack || self.policy().force_acks {
            self.wait_for_ack(&request)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CtrlportEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrlportEndpoint")
            .field("my_epid", &self.my_epid)
            .field("local_port", &self.local_port)
            .field("buff_capacity", &self.buff_capacity)
            .field("max_outstanding_async_msgs", &self.max_outstanding_async_msgs)
            .finish_non_exhaustive()
    }
}
