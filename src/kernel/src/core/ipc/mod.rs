//! Mailbox IPC.
//!
//! Bounded mailboxes buffer messages in slots drawn from one pool shared
//! across all mailboxes; a zero-capacity mailbox is a pure rendezvous where
//! senders and receivers pair up directly. Senders blocked for capacity and
//! receivers blocked for a message wait in per-mailbox FIFO queues and are
//! resumed through the ordinary scheduling primitives, so every wakeup is
//! re-checked: it may mean delivery, a zap, a release, or nothing at all.

use heapless::{Deque, Vec as HVec};
use log::{debug, trace};

use crate::abi::constants::{
    MAX_MBOX, MAX_MESSAGE, MAX_PROC, MAX_SLOTS, RECV_BLOCKED, SEND_BLOCKED,
};
use crate::error::IpcError;
use crate::kernel::{Kernel, KernelState};
use crate::process::{deque_remove, Pid, ProcStatus};

pub type MboxId = u32;

/// One pooled message buffer.
struct MailSlot {
    mbox: MboxId,
    data: HVec<u8, MAX_MESSAGE>,
}

struct Mailbox {
    id: MboxId,
    capacity: usize,
    slot_size: usize,
    /// Occupied pool slots, oldest first.
    slots: Deque<usize, MAX_SLOTS>,
    /// Senders blocked waiting for capacity, oldest first.
    senders: Deque<Pid, MAX_PROC>,
    /// Receivers blocked waiting for a message, oldest first.
    receivers: Deque<Pid, MAX_PROC>,
}

/// In-flight I/O of a blocked sender or receiver.
///
/// A suspended caller's buffer cannot be handed around while it sleeps, so
/// the payload (or the eventual delivery) is parked here, keyed by pid.
enum IoRecord {
    Sender {
        msg: HVec<u8, MAX_MESSAGE>,
        consumed: bool,
    },
    Receiver {
        max_len: usize,
        /// `Ok` carries the delivered bytes; `Err` the size of a message
        /// that did not fit in `max_len`.
        delivered: Option<Result<HVec<u8, MAX_MESSAGE>, usize>>,
    },
}

pub(crate) struct MboxState {
    boxes: [Option<Mailbox>; MAX_MBOX],
    pool: [Option<MailSlot>; MAX_SLOTS],
    records: [Option<IoRecord>; MAX_PROC],
    num_boxes: usize,
    num_slots: usize,
    next_mbox_id: MboxId,
}

impl MboxState {
    pub(crate) fn new() -> MboxState {
        MboxState {
            boxes: [const { None }; MAX_MBOX],
            pool: [const { None }; MAX_SLOTS],
            records: [const { None }; MAX_PROC],
            num_boxes: 0,
            num_slots: 0,
            next_mbox_id: 0,
        }
    }

    fn lookup(&self, id: MboxId) -> Option<&Mailbox> {
        self.boxes[id as usize % MAX_MBOX]
            .as_ref()
            .filter(|b| b.id == id)
    }

    fn lookup_mut(&mut self, id: MboxId) -> Option<&mut Mailbox> {
        self.boxes[id as usize % MAX_MBOX]
            .as_mut()
            .filter(|b| b.id == id)
    }

    /// Take a slot from the shared pool for a copy of `msg`.
    fn alloc_slot(&mut self, mbox: MboxId, msg: &[u8]) -> Option<usize> {
        if self.num_slots >= MAX_SLOTS {
            return None;
        }
        let idx = self
            .pool
            .iter()
            .position(|s| s.is_none())
            .expect("pool count out of sync");
        let data = HVec::from_slice(msg).expect("message within slot bounds");
        self.pool[idx] = Some(MailSlot { mbox, data });
        self.num_slots += 1;
        Some(idx)
    }

    fn free_slot(&mut self, idx: usize) -> HVec<u8, MAX_MESSAGE> {
        let slot = self.pool[idx].take().expect("freeing an empty mail slot");
        self.num_slots -= 1;
        trace!("mbox: slot {} of mailbox {} freed", idx, slot.mbox);
        slot.data
    }

    fn record_mut(&mut self, pid: Pid) -> &mut Option<IoRecord> {
        &mut self.records[pid as usize % MAX_PROC]
    }
}

impl KernelState {
    /// Wake every process parked on the given queues of a dying mailbox.
    fn wake_waiters(&mut self, senders: Deque<Pid, MAX_PROC>, receivers: Deque<Pid, MAX_PROC>) {
        for pid in senders.iter().chain(receivers.iter()) {
            if matches!(self.procs.pcb(*pid).status, ProcStatus::Blocked(_)) {
                self.make_ready(*pid);
            }
        }
    }
}

impl Kernel {
    /// Create a mailbox with `capacity` buffered slots of at most
    /// `slot_size` bytes each. Zero capacity makes a rendezvous mailbox.
    pub fn mbox_create(&self, capacity: usize, slot_size: usize) -> Result<MboxId, IpcError> {
        let mut st = self.enter("mbox_create");
        if slot_size > MAX_MESSAGE || st.mbox.num_boxes >= MAX_MBOX {
            self.leave(st);
            return Err(IpcError::Invalid);
        }
        let mbox = &mut st.mbox;
        while mbox.boxes[mbox.next_mbox_id as usize % MAX_MBOX].is_some() {
            mbox.next_mbox_id += 1;
        }
        let id = mbox.next_mbox_id;
        mbox.next_mbox_id += 1;
        mbox.boxes[id as usize % MAX_MBOX] = Some(Mailbox {
            id,
            capacity,
            slot_size,
            slots: Deque::new(),
            senders: Deque::new(),
            receivers: Deque::new(),
        });
        mbox.num_boxes += 1;
        debug!("mbox_create: id {} capacity {} slot_size {}", id, capacity, slot_size);
        self.leave(st);
        Ok(id)
    }

    /// Destroy a mailbox. Queued messages are dropped and every blocked
    /// sender and receiver is woken; each of their calls reports
    /// `Interrupted`. The table slot is reusable by a later create.
    pub fn mbox_release(&self, id: MboxId) -> Result<(), IpcError> {
        let mut st = self.enter("mbox_release");
        if st.mbox.lookup(id).is_none() {
            self.leave(st);
            return Err(IpcError::Invalid);
        }
        let mailbox = st.mbox.boxes[id as usize % MAX_MBOX]
            .take()
            .expect("checked above");
        st.mbox.num_boxes -= 1;
        for idx in mailbox.slots.iter() {
            st.mbox.free_slot(*idx);
        }
        debug!(
            "mbox_release: id {} ({} senders, {} receivers waiting)",
            id,
            mailbox.senders.len(),
            mailbox.receivers.len()
        );
        // The mailbox is gone before anyone wakes: waiters observe the
        // released state when they re-check.
        st.wake_waiters(mailbox.senders, mailbox.receivers);
        self.dispatch(st);
        Ok(())
    }

    pub fn mbox_send(&self, id: MboxId, msg: &[u8]) -> Result<(), IpcError> {
        self.send_inner(id, msg, false)
    }

    /// Non-blocking send: reports `WouldBlock` instead of suspending.
    pub fn mbox_cond_send(&self, id: MboxId, msg: &[u8]) -> Result<(), IpcError> {
        self.send_inner(id, msg, true)
    }

    pub fn mbox_receive(&self, id: MboxId, buf: &mut [u8]) -> Result<usize, IpcError> {
        self.receive_inner(id, buf, false)
    }

    /// Non-blocking receive: reports `WouldBlock` instead of suspending.
    pub fn mbox_cond_receive(&self, id: MboxId, buf: &mut [u8]) -> Result<usize, IpcError> {
        self.receive_inner(id, buf, true)
    }

    fn send_inner(&self, id: MboxId, msg: &[u8], conditional: bool) -> Result<(), IpcError> {
        let mut st = self.enter("mbox_send");
        let cur = st.current.expect("send outside process context");

        let state_of = st.mbox.lookup(id).map(|b| {
            (
                b.slot_size,
                b.slots.len() >= b.capacity,
                b.receivers.front().copied(),
            )
        });
        let (slot_size, at_capacity, waiting_receiver) = match state_of {
            Some(found) => found,
            None => {
                self.leave(st);
                return Err(IpcError::Invalid);
            }
        };
        if msg.len() > slot_size {
            self.leave(st);
            return Err(IpcError::Invalid);
        }

        // A blocked receiver takes the message directly; no slot is spent.
        if let Some(rpid) = waiting_receiver {
            let mailbox = st.mbox.lookup_mut(id).expect("validated above");
            mailbox.receivers.pop_front();
            match st.mbox.record_mut(rpid) {
                Some(IoRecord::Receiver { max_len, delivered }) => {
                    *delivered = Some(if msg.len() <= *max_len {
                        Ok(HVec::from_slice(msg).expect("bounded by slot size"))
                    } else {
                        // The receiver's buffer is too small; it reports
                        // the error, the send itself has completed.
                        Err(msg.len())
                    });
                }
                _ => unreachable!("queued receiver without a record"),
            }
            trace!("mbox_send: id {} handed {} bytes to pid {}", id, msg.len(), rpid);
            if matches!(st.procs.pcb(rpid).status, ProcStatus::Blocked(_)) {
                st.make_ready(rpid);
            }
            self.dispatch(st);
            return Ok(());
        }

        if at_capacity {
            if conditional {
                self.leave(st);
                return Err(IpcError::WouldBlock);
            }
            // Park the payload and wait for capacity.
            *st.mbox.record_mut(cur) = Some(IoRecord::Sender {
                msg: HVec::from_slice(msg).expect("bounded by slot size"),
                consumed: false,
            });
            let mailbox = st.mbox.lookup_mut(id).expect("validated above");
            let _ = mailbox.senders.push_back(cur);
            trace!("mbox_send: id {} full, pid {} waiting", id, cur);
            loop {
                self.block_current(st, ProcStatus::Blocked(SEND_BLOCKED));
                st = self.reenter();
                let zapped = !st.procs.pcb(cur).zappers.is_empty();
                let alive = st.mbox.lookup(id).is_some();
                if zapped || !alive {
                    if let Some(mailbox) = st.mbox.lookup_mut(id) {
                        deque_remove(&mut mailbox.senders, cur);
                    }
                    *st.mbox.record_mut(cur) = None;
                    self.leave(st);
                    return Err(IpcError::Interrupted);
                }
                let consumed = matches!(
                    st.mbox.record_mut(cur),
                    Some(IoRecord::Sender { consumed: true, .. })
                );
                if consumed {
                    *st.mbox.record_mut(cur) = None;
                    self.leave(st);
                    return Ok(());
                }
                // Spurious wakeup: still queued, wait again.
            }
        }

        // Capacity remains: buffer the message in a pooled slot.
        match st.mbox.alloc_slot(id, msg) {
            Some(idx) => {
                let mailbox = st.mbox.lookup_mut(id).expect("validated above");
                let _ = mailbox.slots.push_back(idx);
                trace!("mbox_send: id {} buffered {} bytes", id, msg.len());
                self.leave(st);
                Ok(())
            }
            None if conditional => {
                self.leave(st);
                Err(IpcError::WouldBlock)
            }
            None => self.fatal(st, format_args!("mbox_send: mail slot pool exhausted")),
        }
    }

    fn receive_inner(&self, id: MboxId, buf: &mut [u8], conditional: bool) -> Result<usize, IpcError> {
        let mut st = self.enter("mbox_receive");
        let cur = st.current.expect("receive outside process context");

        let state_of = st
            .mbox
            .lookup(id)
            .map(|b| (b.slots.front().copied(), b.senders.front().copied()));
        let (queued_slot, waiting_sender) = match state_of {
            Some(found) => found,
            None => {
                self.leave(st);
                return Err(IpcError::Invalid);
            }
        };

        // Oldest buffered message first.
        if let Some(idx) = queued_slot {
            let len = st.mbox.pool[idx]
                .as_ref()
                .map(|s| s.data.len())
                .expect("queued slot is occupied");
            if len > buf.len() {
                // Caller bug: undersized buffer. The message stays queued.
                self.leave(st);
                return Err(IpcError::Invalid);
            }
            let mailbox = st.mbox.lookup_mut(id).expect("validated above");
            mailbox.slots.pop_front();
            let data = st.mbox.free_slot(idx);
            buf[..len].copy_from_slice(&data);
            trace!("mbox_receive: id {} took {} bytes from slot", id, len);

            // A freed slot admits the oldest blocked sender, if any.
            let woke = self.admit_blocked_sender(&mut st, id);
            if woke {
                self.dispatch(st);
            } else {
                self.leave(st);
            }
            return Ok(len);
        }

        // No buffered message. A waiting sender here means a rendezvous
        // mailbox: take its payload directly.
        if let Some(spid) = waiting_sender {
            let len = match st.mbox.record_mut(spid) {
                Some(IoRecord::Sender { msg, .. }) => msg.len(),
                _ => unreachable!("queued sender without a record"),
            };
            if len > buf.len() {
                // The sender stays queued; this receive simply fails.
                self.leave(st);
                return Err(IpcError::Invalid);
            }
            let mailbox = st.mbox.lookup_mut(id).expect("validated above");
            mailbox.senders.pop_front();
            match st.mbox.record_mut(spid) {
                Some(IoRecord::Sender { msg, consumed }) => {
                    buf[..len].copy_from_slice(msg);
                    *consumed = true;
                }
                _ => unreachable!(),
            }
            trace!("mbox_receive: id {} rendezvous {} bytes from pid {}", id, len, spid);
            if matches!(st.procs.pcb(spid).status, ProcStatus::Blocked(_)) {
                st.make_ready(spid);
                self.dispatch(st);
            } else {
                self.leave(st);
            }
            return Ok(len);
        }

        if conditional {
            self.leave(st);
            return Err(IpcError::WouldBlock);
        }

        // Wait for a sender to deliver.
        *st.mbox.record_mut(cur) = Some(IoRecord::Receiver {
            max_len: buf.len(),
            delivered: None,
        });
        let mailbox = st.mbox.lookup_mut(id).expect("validated above");
        let _ = mailbox.receivers.push_back(cur);
        trace!("mbox_receive: id {} empty, pid {} waiting", id, cur);
        loop {
            self.block_current(st, ProcStatus::Blocked(RECV_BLOCKED));
            st = self.reenter();
            let zapped = !st.procs.pcb(cur).zappers.is_empty();
            let alive = st.mbox.lookup(id).is_some();
            if zapped || !alive {
                if let Some(mailbox) = st.mbox.lookup_mut(id) {
                    deque_remove(&mut mailbox.receivers, cur);
                }
                *st.mbox.record_mut(cur) = None;
                self.leave(st);
                return Err(IpcError::Interrupted);
            }
            let outcome = match st.mbox.record_mut(cur) {
                Some(IoRecord::Receiver { delivered, .. }) => delivered.take(),
                _ => unreachable!("blocked receiver without a record"),
            };
            match outcome {
                Some(Ok(data)) => {
                    *st.mbox.record_mut(cur) = None;
                    buf[..data.len()].copy_from_slice(&data);
                    self.leave(st);
                    return Ok(data.len());
                }
                Some(Err(_oversize)) => {
                    *st.mbox.record_mut(cur) = None;
                    self.leave(st);
                    return Err(IpcError::Invalid);
                }
                // Spurious wakeup: still queued, wait again.
                None => {}
            }
        }
    }

    /// Move the oldest blocked sender's payload into a fresh slot and wake
    /// it. Returns whether a sender was admitted.
    fn admit_blocked_sender(
        &self,
        st: &mut spin::MutexGuard<'_, KernelState>,
        id: MboxId,
    ) -> bool {
        let spid = match st.mbox.lookup_mut(id).and_then(|b| b.senders.pop_front()) {
            Some(pid) => pid,
            None => return false,
        };
        let msg = match st.mbox.record_mut(spid) {
            Some(IoRecord::Sender { msg, consumed }) => {
                *consumed = true;
                core::mem::take(msg)
            }
            _ => unreachable!("queued sender without a record"),
        };
        let idx = st
            .mbox
            .alloc_slot(id, &msg)
            .expect("a slot was just freed");
        if let Some(mailbox) = st.mbox.lookup_mut(id) {
            let _ = mailbox.slots.push_back(idx);
        }
        trace!("mbox: admitted blocked sender {} on id {}", spid, id);
        if matches!(st.procs.pcb(spid).status, ProcStatus::Blocked(_)) {
            st.make_ready(spid);
        }
        true
    }
}
