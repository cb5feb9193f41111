use std::collections::{BTreeMap, VecDeque};

use bitflags::bitflags;
use splice_utils::{safe_assert, safe_assert_eq, safe_panic};
use tracing::{debug, trace};

use crate::{
    error::IoqError,
    iocom::{IocomFlags, IocomHandle, Shared},
    msg::Msg,
    wire::{self, CmdFlags, ERR_LOSTLINK, HDR_SIZE, Header, LNK_ERROR, hdr_bytes, switch_cmd},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        /// The per-connection root state; never freed.
        const ROOT = 0x0000_0001;
        /// Heap state created for a transaction, as opposed to the root.
        const DYNAMIC = 0x0000_0002;
        /// The peer initiated this transaction.
        const OPPOSITE = 0x0000_0004;
        /// Linked on the parent's subq.
        const SUBINSERTED = 0x0000_0008;
        /// Present in one of the two msgid trees.
        const RBINSERTED = 0x0000_0010;
        /// No new sends or sub-transactions allowed.
        const DYING = 0x0000_0020;
        /// Failure synthesis ran or is in progress.
        const ABORTING = 0x0000_0040;
        /// Allocated but no byte has gone out yet.
        const NEW = 0x0000_0080;
        /// Messages on this state auto-forward to the relay peer.
        const RELAY = 0x0000_0100;
    }
}

/// Handle to a transaction state. Generation-checked so a stale id held
/// across a teardown resolves to nothing instead of a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    pub(crate) idx: u32,
    pub(crate) r#gen: u32,
}

/// The root state of every connection.
pub const ROOT_ID: StateId = StateId { idx: 0, r#gen: 0 };

/// Mirror state on another connection; each side of a relay pair holds one
/// counted reference on the other.
pub(crate) struct RelayPeer {
    pub handle: IocomHandle,
    pub id: StateId,
}

/// One open transaction. All fields are guarded by the owning connection's
/// mutex.
pub(crate) struct State {
    pub r#gen: u32,
    pub msgid: u64,
    pub parent: StateId,
    /// Children in insertion order.
    pub subq: VecDeque<StateId>,
    /// Cursor letting the failure walk tolerate removal mid-iteration.
    pub scan: Option<StateId>,
    /// CREATE/DELETE/REPLY bits observed in the transmit direction.
    pub txcmd: u32,
    /// CREATE/DELETE/REPLY bits observed in the receive direction.
    pub rxcmd: u32,
    /// Base command latched on the first CREATE.
    pub icmd: u32,
    pub flags: StateFlags,
    /// Counted references: tree membership, subq membership, one per
    /// message, one per live relay peer, transient holds.
    pub refs: u32,
    pub relay: Option<RelayPeer>,
    /// Opaque user cookie.
    pub udata: u64,
}

impl State {
    #[inline]
    pub fn is(&self, flags: StateFlags) -> bool {
        self.flags.intersects(flags)
    }

    #[inline]
    fn tx_has(&self, flags: CmdFlags) -> bool {
        wire::has(self.txcmd, flags)
    }

    #[inline]
    fn rx_has(&self, flags: CmdFlags) -> bool {
        wire::has(self.rxcmd, flags)
    }
}

/// Slab of transaction states plus the two msgid indexes. Slot 0 is the
/// root state.
pub(crate) struct StateTable {
    slots: Vec<Option<State>>,
    /// Per-slot generation, bumped on vacate so recycled slots never alias
    /// a stale id.
    gens: Vec<u32>,
    free: Vec<u32>,
    /// Transactions we initiated, indexed by our msgid.
    pub statewr: BTreeMap<u64, StateId>,
    /// Transactions the peer initiated, indexed by the peer's msgid.
    pub staterd: BTreeMap<u64, StateId>,
    /// Live dynamic states, for diagnostics.
    pub live: usize,
}

impl StateTable {
    fn new() -> Self {
        let root = State {
            r#gen: 0,
            msgid: 0,
            parent: ROOT_ID,
            subq: VecDeque::new(),
            scan: None,
            txcmd: 0,
            rxcmd: 0,
            icmd: 0,
            flags: StateFlags::ROOT,
            refs: 1,
            relay: None,
            udata: 0,
        };
        Self {
            slots: vec![Some(root)],
            gens: vec![0],
            free: Vec::new(),
            statewr: BTreeMap::new(),
            staterd: BTreeMap::new(),
            live: 0,
        }
    }

    pub fn get(&self, id: StateId) -> Option<&State> {
        self.slots.get(id.idx as usize).and_then(Option::as_ref).filter(|s| s.r#gen == id.r#gen)
    }

    pub fn get_mut(&mut self, id: StateId) -> Option<&mut State> {
        self.slots.get_mut(id.idx as usize).and_then(Option::as_mut).filter(|s| s.r#gen == id.r#gen)
    }

    fn insert(&mut self, mut state: State) -> StateId {
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            let r#gen = self.gens[idx as usize];
            state.r#gen = r#gen;
            self.slots[idx as usize] = Some(state);
            StateId { idx, r#gen }
        } else {
            let idx = self.slots.len() as u32;
            state.r#gen = 0;
            self.slots.push(Some(state));
            self.gens.push(0);
            StateId { idx, r#gen: 0 }
        }
    }

    fn vacate(&mut self, id: StateId) {
        self.slots[id.idx as usize] = None;
        self.gens[id.idx as usize] = self.gens[id.idx as usize].wrapping_add(1);
        self.free.push(id.idx);
        self.live -= 1;
    }
}

/// Everything under the connection mutex: the state forest, the
/// cross-thread transmit queue and the pre-processed receive queue.
pub(crate) struct Core {
    pub states: StateTable,
    /// Messages handed off by writers, drained by the IO core flush.
    pub txmsgq: VecDeque<Msg>,
    /// State-processed messages awaiting delivery: synthesized failure
    /// DELETEs and the final link-error sentinel.
    pub rxmsgq: VecDeque<Msg>,
    /// Cross-connection relay references to release once the local mutex
    /// is dropped.
    pub relay_drops: Vec<RelayPeer>,
    /// Error code of the latched receive failure, once the cascade ran.
    pub rx_failed: Option<u32>,
    final_queued: bool,
    next_msgid: u64,
}

impl Core {
    pub fn new() -> Self {
        Self {
            states: StateTable::new(),
            txmsgq: VecDeque::new(),
            rxmsgq: VecDeque::new(),
            relay_drops: Vec::new(),
            rx_failed: None,
            final_queued: false,
            next_msgid: 1,
        }
    }

    /// Resolves an id the engine believes is live. A miss is a logic bug:
    /// debug builds panic, release builds report and degrade to the root
    /// sentinel, whose ROOT flag short-circuits the transactional paths.
    fn st(&self, id: StateId) -> &State {
        let id = if self.states.get(id).is_some() {
            id
        } else {
            safe_panic!("stale state id {id:?}");
            ROOT_ID
        };
        match self.states.get(id) {
            Some(st) => st,
            None => unreachable!("root state is never freed"),
        }
    }

    fn st_mut(&mut self, id: StateId) -> &mut State {
        let id = if self.states.get(id).is_some() {
            id
        } else {
            safe_panic!("stale state id {id:?}");
            ROOT_ID
        };
        match self.states.get_mut(id) {
            Some(st) => st,
            None => unreachable!("root state is never freed"),
        }
    }

    pub fn hold(&mut self, id: StateId) {
        let Some(state) = self.states.get_mut(id) else {
            safe_panic!("hold of a stale state id {id:?}");
            return;
        };
        state.refs += 1;
    }

    /// Drops one reference, freeing the state when the count reaches zero.
    pub fn drop_ref(&mut self, id: StateId) {
        {
            let Some(state) = self.states.get_mut(id) else {
                safe_panic!("drop of a stale state id {id:?}");
                return;
            };
            if state.refs == 0 {
                safe_panic!("ref underflow on state {id:?}");
                return;
            }
            state.refs -= 1;
            if state.refs != 0 {
                return;
            }
        }

        // The last reference is gone; anything still linked here is a leak
        // in the making, keep the state parked rather than freeing it out
        // from under the tree.
        let still_linked = {
            let state = self.st(id);
            state.is(StateFlags::ROOT | StateFlags::SUBINSERTED | StateFlags::RBINSERTED) ||
                !state.subq.is_empty()
        };
        if still_linked {
            safe_panic!("state {id:?} dropped to zero refs while still linked");
            return;
        }

        let relay = {
            let state = self.st_mut(id);
            trace!(idx = id.idx, msgid = state.msgid, "terminate state");
            state.relay.take()
        };
        if let Some(peer) = relay {
            self.relay_drops.push(peer);
        }
        self.states.vacate(id);
    }

    /// Allocates a message on `state`. With CREATE set (and REPLY clear) a
    /// new transaction is opened under `state`; otherwise the message rides
    /// the existing transaction. Returns `None` when the state is gone.
    pub fn msg_alloc(
        &mut self,
        state: StateId,
        aux: Option<Vec<u8>>,
        mut cmd: u32,
    ) -> Option<Msg> {
        if cmd & wire::CMD_SIZE_MASK == 0 {
            cmd |= 1;
        }
        let hbytes = hdr_bytes(cmd);
        safe_assert!(hbytes >= HDR_SIZE && hbytes <= wire::HDR_MAX);

        let (sid, pid) = if (cmd & (CmdFlags::CREATE | CmdFlags::REPLY).bits()) ==
            CmdFlags::CREATE.bits()
        {
            // New transaction stacked under the passed-in circuit. A racing
            // circuit failure is handled by inheriting DYING; ABORTING is
            // deliberately not inherited so the abort sequence can recurse.
            let pid = state;
            let parent = self.states.get(pid)?;
            let inherited = parent.flags & StateFlags::DYING;
            let parent_empty = parent.subq.is_empty();
            let msgid = self.next_msgid;
            self.next_msgid += 1;

            let txcmd = cmd & !(CmdFlags::CREATE | CmdFlags::DELETE).bits();
            let id = self.states.insert(State {
                r#gen: 0,
                msgid,
                parent: pid,
                subq: VecDeque::new(),
                scan: None,
                txcmd,
                rxcmd: CmdFlags::REPLY.bits(),
                icmd: txcmd & wire::CMD_BASE_MASK,
                flags: StateFlags::DYNAMIC |
                    StateFlags::NEW |
                    StateFlags::SUBINSERTED |
                    StateFlags::RBINSERTED |
                    inherited,
                refs: 0,
                relay: None,
                udata: 0,
            });
            self.states.statewr.insert(msgid, id);
            if parent_empty {
                self.hold(pid);
            }
            self.st_mut(pid).subq.push_back(id);
            let st = self.st_mut(id);
            st.refs += 3; // subq, tree, msg
            (id, pid)
        } else {
            let st = self.states.get(state)?;
            let pid = if st.is(StateFlags::SUBINSERTED) { st.parent } else { state };
            self.hold(state); // msg
            (state, pid)
        };

        if self.st(sid).is(StateFlags::OPPOSITE) {
            cmd |= CmdFlags::REVTRANS.bits();
        }
        if self.st(pid).is(StateFlags::OPPOSITE) {
            cmd |= CmdFlags::REVCIRC.bits();
        }

        let hdr = Header {
            magic: wire::HDR_MAGIC,
            cmd,
            msgid: self.st(sid).msgid,
            circuit: self.st(pid).msgid,
            ..Header::default()
        };
        Some(Msg::new(sid, hdr, vec![0u8; hbytes - HDR_SIZE], aux))
    }

    /// Retires a message, releasing its state reference.
    pub fn free_msg(&mut self, msg: Msg) {
        self.drop_ref(msg.state);
    }

    /// Write-side entry point, mutex held. Either commits the message to
    /// the transmit queue (waking the IO core) or drops it, synthesizing a
    /// failure when the target is dying.
    pub fn msg_write(&mut self, shared: &Shared, mut msg: Msg) {
        let sid = msg.state;
        trace!(
            cmd = format_args!("{:08x}", msg.hdr.cmd),
            msgid = msg.hdr.msgid,
            error = msg.hdr.error,
            "msgtx"
        );

        if !self.st(sid).is(StateFlags::ROOT) {
            // First message of our direction: latch txcmd and the inner
            // command. Not done at allocation time because the state could
            // be ripped out before the message is serialized.
            if (msg.hdr.cmd & (CmdFlags::CREATE | CmdFlags::REPLY).bits()) ==
                CmdFlags::CREATE.bits()
            {
                let st = self.st_mut(sid);
                st.txcmd = msg.hdr.cmd & !CmdFlags::DELETE.bits();
                st.icmd = st.txcmd & wire::CMD_BASE_MASK;
                st.flags.remove(StateFlags::NEW);
            }
            msg.hdr.msgid = self.st(sid).msgid;
            if msg.hdr.has(CmdFlags::CREATE) {
                let st = self.st_mut(sid);
                st.txcmd = msg.hdr.cmd & !CmdFlags::DELETE.bits();
            }
        }

        // Discard messages sent to transactions which are already closed in
        // our direction.
        if self.st(sid).tx_has(CmdFlags::DELETE) {
            debug!(cmd = format_args!("{:08x}", msg.hdr.cmd), "msg_write: drop msg to dead transaction");
            self.free_msg(msg);
            return;
        }

        if self.st(sid).is(StateFlags::DYING) {
            // The circuit is dying: the peer is not expecting anything more
            // from us on this state. Throw the message away and simulate the
            // failure in the return direction.
            debug!(
                cmd = format_args!("{:08x}", msg.hdr.cmd),
                msgid = msg.hdr.msgid,
                "msg_write: write to dying transaction"
            );
            self.hold(sid);
            self.cleanup_tx(shared, &msg);
            if !self.st(sid).is(StateFlags::ABORTING) {
                self.simulate_failure(shared, sid, true, ERR_LOSTLINK);
            }
            self.drop_ref(sid);
            self.free_msg(msg);
        } else {
            self.cleanup_tx(shared, &msg);
            self.txmsgq.push_back(msg);
            shared.set_flags(IocomFlags::WWORK);
            shared.wake();
        }
    }

    /// Send-side state update, run before the message hits the wire.
    pub fn cleanup_tx(&mut self, shared: &Shared, msg: &Msg) {
        let sid = msg.state;
        self.hold(sid);

        if self.st(sid).is(StateFlags::ROOT) {
            // Non-transactional message, nothing to track.
        } else if msg.hdr.has(CmdFlags::DELETE) {
            // A failure can terminate the state between the write and this
            // cleanup, so txcmd might already carry DELETE.
            let (tx_del, rx_del) = {
                let st = self.st(sid);
                (st.tx_has(CmdFlags::DELETE), st.rx_has(CmdFlags::DELETE))
            };
            if !tx_del && rx_del {
                let st = self.st_mut(sid);
                st.txcmd |= CmdFlags::DELETE.bits();
                safe_assert!(link: shared.label, st.is(StateFlags::RBINSERTED));
                let msgid = st.msgid;
                let reply = st.tx_has(CmdFlags::REPLY);
                st.flags.remove(StateFlags::RBINSERTED);
                if reply {
                    self.states.staterd.remove(&msgid);
                } else {
                    self.states.statewr.remove(&msgid);
                }
                self.subq_delete(sid);
                self.drop_relay(sid);
                self.drop_ref(sid); // tree
            } else if !tx_del {
                self.st_mut(sid).txcmd |= CmdFlags::DELETE.bits();
            }
        }

        // Deferred abort after transmission. ABORTING is cleared first so
        // the cascade can re-enter state_abort; the cascade re-sets it.
        if self.st(sid).is(StateFlags::ABORTING | StateFlags::DYING) &&
            !self.st(sid).rx_has(CmdFlags::DELETE)
        {
            debug!(msgid = self.st(sid).msgid, "cleanup_tx: executing deferred abort");
            self.st_mut(sid).flags.remove(StateFlags::ABORTING);
            self.simulate_failure(shared, sid, true, ERR_LOSTLINK);
        }

        self.drop_ref(sid);
        self.maybe_queue_final(shared);
    }

    /// Process state tracking for a received message, prior to delivery.
    /// With `stated` set the state has already been incorporated into the
    /// message (synthesized aborts); lookups are skipped.
    pub fn state_msgrx(&mut self, msg: &mut Msg, stated: bool) -> Result<(), IoqError> {
        let cmd = msg.hdr.cmd;
        trace!(
            cmd = format_args!("{cmd:08x}"),
            msgid = msg.hdr.msgid,
            circuit = msg.hdr.circuit,
            error = msg.hdr.error,
            "msgrx"
        );

        // Resolve the circuit. The REVCIRC bit tells us which side
        // initiated it. A missing circuit means the message raced the
        // failure cascade in the other direction: throw it away quietly.
        let pid = if stated {
            self.st(msg.state).parent
        } else if msg.hdr.circuit != 0 {
            let tree = if msg.hdr.has(CmdFlags::REVCIRC) {
                &self.states.statewr
            } else {
                &self.states.staterd
            };
            match tree.get(&msg.hdr.circuit) {
                Some(&id) => id,
                None => {
                    debug!(circuit = msg.hdr.circuit, "msgrx: missing circuit for stacked transaction");
                    return Err(IoqError::Already);
                }
            }
        } else {
            ROOT_ID
        };

        // Resolve the transaction. Commands land in staterd, replies in
        // statewr; no match leaves the message on the circuit itself
        // (brand-new transaction or a one-off).
        let sid = if stated {
            msg.state
        } else {
            let tree = if msg.hdr.has(CmdFlags::REVTRANS) {
                &self.states.statewr
            } else {
                &self.states.staterd
            };
            match tree.get(&msg.hdr.msgid) {
                Some(&id) => {
                    self.drop_ref(msg.state);
                    self.hold(id);
                    msg.state = id;
                    safe_assert_eq!(self.st(id).parent, pid);
                    id
                }
                None => {
                    if msg.state != pid {
                        self.drop_ref(msg.state);
                        self.hold(pid);
                        msg.state = pid;
                    }
                    pid
                }
            }
        };

        let aborting = msg.hdr.has(CmdFlags::ABORT);
        let relation = cmd & (CmdFlags::CREATE | CmdFlags::DELETE | CmdFlags::REPLY).bits();

        const CREATE: u32 = CmdFlags::CREATE.bits();
        const DELETE: u32 = CmdFlags::DELETE.bits();
        const REPLY: u32 = CmdFlags::REPLY.bits();

        match relation {
            r if r == CREATE || r == (CREATE | DELETE) => {
                // Create a new sub-transaction under the circuit.
                if sid != pid {
                    debug!(msgid = msg.hdr.msgid, "msgrx: duplicate transaction");
                    return Err(IoqError::Trans);
                }
                let relay_parent = self.st(pid).relay.is_some();
                let parent_empty = self.st(pid).subq.is_empty();
                let rxcmd = cmd & !CmdFlags::DELETE.bits();
                let id = self.states.insert(State {
                    r#gen: 0,
                    msgid: msg.hdr.msgid,
                    parent: pid,
                    subq: VecDeque::new(),
                    scan: None,
                    txcmd: CmdFlags::REPLY.bits(),
                    rxcmd,
                    icmd: rxcmd & wire::CMD_BASE_MASK,
                    flags: StateFlags::DYNAMIC |
                        StateFlags::OPPOSITE |
                        StateFlags::SUBINSERTED |
                        StateFlags::RBINSERTED |
                        if relay_parent { StateFlags::RELAY } else { StateFlags::empty() },
                    refs: 0,
                    relay: None,
                    udata: 0,
                });
                self.states.staterd.insert(msg.hdr.msgid, id);
                if parent_empty {
                    self.hold(pid);
                }
                self.st_mut(pid).subq.push_back(id);
                self.st_mut(id).refs += 3; // subq, tree, msg
                self.drop_ref(msg.state);
                msg.state = id;
            }
            r if r == DELETE || r == (REPLY | DELETE) => {
                // Persistent state is expected but might be missing, or the
                // msgid might already have been reused, when an ABORT+DELETE
                // races the close.
                if sid == pid {
                    if aborting {
                        return Err(IoqError::Already);
                    }
                    debug!(msgid = msg.hdr.msgid, "msgrx: missing state for DELETE");
                    return Err(IoqError::Trans);
                }
                if !self.st(sid).rx_has(CmdFlags::CREATE) {
                    if aborting {
                        return Err(IoqError::Already);
                    }
                    debug!(msgid = msg.hdr.msgid, "msgrx: reused state for DELETE");
                    return Err(IoqError::Trans);
                }
            }
            r if r == (REPLY | CREATE) || r == (REPLY | CREATE | DELETE) => {
                // A reply with CREATE set requires the original persistent
                // state to exist.
                if sid == pid {
                    debug!(msgid = msg.hdr.msgid, "msgrx: no state for reply");
                    return Err(IoqError::Trans);
                }
                safe_assert_eq!((self.st(sid).rxcmd ^ cmd) & REPLY, 0);
                self.st_mut(sid).rxcmd = cmd & !CmdFlags::DELETE.bits();
            }
            _ => {
                // Mid-stream message, possibly a mid-stream ABORT.
                if aborting && (sid == pid || !self.st(sid).rx_has(CmdFlags::CREATE)) {
                    return Err(IoqError::Already);
                }
            }
        }

        msg.tcmd = switch_cmd(self.st(msg.state).icmd, cmd, self.st(msg.state).is(StateFlags::ROOT));

        // Mark the receive side DELETEd and pull the state out of its tree
        // once both sides are closed. subq linkage and references stay put
        // until the user callback has run.
        let sid = msg.state;
        if self.st(sid).is(StateFlags::ROOT) {
            // Non-transactional message.
        } else if msg.hdr.has(CmdFlags::DELETE) {
            safe_assert!(!self.st(sid).rx_has(CmdFlags::DELETE));
            self.st_mut(sid).rxcmd |= CmdFlags::DELETE.bits();
            if self.st(sid).tx_has(CmdFlags::DELETE) {
                let st = self.st_mut(sid);
                safe_assert!(st.is(StateFlags::RBINSERTED));
                let msgid = st.msgid;
                let reply = st.rx_has(CmdFlags::REPLY);
                st.flags.remove(StateFlags::RBINSERTED);
                if reply {
                    self.states.statewr.remove(&msgid);
                } else {
                    self.states.staterd.remove(&msgid);
                }
                self.drop_ref(sid); // tree
            }
        }

        Ok(())
    }

    /// Cleanup after the receive callback returned, mutex held. Fully
    /// closed transactions disconnect from their parent (which can drop the
    /// parent upward) and shed their relay peer.
    pub fn cleanup_rx(&mut self, shared: &Shared, msg: Msg) {
        let sid = msg.state;
        let st = self.st(sid);
        if !st.is(StateFlags::ROOT) &&
            st.is(StateFlags::SUBINSERTED) &&
            st.rx_has(CmdFlags::DELETE) &&
            st.tx_has(CmdFlags::DELETE)
        {
            self.subq_delete(sid);
            self.drop_relay(sid);
        }
        self.free_msg(msg);
        self.maybe_queue_final(shared);
    }

    /// Removes the state from its parent's subq, dropping the parent's
    /// keep-alive reference when the subq empties.
    fn subq_delete(&mut self, sid: StateId) {
        if !self.st(sid).is(StateFlags::SUBINSERTED) {
            return;
        }
        let pid = self.st(sid).parent;
        if self.st(pid).scan == Some(sid) {
            self.st_mut(pid).scan = None;
        }
        let parent = self.st_mut(pid);
        if let Some(pos) = parent.subq.iter().position(|&s| s == sid) {
            parent.subq.remove(pos);
        }
        let emptied = parent.subq.is_empty();
        self.st_mut(sid).flags.remove(StateFlags::SUBINSERTED);
        if emptied {
            self.drop_ref(pid); // subq keep-alive
        }
        self.drop_ref(sid); // subq membership
    }

    fn drop_relay(&mut self, sid: StateId) {
        if let Some(peer) = self.st_mut(sid).relay.take() {
            self.relay_drops.push(peer);
        }
    }

    /// Simulates reception of transaction DELETEs when the link cannot
    /// deliver them, walking the subtree root-first. The parent's `scan`
    /// cursor makes the walk safe against concurrent removal; if it moved
    /// under us the iteration restarts.
    pub fn simulate_failure(&mut self, shared: &Shared, sid: StateId, meto: bool, err: u32) {
        self.hold(sid);
        if meto {
            self.state_abort(shared, sid, err);
        }

        'again: loop {
            let mut i = 0usize;
            loop {
                let sub = match self.st(sid).subq.get(i) {
                    Some(&s) => s,
                    None => break 'again,
                };
                if !self.st(sub).is(StateFlags::ABORTING) {
                    self.st_mut(sid).scan = Some(sub);
                    self.simulate_failure(shared, sub, true, err);
                    if self.st(sid).scan != Some(sub) {
                        continue 'again;
                    }
                }
                i += 1;
            }
        }

        self.drop_ref(sid);
    }

    /// Aborts one state: marks the whole subtree DYING, then synthesizes
    /// the peer's DELETE for this state unless its receive side is already
    /// closed. Idempotent via ABORTING. Freshly allocated states defer
    /// until their first outbound message runs cleanup_tx.
    pub fn state_abort(&mut self, shared: &Shared, sid: StateId, err: u32) {
        if self.st(sid).is(StateFlags::ABORTING) {
            return;
        }
        self.st_mut(sid).flags.insert(StateFlags::ABORTING);
        self.state_dying(sid);
        if self.st(sid).is(StateFlags::NEW) {
            debug!(msgid = self.st(sid).msgid, "state_abort: deferred, state still unsent");
            return;
        }

        if !self.st(sid).rx_has(CmdFlags::DELETE) {
            let rxcmd = self.st(sid).rxcmd;
            let Some(mut msg) = self.msg_alloc(sid, None, LNK_ERROR) else {
                return;
            };
            if !wire::has(rxcmd, CmdFlags::CREATE) {
                msg.hdr.cmd |= CmdFlags::CREATE.bits();
            }
            msg.hdr.cmd |= CmdFlags::DELETE.bits() | (rxcmd & CmdFlags::REPLY.bits());
            // We are simulating the peer's side of the state, so the
            // direction bits flip.
            msg.hdr.cmd ^= (CmdFlags::REVTRANS | CmdFlags::REVCIRC).bits();
            msg.hdr.cmd |= CmdFlags::ABORT.bits();
            msg.hdr.error = err;

            if self.state_msgrx(&mut msg, true).is_err() {
                self.free_msg(msg);
                return;
            }
            msg.stated = true;
            self.rxmsgq.push_back(msg);
            shared.set_flags(IocomFlags::RWORK);
            shared.wake();
        }
    }

    /// Recursively marks the subtree DYING, preventing any new outbound
    /// traffic. Done atomically under the mutex, whereas ABORTING spreads
    /// one callback at a time.
    fn state_dying(&mut self, sid: StateId) {
        if self.st(sid).is(StateFlags::DYING) {
            return;
        }
        self.st_mut(sid).flags.insert(StateFlags::DYING);
        let children: Vec<StateId> = self.st(sid).subq.iter().copied().collect();
        for child in children {
            self.state_dying(child);
        }
    }

    /// Latches a receive failure and tears down every open transaction.
    pub fn fail_rx(&mut self, shared: &Shared, err: IoqError) {
        let code = match err {
            IoqError::Eof | IoqError::Sock => ERR_LOSTLINK,
            other => other.code(),
        };
        if self.rx_failed.is_none() {
            self.rx_failed = Some(err.code());
        }
        self.simulate_failure(shared, ROOT_ID, false, code);
        self.maybe_queue_final(shared);
    }

    /// After a receive failure, once every transaction has fully closed,
    /// queue the one non-transactional link-error message that tells the
    /// session the connection is gone.
    fn maybe_queue_final(&mut self, shared: &Shared) {
        let Some(code) = self.rx_failed else { return };
        if self.final_queued ||
            !self.states.statewr.is_empty() ||
            !self.states.staterd.is_empty()
        {
            return;
        }
        self.final_queued = true;
        if let Some(mut msg) = self.msg_alloc(ROOT_ID, None, LNK_ERROR) {
            msg.hdr.error = code;
            msg.stated = true;
            msg.tcmd = 0;
            self.rxmsgq.push_back(msg);
            shared.set_flags(IocomFlags::RWORK);
            shared.wake();
        }
    }
}
