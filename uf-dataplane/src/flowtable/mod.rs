//! Per-worker flow cache: bidirectional 5-tuple lookup, TCP-driven
//! lifetimes and a timer wheel for ageing.
//!
//! Every structure here belongs to exactly one worker. The only shared
//! pieces are the [`FlowBudget`] (a counted right to hold live flows, drawn
//! in batches under a short lock) and the timeout channel draining expiry
//! messages toward the control process.

mod signature;
mod tcp;

pub use signature::{hash_signature, packet_signature, FlowSignature};
pub use tcp::{
    inner_tcp_flags, tcp_event, tcp_lifetime, tcp_transition, TcpEvent, TcpState, TCP_FLAG_ACK,
    TCP_FLAG_FIN, TCP_FLAG_RST, TCP_FLAG_SYN, TCP_LIFETIME, TCP_TRANS,
};

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use uf_interface::{AppId, Error, PdrId, Result, INDEX_NONE};

/// Slots in the timer wheel; one slot per second of lifetime.
pub const TIMER_MAX_LIFETIME: u32 = 600;
/// Upper bound on expirations handled in one pass.
pub const TIMER_MAX_EXPIRE: usize = 16;
/// Budget credits moved between the global pool and a worker at a time.
pub const FLOW_CACHE_SZ: usize = 32;
/// Lifetime given to new flows until the TCP machine says otherwise.
pub const TIMER_DEFAULT_LIFETIME: u32 = 60;

/// Per-direction packet/byte counters of a flow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    pub pkts: u64,
    pub bytes: u64,
}

/// Expiry notification handed to the control process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutMsg {
    pub session_index: u32,
    pub flow_id: u64,
    pub initiator: FlowStats,
    pub responder: FlowStats,
}

/// One tracked flow. Lives in exactly one wheel slot and exactly one hash
/// chain for as long as it is in use.
#[derive(Debug)]
pub struct FlowEntry {
    pub flow_id: u64,
    pub sig: FlowSignature,
    pub sig_hash: u64,
    pub tcp_state: TcpState,
    pub lifetime: u32,
    pub expire_at: u32,
    pub stats: [FlowStats; 2],
    pub initiator_direction: u8,
    pub initiator_pdr_id: Option<PdrId>,
    pub responder_pdr_id: Option<PdrId>,
    /// Application binding; set once by DPI and never overwritten.
    pub app_id: Option<AppId>,
    pub session_index: u32,

    in_use: bool,
    timer_slot: u32,
    timer_prev: u32,
    timer_next: u32,
    hash_prev: u32,
    hash_next: u32,
}

impl FlowEntry {
    fn unused() -> FlowEntry {
        FlowEntry {
            flow_id: 0,
            sig: FlowSignature {
                proto: 0,
                src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                src_port: 0,
                dst_port: 0,
            },
            sig_hash: 0,
            tcp_state: TcpState::Closed,
            lifetime: 0,
            expire_at: 0,
            stats: [FlowStats::default(); 2],
            initiator_direction: 0,
            initiator_pdr_id: None,
            responder_pdr_id: None,
            app_id: None,
            session_index: INDEX_NONE,
            in_use: false,
            timer_slot: INDEX_NONE,
            timer_prev: INDEX_NONE,
            timer_next: INDEX_NONE,
            hash_prev: INDEX_NONE,
            hash_next: INDEX_NONE,
        }
    }

    pub fn is_live(&self) -> bool {
        self.in_use
    }
}

#[derive(Debug)]
struct BudgetInner {
    allocated: usize,
    flows_max: usize,
}

/// Global cap on live flows across all workers. Workers draw credits in
/// `FLOW_CACHE_SZ` batches so the lock sits off the per-packet path.
#[derive(Debug)]
pub struct FlowBudget {
    inner: Mutex<BudgetInner>,
    next_flow_id: AtomicU64,
}

impl FlowBudget {
    pub fn new(flows_max: usize) -> Arc<FlowBudget> {
        Arc::new(FlowBudget {
            inner: Mutex::new(BudgetInner {
                allocated: 0,
                flows_max,
            }),
            next_flow_id: AtomicU64::new(0),
        })
    }

    fn take(&self, want: usize) -> usize {
        let mut inner = self.inner.lock();
        let n = want.min(inner.flows_max.saturating_sub(inner.allocated));
        inner.allocated += n;
        n
    }

    fn give(&self, n: usize) {
        self.inner.lock().allocated -= n;
    }

    fn next_flow_id(&self) -> u64 {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Per-worker flow table.
pub struct FlowTable {
    flows: Vec<FlowEntry>,
    free_slots: Vec<u32>,
    ht: HashMap<u64, u32>,
    wheel_head: Vec<u32>,
    wheel_tail: Vec<u32>,
    time_index: u32,
    live: usize,
    credits: usize,
    budget: Arc<FlowBudget>,
    timeout_tx: UnboundedSender<TimeoutMsg>,
    default_lifetime: Arc<AtomicU32>,
}

impl FlowTable {
    pub fn new(
        budget: Arc<FlowBudget>,
        timeout_tx: UnboundedSender<TimeoutMsg>,
        default_lifetime: Arc<AtomicU32>,
    ) -> FlowTable {
        FlowTable {
            flows: Vec::new(),
            free_slots: Vec::new(),
            ht: HashMap::new(),
            wheel_head: vec![INDEX_NONE; TIMER_MAX_LIFETIME as usize],
            wheel_tail: vec![INDEX_NONE; TIMER_MAX_LIFETIME as usize],
            time_index: INDEX_NONE,
            live: 0,
            credits: 0,
            budget,
            timeout_tx,
            default_lifetime,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, idx: u32) -> &FlowEntry {
        &self.flows[idx as usize]
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut FlowEntry {
        &mut self.flows[idx as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowEntry> {
        self.flows.iter().filter(|f| f.in_use)
    }

    /// Finds the flow for a canonical signature or creates it. A fresh flow
    /// gets the default lifetime and a wheel slot one lifetime ahead.
    pub fn lookup_or_create(
        &mut self,
        sig: &FlowSignature,
        sig_hash: u64,
        now: u32,
        session_index: u32,
    ) -> Result<(u32, bool)> {
        if let Some(&head) = self.ht.get(&sig_hash) {
            let mut i = head;
            while i != INDEX_NONE {
                let e = &self.flows[i as usize];
                if e.sig == *sig {
                    return Ok((i, false));
                }
                i = e.hash_next;
            }
        }

        let idx = self.alloc_slot(now)?;
        let flow_id = self.budget.next_flow_id();
        let lifetime = self
            .default_lifetime
            .load(Ordering::Relaxed)
            .clamp(1, TIMER_MAX_LIFETIME - 1);

        let entry = &mut self.flows[idx as usize];
        *entry = FlowEntry::unused();
        entry.in_use = true;
        entry.flow_id = flow_id;
        entry.sig = *sig;
        entry.sig_hash = sig_hash;
        entry.lifetime = lifetime;
        entry.expire_at = now + lifetime;
        entry.session_index = session_index;

        self.insert_timer(idx, (now + lifetime) % TIMER_MAX_LIFETIME);

        // Head insertion into the collision chain of this hash key.
        let next = self.ht.get(&sig_hash).copied().unwrap_or(INDEX_NONE);
        self.flows[idx as usize].hash_next = next;
        if next != INDEX_NONE {
            self.flows[next as usize].hash_prev = idx;
        }
        self.ht.insert(sig_hash, idx);
        self.live += 1;

        trace!(flow_id, ?sig, "flow created");
        Ok((idx, true))
    }

    /// Runs the TCP machine on a flags byte; on a state change the flow is
    /// re-parked with the new state's lifetime.
    pub fn tcp_update(&mut self, idx: u32, flags: u8, now: u32) -> bool {
        let event = tcp_event(flags);
        let old = self.flows[idx as usize].tcp_state;
        let new = tcp_transition(old, event);
        if new == old {
            return false;
        }

        self.remove_timer(idx);
        let lifetime = tcp_lifetime(new);
        let entry = &mut self.flows[idx as usize];
        entry.tcp_state = new;
        entry.lifetime = lifetime;
        entry.expire_at = now + lifetime;
        self.insert_timer(idx, (now + lifetime) % TIMER_MAX_LIFETIME);
        true
    }

    /// Advances the wheel to `now` and expires up to [`TIMER_MAX_EXPIRE`]
    /// flows parked in the current slot. On a slot change, whatever is left
    /// in the previous slot is spliced onto the front of the new one so
    /// nothing is skipped.
    pub fn expire(&mut self, now: u32) -> usize {
        let new_index = now % TIMER_MAX_LIFETIME;
        if self.time_index == INDEX_NONE {
            self.time_index = new_index;
        } else if new_index != self.time_index {
            self.splice(self.time_index, new_index);
            self.time_index = new_index;
        }

        let mut expired = 0;
        while expired < TIMER_MAX_EXPIRE {
            let head = self.wheel_head[self.time_index as usize];
            if head == INDEX_NONE {
                break;
            }
            self.expire_flow(head);
            expired += 1;
        }
        expired
    }

    /// Grafts whatever is left in `from` onto the front of `to`. Each moved
    /// entry is re-stamped with its new slot before the lists are joined,
    /// so a later unlink patches the right head and tail.
    fn splice(&mut self, from: u32, to: u32) {
        let from_head = self.wheel_head[from as usize];
        if from_head == INDEX_NONE {
            return;
        }
        let from_tail = self.wheel_tail[from as usize];

        // The moved list still ends at `from_tail` here, so this walk is
        // bounded by its length.
        let mut i = from_head;
        while i != INDEX_NONE {
            self.flows[i as usize].timer_slot = to;
            i = self.flows[i as usize].timer_next;
        }

        let to_head = self.wheel_head[to as usize];
        if to_head == INDEX_NONE {
            self.wheel_tail[to as usize] = from_tail;
        } else {
            self.flows[from_tail as usize].timer_next = to_head;
            self.flows[to_head as usize].timer_prev = from_tail;
        }
        self.wheel_head[to as usize] = from_head;
        self.wheel_head[from as usize] = INDEX_NONE;
        self.wheel_tail[from as usize] = INDEX_NONE;
    }

    /// Force-expires the oldest flow on the wheel to make room. False only
    /// when this worker holds no flows at all.
    fn recycle(&mut self, now: u32) -> bool {
        let start = if self.time_index == INDEX_NONE {
            now % TIMER_MAX_LIFETIME
        } else {
            self.time_index
        };

        let mut slot = (start + 1) % TIMER_MAX_LIFETIME;
        loop {
            let head = self.wheel_head[slot as usize];
            if head != INDEX_NONE {
                trace!(slot, "recycling oldest flow");
                self.expire_flow(head);
                return true;
            }
            if slot == start {
                return false;
            }
            slot = (slot + 1) % TIMER_MAX_LIFETIME;
        }
    }

    fn alloc_slot(&mut self, now: u32) -> Result<u32> {
        if self.credits == 0 {
            self.credits = self.budget.take(FLOW_CACHE_SZ);
        }
        if self.credits == 0 && !self.recycle(now) {
            return Err(Error::ResourceExhausted);
        }
        debug_assert!(self.credits > 0);
        self.credits -= 1;

        Ok(match self.free_slots.pop() {
            Some(idx) => idx,
            None => {
                self.flows.push(FlowEntry::unused());
                (self.flows.len() - 1) as u32
            }
        })
    }

    fn expire_flow(&mut self, idx: u32) {
        let entry = &self.flows[idx as usize];
        if entry.session_index != INDEX_NONE {
            let init = entry.initiator_direction as usize;
            let msg = TimeoutMsg {
                session_index: entry.session_index,
                flow_id: entry.flow_id,
                initiator: entry.stats[init],
                responder: entry.stats[1 - init],
            };
            // A gone receiver only means the control process is shutting
            // down; the flow is freed either way.
            let _ = self.timeout_tx.send(msg);
        }
        trace!(flow_id = entry.flow_id, "flow expired");

        self.remove_timer(idx);
        self.unlink_hash(idx);

        self.flows[idx as usize].in_use = false;
        self.free_slots.push(idx);
        self.live -= 1;

        self.credits += 1;
        if self.credits > 2 * FLOW_CACHE_SZ {
            self.budget.give(FLOW_CACHE_SZ);
            self.credits -= FLOW_CACHE_SZ;
        }
    }

    fn insert_timer(&mut self, idx: u32, slot: u32) {
        let tail = self.wheel_tail[slot as usize];
        {
            let entry = &mut self.flows[idx as usize];
            entry.timer_slot = slot;
            entry.timer_prev = tail;
            entry.timer_next = INDEX_NONE;
        }
        if tail == INDEX_NONE {
            self.wheel_head[slot as usize] = idx;
        } else {
            self.flows[tail as usize].timer_next = idx;
        }
        self.wheel_tail[slot as usize] = idx;
    }

    fn remove_timer(&mut self, idx: u32) {
        let (slot, prev, next) = {
            let entry = &self.flows[idx as usize];
            (entry.timer_slot, entry.timer_prev, entry.timer_next)
        };
        if slot == INDEX_NONE {
            return;
        }
        if prev == INDEX_NONE {
            self.wheel_head[slot as usize] = next;
        } else {
            self.flows[prev as usize].timer_next = next;
        }
        if next == INDEX_NONE {
            self.wheel_tail[slot as usize] = prev;
        } else {
            self.flows[next as usize].timer_prev = prev;
        }
        let entry = &mut self.flows[idx as usize];
        entry.timer_slot = INDEX_NONE;
        entry.timer_prev = INDEX_NONE;
        entry.timer_next = INDEX_NONE;
    }

    fn unlink_hash(&mut self, idx: u32) {
        let (hash, prev, next) = {
            let entry = &self.flows[idx as usize];
            (entry.sig_hash, entry.hash_prev, entry.hash_next)
        };
        if prev == INDEX_NONE {
            if next == INDEX_NONE {
                self.ht.remove(&hash);
            } else {
                self.flows[next as usize].hash_prev = INDEX_NONE;
                self.ht.insert(hash, next);
            }
        } else {
            self.flows[prev as usize].hash_next = next;
            if next != INDEX_NONE {
                self.flows[next as usize].hash_prev = prev;
            }
        }
        let entry = &mut self.flows[idx as usize];
        entry.hash_prev = INDEX_NONE;
        entry.hash_next = INDEX_NONE;
    }

    #[cfg(test)]
    fn hash_chain_len(&self, hash: u64) -> usize {
        let mut n = 0;
        let mut i = self.ht.get(&hash).copied().unwrap_or(INDEX_NONE);
        while i != INDEX_NONE {
            n += 1;
            i = self.flows[i as usize].hash_next;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ip4_tcp_packet;
    use tokio::sync::mpsc;

    fn sig(a: u8, b: u8, port: u16) -> (FlowSignature, u64) {
        let pkt = ip4_tcp_packet([10, 0, 0, a], [10, 0, 0, b], port, 80, TCP_FLAG_SYN, b"");
        let (s, _) = packet_signature(&pkt).unwrap();
        (s, hash_signature(&s))
    }

    fn table(flows_max: usize) -> (FlowTable, mpsc::UnboundedReceiver<TimeoutMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let budget = FlowBudget::new(flows_max);
        let lifetime = Arc::new(AtomicU32::new(TIMER_DEFAULT_LIFETIME));
        (FlowTable::new(budget, tx, lifetime), rx)
    }

    #[test]
    fn lookup_returns_existing_entry_for_both_directions() {
        let (mut ft, _rx) = table(1024);
        let fwd = ip4_tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 1111, 80, TCP_FLAG_SYN, b"");
        let rev = ip4_tcp_packet([10, 0, 0, 2], [10, 0, 0, 1], 80, 1111, 0x12, b"");

        let (s1, h1) = packet_signature(&fwd).map(|(s, _)| (s, hash_signature(&s))).unwrap();
        let (s2, h2) = packet_signature(&rev).map(|(s, _)| (s, hash_signature(&s))).unwrap();

        let (i1, created1) = ft.lookup_or_create(&s1, h1, 0, 0).unwrap();
        let (i2, created2) = ft.lookup_or_create(&s2, h2, 0, 0).unwrap();

        assert!(created1);
        assert!(!created2);
        assert_eq!(i1, i2);
        assert_eq!(ft.len(), 1);
    }

    #[test]
    fn flow_ids_increase_monotonically_across_workers() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let budget = FlowBudget::new(1024);
        let lifetime = Arc::new(AtomicU32::new(TIMER_DEFAULT_LIFETIME));
        let mut a = FlowTable::new(budget.clone(), tx.clone(), lifetime.clone());
        let mut b = FlowTable::new(budget, tx, lifetime);

        let mut last = 0;
        for port in 1000..1010 {
            let (s, h) = sig(1, 2, port);
            let ft = if port % 2 == 0 { &mut a } else { &mut b };
            let (idx, created) = ft.lookup_or_create(&s, h, 0, 0).unwrap();
            assert!(created);
            let id = ft.get(idx).flow_id;
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn established_flow_ages_out_and_reports() {
        let (mut ft, mut rx) = table(1024);
        let (s, h) = sig(1, 2, 4242);
        let (idx, _) = ft.lookup_or_create(&s, h, 0, 7).unwrap();

        ft.tcp_update(idx, TCP_FLAG_SYN, 0);
        ft.tcp_update(idx, TCP_FLAG_SYN | TCP_FLAG_ACK, 0);
        assert_eq!(ft.get(idx).tcp_state, TcpState::Established);

        let f = ft.get_mut(idx);
        f.stats[0].pkts = 3;
        f.stats[0].bytes = 300;
        let flow_id = f.flow_id;

        let lifetime = tcp_lifetime(TcpState::Established);
        for now in 1..lifetime {
            assert_eq!(ft.expire(now), 0);
        }
        assert_eq!(ft.expire(lifetime), 1);

        assert_eq!(ft.len(), 0);
        assert_eq!(ft.hash_chain_len(h), 0);
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.session_index, 7);
        assert_eq!(msg.flow_id, flow_id);
        assert_eq!(msg.initiator.pkts, 3);
        assert_eq!(msg.initiator.bytes, 300);
    }

    #[test]
    fn state_change_reparks_the_timer() {
        let (mut ft, _rx) = table(1024);
        let (s, h) = sig(3, 4, 5555);
        let (idx, _) = ft.lookup_or_create(&s, h, 0, 0).unwrap();

        // Default lifetime would expire at 60; the established state pushes
        // the flow out to 300.
        ft.tcp_update(idx, TCP_FLAG_SYN, 0);
        ft.tcp_update(idx, TCP_FLAG_SYN | TCP_FLAG_ACK, 0);

        for now in 1..=TIMER_DEFAULT_LIFETIME + 1 {
            ft.expire(now);
        }
        assert_eq!(ft.len(), 1);
    }

    #[test]
    fn recycle_force_expires_the_oldest_flow() {
        let (mut ft, mut rx) = table(1);
        let (s1, h1) = sig(1, 2, 1000);
        let (i1, _) = ft.lookup_or_create(&s1, h1, 0, 3).unwrap();
        let id1 = ft.get(i1).flow_id;

        let (s2, h2) = sig(1, 2, 2000);
        let (i2, created) = ft.lookup_or_create(&s2, h2, 5, 3).unwrap();
        assert!(created);
        assert!(ft.get(i2).flow_id > id1);
        assert_eq!(ft.len(), 1);
        assert_eq!(rx.try_recv().unwrap().flow_id, id1);
    }

    #[test]
    fn exhausted_budget_with_empty_wheel_is_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let budget = FlowBudget::new(1);
        let lifetime = Arc::new(AtomicU32::new(TIMER_DEFAULT_LIFETIME));
        let mut holder = FlowTable::new(budget.clone(), tx.clone(), lifetime.clone());
        let mut starved = FlowTable::new(budget, tx, lifetime);

        let (s1, h1) = sig(1, 2, 1000);
        holder.lookup_or_create(&s1, h1, 0, 0).unwrap();

        let (s2, h2) = sig(3, 4, 2000);
        assert!(matches!(
            starved.lookup_or_create(&s2, h2, 0, 0),
            Err(Error::ResourceExhausted)
        ));
    }

    #[test]
    fn colliding_hashes_share_a_chain_until_both_expire() {
        let (mut ft, _rx) = table(1024);
        let (s1, _) = sig(1, 2, 1000);
        let (s2, _) = sig(1, 2, 2000);
        let shared = 0xdead_beef;

        let (i1, _) = ft.lookup_or_create(&s1, shared, 0, 0).unwrap();
        let (i2, _) = ft.lookup_or_create(&s2, shared, 0, 0).unwrap();
        assert_ne!(i1, i2);
        assert_eq!(ft.hash_chain_len(shared), 2);

        // Lookup through the shared chain still separates the tuples.
        let (again, created) = ft.lookup_or_create(&s1, shared, 0, 0).unwrap();
        assert!(!created);
        assert_eq!(again, i1);

        for now in 1..=TIMER_DEFAULT_LIFETIME {
            ft.expire(now);
        }
        assert_eq!(ft.hash_chain_len(shared), 0);
        assert!(ft.is_empty());
    }

    #[test]
    fn expire_cap_leftovers_are_spliced_into_the_next_slot() {
        let (mut ft, _rx) = table(1024);
        ft.expire(0);

        // More flows in one slot than a single pass may expire.
        let n = TIMER_MAX_EXPIRE + 4;
        for port in 0..n as u16 {
            let (s, h) = sig(1, 2, 3000 + port);
            ft.lookup_or_create(&s, h, 0, 0).unwrap();
        }

        assert_eq!(ft.expire(TIMER_DEFAULT_LIFETIME), TIMER_MAX_EXPIRE);
        assert_eq!(ft.len(), n - TIMER_MAX_EXPIRE);

        // The survivors moved with the slot change and drain next pass.
        assert_eq!(ft.expire(TIMER_DEFAULT_LIFETIME + 1), n - TIMER_MAX_EXPIRE);
        assert!(ft.is_empty());
    }
}
