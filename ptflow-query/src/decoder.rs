//! The query decoder: a stream processor over trace packets.
//!
//! The decoder always looks one packet ahead. The [`Status`] returned by
//! every public operation reflects what the next packet implies, and
//! re-querying [`status`][QueryDecoder::status] without advancing returns
//! the same answer.
//!
//! Asynchronous facts arrive out-of-line in the packet stream: the
//! informing packet (MODE, PIP, OVF, FUP) enqueues a skeleton event under
//! its binding, and the binding packet (TIP family, FUP, or the end of a
//! boundary sequence) supplies the missing IP and releases the event.

use ptflow_codec::{
    Checkpoint as PacketCheckpoint, Config, DecodeUnknown, Error, NoUnknown, Packet, PacketDecoder,
    Result, TargetIp,
};

use crate::{
    event::{Event, EventKind},
    evq::{EventQueue, EventQueues},
    last_ip::LastIp,
    tnt::TntCache,
};

/// Decoder status flags.
///
/// The flags accompany every successful query as a bit-vector view of the
/// decoder's lookahead: whether an event is pending, whether the current
/// IP is suppressed, and whether the next read hits the end of the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    /// Calling [`QueryDecoder::event`] now will deliver an event.
    pub event_pending: bool,
    /// The most recent IP payload was suppressed; the current IP is not
    /// valid.
    pub ip_suppressed: bool,
    /// The next packet read reaches the end of the trace buffer.
    pub eos: bool,
}

impl Status {
    pub const EVENT_PENDING: u32 = 1 << 0;
    pub const IP_SUPPRESSED: u32 = 1 << 1;
    pub const EOS: u32 = 1 << 2;

    /// The wire-stable bit-vector presentation of the flags.
    #[must_use]
    pub const fn to_bits(self) -> u32 {
        (self.event_pending as u32 * Self::EVENT_PENDING)
            | (self.ip_suppressed as u32 * Self::IP_SUPPRESSED)
            | (self.eos as u32 * Self::EOS)
    }
}

/// Saved decoder state for transactional queries.
///
/// Embedding decoders take a checkpoint before a sequence of queries and
/// restore it when the sequence fails as a whole.
#[derive(Clone, Copy)]
pub struct Checkpoint {
    pkt: PacketCheckpoint,
    ip: LastIp,
    tnt: TntCache,
    evq: EventQueues,
    ready: EventQueue,
    tsc: Option<u64>,
    cbr: Option<u8>,
    synced: bool,
    tracing: Option<bool>,
    ip_suppressed: bool,
}

/// Streaming decoder answering control-flow queries over a trace buffer.
///
/// The decoder must be synchronized onto a packet stream boundary before
/// queries are possible. On any failing operation the decoder state is
/// exactly as before the call, so callers can drain events and retry or
/// resynchronize.
#[derive(Debug)]
pub struct QueryDecoder<'a, U = NoUnknown> {
    pkt: PacketDecoder<'a, U>,
    ip: LastIp,
    tnt: TntCache,
    /// Pending skeleton events, per binding
    evq: EventQueues,
    /// Materialized events awaiting delivery, in materialization order
    ready: EventQueue,
    tsc: Option<u64>,
    cbr: Option<u8>,
    synced: bool,
    /// Packet generation state as far as the stream has told us
    tracing: Option<bool>,
    ip_suppressed: bool,
}

impl<'a, U: DecodeUnknown> QueryDecoder<'a, U> {
    /// Create a query decoder over `config`'s trace buffer.
    ///
    /// The decoder needs to be synchronized before it can be used.
    #[must_use]
    pub fn new(config: Config<'a, U>) -> Self {
        Self {
            pkt: PacketDecoder::new(config),
            ip: LastIp::new(),
            tnt: TntCache::new(),
            evq: EventQueues::new(),
            ready: EventQueue::new(),
            tsc: None,
            cbr: None,
            synced: false,
            tracing: None,
            ip_suppressed: false,
        }
    }

    /// Synchronize onto the next packet stream boundary and process the
    /// boundary packet sequence.
    ///
    /// On success, provides the IP at the synchronization point when the
    /// stream carried one; events collected from the boundary sequence
    /// are pending afterwards. [`Error::Eos`] when no further boundary
    /// exists.
    pub fn sync_forward(&mut self) -> Result<(Option<u64>, Status)> {
        self.reset();
        self.pkt.sync_forward()?;
        self.start()
    }

    /// Synchronize onto the previous packet stream boundary.
    pub fn sync_backward(&mut self) -> Result<(Option<u64>, Status)> {
        self.reset();
        self.pkt.sync_backward()?;
        self.start()
    }

    /// Synchronize onto the packet stream boundary at `offset`.
    ///
    /// [`Error::Nosync`] when there is no boundary at `offset`.
    pub fn sync_set(&mut self, offset: u64) -> Result<(Option<u64>, Status)> {
        self.reset();
        self.pkt.sync_set(offset)?;
        self.start()
    }

    /// Query whether the next conditional branch was taken.
    ///
    /// Refills the taken/not-taken cache from the stream when it is
    /// empty, consuming timing and event-informing packets on the way.
    /// [`Error::BadQuery`] when the stream holds no outcome for a
    /// conditional branch.
    pub fn cond_branch(&mut self) -> Result<(bool, Status)> {
        self.transact(Self::cond_branch_inner)
    }

    /// Query the destination of the next indirect branch.
    ///
    /// `None` with the `ip_suppressed` status flag when the destination
    /// is out of context. [`Error::BadQuery`] when the stream holds no
    /// indirect branch target.
    pub fn indirect_branch(&mut self) -> Result<(Option<u64>, Status)> {
        self.transact(Self::indirect_branch_inner)
    }

    /// Query the next pending event.
    ///
    /// Advances the stream until an event materializes when none is
    /// pending. [`Error::BadQuery`] when the next packet is not
    /// event-producing.
    pub fn event(&mut self) -> Result<(Event, Status)> {
        self.transact(Self::event_inner)
    }

    /// The current status flags, without advancing the decoder.
    pub fn status(&mut self) -> Result<Status> {
        self.status_inner()
    }

    /// Whether a conditional-branch outcome is immediately available,
    /// from the cache or the next packet.
    pub fn cond_pending(&mut self) -> Result<bool> {
        if !self.tnt.is_empty() {
            return Ok(true);
        }
        Ok(matches!(
            self.peek()?,
            Some(Packet::Tnt8(_) | Packet::Tnt64(_))
        ))
    }

    /// The current time, as the last timestamp-counter packet reported
    /// it. [`Error::NoTime`] before the first TSC packet.
    pub fn time(&self) -> Result<u64> {
        self.tsc.ok_or(Error::NoTime)
    }

    /// The current core:bus ratio. [`Error::NoCbr`] before the first CBR
    /// packet.
    pub fn core_bus_ratio(&self) -> Result<u8> {
        self.cbr.ok_or(Error::NoCbr)
    }

    /// The current decoder position in the trace buffer.
    pub fn offset(&self) -> Result<u64> {
        self.pkt.offset()
    }

    /// The position of the last synchronization point.
    pub fn sync_offset(&self) -> Result<u64> {
        self.pkt.sync_offset()
    }

    fn reset(&mut self) {
        self.ip = LastIp::new();
        self.tnt.clear();
        self.evq = EventQueues::new();
        self.ready = EventQueue::new();
        self.tsc = None;
        self.cbr = None;
        self.synced = false;
        self.tracing = None;
        self.ip_suppressed = false;
    }

    /// Process the boundary packet sequence at the fresh sync point.
    ///
    /// On failure the decoder stays unsynchronized; the packet cursor
    /// keeps the rejected sync point so another `sync_forward` searches
    /// behind it.
    fn start(&mut self) -> Result<(Option<u64>, Status)> {
        self.synced = true;
        let outcome = (|| {
            match self.peek()? {
                Some(packet @ Packet::Psb) => self.read_psb_plus(&packet)?,
                _ => return Err(Error::Internal),
            }
            let ip = self.ip.query().ok();
            let status = self.status_inner()?;
            Ok((ip, status))
        })();
        if outcome.is_err() {
            self.reset();
        }
        outcome
    }

    /// Save the complete decoder state.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            pkt: self.pkt.checkpoint(),
            ip: self.ip,
            tnt: self.tnt,
            evq: self.evq,
            ready: self.ready,
            tsc: self.tsc,
            cbr: self.cbr,
            synced: self.synced,
            tracing: self.tracing,
            ip_suppressed: self.ip_suppressed,
        }
    }

    /// Roll the decoder back to a previously saved state.
    pub fn restore(&mut self, saved: Checkpoint) {
        self.pkt.restore(saved.pkt);
        self.ip = saved.ip;
        self.tnt = saved.tnt;
        self.evq = saved.evq;
        self.ready = saved.ready;
        self.tsc = saved.tsc;
        self.cbr = saved.cbr;
        self.synced = saved.synced;
        self.tracing = saved.tracing;
        self.ip_suppressed = saved.ip_suppressed;
    }

    /// Run a query; on any failure the decoder state is rolled back to
    /// the state before the call.
    fn transact<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<(T, Status)> {
        let saved = self.checkpoint();
        let outcome = self.attempt(op);
        if outcome.is_err() {
            self.restore(saved);
        }
        outcome
    }

    fn attempt<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<(T, Status)> {
        let value = op(self)?;
        let status = self.status_inner()?;
        Ok((value, status))
    }

    fn peek(&mut self) -> Result<Option<Packet<'a>>> {
        if !self.synced {
            return Err(Error::Nosync);
        }
        match self.pkt.peek() {
            Ok(packet) => Ok(Some(packet)),
            Err(Error::Eos) => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn status_inner(&mut self) -> Result<Status> {
        let next = self.peek()?;
        let event_pending = !self.ready.is_empty()
            || match next {
                Some(
                    Packet::TipPge(_)
                    | Packet::TipPgd(_)
                    | Packet::Fup(_)
                    | Packet::Ovf
                    | Packet::ModeExec(_)
                    | Packet::ModeTsx(_)
                    | Packet::Pip(_),
                ) => true,
                Some(Packet::Tip(_)) => !self.evq.tip.is_empty(),
                _ => false,
            };
        Ok(Status {
            event_pending,
            ip_suppressed: self.ip_suppressed,
            eos: next.is_none(),
        })
    }

    fn errata(&self) -> ptflow_codec::Errata {
        self.pkt.config().errata()
    }

    /// Consume packets every query tolerates: padding, timing, boundary
    /// sequences, and packets that merely inform a later event.
    ///
    /// Returns whether the packet was consumed.
    fn process_ambient(&mut self, packet: &Packet<'a>) -> Result<bool> {
        match packet {
            Packet::Pad | Packet::Unknown(_) => self.pkt.consume(packet),
            Packet::Tsc(tsc) => {
                self.tsc = Some(tsc.tsc);
                self.pkt.consume(packet);
            }
            Packet::Cbr(cbr) => {
                self.cbr = Some(cbr.ratio);
                self.pkt.consume(packet);
            }
            Packet::ModeExec(mode) => {
                self.evq.tip.enqueue(Event::new(EventKind::ExecMode {
                    mode: mode.exec_mode(),
                    ip: 0,
                }))?;
                self.pkt.consume(packet);
            }
            Packet::ModeTsx(mode) => {
                self.evq.fup.enqueue(Event::new(EventKind::Tsx {
                    ip: 0,
                    speculative: mode.intx,
                    aborted: mode.abrt,
                }))?;
                self.pkt.consume(packet);
            }
            Packet::Pip(pip) => {
                self.evq.fup.enqueue(Event::new(EventKind::AsyncPaging {
                    cr3: pip.cr3,
                    ip: 0,
                }))?;
                self.pkt.consume(packet);
            }
            Packet::Psb => self.read_psb_plus(packet)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Read a boundary packet sequence: PSB through PSBEND.
    ///
    /// State packets inside the sequence become status-update events
    /// bound to the sequence end; the FUP carries the IP at the sync
    /// point.
    fn read_psb_plus(&mut self, psb: &Packet<'a>) -> Result<()> {
        self.pkt.consume(psb);
        loop {
            let Some(packet) = self.peek()? else {
                return Err(Error::Eos);
            };
            match packet {
                Packet::PsbEnd => {
                    while let Some(mut event) = self.evq.psbend.dequeue() {
                        self.finish_status_event(&mut event);
                        self.ready.enqueue(event)?;
                    }
                    self.pkt.consume(&packet);
                    return Ok(());
                }
                Packet::Pad | Packet::Unknown(_) => self.pkt.consume(&packet),
                Packet::Tsc(tsc) => {
                    self.tsc = Some(tsc.tsc);
                    self.pkt.consume(&packet);
                }
                Packet::Cbr(cbr) => {
                    self.cbr = Some(cbr.ratio);
                    self.pkt.consume(&packet);
                }
                Packet::Fup(target) => {
                    self.check_bdm70()?;
                    self.ip_suppressed = self.ip.update(&target).is_none();
                    self.pkt.consume(&packet);
                }
                Packet::ModeExec(mode) => {
                    self.check_bdm70()?;
                    self.evq
                        .psbend
                        .enqueue(Event::status_update(EventKind::ExecMode {
                            mode: mode.exec_mode(),
                            ip: 0,
                        }))?;
                    self.pkt.consume(&packet);
                }
                Packet::ModeTsx(mode) => {
                    self.evq
                        .psbend
                        .enqueue(Event::status_update(EventKind::Tsx {
                            ip: 0,
                            speculative: mode.intx,
                            aborted: mode.abrt,
                        }))?;
                    self.pkt.consume(&packet);
                }
                Packet::Pip(pip) => {
                    self.evq
                        .psbend
                        .enqueue(Event::status_update(EventKind::Paging { cr3: pip.cr3 }))?;
                    self.pkt.consume(&packet);
                }
                Packet::Ovf => {
                    // Overflow aborts the boundary sequence.
                    self.evq.psbend.discard_all();
                    return self.process_overflow(&packet);
                }
                _ => return Err(Error::BadContext),
            }
        }
    }

    /// Packets only expected between enable and disable must not show up
    /// in a boundary sequence while tracing is off, unless the BDM70
    /// workaround is active.
    fn check_bdm70(&self) -> Result<()> {
        if self.tracing == Some(false) && !self.errata().bdm70 {
            return Err(Error::BadContext);
        }
        Ok(())
    }

    fn finish_status_event(&mut self, event: &mut Event) {
        match &mut event.kind {
            EventKind::ExecMode { ip, .. } | EventKind::Tsx { ip, .. } => {
                if let Ok(current) = self.ip.query() {
                    *ip = current;
                } else {
                    event.ip_suppressed = true;
                }
            }
            _ => {}
        }
        event.tsc = self.tsc;
    }

    /// Complete a skeleton event with the IP its binding packet supplied
    /// and hand it over for delivery.
    fn complete(&mut self, mut event: Event, ip: Option<u64>) -> Result<()> {
        let slot = match &mut event.kind {
            EventKind::AsyncBranch { to, .. } => Some(to),
            EventKind::ExecMode { ip, .. }
            | EventKind::Tsx { ip, .. }
            | EventKind::AsyncPaging { ip, .. }
            | EventKind::Overflow { ip } => Some(ip),
            _ => None,
        };
        if let Some(slot) = slot {
            if let Some(ip) = ip {
                *slot = ip;
            } else {
                event.ip_suppressed = true;
            }
        }
        event.tsc = self.tsc;
        self.ready.enqueue(event)
    }

    fn deliver(&mut self, mut event: Event, ip: Option<u64>) -> Result<()> {
        if ip.is_none() {
            event.ip_suppressed = true;
        }
        event.tsc = self.tsc;
        self.ready.enqueue(event)
    }

    /// An overflow drops lost state and re-arms on the resuming FUP.
    fn process_overflow(&mut self, packet: &Packet<'a>) -> Result<()> {
        self.tnt.clear();
        self.evq.discard_transient();
        self.evq
            .fup
            .enqueue(Event::new(EventKind::Overflow { ip: 0 }))?;
        self.pkt.consume(packet);
        Ok(())
    }

    fn process_fup(&mut self, packet: &Packet<'a>, target: &TargetIp) -> Result<()> {
        let ip = self.ip.update(target);
        self.ip_suppressed = ip.is_none();
        if self.evq.fup.is_empty() {
            // An asynchronous branch begins here; the destination
            // arrives with the next TIP.
            let Some(from) = ip else {
                return Err(Error::BadPacket);
            };
            self.evq
                .tip
                .enqueue(Event::new(EventKind::AsyncBranch { from, to: 0 }))?;
        } else {
            while let Some(event) = self.evq.fup.dequeue() {
                self.complete(event, ip)?;
            }
        }
        self.pkt.consume(packet);
        Ok(())
    }

    fn process_tip_pge(&mut self, packet: &Packet<'a>, target: &TargetIp) -> Result<()> {
        let ip = self.ip.update(target);
        self.ip_suppressed = ip.is_none();
        self.tracing = Some(true);
        self.deliver(
            Event::new(EventKind::Enabled {
                ip: ip.unwrap_or(0),
            }),
            ip,
        )?;
        while let Some(event) = self.evq.tip.dequeue() {
            self.complete(event, ip)?;
        }
        self.pkt.consume(packet);
        Ok(())
    }

    fn process_tip_pgd(&mut self, packet: &Packet<'a>, target: &TargetIp) -> Result<()> {
        let ip = self.ip.update(target);
        self.ip_suppressed = ip.is_none();
        self.tracing = Some(false);
        let mut async_disable = false;
        while let Some(mut event) = self.evq.tip.dequeue() {
            if let EventKind::AsyncBranch { from, .. } = event.kind {
                // The branch did not complete; tracing was disabled on
                // the way.
                event.kind = EventKind::AsyncDisabled {
                    at: from,
                    ip: ip.unwrap_or(0),
                };
                self.deliver(event, ip)?;
                async_disable = true;
            } else {
                self.complete(event, ip)?;
            }
        }
        if !async_disable {
            self.deliver(
                Event::new(EventKind::Disabled {
                    ip: ip.unwrap_or(0),
                }),
                ip,
            )?;
        }
        self.pkt.consume(packet);
        Ok(())
    }

    /// Resolve pending tip-bound events against a TIP packet.
    ///
    /// Returns whether the packet was handled. The packet is consumed
    /// only when it belonged to an asynchronous branch; otherwise it
    /// stays in the stream to answer an indirect-branch query.
    fn process_tip_for_events(&mut self, packet: &Packet<'a>, target: &TargetIp) -> Result<bool> {
        if self.evq.tip.is_empty() {
            // BDM64: discard the bogus branch target recorded ahead of a
            // transactional abort.
            if self.errata().bdm64
                && self
                    .evq
                    .fup
                    .any(|event| matches!(event.kind, EventKind::Tsx { aborted: true, .. }))
            {
                self.pkt.consume(packet);
                return Ok(true);
            }
            return Ok(false);
        }
        let ip = self.ip.update(target);
        self.ip_suppressed = ip.is_none();
        let mut consumed_by_branch = false;
        while let Some(event) = self.evq.tip.dequeue() {
            if matches!(event.kind, EventKind::AsyncBranch { .. }) {
                consumed_by_branch = true;
            }
            self.complete(event, ip)?;
        }
        if consumed_by_branch {
            self.pkt.consume(packet);
        }
        Ok(true)
    }

    fn event_inner(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.ready.dequeue() {
                log::trace!("event: {event:x?}");
                return Ok(event);
            }
            let Some(packet) = self.peek()? else {
                return Err(Error::BadQuery);
            };
            if self.process_ambient(&packet)? {
                continue;
            }
            match packet {
                Packet::Ovf => self.process_overflow(&packet)?,
                Packet::Fup(target) => self.process_fup(&packet, &target)?,
                Packet::TipPge(target) => self.process_tip_pge(&packet, &target)?,
                Packet::TipPgd(target) => self.process_tip_pgd(&packet, &target)?,
                Packet::Tip(target) => {
                    if !self.process_tip_for_events(&packet, &target)? {
                        return Err(Error::BadQuery);
                    }
                }
                Packet::PsbEnd => return Err(Error::BadContext),
                _ => return Err(Error::BadQuery),
            }
        }
    }

    fn cond_branch_inner(&mut self) -> Result<bool> {
        loop {
            if let Some(taken) = self.tnt.pop_front() {
                return Ok(taken);
            }
            let Some(packet) = self.peek()? else {
                return Err(Error::BadQuery);
            };
            if self.process_ambient(&packet)? {
                continue;
            }
            match packet {
                Packet::Tnt8(tnt) | Packet::Tnt64(tnt) => {
                    self.tnt.append(&tnt)?;
                    self.pkt.consume(&packet);
                }
                Packet::PsbEnd => return Err(Error::BadContext),
                _ => return Err(Error::BadQuery),
            }
        }
    }

    fn indirect_branch_inner(&mut self) -> Result<Option<u64>> {
        loop {
            let Some(packet) = self.peek()? else {
                return Err(Error::BadQuery);
            };
            if self.process_ambient(&packet)? {
                continue;
            }
            match packet {
                Packet::Tip(target) => {
                    if self
                        .evq
                        .tip
                        .any(|event| matches!(event.kind, EventKind::AsyncBranch { .. }))
                    {
                        // The target belongs to an asynchronous branch
                        // event, not to this query.
                        return Err(Error::BadQuery);
                    }
                    let ip = self.ip.update(&target);
                    self.ip_suppressed = ip.is_none();
                    while let Some(event) = self.evq.tip.dequeue() {
                        self.complete(event, ip)?;
                    }
                    self.pkt.consume(&packet);
                    return Ok(ip);
                }
                Packet::PsbEnd => return Err(Error::BadContext),
                _ => return Err(Error::BadQuery),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptflow_codec::{
        Cbr, Encoder, Errata, ExecMode, IpCompression, ModeExec, ModeTsx, Pip, Tnt, Tsc,
    };

    fn encode(packets: &[Packet<'_>]) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let mut encoder = Encoder::new(&mut buf);
        let mut len = 0;
        for packet in packets {
            len += encoder.next(packet).unwrap();
        }
        buf.truncate(len);
        buf
    }

    fn sext48(payload: u64) -> TargetIp {
        TargetIp {
            compression: IpCompression::Sext48,
            ip: payload,
        }
    }

    fn update16(payload: u64) -> TargetIp {
        TargetIp {
            compression: IpCompression::Update16,
            ip: payload,
        }
    }

    fn mode64() -> ModeExec {
        ModeExec {
            csl: true,
            csd: false,
        }
    }

    #[test]
    fn empty_trace_reports_eos() {
        let mut decoder = QueryDecoder::new(Config::new(&[]));
        assert_eq!(decoder.sync_forward().unwrap_err(), Error::Eos);
        assert_eq!(Error::Eos.code(), -7);
    }

    #[test]
    fn lone_boundary_has_no_events() {
        let buf = encode(&[Packet::Psb, Packet::PsbEnd]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        let (ip, status) = decoder.sync_forward().unwrap();
        assert_eq!(ip, None);
        assert!(status.eos);
        assert!(!status.event_pending);
        assert_eq!(decoder.event().unwrap_err(), Error::BadQuery);
    }

    #[test]
    fn cond_branches_pop_in_trace_order() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::Tnt8(Tnt {
                bits: 0b101,
                count: 3,
            }),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();

        assert_eq!(decoder.cond_branch().unwrap().0, true);
        assert_eq!(decoder.cond_branch().unwrap().0, false);
        let (taken, status) = decoder.cond_branch().unwrap();
        assert_eq!(taken, true);
        assert!(status.eos);
        assert_eq!(decoder.cond_branch().unwrap_err(), Error::BadQuery);
    }

    #[test]
    fn indirect_branch_sign_extends() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::Tip(sext48(0xffff_ffff_8000)),
            Packet::Tip(update16(0x1234)),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();

        let (ip, _) = decoder.indirect_branch().unwrap();
        assert_eq!(ip, Some(0xffff_ffff_ffff_8000));

        // The narrow update carries the sign-extended upper bits over.
        let (ip, _) = decoder.indirect_branch().unwrap();
        assert_eq!(ip, Some(0xffff_ffff_ffff_1234));
    }

    #[test]
    fn suppressed_indirect_branch_sets_the_flag() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::Tip(TargetIp::suppressed()),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();

        let (ip, status) = decoder.indirect_branch().unwrap();
        assert_eq!(ip, None);
        assert!(status.ip_suppressed);
    }

    #[test]
    fn mode_binds_to_the_next_tip() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::ModeExec(mode64()),
            Packet::Tip(sext48(0x40_0000)),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        let (_, status) = decoder.sync_forward().unwrap();
        assert!(status.event_pending);

        let (event, _) = decoder.event().unwrap();
        assert_eq!(
            event.kind,
            EventKind::ExecMode {
                mode: ExecMode::Mode64,
                ip: 0x40_0000,
            }
        );
        assert!(!event.status_update);

        // The same TIP still answers the indirect-branch query.
        let (ip, _) = decoder.indirect_branch().unwrap();
        assert_eq!(ip, Some(0x40_0000));
    }

    #[test]
    fn overflow_rearms_on_the_resuming_fup() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::Tnt8(Tnt {
                bits: 0b1,
                count: 1,
            }),
            Packet::Ovf,
            Packet::Fup(sext48(0x50_0000)),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();
        // Fill the cache, then lose it to the overflow.
        decoder.cond_branch().unwrap();

        let (event, _) = decoder.event().unwrap();
        assert_eq!(event.kind, EventKind::Overflow { ip: 0x50_0000 });
        assert!(!decoder.cond_pending().unwrap());
        assert_eq!(decoder.cond_branch().unwrap_err(), Error::BadQuery);
    }

    #[test]
    fn boundary_sequence_yields_status_events() {
        let buf = encode(&[
            Packet::Psb,
            Packet::Tsc(Tsc { tsc: 0x1000 }),
            Packet::Cbr(Cbr { ratio: 0x26 }),
            Packet::Fup(sext48(0x40_0000)),
            Packet::ModeExec(mode64()),
            Packet::Pip(Pip { cr3: 0x5000_0000 }),
            Packet::PsbEnd,
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        let (ip, status) = decoder.sync_forward().unwrap();
        assert_eq!(ip, Some(0x40_0000));
        assert!(status.event_pending);
        assert_eq!(decoder.time(), Ok(0x1000));
        assert_eq!(decoder.core_bus_ratio(), Ok(0x26));

        let (mode_event, _) = decoder.event().unwrap();
        assert_eq!(
            mode_event.kind,
            EventKind::ExecMode {
                mode: ExecMode::Mode64,
                ip: 0x40_0000,
            }
        );
        assert!(mode_event.status_update);
        assert_eq!(mode_event.tsc, Some(0x1000));

        let (paging_event, status) = decoder.event().unwrap();
        assert_eq!(paging_event.kind, EventKind::Paging { cr3: 0x5000_0000 });
        assert!(paging_event.status_update);
        assert!(!status.event_pending);
    }

    #[test]
    fn enable_and_disable_round() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::ModeExec(mode64()),
            Packet::TipPge(sext48(0x40_0000)),
            Packet::TipPgd(TargetIp::suppressed()),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();

        let (enabled, status) = decoder.event().unwrap();
        assert_eq!(enabled.kind, EventKind::Enabled { ip: 0x40_0000 });
        assert!(status.event_pending);

        let (mode_event, _) = decoder.event().unwrap();
        assert_eq!(
            mode_event.kind,
            EventKind::ExecMode {
                mode: ExecMode::Mode64,
                ip: 0x40_0000,
            }
        );

        let (disabled, status) = decoder.event().unwrap();
        assert!(matches!(disabled.kind, EventKind::Disabled { .. }));
        assert!(disabled.ip_suppressed);
        assert!(status.eos);
    }

    #[test]
    fn fup_tip_pair_is_an_async_branch() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::Fup(sext48(0x40_0100)),
            Packet::Tip(sext48(0x40_0200)),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();

        let (event, status) = decoder.event().unwrap();
        assert_eq!(
            event.kind,
            EventKind::AsyncBranch {
                from: 0x40_0100,
                to: 0x40_0200,
            }
        );
        // The TIP was consumed by the branch event.
        assert!(status.eos);
    }

    #[test]
    fn fup_pgd_pair_is_an_async_disable() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::Fup(sext48(0x40_0100)),
            Packet::TipPgd(sext48(0x40_0200)),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();

        let (event, _) = decoder.event().unwrap();
        assert_eq!(
            event.kind,
            EventKind::AsyncDisabled {
                at: 0x40_0100,
                ip: 0x40_0200,
            }
        );
    }

    #[test]
    fn paging_binds_to_the_next_fup() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::Pip(Pip { cr3: 0x7000_0000 }),
            Packet::Fup(sext48(0x40_0300)),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();

        let (event, _) = decoder.event().unwrap();
        assert_eq!(
            event.kind,
            EventKind::AsyncPaging {
                cr3: 0x7000_0000,
                ip: 0x40_0300,
            }
        );
    }

    #[test]
    fn bdm64_discards_the_bogus_abort_target() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::ModeTsx(ModeTsx {
                intx: false,
                abrt: true,
            }),
            Packet::Tip(sext48(0xdead)),
            Packet::Fup(sext48(0x40_0400)),
        ]);
        let config = Config::new(&buf).with_errata(Errata {
            bdm70: false,
            bdm64: true,
        });
        let mut decoder = QueryDecoder::new(config);
        decoder.sync_forward().unwrap();

        let (event, _) = decoder.event().unwrap();
        assert_eq!(
            event.kind,
            EventKind::Tsx {
                ip: 0x40_0400,
                speculative: false,
                aborted: true,
            }
        );
    }

    #[test]
    fn strict_boundary_set_without_bdm70() {
        let disabled_then_psb = [
            Packet::Psb,
            Packet::PsbEnd,
            Packet::TipPge(sext48(0x40_0000)),
            Packet::TipPgd(sext48(0x40_0010)),
            Packet::Psb,
            Packet::Fup(sext48(0x40_0000)),
            Packet::ModeExec(mode64()),
            Packet::PsbEnd,
        ];
        let buf = encode(&disabled_then_psb);

        let mut strict = QueryDecoder::new(Config::new(&buf));
        strict.sync_forward().unwrap();
        strict.event().unwrap();
        strict.event().unwrap();
        assert_eq!(strict.event().unwrap_err(), Error::BadContext);

        let config = Config::new(&buf).with_errata(Errata {
            bdm70: true,
            bdm64: false,
        });
        let mut tolerant = QueryDecoder::new(config);
        tolerant.sync_forward().unwrap();
        tolerant.event().unwrap();
        tolerant.event().unwrap();
        let (event, _) = tolerant.event().unwrap();
        assert!(matches!(event.kind, EventKind::ExecMode { .. }));
        assert!(event.status_update);
    }

    #[test]
    fn failed_queries_leave_the_decoder_unchanged() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::ModeExec(mode64()),
            Packet::Tip(sext48(0x40_0000)),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();
        let offset = decoder.offset().unwrap();

        // No conditional branch in this stream; the attempt consumed the
        // MODE packet internally but rolls everything back.
        assert_eq!(decoder.cond_branch().unwrap_err(), Error::BadQuery);
        assert_eq!(decoder.offset(), Ok(offset));

        let (event, _) = decoder.event().unwrap();
        assert!(matches!(event.kind, EventKind::ExecMode { .. }));
    }

    #[test]
    fn status_requery_is_stable() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::Tnt8(Tnt {
                bits: 0b10,
                count: 2,
            }),
            Packet::TipPgd(TargetIp::suppressed()),
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        let (_, status) = decoder.sync_forward().unwrap();
        assert_eq!(decoder.status().unwrap(), status);

        let (_, status) = decoder.cond_branch().unwrap();
        assert_eq!(decoder.status().unwrap(), status);
        assert_eq!(decoder.status().unwrap(), status);
    }

    #[test]
    fn forward_sync_walks_every_boundary() {
        let buf = encode(&[
            Packet::Psb,
            Packet::PsbEnd,
            Packet::Pad,
            Packet::Psb,
            Packet::PsbEnd,
        ]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.sync_offset(), Ok(0));
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.sync_offset(), Ok(19));
        assert_eq!(decoder.sync_forward().unwrap_err(), Error::Eos);
    }

    #[test]
    fn sync_set_requires_a_boundary() {
        let buf = encode(&[Packet::Pad, Packet::Psb, Packet::PsbEnd]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        assert_eq!(decoder.sync_set(0).unwrap_err(), Error::Nosync);
        let (ip, _) = decoder.sync_set(1).unwrap();
        assert_eq!(ip, None);
    }

    #[test]
    fn time_is_unknown_before_the_first_tsc() {
        let buf = encode(&[Packet::Psb, Packet::PsbEnd]);
        let mut decoder = QueryDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();
        assert_eq!(decoder.time(), Err(Error::NoTime));
        assert_eq!(decoder.core_bus_ratio(), Err(Error::NoCbr));
    }
}
