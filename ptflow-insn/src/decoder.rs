//! The instruction-flow decoder: one record per executed instruction.
//!
//! The decoder drives the query decoder and a traced memory image in
//! lockstep. It prefetches one event at a time from the query layer and
//! binds it to an instruction boundary: events carrying an IP wait until
//! decoding reaches that IP, a synchronous disable waits for the control
//! transfer that caused it, and everything else applies as it arrives.
//! Within an instruction the IP advances according to the instruction's
//! class and the query answers.

use hashbrown::HashSet;

use ptflow_codec::{Config, DecodeUnknown, Error, ExecMode, NoUnknown, Result};
use ptflow_query::{Event, EventKind, QueryDecoder, Status};

use crate::{
    classify::{Classified, InsnClass, classify},
    image::{Asid, Image, NO_CR3},
    retstack::RetStack,
};

/// Longest x86 instruction in bytes.
pub const MAX_INSN_LEN: usize = 15;

/// One executed instruction.
///
/// The flag bits attach trace events to the instruction boundary: flags
/// describing how execution reached the instruction (`enabled`,
/// `resumed`, `resynced`) and flags describing what happened right after
/// it (`disabled`, `interrupted`, `aborted`, `committed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    /// Virtual address of the instruction
    pub ip: u64,
    /// Execution mode the instruction ran in
    pub mode: ExecMode,
    pub class: InsnClass,
    /// Raw instruction bytes; only the first `len` are meaningful
    pub bytes: [u8; MAX_INSN_LEN],
    pub len: u8,
    /// Executed speculatively inside a transaction
    pub speculative: bool,
    /// The transaction aborted at this instruction
    pub aborted: bool,
    /// The transaction committed at this instruction
    pub committed: bool,
    /// Tracing was disabled after this instruction
    pub disabled: bool,
    /// Tracing was enabled at this instruction
    pub enabled: bool,
    /// Tracing resumed at the IP it was disabled at
    pub resumed: bool,
    /// An asynchronous branch interrupted execution after this
    /// instruction
    pub interrupted: bool,
    /// Decoding re-synchronized onto this instruction after an overflow
    pub resynced: bool,
}

impl Insn {
    /// The instruction's raw bytes.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// Flags collected from events for the next emitted instruction.
#[derive(Debug, Clone, Copy, Default)]
struct Carried {
    enabled: bool,
    resumed: bool,
    resynced: bool,
    aborted: bool,
    committed: bool,
}

/// Saved flow state for transactional `next` calls.
#[derive(Clone, Copy)]
struct Saved {
    query: ptflow_query::Checkpoint,
    pending: Option<Event>,
    asid: Asid,
    ip: u64,
    mode: ExecMode,
    enabled: bool,
    speculative: bool,
    retstack: RetStack,
    carry: Carried,
    last_disabled_ip: Option<u64>,
}

/// Reconstructs the executed instruction stream from a trace and a
/// traced memory image.
///
/// The image is borrowed for the decoder's lifetime and must not be
/// mutated while a decode is in progress.
#[derive(Debug)]
pub struct InsnDecoder<'a, U = NoUnknown> {
    query: QueryDecoder<'a, U>,
    image: &'a Image,
    /// Event prefetched from the query decoder, awaiting its boundary
    pending: Option<Event>,
    asid: Asid,
    ip: u64,
    mode: ExecMode,
    enabled: bool,
    speculative: bool,
    retstack: RetStack,
    carry: Carried,
    last_disabled_ip: Option<u64>,
    /// CR3 values already reported to the lazy-load hook
    reported_cr3: HashSet<u64>,
}

impl<'a, U: DecodeUnknown> InsnDecoder<'a, U> {
    /// Create an instruction-flow decoder over `config`'s trace buffer
    /// and the given image.
    ///
    /// The decoder needs to be synchronized before it can be used.
    #[must_use]
    pub fn new(config: Config<'a, U>, image: &'a Image) -> Self {
        Self {
            query: QueryDecoder::new(config),
            image,
            pending: None,
            asid: Asid::unknown(),
            ip: 0,
            mode: ExecMode::Unknown,
            enabled: false,
            speculative: false,
            retstack: RetStack::new(),
            carry: Carried::default(),
            last_disabled_ip: None,
            reported_cr3: HashSet::new(),
        }
    }

    /// Synchronize onto the next packet stream boundary.
    pub fn sync_forward(&mut self) -> Result<Status> {
        let (ip, status) = self.query.sync_forward()?;
        self.restart(ip);
        Ok(status)
    }

    /// Synchronize onto the previous packet stream boundary.
    pub fn sync_backward(&mut self) -> Result<Status> {
        let (ip, status) = self.query.sync_backward()?;
        self.restart(ip);
        Ok(status)
    }

    /// Synchronize onto the packet stream boundary at `offset`.
    pub fn sync_set(&mut self, offset: u64) -> Result<Status> {
        let (ip, status) = self.query.sync_set(offset)?;
        self.restart(ip);
        Ok(status)
    }

    /// Pin the address space the next lookups use, for traces that do
    /// not carry paging information.
    pub fn set_asid(&mut self, asid: Asid) {
        self.asid = asid;
    }

    #[must_use]
    pub fn asid(&self) -> Asid {
        self.asid
    }

    #[must_use]
    pub fn ip(&self) -> u64 {
        self.ip
    }

    #[must_use]
    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn time(&self) -> Result<u64> {
        self.query.time()
    }

    pub fn core_bus_ratio(&self) -> Result<u8> {
        self.query.core_bus_ratio()
    }

    pub fn offset(&self) -> Result<u64> {
        self.query.offset()
    }

    pub fn sync_offset(&self) -> Result<u64> {
        self.query.sync_offset()
    }

    /// Decode the next executed instruction.
    ///
    /// [`Error::Eos`] at the end of the trace; on any failure the
    /// decoder state is exactly as before the call.
    pub fn next(&mut self) -> Result<(Insn, Status)> {
        let saved = self.save();
        let outcome = self.next_inner();
        if outcome.is_err() {
            self.restore(saved);
        }
        outcome
    }

    fn restart(&mut self, ip: Option<u64>) {
        self.pending = None;
        self.retstack.clear();
        self.carry = Carried::default();
        self.speculative = false;
        self.mode = ExecMode::Unknown;
        self.last_disabled_ip = None;
        match ip {
            Some(ip) => {
                self.ip = ip;
                self.enabled = true;
            }
            None => {
                self.ip = 0;
                self.enabled = false;
            }
        }
    }

    fn save(&self) -> Saved {
        Saved {
            query: self.query.checkpoint(),
            pending: self.pending,
            asid: self.asid,
            ip: self.ip,
            mode: self.mode,
            enabled: self.enabled,
            speculative: self.speculative,
            retstack: self.retstack,
            carry: self.carry,
            last_disabled_ip: self.last_disabled_ip,
        }
    }

    fn restore(&mut self, saved: Saved) {
        self.query.restore(saved.query);
        self.pending = saved.pending;
        self.asid = saved.asid;
        self.ip = saved.ip;
        self.mode = saved.mode;
        self.enabled = saved.enabled;
        self.speculative = saved.speculative;
        self.retstack = saved.retstack;
        self.carry = saved.carry;
        self.last_disabled_ip = saved.last_disabled_ip;
    }

    fn next_inner(&mut self) -> Result<(Insn, Status)> {
        let mut carry = std::mem::take(&mut self.carry);

        // Events ahead of the instruction: wait for tracing to be
        // enabled and apply whatever binds to this boundary.
        loop {
            if !self.enabled {
                let event = self.await_event()?;
                self.pending = None;
                self.apply_event(&event, &mut carry, None)?;
                continue;
            }
            match self.peek_event()? {
                Some(event) if self.binds_here(&event, None) => {
                    self.pending = None;
                    self.apply_event(&event, &mut carry, None)?;
                }
                _ => break,
            }
        }

        let (mut insn, classified) = self.fetch()?;
        insn.speculative = self.speculative;
        insn.enabled = carry.enabled;
        insn.resumed = carry.resumed;
        insn.resynced = carry.resynced;
        insn.aborted = carry.aborted;
        insn.committed = carry.committed;

        self.step(&classified)?;

        // Events bound to the just-completed instruction.
        let mut next_carry = Carried::default();
        loop {
            let Some(event) = self.peek_event()? else {
                break;
            };
            if !self.binds_here(&event, Some(&insn)) {
                break;
            }
            self.pending = None;
            self.apply_event(&event, &mut next_carry, Some(&mut insn))?;
        }
        self.carry = next_carry;

        log::trace!("insn at {:#x}: {:?}", insn.ip, insn.class);
        let status = self.query.status()?;
        Ok((insn, status))
    }

    /// Prefetch the next event if one is immediately available.
    fn peek_event(&mut self) -> Result<Option<Event>> {
        if self.pending.is_none() && self.query.status()?.event_pending {
            match self.query.event() {
                Ok((event, _)) => self.pending = Some(event),
                Err(Error::BadQuery) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(self.pending)
    }

    /// Force the next event while tracing is disabled; the end of the
    /// stream surfaces as [`Error::Eos`].
    fn await_event(&mut self) -> Result<Event> {
        if let Some(event) = self.pending {
            return Ok(event);
        }
        match self.query.event() {
            Ok((event, _)) => Ok(event),
            Err(Error::BadQuery) if self.at_eos() => Err(Error::Eos),
            Err(error) => Err(error),
        }
    }

    fn at_eos(&mut self) -> bool {
        self.query
            .status()
            .map(|status| status.eos)
            .unwrap_or(false)
    }

    fn map_query_err(&mut self, error: Error) -> Error {
        if error == Error::BadQuery && self.at_eos() {
            Error::Eos
        } else {
            error
        }
    }

    /// Whether a prefetched event binds to the current boundary.
    ///
    /// `completed` is the just-decoded instruction when draining behind
    /// one, `None` ahead of the next instruction.
    fn binds_here(&self, event: &Event, completed: Option<&Insn>) -> bool {
        // While tracing is disabled, events apply as they arrive.
        if !self.enabled || event.status_update {
            return true;
        }
        match event.kind {
            EventKind::Enabled { .. } | EventKind::Overflow { .. } | EventKind::Paging { .. } => {
                true
            }
            // A synchronous disable is caused by a control transfer; it
            // binds behind the disabling branch.
            EventKind::Disabled { .. } => match completed {
                Some(insn) if event.ip_suppressed => is_branch(insn.class),
                Some(_) => true,
                None => false,
            },
            EventKind::AsyncDisabled { at, .. } => at == self.ip,
            EventKind::AsyncBranch { from, .. } => from == self.ip,
            EventKind::AsyncPaging { ip, .. }
            | EventKind::ExecMode { ip, .. }
            | EventKind::Tsx { ip, .. } => event.ip_suppressed || ip == self.ip,
        }
    }

    fn apply_event(
        &mut self,
        event: &Event,
        carry: &mut Carried,
        record: Option<&mut Insn>,
    ) -> Result<()> {
        match event.kind {
            EventKind::Enabled { ip } => {
                if event.ip_suppressed {
                    return Err(Error::Noip);
                }
                self.ip = ip;
                self.enabled = true;
                carry.enabled = true;
                if self.last_disabled_ip == Some(ip) {
                    carry.resumed = true;
                }
            }
            EventKind::Disabled { ip } => {
                self.enabled = false;
                self.last_disabled_ip = (!event.ip_suppressed).then_some(ip);
                if let Some(record) = record {
                    record.disabled = true;
                }
            }
            EventKind::AsyncDisabled { at, .. } => {
                self.enabled = false;
                self.last_disabled_ip = Some(at);
                if let Some(record) = record {
                    record.disabled = true;
                }
            }
            EventKind::AsyncBranch { to, .. } => {
                if event.ip_suppressed {
                    return Err(Error::Noip);
                }
                self.ip = to;
                // While tracing is disabled the branch destination
                // doubles as the resume point.
                if !self.enabled {
                    self.enabled = true;
                    carry.enabled = true;
                    if self.last_disabled_ip == Some(to) {
                        carry.resumed = true;
                    }
                }
                if let Some(record) = record {
                    record.interrupted = true;
                }
            }
            EventKind::Paging { cr3 } | EventKind::AsyncPaging { cr3, .. } => {
                self.asid = Asid::new(cr3);
            }
            EventKind::ExecMode { mode, .. } => {
                self.mode = mode;
            }
            EventKind::Tsx {
                speculative,
                aborted,
                ..
            } => {
                self.speculative = speculative;
                if !event.status_update {
                    let committed = !speculative && !aborted;
                    if let Some(record) = record {
                        record.aborted |= aborted;
                        record.committed |= committed;
                    } else {
                        carry.aborted |= aborted;
                        carry.committed |= committed;
                    }
                }
            }
            EventKind::Overflow { ip } => {
                if !event.ip_suppressed {
                    self.ip = ip;
                }
                if let Some(record) = record {
                    record.resynced = true;
                } else {
                    carry.resynced = true;
                }
            }
        }
        Ok(())
    }

    /// Read and classify the instruction at the current IP.
    fn fetch(&mut self) -> Result<(Insn, Classified)> {
        let mut bytes = [0u8; MAX_INSN_LEN];
        let read = self.read_memory(&mut bytes)?;
        let classified = classify(&bytes[..read], self.ip, self.mode);
        let insn = Insn {
            ip: self.ip,
            mode: self.mode,
            class: classified.class,
            bytes,
            len: classified.len,
            speculative: false,
            aborted: false,
            committed: false,
            disabled: false,
            enabled: false,
            resumed: false,
            interrupted: false,
            resynced: false,
        };
        Ok((insn, classified))
    }

    fn read_memory(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.image.read(buf, self.asid, self.ip) {
            Err(Error::Nomap) => {
                // A freshly observed address space gets one chance to be
                // loaded lazily, then the lookup is retried once.
                let cr3 = self.asid.cr3;
                if cr3 != NO_CR3
                    && self.reported_cr3.insert(cr3)
                    && self.image.notify_new_cr3(cr3, self.ip)?
                {
                    return self.image.read(buf, self.asid, self.ip);
                }
                Err(Error::Nomap)
            }
            outcome => outcome,
        }
    }

    /// Advance the IP over the classified instruction, consulting the
    /// query decoder where the trace holds the answer.
    fn step(&mut self, classified: &Classified) -> Result<()> {
        let next = self.ip.wrapping_add(u64::from(classified.len));
        match classified.class {
            InsnClass::Other => self.ip = next,
            InsnClass::NearJump => match classified.target {
                Some(target) => self.ip = target,
                None => self.ip = self.indirect()?,
            },
            InsnClass::NearCondJump => {
                let target = classified.target.ok_or(Error::BadInsn)?;
                let (taken, _) = self
                    .query
                    .cond_branch()
                    .map_err(|error| self.map_query_err(error))?;
                self.ip = if taken { target } else { next };
            }
            InsnClass::NearCall => {
                self.retstack.push(next);
                match classified.target {
                    Some(target) => self.ip = target,
                    None => self.ip = self.indirect()?,
                }
            }
            InsnClass::NearReturn => {
                if self.query.cond_pending()? {
                    // Compressed return: a taken bit stands for the
                    // address on the shadow stack.
                    let (taken, _) = self
                        .query
                        .cond_branch()
                        .map_err(|error| self.map_query_err(error))?;
                    if !taken {
                        return Err(Error::BadPacket);
                    }
                    self.ip = self.retstack.pop()?;
                } else {
                    self.ip = self.indirect()?;
                }
            }
            InsnClass::FarCall | InsnClass::FarReturn | InsnClass::FarJump => {
                self.ip = self.indirect()?;
            }
            InsnClass::Error => return Err(Error::BadInsn),
        }
        Ok(())
    }

    fn indirect(&mut self) -> Result<u64> {
        let (ip, _) = self
            .query
            .indirect_branch()
            .map_err(|error| self.map_query_err(error))?;
        ip.ok_or(Error::Noip)
    }
}

const fn is_branch(class: InsnClass) -> bool {
    !matches!(class, InsnClass::Other | InsnClass::Error)
}
