//! Fragmented data block transport package
//!
//! Sessions are announced with FragSessionSetupReq and filled by DataFragment
//! commands. Storage is requested from the [`BlockAllocator`] only when the
//! first fragment of a session arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::{ensure, PACKAGE_VERSION, PACKAGE_VERSION_REQ};
use crate::core::{Error, Result, RxFlags};
use crate::network::MulticastRegister;
use crate::storage::{
    AssemblyProgress, AssemblyStatus, BlockAllocator, BlockOptions, FragLayout, StoreHandle,
};

/// Package identifier reported in the version answer
pub const PACKAGE_ID: u8 = 3;

/// Sessions addressable by a FragIndex
pub const MAX_FRAG_SESSIONS: usize = 4;

const FRAG_SESSION_STATUS: u8 = 0x01;
const FRAG_SESSION_SETUP: u8 = 0x02;
const FRAG_SESSION_DELETE: u8 = 0x03;
const DATA_FRAGMENT: u8 = 0x08;

const SETUP_ENCODING_UNSUPPORTED: u8 = 1 << 0;
const SETUP_NOT_ENOUGH_MEMORY: u8 = 1 << 1;
const SETUP_INDEX_UNSUPPORTED: u8 = 1 << 2;
const SETUP_WRONG_DESCRIPTOR: u8 = 1 << 3;

const SESSION_DOES_NOT_EXIST: u8 = 1 << 2;

const FRAG_NUMBER_MASK: u16 = 0x3FFF;

/// Session whose image is fully in the block store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedSession {
    pub session_index: u8,
    pub descriptor: u32,
    pub store: StoreHandle,
    /// Image bytes, padding excluded
    pub size: usize,
}

/// What a fragmentation downlink produced
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FragResponse {
    /// Answers to management commands
    pub answer: Option<Bytes>,
    pub completed: Option<CompletedSession>,
}

#[derive(Debug)]
struct FragSession {
    mc_group_mask: u8,
    layout: FragLayout,
    block_ack_delay: u8,
    descriptor: u32,
    options: Option<BlockOptions>,
    progress: AssemblyProgress,
}

impl FragSession {
    fn complete(&self) -> bool {
        self.progress.complete
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command<'a> {
    PackageVersion,
    Status { participants: bool, index: u8 },
    Setup {
        index: u8,
        mc_group_mask: u8,
        nb_frag: u16,
        frag_size: u8,
        control: u8,
        padding: u8,
        descriptor: u32,
    },
    Delete { index: u8 },
    DataFragment { index: u8, n: u16, payload: &'a [u8] },
}

/// Device side of the fragmentation package
#[derive(Debug, Default)]
pub struct FragmentationControl {
    sessions: [Option<FragSession>; MAX_FRAG_SESSIONS],
}

impl FragmentationControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session is set up on `index`
    pub fn has_session(&self, index: u8) -> bool {
        self.session(index).is_some()
    }

    /// Reception counters of a session
    pub fn progress(&self, index: u8) -> Option<AssemblyProgress> {
        self.session(index).map(|s| s.progress)
    }

    fn session(&self, index: u8) -> Option<&FragSession> {
        self.sessions.get(index as usize).and_then(Option::as_ref)
    }

    /// Parses a downlink received from `dev_addr`
    pub fn parse(
        &mut self,
        payload: &[u8],
        flags: RxFlags,
        dev_addr: u32,
        allocator: &mut dyn BlockAllocator,
        table: &MulticastRegister,
        expected_descriptor: Option<u32>,
    ) -> Result<Option<FragResponse>> {
        let commands = decode(payload)?;
        self.validate(&commands, allocator.capacity(), expected_descriptor)?;
        let mut answer = BytesMut::new();
        let mut completed = None;

        for command in commands {
            match command {
                Command::PackageVersion => {
                    answer.put_slice(&[PACKAGE_VERSION_REQ, PACKAGE_ID, PACKAGE_VERSION]);
                }
                Command::Status { participants, index } => {
                    let session = match self.session(index) {
                        Some(session) => session,
                        None => {
                            debug!(index, "status requested for undefined session");
                            continue;
                        }
                    };
                    let progress = session.progress;
                    if !participants && progress.missing == 0 {
                        continue;
                    }
                    answer.put_u8(FRAG_SESSION_STATUS);
                    answer.put_u16_le((progress.received & FRAG_NUMBER_MASK) | ((index as u16) << 14));
                    answer.put_u8(progress.missing.min(u8::MAX as u16) as u8);
                    answer.put_u8(u8::from(progress.redundancy_exhausted));
                }
                Command::Setup {
                    index,
                    mc_group_mask,
                    nb_frag,
                    frag_size,
                    control,
                    padding,
                    descriptor,
                } => {
                    let layout = FragLayout {
                        nb_frag,
                        frag_size: frag_size as usize,
                        padding,
                    };
                    let status = setup_status(
                        index,
                        layout,
                        control,
                        descriptor,
                        allocator.capacity(),
                        expected_descriptor,
                    );
                    if status == 0 {
                        self.release(index, allocator);
                        self.sessions[index as usize] = Some(FragSession {
                            mc_group_mask,
                            layout,
                            block_ack_delay: control & 0x07,
                            descriptor,
                            options: None,
                            progress: AssemblyProgress {
                                received: 0,
                                missing: nb_frag,
                                redundancy_exhausted: false,
                                complete: false,
                            },
                        });
                        info!(index, nb_frag, frag_size, padding, descriptor, "fragmentation session set up");
                    } else {
                        warn!(index, status, "fragmentation session setup rejected");
                    }
                    answer.put_u8(FRAG_SESSION_SETUP);
                    answer.put_u8(status | (index << 6));
                }
                Command::Delete { index } => {
                    let status = if self.has_session(index) {
                        self.release(index, allocator);
                        self.sessions[index as usize] = None;
                        info!(index, "fragmentation session deleted");
                        index
                    } else {
                        SESSION_DOES_NOT_EXIST | index
                    };
                    answer.put_u8(FRAG_SESSION_DELETE);
                    answer.put_u8(status);
                }
                Command::DataFragment { index, n, payload } => {
                    if let Some(done) = self.on_fragment(index, n, payload, flags, dev_addr, allocator, table) {
                        completed = Some(done);
                    }
                }
            }
        }

        let answer = if answer.is_empty() {
            None
        } else {
            Some(answer.freeze())
        };
        if answer.is_none() && completed.is_none() {
            return Ok(None);
        }
        Ok(Some(FragResponse { answer, completed }))
    }

    /// Checks every fragment against the layout its session will have when it is applied
    fn validate(
        &self,
        commands: &[Command<'_>],
        capacity: usize,
        expected_descriptor: Option<u32>,
    ) -> Result<()> {
        let mut frag_sizes: [Option<usize>; MAX_FRAG_SESSIONS] = std::array::from_fn(|i| {
            self.sessions[i].as_ref().map(|s| s.layout.frag_size)
        });

        for command in commands {
            match command {
                Command::Setup {
                    index,
                    nb_frag,
                    frag_size,
                    control,
                    padding,
                    descriptor,
                    ..
                } => {
                    let layout = FragLayout {
                        nb_frag: *nb_frag,
                        frag_size: *frag_size as usize,
                        padding: *padding,
                    };
                    if setup_status(*index, layout, *control, *descriptor, capacity, expected_descriptor) == 0 {
                        frag_sizes[*index as usize] = Some(layout.frag_size);
                    }
                }
                Command::Delete { index } => frag_sizes[*index as usize] = None,
                Command::DataFragment { index, n, payload } => {
                    if let Some(size) = frag_sizes[*index as usize] {
                        if payload.len() != size {
                            return Err(Error::protocol(format!(
                                "DataFragment {} of session {} has {} bytes, session uses {}",
                                n,
                                index,
                                payload.len(),
                                size
                            )));
                        }
                    }
                }
                Command::PackageVersion | Command::Status { .. } => {}
            }
        }
        Ok(())
    }

    /// Stores one fragment; storage failures drop the fragment
    #[allow(clippy::too_many_arguments)]
    fn on_fragment(
        &mut self,
        index: u8,
        n: u16,
        payload: &[u8],
        flags: RxFlags,
        dev_addr: u32,
        allocator: &mut dyn BlockAllocator,
        table: &MulticastRegister,
    ) -> Option<CompletedSession> {
        let session = match self.session(index) {
            Some(session) => session,
            None => {
                debug!(index, n, "fragment for undefined session dropped");
                return None;
            }
        };
        if session.complete() {
            return None;
        }
        if flags.multicast {
            let allowed = table
                .group_for_address(dev_addr)
                .map_or(false, |group| session.mc_group_mask & (1 << group) != 0);
            if !allowed {
                debug!(index, dev_addr, "fragment from a group outside the session mask");
                return None;
            }
        }

        let existing = session.options;
        let descriptor = session.descriptor;
        let layout = session.layout;
        let options = match existing {
            Some(options) => options,
            None => {
                let options = match allocator.allocate(index, descriptor, layout) {
                    Ok(options) => options,
                    Err(e) => {
                        warn!(index, n, error = %e, "no storage for session, fragment dropped");
                        return None;
                    }
                };
                self.abort_superseded(index);
                options
            }
        };

        let session = self.sessions[index as usize].as_mut()?;
        session.options = Some(options);
        let status = match allocator.write_fragment(options.assembler, n, payload) {
            Ok(status) => status,
            Err(e) => {
                warn!(index, n, error = %e, "fragment not stored");
                return None;
            }
        };
        if let Some(progress) = allocator.progress(options.assembler) {
            session.progress = progress;
        }
        match status {
            AssemblyStatus::Complete => {
                session.progress.complete = true;
                info!(
                    index,
                    descriptor = session.descriptor,
                    size = layout.image_size(),
                    "fragmentation session complete"
                );
                Some(CompletedSession {
                    session_index: index,
                    descriptor: session.descriptor,
                    store: options.store,
                    size: layout.image_size(),
                })
            }
            AssemblyStatus::InProgress { missing } => {
                debug!(index, n, missing, "fragment stored");
                None
            }
            AssemblyStatus::Duplicate => None,
        }
    }

    /// Drops unfinished sessions whose storage the allocator reclaimed for `index`
    fn abort_superseded(&mut self, index: u8) {
        for (other, slot) in self.sessions.iter_mut().enumerate() {
            if other == index as usize {
                continue;
            }
            let superseded = slot
                .as_ref()
                .map_or(false, |s| s.options.is_some() && !s.complete());
            if superseded {
                warn!(index = other, superseded_by = index, "fragmentation session aborted");
                *slot = None;
            }
        }
    }

    /// Returns the storage of the session on `index` to the allocator
    fn release(&mut self, index: u8, allocator: &mut dyn BlockAllocator) {
        let options = self
            .sessions
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .and_then(|s| s.options.take());
        if let Some(options) = options {
            allocator.release(options.store);
        }
    }

    /// Block ack delay class announced for a session
    pub fn block_ack_delay(&self, index: u8) -> Option<u8> {
        self.session(index).map(|s| s.block_ack_delay)
    }
}

/// Status byte of a FragSessionSetupReq, zero when accepted
fn setup_status(
    index: u8,
    layout: FragLayout,
    control: u8,
    descriptor: u32,
    capacity: usize,
    expected_descriptor: Option<u32>,
) -> u8 {
    let mut status = 0;
    if (control >> 3) & 0x07 != 0 {
        status |= SETUP_ENCODING_UNSUPPORTED;
    }
    if layout.nb_frag == 0 || layout.frag_size == 0 || layout.stored_size() > capacity {
        status |= SETUP_NOT_ENOUGH_MEMORY;
    }
    if index as usize >= MAX_FRAG_SESSIONS {
        status |= SETUP_INDEX_UNSUPPORTED;
    }
    if expected_descriptor.map_or(false, |d| d != descriptor) {
        status |= SETUP_WRONG_DESCRIPTOR;
    }
    status
}

fn decode(mut buf: &[u8]) -> Result<Vec<Command<'_>>> {
    let mut commands = Vec::new();
    while buf.has_remaining() {
        let cid = buf.get_u8();
        let command = match cid {
            PACKAGE_VERSION_REQ => Command::PackageVersion,
            FRAG_SESSION_STATUS => {
                ensure(buf, 1, "FragSessionStatusReq")?;
                let param = buf.get_u8();
                Command::Status {
                    participants: param & 0x01 != 0,
                    index: (param >> 1) & 0x03,
                }
            }
            FRAG_SESSION_SETUP => {
                ensure(buf, 10, "FragSessionSetupReq")?;
                let session = buf.get_u8();
                Command::Setup {
                    index: (session >> 4) & 0x03,
                    mc_group_mask: session & 0x0F,
                    nb_frag: buf.get_u16_le(),
                    frag_size: buf.get_u8(),
                    control: buf.get_u8(),
                    padding: buf.get_u8(),
                    descriptor: buf.get_u32_le(),
                }
            }
            FRAG_SESSION_DELETE => {
                ensure(buf, 1, "FragSessionDeleteReq")?;
                Command::Delete {
                    index: buf.get_u8() & 0x03,
                }
            }
            DATA_FRAGMENT => {
                ensure(buf, 2, "DataFragment")?;
                let index_and_n = buf.get_u16_le();
                let n = index_and_n & FRAG_NUMBER_MASK;
                if n == 0 {
                    return Err(Error::protocol("DataFragment numbers start at 1"));
                }
                // The fragment runs to the end of the payload
                let payload = buf;
                buf.advance(payload.len());
                Command::DataFragment {
                    index: (index_and_n >> 14) as u8,
                    n,
                    payload,
                }
            }
            _ => {
                debug!(cid, "unknown fragmentation command, rest of payload skipped");
                break;
            }
        };
        commands.push(command);
    }
    Ok(commands)
}
