//! Linux taskstats exit events over generic netlink
//!
//! The kernel pushes a `TASKSTATS_TYPE_AGGR_PID` message for every exiting
//! task to each listener registered for the CPU the task exited on. The
//! message carries the task's `struct taskstats`, from which the pid, parent
//! pid, command and lifetime CPU (`ac_utime + ac_stime`, microseconds) are
//! decoded.
//!
//! Decoding is split into pure functions over byte slices so it can be unit
//! tested and fuzzed without a socket. Opening the socket and registering the
//! cpumask requires `CAP_NET_ADMIN`.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tracing::{debug, info, warn};

use super::{EventSink, EventSource, ProcessEvent, SourceError};
use crate::host::procfs::configured_cpus;
use crate::host::ProcessSample;

const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;
/// Strips `NLA_F_NESTED` and `NLA_F_NET_BYTEORDER`
const NLA_TYPE_MASK: u16 = 0x3fff;

const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;

const GENL_ID_CTRL: u16 = 0x10;
const GENL_VERSION: u8 = 1;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

const TASKSTATS_GENL_NAME: &[u8] = b"TASKSTATS\0";
const TASKSTATS_CMD_GET: u8 = 1;
const TASKSTATS_CMD_ATTR_REGISTER_CPUMASK: u16 = 3;
const TASKSTATS_CMD_ATTR_DEREGISTER_CPUMASK: u16 = 4;
pub const TASKSTATS_TYPE_PID: u16 = 1;
pub const TASKSTATS_TYPE_TGID: u16 = 2;
pub const TASKSTATS_TYPE_STATS: u16 = 3;
pub const TASKSTATS_TYPE_AGGR_PID: u16 = 4;
pub const TASKSTATS_TYPE_AGGR_TGID: u16 = 5;

// struct taskstats field offsets, unchanged since the first ABI version
const TS_COMM: usize = 80;
const TS_COMM_LEN: usize = 32;
const TS_PID: usize = 128;
const TS_PPID: usize = 132;
const TS_UTIME: usize = 152;
const TS_STIME: usize = 160;
/// Shortest payload containing every field we read
pub const TASKSTATS_MIN_LEN: usize = 168;

const RECV_BUFFER_LEN: usize = 64 * 1024;
const SOCKET_RCVBUF: libc::c_int = 4 * 1024 * 1024;
/// Datagrams read while waiting for the registration acknowledgement
const MAX_ACK_WAIT: usize = 256;

fn align(len: usize) -> usize {
    (len + 3) & !3
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_ne_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_ne_bytes(bytes))
}

fn read_i32(buf: &[u8], at: usize) -> Option<i32> {
    read_u32(buf, at).map(|v| v as i32)
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = buf.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_ne_bytes(bytes))
}

/// One netlink message: its type and the bytes following `nlmsghdr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetlinkMessage<'a> {
    pub kind: u16,
    pub payload: &'a [u8],
}

/// Split a datagram into netlink messages
pub fn split_messages(buf: &[u8]) -> Result<Vec<NetlinkMessage<'_>>, SourceError> {
    let mut messages = Vec::new();
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = read_u32(buf, offset).unwrap_or(0) as usize;
        let kind = read_u16(buf, offset + 4).unwrap_or(0);
        if len < NLMSG_HDRLEN || len > buf.len() - offset {
            return Err(SourceError::Malformed("message length out of bounds"));
        }
        messages.push(NetlinkMessage {
            kind,
            payload: &buf[offset + NLMSG_HDRLEN..offset + len],
        });
        offset += align(len);
    }
    Ok(messages)
}

/// Split an attribute stream into `(type, value)` pairs
pub fn split_attributes(buf: &[u8]) -> Result<Vec<(u16, &[u8])>, SourceError> {
    let mut attributes = Vec::new();
    let mut offset = 0;
    while offset + NLA_HDRLEN <= buf.len() {
        let len = read_u16(buf, offset).unwrap_or(0) as usize;
        let kind = read_u16(buf, offset + 2).unwrap_or(0) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > buf.len() - offset {
            return Err(SourceError::Malformed("attribute length out of bounds"));
        }
        attributes.push((kind, &buf[offset + NLA_HDRLEN..offset + len]));
        offset += align(len);
    }
    Ok(attributes)
}

/// Append one attribute, padded to 4 bytes
pub fn encode_attribute(out: &mut Vec<u8>, kind: u16, value: &[u8]) {
    let len = (NLA_HDRLEN + value.len()) as u16;
    out.extend_from_slice(&len.to_ne_bytes());
    out.extend_from_slice(&kind.to_ne_bytes());
    out.extend_from_slice(value);
    out.resize(align(out.len()), 0);
}

/// Build a generic netlink request
pub fn build_request(
    family: u16,
    flags: u16,
    seq: u32,
    command: u8,
    attributes: &[(u16, &[u8])],
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(64);
    // nlmsghdr; the length is patched once the attributes are in
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&family.to_ne_bytes());
    msg.extend_from_slice(&flags.to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    // genlmsghdr
    msg.extend_from_slice(&[command, GENL_VERSION, 0, 0]);
    for (kind, value) in attributes {
        encode_attribute(&mut msg, *kind, value);
    }
    let total = msg.len() as u32;
    msg[..4].copy_from_slice(&total.to_ne_bytes());
    msg
}

/// Cpumask string covering `cpus` CPUs, in the kernel's list format
pub fn cpumask(cpus: usize) -> String {
    match cpus {
        0 | 1 => "0".to_string(),
        n => format!("0-{}", n - 1),
    }
}

fn nul_terminated(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

/// Decode the fields of a `struct taskstats` payload
pub fn parse_taskstats(stats: &[u8]) -> Option<ProcessSample> {
    if stats.len() < TASKSTATS_MIN_LEN {
        return None;
    }
    let comm = &stats[TS_COMM..TS_COMM + TS_COMM_LEN];
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    let command = String::from_utf8_lossy(&comm[..end]).into_owned();

    let pid = read_u32(stats, TS_PID)? as i32;
    let parent_pid = read_u32(stats, TS_PPID)? as i32;
    let utime = read_u64(stats, TS_UTIME)?;
    let stime = read_u64(stats, TS_STIME)?;

    Some(ProcessSample::new(
        pid,
        parent_pid,
        utime.saturating_add(stime),
        command,
    ))
}

/// Decode every exit carried by a datagram from the taskstats family
///
/// Only per-task (`AGGR_PID`) records are used; the per-thread-group
/// (`AGGR_TGID`) record sent when a group leader exits would count the
/// process twice.
pub fn parse_exit_events(buf: &[u8], family_id: u16) -> Result<Vec<ProcessSample>, SourceError> {
    let mut exits = Vec::new();
    for message in split_messages(buf)? {
        match message.kind {
            NLMSG_NOOP | NLMSG_DONE => {}
            NLMSG_ERROR => {
                let code = read_i32(message.payload, 0).unwrap_or(0);
                if code != 0 {
                    warn!(
                        error = %io::Error::from_raw_os_error(-code),
                        "netlink error message on event channel"
                    );
                }
            }
            kind if kind == family_id => {
                let attributes = message
                    .payload
                    .get(GENL_HDRLEN..)
                    .ok_or(SourceError::Malformed("truncated generic netlink header"))?;
                for (kind, value) in split_attributes(attributes)? {
                    if kind != TASKSTATS_TYPE_AGGR_PID {
                        continue;
                    }
                    for (inner, stats) in split_attributes(value)? {
                        if inner != TASKSTATS_TYPE_STATS {
                            continue;
                        }
                        let sample = parse_taskstats(stats)
                            .ok_or(SourceError::Malformed("short taskstats payload"))?;
                        exits.push(sample);
                    }
                }
            }
            kind => debug!(kind, "ignoring unexpected netlink message"),
        }
    }
    Ok(exits)
}

/// Extract the taskstats family id from a controller reply
pub fn parse_family_id(buf: &[u8]) -> Result<u16, SourceError> {
    for message in split_messages(buf)? {
        match message.kind {
            NLMSG_ERROR => {
                let code = read_i32(message.payload, 0).unwrap_or(0);
                if code != 0 {
                    return Err(SourceError::FamilyUnavailable(
                        io::Error::from_raw_os_error(-code).to_string(),
                    ));
                }
            }
            GENL_ID_CTRL => {
                let attributes = message
                    .payload
                    .get(GENL_HDRLEN..)
                    .ok_or(SourceError::Malformed("truncated generic netlink header"))?;
                for (kind, value) in split_attributes(attributes)? {
                    if kind == CTRL_ATTR_FAMILY_ID {
                        return read_u16(value, 0)
                            .ok_or(SourceError::Malformed("short family id attribute"));
                    }
                }
            }
            _ => {}
        }
    }
    Err(SourceError::FamilyUnavailable(
        "controller reply has no family id".to_string(),
    ))
}

/// Find the acknowledgement in a datagram, if any
pub fn parse_ack(buf: &[u8]) -> Option<io::Result<()>> {
    let messages = split_messages(buf).ok()?;
    let ack = messages.iter().find(|m| m.kind == NLMSG_ERROR)?;
    match read_i32(ack.payload, 0)? {
        0 => Some(Ok(())),
        code => Some(Err(io::Error::from_raw_os_error(-code))),
    }
}

fn kernel_address() -> libc::sockaddr_nl {
    // SAFETY: sockaddr_nl is plain data; all-zero is a valid value
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr
}

#[derive(Debug)]
struct NetlinkSocket {
    fd: OwnedFd,
}

impl NetlinkSocket {
    fn open() -> io::Result<Self> {
        // SAFETY: plain syscall, the descriptor is owned right below
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a fresh descriptor nothing else owns
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // Port id 0: the kernel assigns one
        let addr = kernel_address();
        // SAFETY: addr outlives the call and the length matches its type
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_nl).cast(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let size = SOCKET_RCVBUF;
        // SAFETY: size outlives the call and the length matches its type
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                (&size as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            debug!(error = %io::Error::last_os_error(), "cannot enlarge netlink receive buffer");
        }

        Ok(Self { fd })
    }

    fn send(&self, msg: &[u8]) -> io::Result<()> {
        let kernel = kernel_address();
        // SAFETY: msg and kernel outlive the call, lengths match
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                msg.as_ptr().cast(),
                msg.len(),
                0,
                (&kernel as *const libc::sockaddr_nl).cast(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for writes of buf.len() bytes
        let rc = unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    fn recv_retrying(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.recv(buf) {
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                other => return other,
            }
        }
    }
}

/// Exit event source backed by the taskstats netlink family
#[derive(Debug)]
pub struct TaskstatsSource {
    socket: NetlinkSocket,
    family_id: u16,
    cpumask: String,
    seq: u32,
    buffer: Vec<u8>,
    overflows: u64,
}

impl TaskstatsSource {
    /// Listen for exits on every configured CPU
    pub fn open() -> Result<Self, SourceError> {
        Self::open_for_cpus(configured_cpus())
    }

    pub fn open_for_cpus(cpus: usize) -> Result<Self, SourceError> {
        let socket = NetlinkSocket::open().map_err(SourceError::Open)?;
        let mut source = Self {
            socket,
            family_id: 0,
            cpumask: cpumask(cpus),
            seq: 0,
            buffer: vec![0; RECV_BUFFER_LEN],
            overflows: 0,
        };
        source.family_id = source.resolve_family()?;
        source.register()?;
        info!(
            family_id = source.family_id,
            cpumask = %source.cpumask,
            "listening for taskstats exit events"
        );
        Ok(source)
    }

    pub fn family_id(&self) -> u16 {
        self.family_id
    }

    /// Receive buffer overflows seen so far; each one lost exit events
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn resolve_family(&mut self) -> Result<u16, SourceError> {
        let seq = self.next_seq();
        let request = build_request(
            GENL_ID_CTRL,
            NLM_F_REQUEST,
            seq,
            CTRL_CMD_GETFAMILY,
            &[(CTRL_ATTR_FAMILY_NAME, TASKSTATS_GENL_NAME)],
        );
        self.socket.send(&request).map_err(SourceError::Open)?;
        let len = self
            .socket
            .recv_retrying(&mut self.buffer)
            .map_err(SourceError::Open)?;
        parse_family_id(&self.buffer[..len])
    }

    fn register(&mut self) -> Result<(), SourceError> {
        let mask = nul_terminated(&self.cpumask);
        let seq = self.next_seq();
        let request = build_request(
            self.family_id,
            NLM_F_REQUEST | NLM_F_ACK,
            seq,
            TASKSTATS_CMD_GET,
            &[(TASKSTATS_CMD_ATTR_REGISTER_CPUMASK, &mask)],
        );
        let register_error = |source| SourceError::Register {
            mask: self.cpumask.clone(),
            source,
        };
        self.socket.send(&request).map_err(register_error)?;

        // Exit events may already be queued ahead of the acknowledgement
        for _ in 0..MAX_ACK_WAIT {
            let len = self
                .socket
                .recv_retrying(&mut self.buffer)
                .map_err(register_error)?;
            match parse_ack(&self.buffer[..len]) {
                Some(Ok(())) => return Ok(()),
                Some(Err(source)) => return Err(register_error(source)),
                None => continue,
            }
        }
        Err(register_error(io::Error::new(
            io::ErrorKind::TimedOut,
            "no acknowledgement for cpumask registration",
        )))
    }
}

impl Drop for TaskstatsSource {
    fn drop(&mut self) {
        let mask = nul_terminated(&self.cpumask);
        let seq = self.next_seq();
        let request = build_request(
            self.family_id,
            NLM_F_REQUEST,
            seq,
            TASKSTATS_CMD_GET,
            &[(TASKSTATS_CMD_ATTR_DEREGISTER_CPUMASK, &mask)],
        );
        if let Err(error) = self.socket.send(&request) {
            debug!(%error, "taskstats deregistration failed");
        }
    }
}

impl EventSource for TaskstatsSource {
    fn name(&self) -> &'static str {
        "taskstats"
    }

    fn run(&mut self, sink: &dyn EventSink) -> Result<(), SourceError> {
        loop {
            let len = match self.socket.recv(&mut self.buffer) {
                Ok(len) => len,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    self.overflows += 1;
                    warn!(
                        overflows = self.overflows,
                        "netlink receive buffer overflowed, exit events lost"
                    );
                    continue;
                }
                Err(e) => return Err(SourceError::Receive(e)),
            };

            match parse_exit_events(&self.buffer[..len], self.family_id) {
                Ok(exits) => {
                    for sample in exits {
                        sink.deliver(ProcessEvent::Exit(sample));
                    }
                }
                Err(error) => warn!(%error, len, "skipping undecodable netlink datagram"),
            }
        }
    }
}
