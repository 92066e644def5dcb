//! The `syscall` instruction. The syscall number is taken from `r0`, up to
//! three arguments from `r1..r3`, and the result is written back to `r0`.
//! A failing call returns -1 instead of faulting the machine.
//!
//! | r0 | call                                 |
//! |----|--------------------------------------|
//! | 0  | exit(code)                           |
//! | 1  | write(fd, offset, length)            |
//! | 2  | read(fd, offset, length)             |
//! | 3  | connect (reserved, always fails)     |
//! | 4  | listen(port, ip6 address offset)     |
//! | 5  | accept(fd)                           |
//! | 9  | signal(sig), where 9 aborts the VM   |

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Ipv6Addr, SocketAddr, SocketAddrV6, TcpListener, TcpStream},
};

use hashbrown::HashMap;
use log::debug;

use crate::backend::isa::Register;

use super::{Machine, VmError, VmExit};

pub const EXIT: i64 = 0;
pub const WRITE: i64 = 1;
pub const READ: i64 = 2;
pub const LISTEN: i64 = 4;
pub const ACCEPT: i64 = 5;
pub const SIGNAL: i64 = 9;

const SIGKILL: i64 = 9;

/// Where a machine's I/O goes
pub trait SyscallHost {
    fn write(&mut self, fd: i64, bytes: &[u8]) -> io::Result<usize>;

    fn read(&mut self, fd: i64, buffer: &mut [u8]) -> io::Result<usize>;

    /// Returns the fd of a new listening socket
    fn listen(&mut self, _address: SocketAddrV6) -> io::Result<i64> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Returns the fd of the accepted connection
    fn accept(&mut self, _fd: i64) -> io::Result<i64> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Called with the register file before every syscall executes
    fn on_syscall(&mut self, _registers: &[i64; Register::COUNT]) {}
}

/// Real stdio on fds 0 to 2, and TCP sockets numbered from 3
#[derive(Debug)]
pub struct OsHost {
    listeners: HashMap<i64, TcpListener>,
    streams: HashMap<i64, TcpStream>,
    next_fd: i64,
}

impl OsHost {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            streams: HashMap::new(),
            next_fd: 3,
        }
    }

    fn allocate_fd(&mut self) -> i64 {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    fn stream(&mut self, fd: i64) -> io::Result<&mut TcpStream> {
        self.streams
            .get_mut(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("bad fd {fd}")))
    }
}

impl Default for OsHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallHost for OsHost {
    fn write(&mut self, fd: i64, bytes: &[u8]) -> io::Result<usize> {
        match fd {
            1 => {
                let mut stdout = io::stdout().lock();
                let written = stdout.write(bytes)?;
                stdout.flush()?;
                Ok(written)
            }
            2 => io::stderr().lock().write(bytes),
            fd => self.stream(fd)?.write(bytes),
        }
    }

    fn read(&mut self, fd: i64, buffer: &mut [u8]) -> io::Result<usize> {
        match fd {
            0 => io::stdin().lock().read(buffer),
            fd => self.stream(fd)?.read(buffer),
        }
    }

    fn listen(&mut self, address: SocketAddrV6) -> io::Result<i64> {
        let listener = TcpListener::bind(SocketAddr::V6(address))?;
        let fd = self.allocate_fd();
        debug!("fd {fd} listening on {address}");
        self.listeners.insert(fd, listener);
        Ok(fd)
    }

    fn accept(&mut self, fd: i64) -> io::Result<i64> {
        let listener = self
            .listeners
            .get(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("bad fd {fd}")))?;
        let (stream, peer) = listener.accept()?;

        let fd = self.allocate_fd();
        debug!("fd {fd} accepted from {peer}");
        self.streams.insert(fd, stream);
        Ok(fd)
    }
}

/// Keeps all I/O in memory
#[derive(Debug, Clone, Default)]
pub struct CaptureHost {
    pub stdin: VecDeque<u8>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// The register file at every syscall, in order
    pub syscalls: Vec<[i64; Register::COUNT]>,
}

impl CaptureHost {
    pub fn with_stdin(input: impl AsRef<[u8]>) -> Self {
        Self {
            stdin: input.as_ref().iter().copied().collect(),
            ..Self::default()
        }
    }
}

impl SyscallHost for CaptureHost {
    fn write(&mut self, fd: i64, bytes: &[u8]) -> io::Result<usize> {
        match fd {
            1 => self.stdout.extend_from_slice(bytes),
            2 => self.stderr.extend_from_slice(bytes),
            _ => return Err(io::ErrorKind::NotFound.into()),
        }
        Ok(bytes.len())
    }

    fn read(&mut self, fd: i64, buffer: &mut [u8]) -> io::Result<usize> {
        if fd != 0 {
            return Err(io::ErrorKind::NotFound.into());
        }

        let count = buffer.len().min(self.stdin.len());
        for (slot, byte) in buffer.iter_mut().zip(self.stdin.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn on_syscall(&mut self, registers: &[i64; Register::COUNT]) {
        self.syscalls.push(*registers);
    }
}

impl<H: SyscallHost> Machine<H> {
    fn argument(&self, n: u8) -> i64 {
        self.registers[usize::from(n)]
    }

    /// The memory range of a buffer argument, if it is in bounds
    fn buffer(&self, offset: i64, len: i64) -> Option<core::ops::Range<usize>> {
        let len = usize::try_from(len).ok()?;
        self.range(offset as u64, len).ok()
    }

    /// Executes the syscall in `r0`. Returns the exit if the machine stops.
    pub(super) fn syscall(&mut self) -> Result<Option<VmExit>, VmError> {
        self.host.on_syscall(&self.registers);

        let number = self.argument(0);
        let (a, b, c) = (self.argument(1), self.argument(2), self.argument(3));

        let result = match number {
            EXIT => return Ok(Some(VmExit::Exited(a))),
            SIGNAL if a == SIGKILL => return Ok(Some(VmExit::Aborted)),
            WRITE => match self.buffer(b, c) {
                Some(range) => io_result(self.host.write(a, &self.memory[range])),
                None => -1,
            },
            READ => match self.buffer(b, c) {
                Some(range) => io_result(self.host.read(a, &mut self.memory[range])),
                None => -1,
            },
            LISTEN => self.listen(a, b),
            ACCEPT => self.host.accept(a).unwrap_or(-1),
            // connect is reserved
            _ => -1,
        };

        debug!("syscall {number}({a}, {b}, {c}) = {result}");
        self.registers[Register::RETURN.index()] = result;
        Ok(None)
    }

    fn listen(&mut self, port: i64, address: i64) -> i64 {
        let Ok(port) = u16::try_from(port) else {
            return -1;
        };
        let Some(range) = self.buffer(address, 16) else {
            return -1;
        };

        let mut octets = [0; 16];
        octets.copy_from_slice(&self.memory[range]);
        let address = SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0);

        self.host.listen(address).unwrap_or(-1)
    }
}

fn io_result(result: io::Result<usize>) -> i64 {
    result.map_or(-1, |n| n as i64)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::vm::{Strategy, tests::run};

    const WRITE_HI: &str = indoc! {"
        _start:
            sets r6, 0x1000
            setb r7, 0
            setb r5, 104
            storebat r6, r7, r5
            setb r7, 1
            setb r5, 105
            storebat r6, r7, r5
            setb r0, 1
            setb r1, 1
            mov r2, r6
            setb r3, 2
            syscall
            mov r1, r0
            setb r0, 0
            syscall
    "};

    #[test]
    fn write_returns_the_byte_count() {
        for strategy in [Strategy::Direct, Strategy::Threaded] {
            let (result, machine) = run(WRITE_HI, strategy);

            assert_eq!(result, Ok(VmExit::Exited(2)));
            assert_eq!(machine.host.stdout, b"hi");
            assert!(machine.host.stderr.is_empty());
            assert_eq!(machine.host.syscalls.len(), 2);
            assert_eq!(machine.host.syscalls[1][0], EXIT);
        }
    }

    #[test]
    fn failures_return_minus_one() {
        // write to an out of range buffer, then exit with its result
        let (result, _) = run(
            "_start:\n setb r0, 1; setb r1, 1; setl r2, -1; setb r3, 4; syscall; mov r1, r0; setb r0, 0; syscall",
            Strategy::Direct,
        );
        assert_eq!(result, Ok(VmExit::Exited(-1)));

        let (result, _) = run(
            "_start:\n setb r0, 3; syscall; mov r1, r0; setb r0, 0; syscall",
            Strategy::Direct,
        );
        assert_eq!(result, Ok(VmExit::Exited(-1)));
    }

    #[test]
    fn signals() {
        let (result, _) = run("_start:\n setb r0, 9; setb r1, 9; syscall", Strategy::Threaded);
        assert_eq!(result, Ok(VmExit::Aborted));

        let (result, _) = run(
            "_start:\n setb r0, 9; setb r1, 2; syscall; mov r1, r0; setb r0, 0; syscall",
            Strategy::Direct,
        );
        assert_eq!(result, Ok(VmExit::Exited(-1)));
    }

    #[test]
    fn reads_from_stdin() {
        let mut host = CaptureHost::with_stdin("abc");
        let mut buffer = [0; 2];
        assert_eq!(host.read(0, &mut buffer).unwrap(), 2);
        assert_eq!(&buffer, b"ab");
        assert_eq!(host.read(0, &mut buffer).unwrap(), 1);
        assert_eq!(buffer[0], b'c');
        assert!(host.read(5, &mut buffer).is_err());
    }
}
