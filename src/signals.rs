//! Self-pipe signal dispatch.
//!
//! Signal handlers never touch supervisor state; each delivery writes the
//! signal number to a pipe the event loop polls, turning asynchronous
//! signals into synchronous events.

use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd, IntoRawFd, OwnedFd},
    sync::atomic::{AtomicI32, Ordering},
};

use nix::{
    fcntl::{FcntlArg, OFlag, fcntl},
    sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction},
    unistd::{pipe, read},
};

static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// Signals the supervisor converts into loop events.
pub const HANDLED: [Signal; 8] = [
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGTSTP,
    Signal::SIGCONT,
];

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Read end of the installed self-pipe.
#[derive(Debug)]
pub struct SignalPipe {
    rd: OwnedFd,
}

impl SignalPipe {
    /// Creates the pipe and installs handlers for every signal in
    /// [`HANDLED`].
    pub fn install() -> io::Result<Self> {
        let (rd, wr) = pipe().map_err(io::Error::from)?;
        for fd in [rd.as_raw_fd(), wr.as_raw_fd()] {
            fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
        }
        PIPE_WR.store(wr.into_raw_fd(), Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in HANDLED {
            unsafe {
                sigaction(signal, &action).map_err(io::Error::from)?;
            }
        }
        Ok(SignalPipe { rd })
    }

    /// File descriptor to poll for readability.
    pub fn fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.rd.as_raw_fd()) }
    }

    /// Drains every queued signal byte.
    pub fn drain(&self) -> Vec<Signal> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match read(self.rd.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for byte in &buf[..n] {
                        if let Ok(signal) = Signal::try_from(*byte as i32) {
                            signals.push(signal);
                        }
                    }
                }
                Err(_) => break,
            }
        }
        signals
    }
}
