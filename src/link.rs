//! Owns the duplex serial endpoint and the reader/caller concurrency split.
//!
//! A [`Link`] is generic over anything that reads and writes bytes — a real
//! `Box<dyn serialport::SerialPort>` in production, or a `UnixStream` half
//! in tests — so the reader-thread/reply-latch machinery is exercised the
//! same way whether or not real hardware is attached.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::codec::{self, Command, Frame};
use crate::error::{Error, Result};
use crate::framer;

/// Optional, non-blocking callbacks for OTA progress and completion.
///
/// `on_progress` fires from two independent sources (§4.4): the reader
/// thread calls it for target-originated PROGRESS frames, and the Sender
/// calls the same clone directly after each DATA block it gets ACKed.
/// Handlers must not block. Cheaply `Clone`-able (an `Arc` per callback) so
/// both sides can hold their own copy.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_progress: Option<Arc<dyn Fn(u32, u32, u8) + Send + Sync>>,
    pub on_complete: Option<Arc<dyn Fn(bool, u8) + Send + Sync>>,
}

/// The single-slot, generation-tagged reply mailbox (§5/§9).
///
/// The caller mints a new generation and clears the slot before writing a
/// request; the reader stamps every stored reply with the generation that
/// was current at the moment it arrived. A waiter only accepts a reply
/// carrying its own generation, so a reply left over from an earlier,
/// already-abandoned wait can never satisfy a later one.
struct ReplySlot {
    generation: u64,
    reply: Option<(u64, Frame)>,
}

struct Shared {
    slot: Mutex<ReplySlot>,
    cv: Condvar,
    shutdown: AtomicBool,
    /// Set by a caller awaiting END's outcome (§4.4): while armed, a
    /// COMPLETE frame is *also* latched into the reply slot so that wait
    /// unblocks, in addition to always firing the `on_complete` hook. Any
    /// other outstanding wait (RPC, START, DATA) leaves this false, so an
    /// unrelated COMPLETE never satisfies it — matching §4.3's rule that
    /// COMPLETE is an asynchronous event, not a general-purpose reply.
    end_armed: AtomicBool,
}

impl Shared {
    fn dispatch(self: &Arc<Self>, hooks: &Hooks, frame: Frame) {
        let command = match Command::from_code(frame.command) {
            Some(c) => c,
            None => {
                warn!("dropping frame with unknown command {:#04x}", frame.command);
                return;
            }
        };

        if command.is_reply() {
            trace!("latching reply {:?} seq={}", command, frame.sequence);
            let mut slot = self.slot.lock().unwrap();
            let generation = slot.generation;
            slot.reply = Some((generation, frame));
            self.cv.notify_all();
            return;
        }

        match command {
            Command::Progress => {
                if let Ok(p) = codec::ProgressPayload::unpack(&frame.payload) {
                    if let Some(hook) = &hooks.on_progress {
                        hook(p.received, p.total, p.percentage);
                    }
                } else {
                    warn!("dropping malformed PROGRESS payload");
                }
            }
            Command::Complete => {
                if self.end_armed.load(Ordering::Acquire) {
                    trace!("latching COMPLETE as the END reply");
                    let mut slot = self.slot.lock().unwrap();
                    let generation = slot.generation;
                    slot.reply = Some((generation, frame));
                    self.cv.notify_all();
                }
                if let Some(hook) = &hooks.on_complete {
                    hook(true, codec::ErrorCode::Success.code());
                }
            }
            other => {
                debug!("dropping unexpected gateway-bound command {:?}", other);
            }
        }
    }
}

/// Owns the write half of the serial endpoint and coordinates with a
/// background reader thread over the write half's twin read handle.
pub struct Link<W: Write + Send + 'static> {
    writer: Mutex<W>,
    shared: Arc<Shared>,
    reader_thread: Option<JoinHandle<()>>,
}

impl<W: Write + Send + 'static> Link<W> {
    /// Spawns the reader thread over `reader` and takes ownership of the
    /// write half `writer`. `reader` should have a bounded read timeout
    /// configured by the caller so the reader thread notices shutdown
    /// promptly instead of blocking forever on an idle line.
    pub fn spawn<R: Read + Send + 'static>(writer: W, mut reader: R, hooks: Hooks) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(ReplySlot {
                generation: 0,
                reply: None,
            }),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            end_armed: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        let reader_thread = thread::Builder::new()
            .name("uart-ota-reader".into())
            .spawn(move || {
                let mut buffer: Vec<u8> = Vec::new();
                let mut chunk = [0u8; 512];

                while !reader_shared.shutdown.load(Ordering::Relaxed) {
                    match reader.read(&mut chunk) {
                        Ok(0) => {}
                        Ok(n) => {
                            buffer.extend_from_slice(&chunk[..n]);
                            loop {
                                let (frame, rest) = framer::extract(&buffer);
                                buffer = rest;
                                match frame {
                                    Some(bytes) => match codec::unpack_frame(&bytes) {
                                        Ok(f) => reader_shared.dispatch(&hooks, f),
                                        Err(e) => warn!("framer matched an invalid frame: {}", e),
                                    },
                                    None => break,
                                }
                            }
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::TimedOut
                                || e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            error!("serial read failed, reader thread stopping: {}", e);
                            break;
                        }
                    }
                }
                debug!("reader thread exiting");
            })
            .expect("failed to spawn UART reader thread");

        Link {
            writer: Mutex::new(writer),
            shared,
            reader_thread: Some(reader_thread),
        }
    }

    fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().unwrap();
        w.write_all(bytes)
            .map_err(|e| Error::Transport(format!("write failed: {}", e)))?;
        w.flush()
            .map_err(|e| Error::Transport(format!("flush failed: {}", e)))?;
        Ok(())
    }

    /// Sends `frame_bytes` and waits up to `timeout` for the single next
    /// reply frame. Returns `Ok(None)` on timeout, never a stale reply.
    pub fn request(&self, frame_bytes: &[u8], timeout: Duration) -> Result<Option<Frame>> {
        self.request_inner(frame_bytes, timeout, false)
    }

    /// Like [`Link::request`], but a COMPLETE frame is also accepted as the
    /// reply (§4.4: END's wait ends on either a NACK or a target COMPLETE).
    /// Every other outstanding wait treats COMPLETE as a pure async event.
    pub fn request_awaiting_complete(&self, frame_bytes: &[u8], timeout: Duration) -> Result<Option<Frame>> {
        self.request_inner(frame_bytes, timeout, true)
    }

    fn request_inner(&self, frame_bytes: &[u8], timeout: Duration, expect_complete: bool) -> Result<Option<Frame>> {
        let my_generation = {
            let mut slot = self.shared.slot.lock().unwrap();
            slot.generation += 1;
            slot.reply = None;
            slot.generation
        };
        self.shared.end_armed.store(expect_complete, Ordering::Release);

        let result = (|| {
            self.write_frame(frame_bytes)?;

            let deadline = Instant::now() + timeout;
            let mut slot = self.shared.slot.lock().unwrap();
            loop {
                if let Some((generation, _)) = &slot.reply {
                    if *generation == my_generation {
                        let (_, frame) = slot.reply.take().unwrap();
                        return Ok(Some(frame));
                    }
                    // A reply tagged with a different generation is stale (left
                    // over from a wait this caller already abandoned); discard
                    // it rather than let it satisfy this wait.
                    slot.reply = None;
                }

                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                let (guard, _timeout_result) = self
                    .shared
                    .cv
                    .wait_timeout(slot, deadline - now)
                    .expect("reply slot mutex poisoned");
                slot = guard;
            }
        })();

        if expect_complete {
            self.shared.end_armed.store(false, Ordering::Release);
        }
        result
    }

    /// Best-effort one-way send with no reply wait (used for ABORT).
    pub fn send_no_reply(&self, frame_bytes: &[u8]) {
        if let Err(e) = self.write_frame(frame_bytes) {
            warn!("best-effort send failed: {}", e);
        }
    }

    /// Stops the reader thread and releases it. The underlying serial
    /// handle is dropped by the caller after this returns.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.cv.notify_all();
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

impl<W: Write + Send + 'static> Drop for Link<W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{pack_frame, Command};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicU32;

    fn duplex_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        b.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        (a, b)
    }

    #[test]
    fn request_receives_matching_reply() {
        let (gateway_io, target_io) = duplex_pair();
        let gateway_reader = gateway_io.try_clone().unwrap();
        let link = Link::spawn(gateway_io, gateway_reader, Hooks::default());

        let mut target_writer = target_io.try_clone().unwrap();
        let mut target_reader = target_io;

        let responder = thread::spawn(move || {
            let mut buf = [0u8; 256];
            let mut acc = Vec::new();
            loop {
                match target_reader.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => acc.extend_from_slice(&buf[..n]),
                    Err(_) => continue,
                }
                let (frame, rest) = framer::extract(&acc);
                acc = rest;
                if frame.is_some() {
                    let reply = pack_frame(Command::Ready.code(), 0, 0, &[]).unwrap();
                    target_writer.write_all(&reply).unwrap();
                    target_writer.flush().unwrap();
                    return;
                }
            }
        });

        let start = pack_frame(Command::Start.code(), 0, 0, &[]).unwrap();
        let reply = link
            .request(&start, Duration::from_millis(500))
            .unwrap()
            .expect("expected a reply");
        assert_eq!(reply.command, Command::Ready.code());

        responder.join().unwrap();
    }

    #[test]
    fn request_times_out_with_no_reply() {
        let (gateway_io, _target_io) = duplex_pair();
        let gateway_reader = gateway_io.try_clone().unwrap();
        let link = Link::spawn(gateway_io, gateway_reader, Hooks::default());

        let start = pack_frame(Command::Start.code(), 0, 0, &[]).unwrap();
        let reply = link.request(&start, Duration::from_millis(100)).unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn stale_reply_does_not_satisfy_a_later_wait() {
        let (gateway_io, target_io) = duplex_pair();
        let gateway_reader = gateway_io.try_clone().unwrap();
        let link = Link::spawn(gateway_io, gateway_reader, Hooks::default());

        // First request times out (target never responds).
        let req1 = pack_frame(Command::QueryStatus.code(), 1, 0, &[]).unwrap();
        let reply1 = link.request(&req1, Duration::from_millis(80)).unwrap();
        assert!(reply1.is_none());

        // Simulate the first reply finally arriving late, tagged to the
        // generation active when it's processed — by the time the second
        // request starts its own wait, it resets the slot so this cannot
        // leak forward.
        let mut target_writer = target_io.try_clone().unwrap();
        let stale = pack_frame(Command::Ack.code(), 1, 0, &[]).unwrap();
        target_writer.write_all(&stale).unwrap();
        target_writer.flush().unwrap();
        thread::sleep(Duration::from_millis(150));

        let req2 = pack_frame(Command::QueryStatus.code(), 2, 0, &[]).unwrap();
        let reply2 = link.request(&req2, Duration::from_millis(100)).unwrap();
        assert!(reply2.is_none(), "a reply delivered before this wait started must not satisfy it");

        let _ = target_io;
    }

    #[test]
    fn progress_hook_fires_without_unblocking_a_waiter() {
        let (gateway_io, target_io) = duplex_pair();
        let gateway_reader = gateway_io.try_clone().unwrap();

        let progress_count = Arc::new(AtomicU32::new(0));
        let progress_count_cb = Arc::clone(&progress_count);
        let hooks = Hooks {
            on_progress: Some(Arc::new(move |_received, _total, _pct| {
                progress_count_cb.fetch_add(1, Ordering::SeqCst);
            })),
            on_complete: None,
        };
        let link = Link::spawn(gateway_io, gateway_reader, hooks);

        let mut target_writer = target_io.try_clone().unwrap();
        let progress_payload = codec::ProgressPayload {
            received: 10,
            total: 100,
            percentage: 10,
        };
        let event = pack_frame(Command::Progress.code(), 0, 0, &progress_payload.pack()).unwrap();
        target_writer.write_all(&event).unwrap();
        target_writer.flush().unwrap();

        let req = pack_frame(Command::QueryStatus.code(), 1, 0, &[]).unwrap();
        let reply = link.request(&req, Duration::from_millis(150)).unwrap();
        assert!(reply.is_none(), "PROGRESS must not be treated as a reply");

        thread::sleep(Duration::from_millis(50));
        assert_eq!(progress_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn complete_does_not_unblock_a_plain_request() {
        let (gateway_io, target_io) = duplex_pair();
        let gateway_reader = gateway_io.try_clone().unwrap();
        let link = Link::spawn(gateway_io, gateway_reader, Hooks::default());

        let mut target_writer = target_io.try_clone().unwrap();
        let event = pack_frame(Command::Complete.code(), 0, 0, &[]).unwrap();
        target_writer.write_all(&event).unwrap();
        target_writer.flush().unwrap();

        let req = pack_frame(Command::QueryStatus.code(), 1, 0, &[]).unwrap();
        let reply = link.request(&req, Duration::from_millis(150)).unwrap();
        assert!(reply.is_none(), "an unarmed wait must not be satisfied by COMPLETE");
    }

    #[test]
    fn complete_unblocks_a_request_awaiting_it() {
        let (gateway_io, target_io) = duplex_pair();
        let gateway_reader = gateway_io.try_clone().unwrap();
        let link = Link::spawn(gateway_io, gateway_reader, Hooks::default());

        let mut target_writer = target_io.try_clone().unwrap();
        let responder = {
            let end = pack_frame(Command::End.code(), 4, 0, &[]).unwrap();
            let target_reader_done = Arc::new(AtomicU32::new(0));
            let done = Arc::clone(&target_reader_done);
            let mut target_reader = target_io;
            thread::spawn(move || {
                let mut buf = [0u8; 256];
                let mut acc = Vec::new();
                loop {
                    match target_reader.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => acc.extend_from_slice(&buf[..n]),
                        Err(_) => continue,
                    }
                    let (frame, rest) = framer::extract(&acc);
                    acc = rest;
                    if let Some(bytes) = frame {
                        assert_eq!(bytes, end);
                        let reply = pack_frame(Command::Complete.code(), 0, 0, &[]).unwrap();
                        target_writer.write_all(&reply).unwrap();
                        target_writer.flush().unwrap();
                        done.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                }
            })
        };

        let end = pack_frame(Command::End.code(), 4, 0, &[]).unwrap();
        let reply = link
            .request_awaiting_complete(&end, Duration::from_millis(500))
            .unwrap()
            .expect("COMPLETE must satisfy an armed wait");
        assert_eq!(reply.command, Command::Complete.code());

        responder.join().unwrap();
    }
}
