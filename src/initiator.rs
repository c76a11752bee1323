//! The initiator engine.
//!
//! Every acknowledged command is registered in a transaction table before it goes out. A reader
//! thread drains the transport, matches replies against the table, and periodically sweeps it for
//! transactions whose deadline passed, either retransmitting the exact same bytes or failing them
//! with [`Error::Timeout`] once the retries are used up. Callers either block until their
//! transaction resolves or take a [`PendingReply`] to collect it later.

use crate::{
    core::Config,
    transport::{
        self,
        tcp::SpwTcp,
        Deserialize,
        Serialize,
        Transport,
    },
    Error,
    Result,
};
use rmap::{
    encode_command,
    Command,
    PendingTransaction,
    Reply,
    TargetNode,
    TransactionTable,
};
use std::{
    net::ToSocketAddrs,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        mpsc::{
            self,
            Receiver,
            RecvTimeoutError,
            Sender,
        },
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};
use tracing::{
    debug,
    error,
    trace,
    warn,
};

/// Flags for a write command
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    /// Have the target check the data CRC before touching memory
    pub verify: bool,
    /// Wait for the target to confirm the write
    pub acknowledge: bool,
    /// Write consecutive addresses rather than the same one over and over
    pub increment: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            verify: false,
            acknowledge: true,
            increment: true,
        }
    }
}

/// The completion slot of a pending transaction
#[derive(Debug)]
struct InFlight {
    /// The bytes as first sent, so retransmissions are identical
    frame: Vec<u8>,
    target: TargetNode,
    outcome: Sender<Result<Reply>>,
}

impl InFlight {
    fn complete(self, outcome: Result<Reply>) {
        // The caller may have stopped waiting already
        let _ = self.outcome.send(outcome);
    }
}

#[derive(Debug)]
struct Session {
    table: TransactionTable<InFlight>,
    /// Set once the session is over, handed to everything that tries to use it afterwards
    failure: Option<Error>,
}

impl Session {
    fn ensure_open(&self) -> Result<()> {
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
struct Shared<T> {
    transport: T,
    config: Config,
    session: Mutex<Session>,
    running: AtomicBool,
}

/// Check a matched reply against the command it answers
fn check_reply(command: &Command, target: &TargetNode, reply: Reply) -> Result<Reply> {
    let transaction_id = reply.transaction_id;
    if reply.target_logical_address != target.logical_address()
        || reply.initiator_logical_address != target.initiator_logical_address()
    {
        return Err(Error::ReplyMismatch {
            transaction_id,
            reason: "reply is between a different pair of logical addresses",
        });
    }
    if reply.kind != command.kind {
        return Err(Error::ReplyMismatch {
            transaction_id,
            reason: "reply is for a different kind of command",
        });
    }
    if !reply.is_success() {
        return Err(Error::from_status(reply.status));
    }
    if reply.data.len() != command.reply_data_length() as usize {
        return Err(Error::ReplyMismatch {
            transaction_id,
            reason: "reply carries the wrong amount of data",
        });
    }
    Ok(reply)
}

impl<T: Transport> Shared<T> {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End the session, failing every pending transaction with `error`
    fn fail_session(&self, error: Error) {
        let mut session = self.lock_session();
        if session.failure.is_none() {
            session.failure = Some(error.clone());
        }
        let pending: Vec<_> = session.table.drain().collect();
        drop(session);
        for transaction in pending {
            trace!(transaction_id = transaction.transaction_id, "Failed");
            transaction.slot.complete(Err(error.clone()));
        }
    }

    /// Push a frame out, ending the session if the transport can't take it.
    /// A frame refused for its size never touched the wire, so that alone isn't fatal.
    fn send(&self, frame: &[u8]) -> Result<()> {
        match self.transport.send(frame) {
            Ok(()) => Ok(()),
            Err(e @ transport::Error::FrameTooLarge { .. }) => Err(Error::Transport(Arc::new(e))),
            Err(e) => {
                let e = Arc::new(e);
                error!(error = %e, "Send failed, ending the session");
                self.running.store(false, Ordering::Release);
                self.fail_session(Error::Connection(e.clone()));
                Err(Error::Transport(e))
            }
        }
    }

    /// Match an inbound frame to its transaction. Anything that isn't a reply to a pending
    /// transaction is logged and dropped.
    fn dispatch(&self, frame: &[u8]) {
        let reply = match rmap::decode_reply(frame) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, bytes = frame.len(), "Discarded inbound frame");
                return;
            }
        };
        let resolved = self.lock_session().table.resolve(&reply);
        let transaction = match resolved {
            Ok(transaction) => transaction,
            Err(e) => {
                warn!(error = %e, "Discarded reply");
                return;
            }
        };
        trace!(
            transaction_id = transaction.transaction_id,
            attempt = transaction.retries + 1,
            "Completed"
        );
        let outcome = check_reply(&transaction.command, &transaction.slot.target, reply);
        transaction.slot.complete(outcome);
    }

    /// Retransmit or time out everything past its deadline
    fn sweep(&self, now: Instant) {
        let mut retransmissions = vec![];
        let mut timed_out = vec![];
        {
            let mut session = self.lock_session();
            let expired: Vec<_> = session.table.expire(now).collect();
            for transaction in expired {
                if transaction.retries >= self.config.retries {
                    timed_out.push(transaction);
                    continue;
                }
                let PendingTransaction {
                    transaction_id,
                    command,
                    retries,
                    slot,
                    ..
                } = transaction;
                let frame = slot.frame.clone();
                let deadline = now + self.config.timeouts.read;
                match session
                    .table
                    .register(transaction_id, command, deadline, slot)
                {
                    Ok(entry) => {
                        entry.retries = retries + 1;
                        debug!(transaction_id, attempt = retries + 2, "Retransmitting");
                        retransmissions.push(frame);
                    }
                    Err(e) => error!(error = %e, "Couldn't requeue an expired transaction"),
                }
            }
        }
        for transaction in timed_out {
            let transaction_id = transaction.transaction_id;
            warn!(transaction_id, "Timed out");
            transaction.slot.complete(Err(Error::Timeout {
                transaction_id,
                attempts: transaction.retries + 1,
            }));
        }
        for frame in retransmissions {
            if self.send(&frame).is_err() {
                return;
            }
        }
    }

    fn run(&self) {
        debug!("Reader started");
        while self.running.load(Ordering::Acquire) {
            match self.transport.receive() {
                Ok(Some(frame)) => self.dispatch(&frame),
                Ok(None) => {}
                Err(e) => {
                    if self.running.swap(false, Ordering::AcqRel) {
                        error!(error = %e, "Transport failed, ending the session");
                        self.fail_session(Error::Connection(Arc::new(e)));
                    }
                    break;
                }
            }
            self.sweep(Instant::now());
        }
        debug!("Reader stopped");
    }
}

/// A command on the wire whose reply hasn't been collected yet.
///
/// Dropping the handle (or calling [`PendingReply::cancel`]) withdraws the transaction, after which
/// a late reply to it is discarded like any other unsolicited one.
#[derive(Debug)]
#[must_use = "the transaction is cancelled when this is dropped"]
pub struct PendingReply<T: Transport> {
    shared: Arc<Shared<T>>,
    transaction_id: u16,
    submitted: Instant,
    completion: Receiver<Result<Reply>>,
    /// Kept for `wait_timeout` callers that ask again after it resolved
    outcome: Option<Result<Reply>>,
    settled: bool,
}

impl<T: Transport> PendingReply<T> {
    #[must_use]
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    fn disconnected(&self) -> Error {
        self.shared
            .lock_session()
            .failure
            .clone()
            .unwrap_or(Error::Closed)
    }

    /// Block until the transaction resolves
    /// # Errors
    /// Returns an error if the target rejects the command, the reply doesn't fit it, the retries
    /// run out, or the session ends first
    pub fn wait(mut self) -> Result<Reply> {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        self.settled = true;
        let transaction_id = self.transaction_id;
        let budget = self
            .shared
            .config
            .transaction_budget()
            .saturating_sub(self.submitted.elapsed());
        match self.completion.recv_timeout(budget) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                // The reader should have expired it by now, make sure a late reply can't match
                let cancelled = self.shared.lock_session().table.cancel(transaction_id);
                if let Ok(outcome) = self.completion.try_recv() {
                    return outcome;
                }
                warn!(transaction_id, "Gave up waiting on the reader");
                Err(Error::Timeout {
                    transaction_id,
                    attempts: cancelled.map_or(self.shared.config.attempts(), |t| t.retries + 1),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    /// Wait up to `timeout` for the transaction to resolve, returning `None` if it is still in
    /// flight. Retries carry on in the background either way.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<Reply>> {
        if self.outcome.is_none() {
            let outcome = match self.completion.recv_timeout(timeout) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
            };
            self.outcome = Some(outcome);
            self.settled = true;
        }
        self.outcome.clone()
    }

    /// Withdraw the transaction. A reply arriving afterwards is dropped.
    pub fn cancel(self) {
        drop(self);
    }
}

impl<T: Transport> Drop for PendingReply<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.shared.lock_session().table.cancel(self.transaction_id).is_some() {
            debug!(transaction_id = self.transaction_id, "Cancelled");
        }
    }
}

/// An RMAP initiator bound to one transport session
#[derive(Debug)]
pub struct Initiator<T: Transport> {
    shared: Arc<Shared<T>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Initiator<SpwTcp> {
    /// Connect to a SpaceWire-to-TCP bridge at `addr`
    /// # Errors
    /// Returns [`Error::Connection`] if no address accepts the connection in time
    pub fn connect<A: ToSocketAddrs>(addr: A, config: Config) -> Result<Self> {
        let transport =
            SpwTcp::connect(addr, &config).map_err(|e| Error::Connection(Arc::new(e)))?;
        Self::new(transport, config)
    }
}

impl<T: Transport> Initiator<T> {
    /// Start a session over an already connected transport
    /// # Errors
    /// Returns an error if the transport rejects the configured buffer sizes or the reader thread
    /// can't be spawned
    pub fn new(transport: T, config: Config) -> Result<Self> {
        transport
            .set_buffers(config.send_buffer_size, config.recv_buffer_size)
            .map_err(|e| Error::Connection(Arc::new(e)))?;
        let shared = Arc::new(Shared {
            transport,
            session: Mutex::new(Session {
                table: TransactionTable::with_id_range(config.transaction_ids.clone()),
                failure: None,
            }),
            config,
            running: AtomicBool::new(true),
        });
        let reader = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("rmap-reader".to_owned())
                .spawn(move || shared.run())
                .map_err(|e| Error::Connection(Arc::new(e.into())))?
        };
        Ok(Self {
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    /// The number of transactions waiting on a reply
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock_session().table.len()
    }

    #[must_use]
    pub fn is_pending(&self, transaction_id: u16) -> bool {
        self.shared.lock_session().table.contains(transaction_id)
    }

    /// Resize the transport buffers. Only allowed while nothing is in flight.
    /// # Errors
    /// Returns [`Error::Busy`] if transactions are pending, or an error if the transport refuses
    pub fn set_buffers(&self, send: usize, recv: usize) -> Result<()> {
        let session = self.shared.lock_session();
        session.ensure_open()?;
        if !session.table.is_empty() {
            return Err(Error::Busy(session.table.len()));
        }
        // Hold the session so nothing registers mid-resize
        self.shared
            .transport
            .set_buffers(send, recv)
            .map_err(|e| Error::Transport(Arc::new(e)))
    }

    /// Register and send a command that expects a reply, without waiting on it
    fn submit(&self, target: &TargetNode, mut command: Command) -> Result<PendingReply<T>> {
        let (outcome, completion) = mpsc::channel();
        let (transaction_id, frame) = {
            let mut session = self.shared.lock_session();
            session.ensure_open()?;
            let transaction_id = session.table.allocate()?;
            command.transaction_id = transaction_id;
            let frame = encode_command(&command, target)?;
            let deadline = Instant::now() + self.shared.config.timeouts.read;
            let slot = InFlight {
                frame: frame.clone(),
                target: target.clone(),
                outcome,
            };
            session
                .table
                .register(transaction_id, command, deadline, slot)?;
            (transaction_id, frame)
        };
        let submitted = Instant::now();
        if let Err(e) = self.shared.send(&frame) {
            self.shared.lock_session().table.cancel(transaction_id);
            return Err(e);
        }
        trace!(transaction_id, bytes = frame.len(), "Awaiting reply");
        Ok(PendingReply {
            shared: self.shared.clone(),
            transaction_id,
            submitted,
            completion,
            outcome: None,
            settled: false,
        })
    }

    /// Run one command through its whole lifecycle.
    ///
    /// The transaction ID is assigned here, whatever `command` carries is overwritten. Commands
    /// that don't ask for a reply return `None` as soon as the transport accepts them.
    /// # Errors
    /// Returns an error if the command can't be encoded, the session is over, the target rejects
    /// it, or no reply arrives within the retry budget
    pub fn execute(&self, target: &TargetNode, mut command: Command) -> Result<Option<Reply>> {
        if command.expects_reply() {
            return self.submit(target, command)?.wait().map(Some);
        }
        let frame = {
            let mut session = self.shared.lock_session();
            session.ensure_open()?;
            command.transaction_id = session.table.allocate()?;
            encode_command(&command, target)?
        };
        self.shared.send(&frame)?;
        trace!(
            transaction_id = command.transaction_id,
            "Sent without acknowledgement"
        );
        Ok(None)
    }

    /// Start a read of `length` bytes at `address` and hand back the transaction to wait on later
    /// # Errors
    /// Returns an error if the command can't be encoded or sent
    pub fn read_async(
        &self,
        target: &TargetNode,
        address: u32,
        length: u32,
    ) -> Result<PendingReply<T>> {
        self.submit(target, Command::read(address, length).with_key(target.key()))
    }

    /// Start an acknowledged write of `data` at `address` without waiting for the target
    /// # Errors
    /// Returns an error if the command can't be encoded or sent
    pub fn write_async(
        &self,
        target: &TargetNode,
        address: u32,
        data: &[u8],
    ) -> Result<PendingReply<T>> {
        self.submit(target, Command::write(address, data).with_key(target.key()))
    }

    /// Read `length` bytes starting at `address`
    /// # Errors
    /// See [`Initiator::execute`]
    pub fn read(&self, target: &TargetNode, address: u32, length: u32) -> Result<Vec<u8>> {
        let command = Command::read(address, length).with_key(target.key());
        Ok(self
            .execute(target, command)?
            .map(|reply| reply.data)
            .unwrap_or_default())
    }

    /// Fill `buf` with the bytes starting at `address`
    /// # Errors
    /// See [`Initiator::execute`]
    pub fn read_into(&self, target: &TargetNode, address: u32, buf: &mut [u8]) -> Result<()> {
        let length = u32::try_from(buf.len()).map_err(|_| rmap::Error::PayloadTooLarge(buf.len()))?;
        let data = self.read(target, address, length)?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Read a big endian number from `address`
    /// # Errors
    /// See [`Initiator::execute`]
    pub fn read_value<D>(&self, target: &TargetNode, address: u32) -> Result<D>
    where
        D: Deserialize,
    {
        let mut chunk = D::Chunk::default();
        self.read_into(target, address, chunk.as_mut())?;
        Ok(D::deserialize(chunk))
    }

    /// Write `data` starting at `address` and wait for the target to acknowledge it
    /// # Errors
    /// See [`Initiator::execute`]
    pub fn write(&self, target: &TargetNode, address: u32, data: &[u8]) -> Result<()> {
        self.write_with(target, address, data, WriteOptions::default())
    }

    /// Write `data` starting at `address` with explicit command flags
    /// # Errors
    /// See [`Initiator::execute`]
    pub fn write_with(
        &self,
        target: &TargetNode,
        address: u32,
        data: &[u8],
        options: WriteOptions,
    ) -> Result<()> {
        let command = Command::write(address, data)
            .with_key(target.key())
            .with_verify(options.verify)
            .with_acknowledge(options.acknowledge)
            .with_increment(options.increment);
        self.execute(target, command).map(|_| ())
    }

    /// Write a number to `address`, big endian
    /// # Errors
    /// See [`Initiator::execute`]
    pub fn write_value<S>(&self, target: &TargetNode, address: u32, value: &S) -> Result<()>
    where
        S: Serialize,
    {
        self.write(target, address, value.serialize().as_ref())
    }

    /// Replace the bits of `mask` at `address` with those of `data`, returning the old contents
    /// # Errors
    /// Returns an error if `data` and `mask` aren't both 1 to 4 bytes long, otherwise see
    /// [`Initiator::execute`]
    pub fn read_modify_write(
        &self,
        target: &TargetNode,
        address: u32,
        data: &[u8],
        mask: &[u8],
    ) -> Result<Vec<u8>> {
        let command = Command::read_modify_write(address, data, mask)?.with_key(target.key());
        Ok(self
            .execute(target, command)?
            .map(|reply| reply.data)
            .unwrap_or_default())
    }

    /// Broadcast a SpaceWire time-code
    /// # Errors
    /// Returns an error if the session is over or the transport can't send it
    pub fn emit_timecode(&self, timecode: u8) -> Result<()> {
        self.shared.lock_session().ensure_open()?;
        self.shared
            .transport
            .emit_timecode(timecode)
            .map_err(|e| Error::Transport(Arc::new(e)))
    }

    /// End the session. The reader stops, the transport is closed, and anything still pending
    /// fails with [`Error::Closed`].
    /// # Errors
    /// Returns an error if the transport doesn't shut down cleanly
    pub fn close(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        let closed = self.shared.transport.close();
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            if reader.join().is_err() {
                error!("Reader thread panicked");
            }
        }
        self.shared.fail_session(Error::Closed);
        closed.map_err(|e| Error::Connection(Arc::new(e)))
    }
}

impl<T: Transport> Drop for Initiator<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "Transport didn't close cleanly");
        }
    }
}
