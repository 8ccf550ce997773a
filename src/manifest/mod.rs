//! # Manifest Component
//!
//! The manifest is the metadata authority of the engine: an
//! **append-only event log** recording which SST files are live at
//! which level, how many stripes are committed, and the most recent
//! checkpoint. A fold over the log reconstructs the exact live set —
//! deterministically and order-preservingly — so two opens of the same
//! directory always agree.
//!
//! # On-disk layout
//!
//! `manifest.akmf` is a sequence of frames:
//!
//! ```text
//! [LEN_LE u32][TAG u8][PAYLOAD][CRC32C_LE u32]
//! ```
//!
//! `LEN` counts the tag byte plus payload; the CRC covers tag ‖
//! payload. Payload fields use the crate's [`encoding`](crate::encoding)
//! wire format.
//!
//! | tag | event            |
//! |-----|------------------|
//! | 0   | StripeCommit     |
//! | 1   | SstSeal          |
//! | 2   | SstDelete        |
//! | 3   | CompactionStart  |
//! | 4   | CompactionEnd    |
//! | 5   | Checkpoint       |
//! | 6   | Truncate         |
//! | 7   | FormatBump       |
//!
//! # Durability
//!
//! Events are group-committed by a dedicated writer thread (fast mode
//! `sync_data` per batch); Checkpoint events force a full `sync_all`.
//! [`Manifest::append`] returns a completion ticket; callers that need
//! the event durable (seals, compaction ends) wait on it.
//!
//! # Rotation
//!
//! When the log exceeds the configured size the writer renames it to
//! `manifest.{timestamp}` and re-expresses live state into a fresh
//! `manifest.akmf` (format bump, stripe commit, checkpoint, one seal
//! per live SST, pending compaction starts). A fold of the newest file
//! alone is therefore always sufficient.
//!
//! # Fold semantics
//!
//! - `SstSeal` adds a file to its level; sealing a live file twice is
//!   [`ManifestError::Inconsistent`] (refuse to open).
//! - `CompactionEnd` adds the output and clears the matching
//!   `CompactionStart`; inputs stay live until their `SstDelete`.
//! - A `CompactionStart` with no `CompactionEnd` at EOF leaves inputs
//!   live; its never-sealed outputs are garbage the engine removes.
//! - A torn trailing frame is discarded with a warning; a CRC mismatch
//!   in a complete frame refuses to open.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec;
use crate::encoding::{self, Decode, Encode, EncodingError};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Live manifest file name.
pub const MANIFEST_FILENAME: &str = "manifest.akmf";

/// Highest format major version this build understands.
pub const FORMAT_MAJOR: u32 = 1;

/// Current format minor version.
pub const FORMAT_MINOR: u32 = 0;

/// Maximum sane frame length; larger prefixes are corruption.
const MAX_EVENT_LEN: usize = 1 << 20;

/// Levels beyond this are structurally invalid.
const MAX_LEVEL: u32 = 63;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error inside an event payload.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The event log describes an impossible state transition, or a
    /// complete frame failed its CRC. The engine refuses to open.
    #[error("manifest inconsistent: {0}")]
    Inconsistent(String),

    /// The writer has shut down.
    #[error("manifest closed")]
    Closed,

    /// Internal consistency error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Events
// ------------------------------------------------------------------------------------------------

/// One manifest log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEvent {
    /// Stripe append progress: the next stripe index to be written.
    StripeCommit { next_stripe: u64 },

    /// A new SST became live at `level`.
    SstSeal {
        level: u32,
        file: String,
        entries: u64,
        first_key_hex: Option<String>,
        last_key_hex: Option<String>,
    },

    /// A previously live SST is deleted.
    SstDelete { file: String },

    /// A compaction began consuming `inputs` at `level`.
    CompactionStart { level: u32, inputs: Vec<String> },

    /// A compaction finished, sealing `output` into `level + 1`.
    CompactionEnd {
        level: u32,
        output: String,
        inputs: Vec<String>,
        entries: u64,
        first_key_hex: Option<String>,
        last_key_hex: Option<String>,
    },

    /// Recovery high-water mark.
    Checkpoint {
        name: Option<String>,
        stripe: Option<u64>,
        last_seq: Option<u64>,
    },

    /// Operator note: something was excluded or trimmed.
    Truncate { note: Option<String> },

    /// On-disk format version change.
    FormatBump { major: u32, minor: u32 },
}

impl ManifestEvent {
    fn tag(&self) -> u8 {
        match self {
            ManifestEvent::StripeCommit { .. } => 0,
            ManifestEvent::SstSeal { .. } => 1,
            ManifestEvent::SstDelete { .. } => 2,
            ManifestEvent::CompactionStart { .. } => 3,
            ManifestEvent::CompactionEnd { .. } => 4,
            ManifestEvent::Checkpoint { .. } => 5,
            ManifestEvent::Truncate { .. } => 6,
            ManifestEvent::FormatBump { .. } => 7,
        }
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            ManifestEvent::StripeCommit { next_stripe } => next_stripe.encode_to(buf),
            ManifestEvent::SstSeal {
                level,
                file,
                entries,
                first_key_hex,
                last_key_hex,
            } => {
                level.encode_to(buf)?;
                file.encode_to(buf)?;
                entries.encode_to(buf)?;
                first_key_hex.encode_to(buf)?;
                last_key_hex.encode_to(buf)
            }
            ManifestEvent::SstDelete { file } => file.encode_to(buf),
            ManifestEvent::CompactionStart { level, inputs } => {
                level.encode_to(buf)?;
                encoding::encode_vec(inputs, buf)
            }
            ManifestEvent::CompactionEnd {
                level,
                output,
                inputs,
                entries,
                first_key_hex,
                last_key_hex,
            } => {
                level.encode_to(buf)?;
                output.encode_to(buf)?;
                encoding::encode_vec(inputs, buf)?;
                entries.encode_to(buf)?;
                first_key_hex.encode_to(buf)?;
                last_key_hex.encode_to(buf)
            }
            ManifestEvent::Checkpoint {
                name,
                stripe,
                last_seq,
            } => {
                name.encode_to(buf)?;
                stripe.encode_to(buf)?;
                last_seq.encode_to(buf)
            }
            ManifestEvent::Truncate { note } => note.encode_to(buf),
            ManifestEvent::FormatBump { major, minor } => {
                major.encode_to(buf)?;
                minor.encode_to(buf)
            }
        }
    }

    fn decode(tag: u8, payload: &[u8]) -> Result<Self, ManifestError> {
        let mut off = 0;
        macro_rules! field {
            ($ty:ty) => {{
                let (value, n) = <$ty>::decode_from(&payload[off..])?;
                off += n;
                value
            }};
        }
        let event = match tag {
            0 => ManifestEvent::StripeCommit {
                next_stripe: field!(u64),
            },
            1 => ManifestEvent::SstSeal {
                level: field!(u32),
                file: field!(String),
                entries: field!(u64),
                first_key_hex: field!(Option<String>),
                last_key_hex: field!(Option<String>),
            },
            2 => ManifestEvent::SstDelete {
                file: field!(String),
            },
            3 => {
                let level = field!(u32);
                let (inputs, n) = encoding::decode_vec::<String>(&payload[off..])?;
                off += n;
                ManifestEvent::CompactionStart { level, inputs }
            }
            4 => {
                let level = field!(u32);
                let output = field!(String);
                let (inputs, n) = encoding::decode_vec::<String>(&payload[off..])?;
                off += n;
                ManifestEvent::CompactionEnd {
                    level,
                    output,
                    inputs,
                    entries: field!(u64),
                    first_key_hex: field!(Option<String>),
                    last_key_hex: field!(Option<String>),
                }
            }
            5 => ManifestEvent::Checkpoint {
                name: field!(Option<String>),
                stripe: field!(Option<u64>),
                last_seq: field!(Option<u64>),
            },
            6 => ManifestEvent::Truncate {
                note: field!(Option<String>),
            },
            7 => ManifestEvent::FormatBump {
                major: field!(u32),
                minor: field!(u32),
            },
            other => {
                return Err(ManifestError::Inconsistent(format!(
                    "unknown event tag {other}"
                )));
            }
        };
        if off != payload.len() {
            return Err(ManifestError::Inconsistent(
                "event payload has trailing bytes".into(),
            ));
        }
        Ok(event)
    }
}

/// Hex-encodes a key for the human-auditable manifest fields.
pub fn key_hex(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len() * 2);
    for byte in key {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ------------------------------------------------------------------------------------------------
// Folded state
// ------------------------------------------------------------------------------------------------

/// One live SST as recorded by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSst {
    /// Level the file lives at.
    pub level: u32,

    /// File name (relative to the SST directory).
    pub file: String,

    /// Record count at seal time.
    pub entries: u64,
}

/// Recovery high-water mark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointState {
    /// Optional operator-supplied name.
    pub name: Option<String>,

    /// Stripes committed at checkpoint time.
    pub stripe: Option<u64>,

    /// Highest durable seq at checkpoint time.
    pub last_seq: Option<u64>,
}

/// A CompactionStart awaiting its CompactionEnd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCompaction {
    /// Source level.
    pub level: u32,

    /// Input file names.
    pub inputs: Vec<String>,
}

/// The result of folding the event log.
#[derive(Debug, Clone, Default)]
pub struct ManifestState {
    /// Live files per level, in seal order (oldest first).
    pub live: BTreeMap<u32, Vec<LiveSst>>,

    /// Next stripe index to be written.
    pub stripes_committed: u64,

    /// Most recent checkpoint.
    pub last_checkpoint: CheckpointState,

    /// Starts with no matching end (at most one in practice).
    pub pending_compactions: Vec<PendingCompaction>,

    /// Current on-disk format version.
    pub format: (u32, u32),
}

impl ManifestState {
    fn new() -> Self {
        Self {
            format: (FORMAT_MAJOR, FORMAT_MINOR),
            ..Self::default()
        }
    }

    /// Every live file name, newest level order preserved.
    pub fn live_files(&self) -> Vec<&LiveSst> {
        self.live.values().flatten().collect()
    }

    /// Whether `file` is referenced as live at any level.
    pub fn is_live(&self, file: &str) -> bool {
        self.live
            .values()
            .any(|files| files.iter().any(|sst| sst.file == file))
    }

    /// Applies one event, validating state transitions.
    fn apply(&mut self, event: &ManifestEvent) -> Result<(), ManifestError> {
        match event {
            ManifestEvent::StripeCommit { next_stripe } => {
                self.stripes_committed = self.stripes_committed.max(*next_stripe);
            }
            ManifestEvent::SstSeal {
                level,
                file,
                entries,
                ..
            } => {
                if *level > MAX_LEVEL {
                    return Err(ManifestError::Inconsistent(format!(
                        "seal at impossible level {level}"
                    )));
                }
                if self.is_live(file) {
                    return Err(ManifestError::Inconsistent(format!(
                        "file {file} sealed twice"
                    )));
                }
                self.live.entry(*level).or_default().push(LiveSst {
                    level: *level,
                    file: file.clone(),
                    entries: *entries,
                });
            }
            ManifestEvent::SstDelete { file } => {
                if !self.is_live(file) {
                    return Err(ManifestError::Inconsistent(format!(
                        "delete of unknown file {file}"
                    )));
                }
                for files in self.live.values_mut() {
                    files.retain(|sst| sst.file != *file);
                }
                self.live.retain(|_, files| !files.is_empty());
            }
            ManifestEvent::CompactionStart { level, inputs } => {
                for input in inputs {
                    if !self.is_live(input) {
                        return Err(ManifestError::Inconsistent(format!(
                            "compaction at level {level} references unknown input {input}"
                        )));
                    }
                }
                self.pending_compactions.push(PendingCompaction {
                    level: *level,
                    inputs: inputs.clone(),
                });
            }
            ManifestEvent::CompactionEnd {
                level,
                output,
                inputs,
                entries,
                ..
            } => {
                // An empty output name means every record was eliminated
                // and no file was produced.
                if !output.is_empty() {
                    if self.is_live(output) {
                        return Err(ManifestError::Inconsistent(format!(
                            "compaction output {output} already live"
                        )));
                    }
                    let target = level + 1;
                    if target > MAX_LEVEL {
                        return Err(ManifestError::Inconsistent(format!(
                            "compaction into impossible level {target}"
                        )));
                    }
                    self.live.entry(target).or_default().push(LiveSst {
                        level: target,
                        file: output.clone(),
                        entries: *entries,
                    });
                }
                self.pending_compactions
                    .retain(|pending| !(pending.level == *level && pending.inputs == *inputs));
            }
            ManifestEvent::Checkpoint {
                name,
                stripe,
                last_seq,
            } => {
                self.last_checkpoint = CheckpointState {
                    name: name.clone(),
                    stripe: *stripe,
                    last_seq: *last_seq,
                };
            }
            ManifestEvent::Truncate { note } => {
                debug!(note = ?note, "manifest truncate note");
            }
            ManifestEvent::FormatBump { major, minor } => {
                if *major > FORMAT_MAJOR {
                    return Err(ManifestError::Inconsistent(format!(
                        "format {major}.{minor} newer than supported {FORMAT_MAJOR}.{FORMAT_MINOR}"
                    )));
                }
                self.format = (*major, *minor);
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Frame codec
// ------------------------------------------------------------------------------------------------

fn encode_frame(event: &ManifestEvent) -> Result<Vec<u8>, ManifestError> {
    let mut body = vec![event.tag()];
    event.encode_payload(&mut body)?;
    let mut frame = Vec::with_capacity(U32_SIZE + body.len() + U32_SIZE);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&codec::crc32c(&body).to_le_bytes());
    Ok(frame)
}

/// Decodes all frames of a manifest file.
///
/// Returns the events plus the byte length of the valid prefix. A torn
/// tail is discarded with a warning; a CRC mismatch in a complete frame
/// is [`ManifestError::Inconsistent`].
fn decode_frames(data: &[u8]) -> Result<(Vec<ManifestEvent>, u64), ManifestError> {
    let mut events = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let remaining = &data[pos..];
        if remaining.len() < U32_SIZE {
            warn!(offset = pos, "manifest torn tail discarded");
            break;
        }
        let len =
            u32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]) as usize;
        if len == 0 || len > MAX_EVENT_LEN {
            return Err(ManifestError::Inconsistent(format!(
                "frame length {len} out of range at offset {pos}"
            )));
        }
        if remaining.len() < U32_SIZE + len + U32_SIZE {
            warn!(offset = pos, "manifest torn tail discarded");
            break;
        }
        let body = &remaining[U32_SIZE..U32_SIZE + len];
        let stored_crc = u32::from_le_bytes([
            remaining[U32_SIZE + len],
            remaining[U32_SIZE + len + 1],
            remaining[U32_SIZE + len + 2],
            remaining[U32_SIZE + len + 3],
        ]);
        if codec::crc32c(body) != stored_crc {
            return Err(ManifestError::Inconsistent(format!(
                "frame checksum mismatch at offset {pos}"
            )));
        }
        events.push(ManifestEvent::decode(body[0], &body[1..])?);
        pos += U32_SIZE + len + U32_SIZE;
    }
    Ok((events, pos as u64))
}

// ------------------------------------------------------------------------------------------------
// Writer thread
// ------------------------------------------------------------------------------------------------

type Completion = Sender<Result<(), ManifestError>>;

enum ManifestCommand {
    Frame {
        bytes: Vec<u8>,
        /// Checkpoint frames force a full `sync_all`.
        full_sync: bool,
        done: Completion,
    },
    Shutdown {
        done: Completion,
    },
}

struct ManifestWriter {
    dir: PathBuf,
    file: BufWriter<File>,
    bytes_written: u64,
    rotate_bytes: u64,
    state: Arc<Mutex<ManifestState>>,
}

impl ManifestWriter {
    fn flush_batch(
        &mut self,
        batch: &mut Vec<(Vec<u8>, bool, Completion)>,
    ) {
        if batch.is_empty() {
            return;
        }
        let full_sync = batch.iter().any(|(_, full, _)| *full);
        let mut result: Result<(), io::Error> = Ok(());
        for (bytes, _, _) in batch.iter() {
            if let Err(e) = self.file.write_all(bytes) {
                result = Err(e);
                break;
            }
            self.bytes_written += bytes.len() as u64;
        }
        if result.is_ok() {
            result = self.file.flush().and_then(|_| {
                if full_sync {
                    self.file.get_ref().sync_all()
                } else {
                    self.file.get_ref().sync_data()
                }
            });
        }
        for (_, _, done) in batch.drain(..) {
            let completion = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(ManifestError::Io(io::Error::new(e.kind(), e.to_string()))),
            };
            let _ = done.send(completion);
        }
    }

    /// Rotates once the log is over the threshold — but only at a
    /// quiescent point. The snapshot is taken under the state lock with
    /// the command channel empty, so the snapshot equals the file
    /// content exactly and no event can be applied twice by a fold of
    /// the rotated log.
    fn maybe_rotate(&mut self, rx: &Receiver<ManifestCommand>) {
        if self.bytes_written <= self.rotate_bytes {
            return;
        }
        let snapshot = {
            let state = match self.state.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            // Events apply-and-enqueue under this same lock, so an empty
            // channel here means the file holds every applied event.
            if !rx.is_empty() {
                return;
            }
            state.clone()
        };
        if let Err(e) = self.rotate(snapshot) {
            warn!(error = %e, "manifest rotation failed, continuing on current file");
        }
    }

    /// Renames the full log aside and re-expresses `snapshot` into a
    /// fresh `manifest.akmf`.
    fn rotate(&mut self, snapshot: ManifestState) -> Result<(), ManifestError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let archive = self.dir.join(format!("manifest.{timestamp}"));
        let live_path = self.dir.join(MANIFEST_FILENAME);

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        fs::rename(&live_path, &archive)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&live_path)?;
        let mut writer = BufWriter::new(file);
        let mut written = 0u64;

        let mut events: Vec<ManifestEvent> = vec![
            ManifestEvent::FormatBump {
                major: snapshot.format.0,
                minor: snapshot.format.1,
            },
            ManifestEvent::StripeCommit {
                next_stripe: snapshot.stripes_committed,
            },
            ManifestEvent::Checkpoint {
                name: snapshot.last_checkpoint.name.clone(),
                stripe: snapshot.last_checkpoint.stripe,
                last_seq: snapshot.last_checkpoint.last_seq,
            },
        ];
        for sst in snapshot.live_files() {
            events.push(ManifestEvent::SstSeal {
                level: sst.level,
                file: sst.file.clone(),
                entries: sst.entries,
                first_key_hex: None,
                last_key_hex: None,
            });
        }
        for pending in &snapshot.pending_compactions {
            events.push(ManifestEvent::CompactionStart {
                level: pending.level,
                inputs: pending.inputs.clone(),
            });
        }
        for event in &events {
            let frame = encode_frame(event)?;
            writer.write_all(&frame)?;
            written += frame.len() as u64;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;

        // Make the rename + new file durable.
        File::open(&self.dir)?.sync_all()?;

        self.file = writer;
        self.bytes_written = written;
        info!(archive = %archive.display(), live_events = events.len(), "manifest rotated");
        Ok(())
    }
}

fn manifest_writer_loop(mut writer: ManifestWriter, rx: Receiver<ManifestCommand>) {
    let mut batch: Vec<(Vec<u8>, bool, Completion)> = Vec::new();
    loop {
        let command = if batch.is_empty() {
            match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => return,
            }
        } else {
            match rx.recv_timeout(Duration::from_micros(500)) {
                Ok(cmd) => cmd,
                Err(RecvTimeoutError::Timeout) => {
                    writer.flush_batch(&mut batch);
                    writer.maybe_rotate(&rx);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    writer.flush_batch(&mut batch);
                    return;
                }
            }
        };
        match command {
            ManifestCommand::Frame {
                bytes,
                full_sync,
                done,
            } => {
                batch.push((bytes, full_sync, done));
                if batch.len() >= 16 || full_sync {
                    writer.flush_batch(&mut batch);
                    writer.maybe_rotate(&rx);
                }
            }
            ManifestCommand::Shutdown { done } => {
                writer.flush_batch(&mut batch);
                let result = writer
                    .file
                    .flush()
                    .and_then(|_| writer.file.get_ref().sync_all())
                    .map_err(ManifestError::Io);
                let _ = done.send(result);
                while let Ok(cmd) = rx.try_recv() {
                    match cmd {
                        ManifestCommand::Frame { done, .. } => {
                            let _ = done.send(Err(ManifestError::Closed));
                        }
                        ManifestCommand::Shutdown { done } => {
                            let _ = done.send(Ok(()));
                        }
                    }
                }
                return;
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest handle
// ------------------------------------------------------------------------------------------------

/// Completion handle for an appended manifest event.
#[derive(Debug)]
pub struct ManifestTicket {
    rx: Receiver<Result<(), ManifestError>>,
}

impl ManifestTicket {
    /// Blocks until the event's batch is durable.
    pub fn wait(self) -> Result<(), ManifestError> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(ManifestError::Closed),
        }
    }
}

/// Handle to the manifest log: folded state plus the group-committed
/// appender.
#[derive(Debug)]
pub struct Manifest {
    state: Arc<Mutex<ManifestState>>,
    tx: Sender<ManifestCommand>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
}

impl Manifest {
    /// Opens (creating if absent) and folds `manifest.akmf` in `dir`.
    pub fn open(dir: impl AsRef<Path>, rotate_bytes: u64) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(MANIFEST_FILENAME);

        let mut state = ManifestState::new();
        if path.exists() {
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;
            let (events, valid_len) = decode_frames(&data)?;
            for event in &events {
                state.apply(event)?;
            }
            // Trim a torn tail so frames appended from here on stay
            // reachable by the next fold.
            if valid_len < data.len() as u64 {
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            info!(
                events = events.len(),
                live = state.live_files().len(),
                "manifest folded"
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let state = Arc::new(Mutex::new(state));
        let (tx, rx) = channel::unbounded();
        let writer = ManifestWriter {
            dir,
            bytes_written: file.metadata()?.len(),
            file: BufWriter::new(file),
            rotate_bytes,
            state: Arc::clone(&state),
        };
        let worker = std::thread::Builder::new()
            .name("akkara-manifest".into())
            .spawn(move || manifest_writer_loop(writer, rx))
            .map_err(|e| ManifestError::Internal(format!("failed to spawn manifest writer: {e}")))?;

        Ok(Self {
            state,
            tx,
            worker: Some(worker),
            closed: false,
        })
    }

    /// A clone of the current folded state.
    pub fn state(&self) -> Result<ManifestState, ManifestError> {
        Ok(self
            .state
            .lock()
            .map_err(|_| ManifestError::Internal("state lock poisoned".into()))?
            .clone())
    }

    /// Applies `event` to in-memory state and enqueues it for the
    /// writer. Returns the durability ticket.
    pub fn append(&self, event: ManifestEvent) -> Result<ManifestTicket, ManifestError> {
        if self.closed {
            return Err(ManifestError::Closed);
        }
        let full_sync = matches!(event, ManifestEvent::Checkpoint { .. });
        let bytes = encode_frame(&event)?;
        let (done, rx) = channel::bounded(1);

        // Apply and enqueue under one lock so the log order always
        // matches the fold order. The channel send never blocks.
        let mut state = self
            .state
            .lock()
            .map_err(|_| ManifestError::Internal("state lock poisoned".into()))?;
        state.apply(&event)?;
        self.tx
            .send(ManifestCommand::Frame {
                bytes,
                full_sync,
                done,
            })
            .map_err(|_| ManifestError::Closed)?;
        Ok(ManifestTicket { rx })
    }

    /// Appends and waits for durability.
    pub fn append_durable(&self, event: ManifestEvent) -> Result<(), ManifestError> {
        self.append(event)?.wait()
    }

    /// Stops the writer thread after a final full sync. Idempotent.
    pub fn close(&mut self) -> Result<(), ManifestError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let (done, rx) = channel::bounded(1);
        if self.tx.send(ManifestCommand::Shutdown { done }).is_ok() {
            let _ = rx.recv();
        }
        if let Some(handle) = self.worker.take() {
            handle
                .join()
                .map_err(|_| ManifestError::Internal("manifest writer thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for Manifest {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "manifest close failed on drop");
        }
    }
}
