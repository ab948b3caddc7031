//! File fragmenter/reassembler: fixed-size fragments over the binary file
//! channel, random-order reassembly into temp files, and dispatch of
//! completed blobs to their final paths.

use airan_protocol::{
    encode_blob_prefix, encode_fragment, fragment_count, parse_blob_header_len, parse_fragment,
    FileEntry, FileMessage, TransferHeader, FRAGMENT_PAYLOAD_SIZE,
};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use uuid::Uuid;
use tracing::{debug, info, warn};

/// Pacing: a short breather every ten fragments keeps the SCTP send queue
/// from ballooning on large files.
const PACING_EVERY: u64 = 10;
const PACING_SLEEP: Duration = Duration::from_millis(1);

/// Reassembly buffers idle longer than this are evicted.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Stream one file as a fragment sequence into `frag_tx` (a bounded channel
/// pumped onto the binary file channel). A closed channel aborts the
/// transfer; the bounded capacity provides backpressure on top of the
/// explicit pacing.
pub async fn send_file_stream(
    path: &Path,
    header: &FileMessage,
    frag_tx: &tokio::sync::mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let file_len = file
        .metadata()
        .await
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    let header_json = serde_json::to_string(header).context("encoding transfer header")?;
    let prefix = encode_blob_prefix(&header_json);
    let total_len = prefix.len() as u64 + file_len;
    let total_fragments = fragment_count(total_len);
    let message_id = Uuid::new_v4();

    info!(
        path = %path.display(),
        bytes = total_len,
        fragments = total_fragments,
        message_id = %message_id,
        "file stream send starting"
    );

    let mut pending: Vec<u8> = prefix;
    let mut read_buf = vec![0u8; FRAGMENT_PAYLOAD_SIZE];
    for index in 0..total_fragments {
        while pending.len() < FRAGMENT_PAYLOAD_SIZE {
            let n = file
                .read(&mut read_buf)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&read_buf[..n]);
        }
        let take = pending.len().min(FRAGMENT_PAYLOAD_SIZE);
        let payload: Vec<u8> = pending.drain(..take).collect();
        let frame = encode_fragment(message_id, total_fragments, index, &payload);
        frag_tx
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("fragment sink closed at {index}/{total_fragments}"))?;

        if (index + 1) % PACING_EVERY == 0 {
            tokio::time::sleep(PACING_SLEEP).await;
        }
    }

    info!(path = %path.display(), fragments = total_fragments, "file stream sent");
    Ok(())
}

/// A fully reassembled logical blob, parked in a temp file.
#[derive(Debug)]
pub struct CompletedBlob {
    pub channel: String,
    pub message_id: Uuid,
    pub temp_path: PathBuf,
    pub header: FileMessage,
    /// Byte offset of the file payload within the temp file.
    pub payload_offset: u64,
}

struct ReassemblyBuffer {
    total_fragments: u64,
    received: Vec<u64>,
    received_count: u64,
    temp_path: PathBuf,
    file: fs::File,
    last_activity: Instant,
}

impl ReassemblyBuffer {
    fn mark(&mut self, index: u64) -> bool {
        let word = (index / 64) as usize;
        let bit = 1u64 << (index % 64);
        if self.received[word] & bit == 0 {
            self.received[word] |= bit;
            self.received_count += 1;
            true
        } else {
            false
        }
    }

    fn complete(&self) -> bool {
        self.received_count == self.total_fragments
    }
}

/// Per-channel fragment reassembly keyed by `(channel, message_id)`.
/// Fragment `i`'s payload lands at byte offset `i * 8160` of the temp file,
/// so arrival order does not matter.
pub struct Reassembler {
    buffers: HashMap<(String, Uuid), ReassemblyBuffer>,
    temp_dir: PathBuf,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(temp_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            temp_dir,
            timeout,
        }
    }

    /// Feed one incoming binary message. Returns the completed blob when
    /// this fragment was the last missing piece.
    pub fn ingest(&mut self, channel: &str, data: &[u8], now: Instant) -> Result<Option<CompletedBlob>> {
        let (header, payload) = parse_fragment(data)?;
        let key = (channel.to_string(), header.message_id);

        // A mid-flight total mismatch means the sender reused the id;
        // restart the reassembly from scratch.
        if let Some(existing) = self.buffers.get(&key) {
            if existing.total_fragments != header.total_fragments {
                warn!(
                    message_id = %header.message_id,
                    "message id reused with different fragment count, restarting reassembly"
                );
                let stale = self.buffers.remove(&key).unwrap();
                let _ = fs::remove_file(&stale.temp_path);
            }
        }

        if !self.buffers.contains_key(&key) {
            let temp_path = self
                .temp_dir
                .join(format!("{}_{}.tmp", channel, header.message_id));
            let file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .read(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("creating {}", temp_path.display()))?;
            let words = (header.total_fragments as usize).div_ceil(64);
            self.buffers.insert(
                key.clone(),
                ReassemblyBuffer {
                    total_fragments: header.total_fragments,
                    received: vec![0u64; words],
                    received_count: 0,
                    temp_path,
                    file,
                    last_activity: now,
                },
            );
            debug!(message_id = %header.message_id, total = header.total_fragments, "reassembly started");
        }

        let buffer = self.buffers.get_mut(&key).unwrap();
        buffer.last_activity = now;

        let offset = header.fragment_index * FRAGMENT_PAYLOAD_SIZE as u64;
        buffer
            .file
            .seek(SeekFrom::Start(offset))
            .context("seeking reassembly temp file")?;
        // The padded tail of the last fragment is written too; the header's
        // file_size decides how much of it anyone reads back.
        buffer
            .file
            .write_all(payload)
            .context("writing fragment payload")?;
        buffer.mark(header.fragment_index);

        if !buffer.complete() {
            return Ok(None);
        }

        let mut buffer = self.buffers.remove(&key).unwrap();
        buffer.file.flush().context("flushing reassembly temp file")?;

        match read_blob_header(&mut buffer.file) {
            Ok((message, payload_offset)) => {
                debug!(message_id = %header.message_id, "reassembly complete");
                Ok(Some(CompletedBlob {
                    channel: key.0,
                    message_id: header.message_id,
                    temp_path: buffer.temp_path,
                    header: message,
                    payload_offset,
                }))
            }
            Err(e) => {
                let _ = fs::remove_file(&buffer.temp_path);
                Err(e)
            }
        }
    }

    /// Drop buffers idle past the timeout; their temp files go with them.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let stale: Vec<(String, Uuid)> = self
            .buffers
            .iter()
            .filter(|(_, b)| now.duration_since(b.last_activity) > timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(buffer) = self.buffers.remove(key) {
                warn!(message_id = %key.1, "evicting stale reassembly buffer");
                let _ = fs::remove_file(&buffer.temp_path);
            }
        }
        stale.len()
    }

    pub fn in_flight(&self, channel: &str) -> usize {
        self.buffers.keys().filter(|(c, _)| c == channel).count()
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        for (_, buffer) in self.buffers.drain() {
            let _ = fs::remove_file(&buffer.temp_path);
        }
    }
}

fn read_blob_header(file: &mut fs::File) -> Result<(FileMessage, u64)> {
    file.seek(SeekFrom::Start(0)).context("seeking blob start")?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf).context("reading header length")?;
    let header_len = parse_blob_header_len(&len_buf)? as u64;
    let file_len = file.metadata().context("stat temp file")?.len();
    if header_len > file_len.saturating_sub(4) {
        bail!("header length {header_len} exceeds blob size {file_len}");
    }
    let mut header_buf = vec![0u8; header_len as usize];
    file.read_exact(&mut header_buf).context("reading header json")?;
    let message: FileMessage =
        serde_json::from_slice(&header_buf).context("parsing transfer header")?;
    Ok((message, 4 + header_len))
}

/// Where a dispatched blob ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// `file_download` blob landed (or failed to land) at `path` on the
    /// controller.
    Download { ok: bool, path: String },
    /// `file_upload` blob landed at `path` on the client.
    Upload { ok: bool, path: String },
}

/// Copy a completed blob's payload to its destination and delete the temp
/// file. Failures delete the partial target.
pub fn dispatch_blob(blob: &CompletedBlob) -> Result<TransferOutcome> {
    debug!(channel = %blob.channel, message_id = %blob.message_id, "dispatching blob");
    let (target, header, is_download) = match &blob.header {
        FileMessage::Download(h) => (h.path_ctl.clone(), h, true),
        FileMessage::Upload(h) => (h.path_cli.clone(), h, false),
        other => {
            let _ = fs::remove_file(&blob.temp_path);
            bail!("unexpected blob header: {other:?}");
        }
    };

    let ok = match stream_copy_payload(&blob.temp_path, blob.payload_offset, header, &target) {
        Ok(()) => true,
        Err(e) => {
            warn!(target = %target, "blob dispatch failed: {e:#}");
            let _ = fs::remove_file(&target);
            false
        }
    };
    let _ = fs::remove_file(&blob.temp_path);

    Ok(if is_download {
        TransferOutcome::Download { ok, path: target }
    } else {
        TransferOutcome::Upload { ok, path: target }
    })
}

fn stream_copy_payload(
    temp_path: &Path,
    payload_offset: u64,
    header: &TransferHeader,
    target: &str,
) -> Result<()> {
    if target.is_empty() {
        bail!("empty target path");
    }
    let mut source = fs::File::open(temp_path)
        .with_context(|| format!("opening {}", temp_path.display()))?;
    source
        .seek(SeekFrom::Start(payload_offset))
        .context("seeking blob payload")?;

    let target_path = Path::new(target);
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut out = fs::File::create(target_path)
        .with_context(|| format!("creating {}", target_path.display()))?;

    // The header's file_size bounds the copy; the temp file may carry the
    // last fragment's zero padding past it.
    let blob_payload = fs::metadata(temp_path)?.len().saturating_sub(payload_offset);
    let mut remaining = if header.file_size >= 0 {
        let want = header.file_size as u64;
        if want > blob_payload {
            bail!("blob payload short: header claims {want} bytes, blob has {blob_payload}");
        }
        want
    } else {
        blob_payload
    };

    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = source.read(&mut buf[..want]).context("reading blob payload")?;
        if n == 0 {
            bail!("blob payload short by {remaining} bytes");
        }
        out.write_all(&buf[..n]).context("writing target file")?;
        remaining -= n as u64;
    }
    out.flush().context("flushing target file")?;
    Ok(())
}

/// Track directory transfers on the receiving side. A directory is only
/// declared complete once the `directoryEnd` marker has arrived *and* every
/// announced file has finished reassembling; `directoryEnd` racing the last
/// in-flight file is expected.
#[derive(Debug, Default)]
pub struct DirectoryTracker {
    pending: HashMap<String, DirectoryState>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    end_seen: bool,
    expected: Option<u64>,
    completed: u64,
}

impl DirectoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_directory_start(&mut self, root: &str) {
        self.pending.insert(root.to_string(), DirectoryState::default());
    }

    /// Returns the root path when the marker completes the directory
    /// immediately (all files already landed, or it was empty).
    pub fn on_directory_end(&mut self, root: &str, file_count: u64) -> Option<String> {
        let state = self.pending.entry(root.to_string()).or_default();
        state.end_seen = true;
        state.expected = Some(file_count);
        self.take_if_complete(root)
    }

    /// A per-file transfer landed at `path`. Returns the completed
    /// directory root, if this was the last outstanding file.
    pub fn on_file_completed(&mut self, path: &str) -> Option<String> {
        let root = self
            .pending
            .keys()
            .filter(|root| Path::new(path).starts_with(root))
            .max_by_key(|root| root.len())?
            .clone();
        if let Some(state) = self.pending.get_mut(&root) {
            state.completed += 1;
        }
        self.take_if_complete(&root)
    }

    fn take_if_complete(&mut self, root: &str) -> Option<String> {
        let state = self.pending.get(root)?;
        match state.expected {
            Some(expected) if state.end_seen && state.completed >= expected => {
                self.pending.remove(root);
                Some(root.to_string())
            }
            _ => None,
        }
    }
}

/// Recursively collect regular files under `dir` with their paths relative
/// to it, sorted for a deterministic send order.
pub fn collect_directory_files(dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = fs::read_dir(&current)
            .with_context(|| format!("reading {}", current.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let kind = entry.file_type()?;
            if kind.is_dir() {
                stack.push(path);
            } else if kind.is_file() {
                let rel = path
                    .strip_prefix(dir)
                    .expect("entry under walk root")
                    .to_path_buf();
                out.push((path, rel));
            }
        }
    }
    out.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(out)
}

/// Build the `file_list` response for a directory. `"home"` selects the
/// user's home directory.
pub fn list_directory(requested: &str) -> FileMessage {
    let path = if requested == airan_protocol::FOLDER_HOME || requested.is_empty() {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
    } else {
        PathBuf::from(requested)
    };

    let mut entries = Vec::new();
    if let Ok(dir) = fs::read_dir(&path) {
        for entry in dir.flatten() {
            let meta = entry.metadata().ok();
            let is_dir = meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);
            let file_size = meta.as_ref().map(|m| m.len() as i64).unwrap_or(0);
            let file_last_mod_time = meta
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs().to_string())
                .unwrap_or_default();
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
                file_size,
                file_last_mod_time,
            });
        }
    }
    entries.sort_by(|a, b| (!a.is_dir, a.name.clone()).cmp(&(!b.is_dir, b.name.clone())));

    FileMessage::FileList {
        path: path.to_string_lossy().into_owned(),
        folder_files: entries,
        mounted: mounted_roots(),
    }
}

fn mounted_roots() -> Vec<String> {
    // The filesystem root is always present; everything else is a detail
    // the controller can browse into.
    vec!["/".to_string()]
}
