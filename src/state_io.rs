//! Save-state persistence: read and write the byte blob a core hands back
//! from `retro_serialize`, optionally wrapped in an `RASTATE` header and/or
//! lz4 framing, written atomically so a crash mid-write can't corrupt the
//! slot a player is about to resume from.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use atomicwrites::{AtomicFile, OverwriteBehavior::AllowOverwrite};

/// First bytes of a state file written with header metadata. A bare
/// core state blob (no header) is also accepted on read: the magic is
/// checked but its absence is not an error, it just means "raw state".
const RASTATE_MAGIC: &[u8; 7] = b"RASTATE";
const RASTATE_HEADER_SIZE: usize = 16;

/// Reasons a save/load can be refused before it ever touches a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    HardcoreMode,
}

/// Whether the slot at `path` should be treated as lz4-compressed, purely
/// from its file name, not content sniffing: `.st<N>` is plain, `.srm` and
/// `.state<N>` are compressed (spec.md §4.E).
pub fn is_compressed_path(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if ext == "srm" {
        return true;
    }
    if ext.starts_with("state") {
        return true;
    }
    false
}

/// Reads a save state from `path` into a freshly allocated buffer sized
/// exactly `expected_size` (the core's current `retro_serialize_size`).
///
/// Cores sometimes under-report their serialize size for a save made
/// under different in-game conditions; a state file that contains *more*
/// bytes than `expected_size` is still accepted; reads are never decoded
/// to more bytes than the buffer holds.
pub fn read_state(path: &Path, expected_size: usize, hardcore: bool) -> Result<Result<Vec<u8>, Blocked>> {
    if hardcore {
        return Ok(Err(Blocked::HardcoreMode));
    }
    if expected_size == 0 {
        bail!("core reports zero-size serialization, nothing to restore");
    }

    let raw = fs::read(path).with_context(|| format!("reading state file {}", path.display()))?;
    let raw = if is_compressed_path(path) {
        decompress(&raw).with_context(|| format!("decompressing state file {}", path.display()))?
    } else {
        raw
    };

    let body = strip_header(&raw);
    if body.len() < expected_size {
        bail!(
            "state file {} holds {} bytes, core expects at least {}",
            path.display(),
            body.len(),
            expected_size
        );
    }
    Ok(Ok(body[..expected_size].to_vec()))
}

/// Writes `state` (the core's serialized bytes) to `path` atomically,
/// prefixed with the `RASTATE` header so downstream tooling can tell a
/// real save state from a plain memory dump.
pub fn write_state(path: &Path, state: &[u8], hardcore: bool) -> Result<Result<(), Blocked>> {
    if hardcore {
        return Ok(Err(Blocked::HardcoreMode));
    }

    let mut body = Vec::with_capacity(RASTATE_HEADER_SIZE + state.len());
    body.extend_from_slice(RASTATE_MAGIC);
    body.resize(RASTATE_HEADER_SIZE, 0);
    body.extend_from_slice(state);

    let body = if is_compressed_path(path) { compress(&body) } else { body };

    AtomicFile::new(path, AllowOverwrite)
        .write(|f| std::io::Write::write_all(f, &body))
        .with_context(|| format!("writing state file {}", path.display()))?;
    Ok(Ok(()))
}

/// Skips the 16-byte `RASTATE` header when present; returns the slice
/// unchanged when the file holds a bare core state instead.
fn strip_header(raw: &[u8]) -> &[u8] {
    if raw.len() >= RASTATE_HEADER_SIZE && &raw[..7] == RASTATE_MAGIC {
        &raw[RASTATE_HEADER_SIZE..]
    } else {
        raw
    }
}

/// lz4 block compression with an 8-byte little-endian original-size prefix,
/// the same framing `rewind.rs` uses for its ring entries.
fn compress(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + lz4_flex::block::get_maximum_output_size(body.len()));
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&lz4_flex::block::compress(body));
    out
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 8 {
        bail!("compressed state file is shorter than its size prefix");
    }
    let (len_bytes, compressed) = data.split_at(8);
    let original_len = u64::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    lz4_flex::block::decompress(compressed, original_len).context("lz4 block decompression failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn round_trips_through_atomic_write_and_read() {
        let dir = tempdir();
        let path = dir.join("slot0.state");
        let state = vec![1u8, 2, 3, 4, 5];

        write_state(&path, &state, false).unwrap().unwrap();
        let restored = read_state(&path, state.len(), false).unwrap().unwrap();
        assert_eq!(restored, state);

        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[test]
    fn hardcore_mode_blocks_read_and_write() {
        let dir = tempdir();
        let path = dir.join("slot0.state");
        assert_eq!(write_state(&path, &[1, 2, 3], true).unwrap(), Err(Blocked::HardcoreMode));
        assert_eq!(read_state(&path, 3, true).unwrap(), Err(Blocked::HardcoreMode));
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[test]
    fn bare_state_without_header_is_accepted() {
        let dir = tempdir();
        let path = dir.join("slot0.state");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[9, 9, 9, 9]).unwrap();
        drop(f);

        let restored = read_state(&path, 4, false).unwrap().unwrap();
        assert_eq!(restored, vec![9, 9, 9, 9]);
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[test]
    fn compressed_suffix_round_trips() {
        let dir = tempdir();
        let path = dir.join("rom.state0");
        let state = vec![7u8; 4096];

        write_state(&path, &state, false).unwrap().unwrap();
        let restored = read_state(&path, state.len(), false).unwrap().unwrap();
        assert_eq!(restored, state);
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[test]
    fn st_suffix_is_plain_srm_is_compressed() {
        let plain = Path::new("rom.st0");
        let compressed = Path::new("rom.srm");
        let compressed_state = Path::new("rom.state3");

        assert!(!is_compressed_path(plain));
        assert!(is_compressed_path(compressed));
        assert!(is_compressed_path(compressed_state));
    }

    fn tempdir() -> std::path::PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("minarch-state-io-test-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
