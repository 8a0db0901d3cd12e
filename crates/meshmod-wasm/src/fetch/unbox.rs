//! Unwrap gzip/tar packaged modules down to the raw Wasm binary.

use std::io::{Cursor, Read};

use tracing::debug;

use crate::error::{WasmError, WasmResult};

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const GZIP_MAGIC: &[u8; 2] = &[0x1f, 0x8b];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8; 5] = b"ustar";

/// Upper bound on inflated content.
pub(crate) const MAX_MODULE_SIZE: u64 = 256 * 1024 * 1024;

/// Magic number plus version word.
pub(crate) fn is_wasm_binary(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && bytes.starts_with(WASM_MAGIC)
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(GZIP_MAGIC)
}

fn is_tar(bytes: &[u8]) -> bool {
    bytes
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len())
        .is_some_and(|magic| magic == TAR_MAGIC)
}

fn invalid(uri: &str, message: impl Into<String>) -> WasmError {
    WasmError::InvalidModule {
        uri: uri.to_string(),
        message: message.into(),
    }
}

fn inflate(uri: &str, bytes: &[u8]) -> WasmResult<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(Cursor::new(bytes))
        .take(MAX_MODULE_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| invalid(uri, format!("failed to decompress gzip: {}", e)))?;
    if out.len() as u64 > MAX_MODULE_SIZE {
        return Err(invalid(uri, "decompressed module exceeds size limit"));
    }
    Ok(out)
}

fn first_wasm_in_tar(uri: &str, bytes: &[u8]) -> WasmResult<Vec<u8>> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| invalid(uri, format!("failed to read tar entries: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| invalid(uri, format!("failed to read tar entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut content = Vec::new();
        (&mut entry)
            .take(MAX_MODULE_SIZE + 1)
            .read_to_end(&mut content)
            .map_err(|e| invalid(uri, format!("failed to read tar entry content: {}", e)))?;
        if is_wasm_binary(&content) && content.len() as u64 <= MAX_MODULE_SIZE {
            if let Ok(path) = entry.path() {
                debug!(uri, entry = %path.display(), "extracted wasm module from tar");
            }
            return Ok(content);
        }
    }

    Err(invalid(uri, "tar archive does not contain a wasm binary"))
}

/// Return the raw Wasm binary contained in `bytes`.
///
/// Accepts a plain binary, a gzip stream, a tar archive, or a gzipped tar
/// archive. Anything else is [`WasmError::InvalidModule`].
pub(crate) fn unbox_module(uri: &str, bytes: Vec<u8>) -> WasmResult<Vec<u8>> {
    if is_wasm_binary(&bytes) {
        return Ok(bytes);
    }

    let bytes = if is_gzip(&bytes) {
        let inflated = inflate(uri, &bytes)?;
        if is_wasm_binary(&inflated) {
            return Ok(inflated);
        }
        inflated
    } else {
        bytes
    };

    if is_tar(&bytes) {
        return first_wasm_in_tar(uri, &bytes);
    }

    Err(invalid(uri, "missing wasm magic number"))
}
