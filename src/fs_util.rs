use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;

use crate::error::KiraError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip_name(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Cheap check used to decide whether a local download can be reused:
/// the file is non-empty, and when it is (or claims to be) gzip, the header
/// and first block decode.
pub fn passes_integrity_check(path: &Path) -> bool {
    validate_download(path).is_ok()
}

pub fn validate_download(path: &Path) -> Result<(), KiraError> {
    let meta = fs::metadata(path)
        .map_err(|err| KiraError::Filesystem(format!("stat {}: {err}", path.display())))?;
    if !meta.is_file() || meta.len() == 0 {
        return Err(KiraError::Filesystem(format!(
            "{} is empty or not a file",
            path.display()
        )));
    }
    let file = fs::File::open(path)
        .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    let head = reader
        .fill_buf()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let has_magic = head.starts_with(&GZIP_MAGIC);
    if is_gzip_name(path) && !has_magic {
        return Err(KiraError::Filesystem(format!(
            "{} is not gzip compressed",
            path.display()
        )));
    }
    if has_magic {
        let mut decoder = MultiGzDecoder::new(reader);
        let mut probe = [0u8; 512];
        decoder.read(&mut probe).map_err(|err| {
            KiraError::Filesystem(format!("corrupt gzip {}: {err}", path.display()))
        })?;
    }
    Ok(())
}

/// Reads a text file, transparently decompressing gzip content.
///
/// Bytes that are not valid UTF-8 (Latin-1 titles in older SOFT files) are
/// replaced with U+FFFD rather than failing the read.
pub fn read_text(path: &Path) -> Result<String, KiraError> {
    let file = fs::File::open(path)
        .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    let is_gzip = reader
        .fill_buf()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?
        .starts_with(&GZIP_MAGIC);
    let mut bytes = Vec::new();
    let result = if is_gzip {
        MultiGzDecoder::new(reader).read_to_end(&mut bytes)
    } else {
        reader.read_to_end(&mut bytes)
    };
    result.map_err(|err| KiraError::Filesystem(format!("read {}: {err}", path.display())))?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    })
}

/// Writes `content` to a temporary sibling and renames it over `path`.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), KiraError> {
    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".kira-cx")
        .tempfile_in(parent)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> Result<(), KiraError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(KiraError::Filesystem(err.to_string())),
    }
}
