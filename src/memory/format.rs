//! Binary tensor file codec.
//!
//! Layout (little-endian): `rank: i32`, `dims: [i32; rank]`,
//! `element_count: i64`, then `element_count` float32 values. No checksum.
//!
//! Writes go to a `.tmp` sibling that is renamed over the target, so readers
//! see either the previous file or the new one.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::engine::{Location, MathEngine, Tensor};
use crate::error::{Result, TensorError};

/// Shape and payload of a tensor file.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorFile {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

fn write_header<W: Write>(writer: &mut W, shape: &[usize], element_count: usize) -> Result<()> {
    writer.write_all(&(shape.len() as i32).to_le_bytes())?;
    for &dim in shape {
        writer.write_all(&(dim as i32).to_le_bytes())?;
    }
    writer.write_all(&(element_count as i64).to_le_bytes())?;
    Ok(())
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_header<R: Read>(reader: &mut R, file_len: u64) -> Result<(Vec<usize>, usize)> {
    let rank = read_i32(reader)?;
    if rank < 0 {
        return Err(TensorError::Corrupt(format!("negative rank {}", rank)));
    }
    let header_len = 4 + 4 * rank as u64 + 8;
    if header_len > file_len {
        return Err(TensorError::Corrupt(format!("rank {} exceeds file length {}", rank, file_len)));
    }
    let mut shape = Vec::with_capacity(rank as usize);
    for _ in 0..rank {
        let dim = read_i32(reader)?;
        if dim <= 0 {
            return Err(TensorError::Corrupt(format!("non-positive dimension {}", dim)));
        }
        shape.push(dim as usize);
    }
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    let count = i64::from_le_bytes(buf);
    let expected = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| TensorError::Corrupt(format!("shape {:?} overflows", shape)))?;
    if count < 0 || count as u64 != expected as u64 {
        return Err(TensorError::Corrupt(format!(
            "element count {} does not match shape {:?}",
            count, shape
        )));
    }
    let payload = (expected as u64)
        .checked_mul(4)
        .and_then(|bytes| bytes.checked_add(header_len));
    if payload.map_or(true, |total| total > file_len) {
        return Err(TensorError::Corrupt(format!(
            "{} elements do not fit in a {} byte file",
            expected, file_len
        )));
    }
    Ok((shape, expected))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes `data` with `shape` to `path`, atomically replacing any existing file.
pub fn write_tensor_file<P: AsRef<Path>>(path: P, shape: &[usize], data: &[f32]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(TensorError::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![data.len()],
        });
    }
    let path = path.as_ref();
    let temp = temp_path(path);
    let written = write_payload(&temp, shape, data).and_then(|_| fs::rename(&temp, path).map_err(Into::into));
    if written.is_err() {
        let _ = fs::remove_file(&temp);
    }
    written
}

fn write_payload(path: &Path, shape: &[usize], data: &[f32]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_header(&mut writer, shape, data.len())?;
    for value in data {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

fn open_tensor_file(path: &Path) -> Result<(BufReader<File>, u64)> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    Ok((BufReader::new(file), len))
}

pub fn read_tensor_file<P: AsRef<Path>>(path: P) -> Result<TensorFile> {
    let (mut reader, len) = open_tensor_file(path.as_ref())?;
    let (shape, count) = read_header(&mut reader, len)?;
    let mut bytes = vec![0u8; count * 4];
    reader.read_exact(&mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(TensorFile { shape, data })
}

/// Reads only the header of a tensor file.
pub fn read_tensor_shape<P: AsRef<Path>>(path: P) -> Result<Vec<usize>> {
    let (mut reader, len) = open_tensor_file(path.as_ref())?;
    read_header(&mut reader, len).map(|(shape, _)| shape)
}

/// Reads a device tensor back from the engine and writes it to `path`.
pub fn save_tensor<P: AsRef<Path>>(engine: &dyn MathEngine, tensor: &Tensor, path: P) -> Result<()> {
    if engine.is_gpu() {
        engine.synchronize()?;
    }
    let data = engine.read(tensor)?;
    write_tensor_file(path, tensor.shape(), &data)
}

/// Loads a tensor file into a fresh engine buffer at `location`.
pub fn load_tensor<P: AsRef<Path>>(engine: &dyn MathEngine, path: P, location: Location) -> Result<Tensor> {
    let file = read_tensor_file(path)?;
    engine.from_slice(&file.data, &file.shape, location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        write_tensor_file(&path, &[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // rank + 2 dims + count + 6 floats
        assert_eq!(bytes.len(), 4 + 8 + 8 + 24);
        assert_eq!(&bytes[0..4], &2i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &3i32.to_le_bytes());
        assert_eq!(&bytes[12..20], &6i64.to_le_bytes());
        assert_eq!(&bytes[24..28], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_bit_identical_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let data = vec![f32::MIN_POSITIVE, -0.0, 1.5e-38, 3.25, f32::MAX, -7.125];
        write_tensor_file(&path, &[3, 2], &data).unwrap();

        let file = read_tensor_file(&path).unwrap();
        assert_eq!(file.shape, vec![3, 2]);
        let bits: Vec<u32> = file.data.iter().map(|x| x.to_bits()).collect();
        let expected: Vec<u32> = data.iter().map(|x| x.to_bits()).collect();
        assert_eq!(bits, expected);
        assert_eq!(read_tensor_shape(&path).unwrap(), vec![3, 2]);
    }

    #[test]
    fn test_rejects_inconsistent_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&4i32.to_le_bytes());
        bytes.extend_from_slice(&5i64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(read_tensor_file(&path), Err(TensorError::Corrupt(_))));
    }

    #[test]
    fn test_oversized_header_is_rejected_before_allocating() {
        let dir = tempdir().unwrap();
        let overflow = dir.path().join("overflow.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3i32.to_le_bytes());
        for _ in 0..3 {
            bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        }
        bytes.extend_from_slice(&i64::MAX.to_le_bytes());
        std::fs::write(&overflow, bytes).unwrap();
        assert!(matches!(read_tensor_file(&overflow), Err(TensorError::Corrupt(_))));

        let huge = dir.path().join("huge.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&(1i32 << 30).to_le_bytes());
        bytes.extend_from_slice(&(1i64 << 30).to_le_bytes());
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        std::fs::write(&huge, bytes).unwrap();
        assert!(matches!(read_tensor_file(&huge), Err(TensorError::Corrupt(_))));
        assert!(matches!(read_tensor_shape(&huge), Err(TensorError::Corrupt(_))));

        let ranked = dir.path().join("rank.bin");
        std::fs::write(&ranked, i32::MAX.to_le_bytes()).unwrap();
        assert!(matches!(read_tensor_file(&ranked), Err(TensorError::Corrupt(_))));
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        write_tensor_file(&path, &[4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        assert!(matches!(read_tensor_file(&path), Err(TensorError::Corrupt(_))));
    }

    #[test]
    fn test_rewrite_replaces_file_without_leftovers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.bin");
        write_tensor_file(&path, &[2], &[1.0, 2.0]).unwrap();
        write_tensor_file(&path, &[3], &[4.0, 5.0, 6.0]).unwrap();

        assert_eq!(read_tensor_file(&path).unwrap().data, vec![4.0, 5.0, 6.0]);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("w.bin")]);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let err = read_tensor_file(dir.path().join("absent.bin")).unwrap_err();
        assert!(err.is_not_found());
    }
}
