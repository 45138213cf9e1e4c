//! Minimal NumPy `.npy` (format 1.0) reader and writer for `float64` arrays.
//!
//! Only little-endian `<f8` data in C order is supported, which is all the
//! split tensors need.

use crate::errors::{DatasetError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const VERSION: [u8; 2] = [1, 0];
/// Preamble: magic, version and the u16 header length.
const PREAMBLE_LEN: usize = MAGIC.len() + 2 + 2;
const ALIGNMENT: usize = 64;

/// A dense `float64` array with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NpyArray {
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Build a 2-D array. `width` is used when `rows` is empty.
    pub fn matrix(rows: &[Vec<f64>], width: usize) -> std::result::Result<Self, String> {
        let width = rows.first().map(|r| r.len()).unwrap_or(width);
        if let Some(bad) = rows.iter().position(|r| r.len() != width) {
            return Err(format!(
                "row {bad} has {} columns, expected {width}",
                rows[bad].len()
            ));
        }
        Ok(Self {
            shape: vec![rows.len(), width],
            data: rows.iter().flatten().copied().collect(),
        })
    }

    /// Split a 2-D array back into rows.
    pub fn into_rows(self) -> Option<Vec<Vec<f64>>> {
        match self.shape.as_slice() {
            [_, 0] => Some(vec![Vec::new(); self.shape[0]]),
            [_, width] => Some(self.data.chunks(*width).map(|c| c.to_vec()).collect()),
            _ => None,
        }
    }

    pub fn into_vector(self) -> Option<Vec<f64>> {
        match self.shape.as_slice() {
            [_] => Some(self.data),
            _ => None,
        }
    }

    fn header(&self) -> String {
        let shape = match self.shape.as_slice() {
            [n] => format!("({n},)"),
            dims => format!(
                "({})",
                dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
            ),
        };
        let mut header =
            format!("{{'descr': '<f8', 'fortran_order': False, 'shape': {shape}, }}");
        let unpadded = PREAMBLE_LEN + header.len() + 1;
        let padding = (ALIGNMENT - unpadded % ALIGNMENT) % ALIGNMENT;
        header.extend(std::iter::repeat(' ').take(padding));
        header.push('\n');
        header
    }
}

fn tensor_err(path: &Path, reason: impl Into<String>) -> DatasetError {
    DatasetError::Tensor {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Write an array to `path`.
pub fn write_array(path: &Path, array: &NpyArray) -> Result<()> {
    let expected: usize = array.shape.iter().product();
    if expected != array.data.len() {
        return Err(tensor_err(
            path,
            format!("shape {:?} does not match {} values", array.shape, array.data.len()),
        ));
    }

    let header = array.header();
    let header_len = u16::try_from(header.len())
        .map_err(|_| tensor_err(path, "header too long for format 1.0"))?;

    let file = File::create(path).map_err(|e| DatasetError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let write = |w: &mut BufWriter<File>, bytes: &[u8]| -> Result<()> {
        w.write_all(bytes).map_err(|e| DatasetError::io(path, e))
    };

    write(&mut writer, MAGIC)?;
    write(&mut writer, &VERSION)?;
    write(&mut writer, &header_len.to_le_bytes())?;
    write(&mut writer, header.as_bytes())?;
    for value in &array.data {
        write(&mut writer, &value.to_le_bytes())?;
    }
    writer.flush().map_err(|e| DatasetError::io(path, e))
}

pub fn write_vector(path: &Path, values: &[f64]) -> Result<()> {
    write_array(path, &NpyArray::vector(values.to_vec()))
}

pub fn write_matrix(path: &Path, rows: &[Vec<f64>], width: usize) -> Result<()> {
    let array = NpyArray::matrix(rows, width).map_err(|reason| tensor_err(path, reason))?;
    write_array(path, &array)
}

/// Read an array written by [`write_array`] or by NumPy itself.
pub fn read_array(path: &Path) -> Result<NpyArray> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DatasetError::ArtifactNotFound(path.to_path_buf())
        } else {
            DatasetError::io(path, e)
        }
    })?;
    let mut reader = BufReader::new(file);

    let mut preamble = [0u8; 8];
    reader
        .read_exact(&mut preamble)
        .map_err(|e| DatasetError::io(path, e))?;
    if &preamble[..6] != MAGIC {
        return Err(tensor_err(path, "missing NUMPY magic"));
    }

    let header_len = match preamble[6] {
        1 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len).map_err(|e| DatasetError::io(path, e))?;
            u16::from_le_bytes(len) as usize
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len).map_err(|e| DatasetError::io(path, e))?;
            u32::from_le_bytes(len) as usize
        }
        other => return Err(tensor_err(path, format!("unsupported format version {other}"))),
    };

    let mut header = vec![0u8; header_len];
    reader
        .read_exact(&mut header)
        .map_err(|e| DatasetError::io(path, e))?;
    let header = String::from_utf8_lossy(&header);

    if !header.contains("'descr': '<f8'") {
        return Err(tensor_err(path, "only little-endian float64 data is supported"));
    }
    if header.contains("'fortran_order': True") {
        return Err(tensor_err(path, "fortran-ordered arrays are not supported"));
    }
    let shape = parse_shape(&header).ok_or_else(|| tensor_err(path, "malformed shape"))?;

    let count: usize = shape.iter().product();
    let mut bytes = Vec::with_capacity(count * 8);
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| DatasetError::io(path, e))?;
    if bytes.len() != count * 8 {
        return Err(tensor_err(
            path,
            format!("expected {} data bytes, found {}", count * 8, bytes.len()),
        ));
    }

    let data = bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            f64::from_le_bytes(buf)
        })
        .collect();

    Ok(NpyArray { shape, data })
}

fn parse_shape(header: &str) -> Option<Vec<usize>> {
    let start = header.find("'shape':")? + "'shape':".len();
    let rest = &header[start..];
    let open = rest.find('(')?;
    let close = rest.find(')')?;
    rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

pub fn read_vector(path: &Path) -> Result<Vec<f64>> {
    read_array(path)?
        .into_vector()
        .ok_or_else(|| tensor_err(path, "expected a 1-D array"))
}

pub fn read_matrix(path: &Path) -> Result<Vec<Vec<f64>>> {
    read_array(path)?
        .into_rows()
        .ok_or_else(|| tensor_err(path, "expected a 2-D array"))
}
