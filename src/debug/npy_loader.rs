//! Minimal NumPy .npy reader
//!
//! Golden reference data (logits, metric values) is exported from the
//! Python side as .npy files. Only C-order little-endian f32/i64 arrays
//! are supported, which covers everything the validation flow produces.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// A decoded .npy array
#[derive(Debug, Clone)]
pub struct NpyArray {
    /// Array shape
    pub shape: Vec<usize>,
    /// NumPy descr string, e.g. "<f4" or "<i8"
    pub dtype: String,
    data: Vec<u8>,
}

impl NpyArray {
    /// Total element count
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// True when the array has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode as f32 values
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        if self.dtype != "<f4" {
            bail!("expected <f4 data, got {}", self.dtype);
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    /// Decode as i64 values
    pub fn to_i64(&self) -> Result<Vec<i64>> {
        if self.dtype != "<i8" {
            bail!("expected <i8 data, got {}", self.dtype);
        }
        Ok(self
            .data
            .chunks_exact(8)
            .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect())
    }
}

fn item_size(dtype: &str) -> Result<usize> {
    match dtype {
        "<f4" | "<i4" => Ok(4),
        "<f8" | "<i8" => Ok(8),
        other => bail!("unsupported npy dtype: {other}"),
    }
}

/// Locate the value following `'key':` in the header dict
fn header_field<'a>(header: &'a str, key: &str) -> Result<&'a str> {
    let start = header
        .find(&format!("'{key}'"))
        .with_context(|| format!("npy header missing '{key}'"))?;
    let rest = &header[start..];
    let colon = rest.find(':').context("malformed npy header")?;
    Ok(rest[colon + 1..].trim_start())
}

fn parse_header(header: &str) -> Result<(String, Vec<usize>)> {
    let descr = header_field(header, "descr")?;
    let descr = descr
        .strip_prefix('\'')
        .and_then(|s| s.split('\'').next())
        .context("malformed descr in npy header")?
        .to_string();

    let order = header_field(header, "fortran_order")?;
    if order.starts_with("True") {
        bail!("fortran-order npy arrays are not supported");
    }

    let shape_text = header_field(header, "shape")?;
    let open = shape_text.find('(').context("malformed shape in npy header")?;
    let close = shape_text.find(')').context("malformed shape in npy header")?;
    let shape: Vec<usize> = shape_text[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().context("bad shape entry in npy header"))
        .collect::<Result<_>>()?;

    Ok((descr, shape))
}

/// Read one .npy file
pub fn read_npy<P: AsRef<Path>>(path: P) -> Result<NpyArray> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open npy file: {:?}", path))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic[..6] != b"\x93NUMPY" {
        bail!("not an npy file: {:?}", path);
    }
    let major = magic[6];

    let header_len = match major {
        1 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len)?;
            u16::from_le_bytes(len) as usize
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            u32::from_le_bytes(len) as usize
        }
        v => bail!("unsupported npy version {v}"),
    };

    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;
    let header = String::from_utf8(header).context("npy header is not utf-8")?;
    let (dtype, shape) = parse_header(&header)?;

    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    let expected = shape.iter().product::<usize>() * item_size(&dtype)?;
    if data.len() != expected {
        bail!(
            "npy payload is {} bytes, expected {} for shape {:?} dtype {}",
            data.len(),
            expected,
            shape,
            dtype
        );
    }

    Ok(NpyArray { shape, dtype, data })
}

/// Read a .npy file as f32 values plus shape
pub fn read_npy_f32<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, Vec<usize>)> {
    let array = read_npy(path)?;
    Ok((array.to_f32()?, array.shape))
}

/// Read a .npy file as i64 values plus shape
pub fn read_npy_i64<P: AsRef<Path>>(path: P) -> Result<(Vec<i64>, Vec<usize>)> {
    let array = read_npy(path)?;
    Ok((array.to_i64()?, array.shape))
}
