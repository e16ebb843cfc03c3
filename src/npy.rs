//! Minimal NPY (format 1.0) reader/writer for the persisted artifacts:
//! little-endian float64 arrays in C order and 1-D unicode string arrays.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ndarray::{ArrayD, IxDyn};

use crate::{Result, SyncError};

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const ALIGN: usize = 64;

/// Contents of an `.npy` file this crate understands
#[derive(Debug, Clone, PartialEq)]
pub enum NpyArray {
    Float(ArrayD<f64>),
    Unicode(Vec<String>),
}

impl NpyArray {
    pub fn dtype_name(&self) -> &'static str {
        match self {
            NpyArray::Float(_) => "float64",
            NpyArray::Unicode(_) => "unicode",
        }
    }
}

fn npy_err(path: &Path, reason: impl Into<String>) -> SyncError {
    SyncError::Npy {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn shape_literal(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [n] => format!("({n},)"),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Header bytes (magic through the trailing newline) for `descr` and `shape`
fn header(descr: &str, shape: &[usize]) -> Vec<u8> {
    let dict = format!(
        "{{'descr': '{descr}', 'fortran_order': False, 'shape': {}, }}",
        shape_literal(shape)
    );
    // magic(6) + version(2) + header_len(2) + dict + padding + '\n'
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (ALIGN - unpadded % ALIGN) % ALIGN;
    let header_len = dict.len() + padding + 1;

    let mut out = Vec::with_capacity(unpadded + padding);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out.extend(std::iter::repeat(b' ').take(padding));
    out.push(b'\n');
    out
}

fn write_bytes(path: &Path, header: &[u8], body: &[u8]) -> Result<()> {
    let file = File::create(path).map_err(|e| SyncError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(header)
        .and_then(|_| writer.write_all(body))
        .and_then(|_| writer.flush())
        .map_err(|e| SyncError::io(path, e))
}

/// Write a float64 array in C order
pub fn write_f64(path: &Path, array: &ArrayD<f64>) -> Result<()> {
    let mut body = Vec::with_capacity(array.len() * 8);
    // logical (row-major) order regardless of memory layout
    for v in array.iter() {
        body.extend_from_slice(&v.to_le_bytes());
    }
    write_bytes(path, &header("<f8", array.shape()), &body)
}

/// Write a 1-D unicode array (`<U{n}`, n = longest string in chars)
pub fn write_strings<S: AsRef<str>>(path: &Path, values: &[S]) -> Result<()> {
    let width = values
        .iter()
        .map(|s| s.as_ref().chars().count())
        .max()
        .unwrap_or(0)
        .max(1);
    let mut body = Vec::with_capacity(values.len() * width * 4);
    for s in values {
        let mut n = 0;
        for c in s.as_ref().chars() {
            body.extend_from_slice(&u32::from(c).to_le_bytes());
            n += 1;
        }
        for _ in n..width {
            body.extend_from_slice(&0u32.to_le_bytes());
        }
    }
    write_bytes(
        path,
        &header(&format!("<U{width}"), &[values.len()]),
        &body,
    )
}

struct Header {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
}

/// Value text following `'key':` in a header dict
fn dict_value<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}':");
    let start = dict.find(&needle)? + needle.len();
    Some(dict[start..].trim_start())
}

fn parse_header(path: &Path, dict: &str) -> Result<Header> {
    let descr = dict_value(dict, "descr")
        .and_then(|v| v.strip_prefix('\''))
        .and_then(|v| v.split('\'').next())
        .ok_or_else(|| npy_err(path, "header has no 'descr'"))?
        .to_string();

    let fortran_order = match dict_value(dict, "fortran_order") {
        Some(v) if v.starts_with("False") => false,
        Some(v) if v.starts_with("True") => true,
        _ => return Err(npy_err(path, "header has no 'fortran_order'")),
    };

    let shape_text = dict_value(dict, "shape")
        .and_then(|v| v.strip_prefix('('))
        .and_then(|v| v.split(')').next())
        .ok_or_else(|| npy_err(path, "header has no 'shape'"))?;
    let shape = shape_text
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| npy_err(path, format!("bad shape entry {s:?}")))
        })
        .collect::<Result<Vec<usize>>>()?;

    Ok(Header {
        descr,
        fortran_order,
        shape,
    })
}

/// Read any supported `.npy` file
pub fn read(path: &Path) -> Result<NpyArray> {
    let file = File::open(path).map_err(|e| SyncError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut buffer = Vec::new();
    reader
        .read_to_end(&mut buffer)
        .map_err(|e| SyncError::io(path, e))?;

    if buffer.len() < 10 || &buffer[..6] != MAGIC {
        return Err(npy_err(path, "not an NPY file"));
    }
    let (header_len, data_start) = match buffer[6] {
        1 => (u16::from_le_bytes([buffer[8], buffer[9]]) as usize, 10),
        2 | 3 if buffer.len() >= 12 => (
            u32::from_le_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]) as usize,
            12,
        ),
        v => return Err(npy_err(path, format!("unsupported format version {v}"))),
    };
    let body_start = data_start + header_len;
    if buffer.len() < body_start {
        return Err(npy_err(path, "truncated header"));
    }
    let dict = String::from_utf8_lossy(&buffer[data_start..body_start]);
    let header = parse_header(path, &dict)?;
    if header.fortran_order {
        return Err(npy_err(path, "Fortran-ordered arrays are not supported"));
    }

    let body = &buffer[body_start..];
    let count: usize = header.shape.iter().product();

    if header.descr == "<f8" {
        if body.len() != count * 8 {
            return Err(npy_err(
                path,
                format!("expected {} data bytes, found {}", count * 8, body.len()),
            ));
        }
        let values: Vec<f64> = body
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect();
        return Ok(NpyArray::Float(ArrayD::from_shape_vec(
            IxDyn(&header.shape),
            values,
        )?));
    }

    if let Some(width) = header.descr.strip_prefix("<U") {
        let width: usize = width
            .parse()
            .map_err(|_| npy_err(path, format!("bad dtype {:?}", header.descr)))?;
        if header.shape.len() != 1 {
            return Err(npy_err(path, "only 1-D string arrays are supported"));
        }
        if body.len() != count * width * 4 {
            return Err(npy_err(
                path,
                format!("expected {} data bytes, found {}", count * width * 4, body.len()),
            ));
        }
        let mut values = Vec::with_capacity(count);
        if width > 0 {
            for item in body.chunks_exact(width * 4) {
                let mut s = String::with_capacity(width);
                for cp in item.chunks_exact(4) {
                    let code = u32::from_le_bytes([cp[0], cp[1], cp[2], cp[3]]);
                    if code == 0 {
                        break;
                    }
                    let c = char::from_u32(code)
                        .ok_or_else(|| npy_err(path, format!("invalid code point {code:#x}")))?;
                    s.push(c);
                }
                values.push(s);
            }
        } else {
            values.resize(count, String::new());
        }
        return Ok(NpyArray::Unicode(values));
    }

    Err(npy_err(path, format!("unsupported dtype {:?}", header.descr)))
}

/// Read a float64 array
pub fn read_f64(path: &Path) -> Result<ArrayD<f64>> {
    match read(path)? {
        NpyArray::Float(a) => Ok(a),
        other => Err(npy_err(
            path,
            format!("expected float64 data, found {}", other.dtype_name()),
        )),
    }
}

/// Read a 1-D unicode array
pub fn read_strings(path: &Path) -> Result<Vec<String>> {
    match read(path)? {
        NpyArray::Unicode(s) => Ok(s),
        other => Err(npy_err(
            path,
            format!("expected unicode data, found {}", other.dtype_name()),
        )),
    }
}
