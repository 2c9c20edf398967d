/// Matrix loading module.
///
/// Experiments are stored as MATLAB files in one of two containers: the
/// classic v5 format, or v7.3 which is really HDF5 behind a MATLAB header.
/// Both are parsed by existing libraries; this module only picks the right
/// one and brings the result into a common axis order.
///
/// MATLAB arrays are column-major with dimensions `(rows, cols, pages...)`.
/// Everything returned from here uses that *logical* order; the `as_*`
/// helpers then reshape into what the rest of the crate wants.
use crate::error::{Error, Result};
use ndarray::{ArrayD, Array2, Array3, Axis, Ix2, Ix3, IxDyn, ShapeBuilder};
use std::io::Cursor;

const HDF5_SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];

/// HDF5 puts the superblock at 0, 512, 1024, ... A v7.3 MAT file uses 512.
const MAT73_SUPERBLOCK_OFFSET: usize = 512;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatrixFormat {
    /// MATLAB Level 5 MAT-file (v5, v6, v7).
    MatV5,
    /// MATLAB v7.3 MAT-file (HDF5).
    MatV73,
}

/// Sniff the container format from the first bytes of a file.
pub fn detect_format(bytes: &[u8]) -> Result<MatrixFormat> {
    let has_signature_at =
        |offset: usize| bytes.get(offset..offset + HDF5_SIGNATURE.len()) == Some(&HDF5_SIGNATURE[..]);
    if has_signature_at(0) || has_signature_at(MAT73_SUPERBLOCK_OFFSET) {
        return Ok(MatrixFormat::MatV73);
    }
    if bytes.len() >= 128 && bytes.starts_with(b"MATLAB") {
        return Ok(MatrixFormat::MatV5);
    }
    Err(Error::UnsupportedFormat(
        "not a MATLAB v5 or v7.3 file".to_string(),
    ))
}

/// Load one variable in MATLAB logical order.
///
/// If `name` isn't in the file but the file holds exactly one variable, that
/// variable is returned instead; lab scripts aren't consistent about names.
pub fn load_variable(bytes: &[u8], name: &str) -> Result<ArrayD<f64>> {
    match detect_format(bytes)? {
        MatrixFormat::MatV5 => load_v5(bytes, name, true),
        MatrixFormat::MatV73 => load_v73(bytes, name, true),
    }
}

/// Load a variable that may legitimately be absent, without falling back to
/// whatever else is in the file.
pub fn load_optional_variable(bytes: &[u8], name: &str) -> Result<Option<ArrayD<f64>>> {
    let loaded = match detect_format(bytes)? {
        MatrixFormat::MatV5 => load_v5(bytes, name, false),
        MatrixFormat::MatV73 => load_v73(bytes, name, false),
    };
    match loaded {
        Ok(array) => Ok(Some(array)),
        Err(Error::MissingVariable(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_v5(bytes: &[u8]) -> Result<matfile::MatFile> {
    matfile::MatFile::parse(Cursor::new(bytes))
        .map_err(|e| Error::Matrix(format!("couldn't parse MAT-file: {:?}", e)))
}

fn widen<T: Copy + Into<f64>>(values: &[T]) -> Vec<f64> {
    values.iter().map(|&v| v.into()).collect()
}

/// Real part of any numeric class, as f64. 64-bit integers lose precision
/// past 2^53, which is far beyond any pixel or label value we store.
fn numeric_to_f64(data: &matfile::NumericData) -> Vec<f64> {
    use matfile::NumericData::*;
    match data {
        Int8 { real, .. } => widen(real),
        UInt8 { real, .. } => widen(real),
        Int16 { real, .. } => widen(real),
        UInt16 { real, .. } => widen(real),
        Int32 { real, .. } => widen(real),
        UInt32 { real, .. } => widen(real),
        Int64 { real, .. } => real.iter().map(|&v| v as f64).collect(),
        UInt64 { real, .. } => real.iter().map(|&v| v as f64).collect(),
        Single { real, .. } => widen(real),
        Double { real, .. } => real.clone(),
    }
}

fn load_v5(bytes: &[u8], name: &str, fallback: bool) -> Result<ArrayD<f64>> {
    let file = parse_v5(bytes)?;
    let array = match file.find_by_name(name) {
        Some(array) => array,
        None if fallback && file.arrays().len() == 1 => &file.arrays()[0],
        None => return Err(Error::MissingVariable(name.to_string())),
    };
    let shape = array.size().to_vec();
    let data = numeric_to_f64(array.data());
    Ok(ArrayD::from_shape_vec(IxDyn(&shape).f(), data)?)
}

#[cfg(feature = "hdf5")]
fn load_v73(bytes: &[u8], name: &str, fallback: bool) -> Result<ArrayD<f64>> {
    // HDF5 stores the column-major MATLAB array with its dimensions reversed.
    Ok(v73::read(bytes, name, fallback)?.reversed_axes())
}

#[cfg(not(feature = "hdf5"))]
fn load_v73(_bytes: &[u8], _name: &str, _fallback: bool) -> Result<ArrayD<f64>> {
    Err(Error::UnsupportedFormat(
        "MATLAB v7.3 files need the `hdf5` feature".to_string(),
    ))
}

#[cfg(feature = "hdf5")]
mod v73 {
    use crate::error::{Error, Result};
    use ndarray::ArrayD;
    use std::io::Write;

    fn h5_err(e: hdf5::Error) -> Error {
        Error::Matrix(e.to_string())
    }

    /// libhdf5 only opens paths, so the download goes through a temp file.
    fn open(bytes: &[u8]) -> Result<(tempfile::NamedTempFile, hdf5::File)> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        let file = hdf5::File::open(tmp.path()).map_err(h5_err)?;
        Ok((tmp, file))
    }

    pub fn read(bytes: &[u8], name: &str, fallback: bool) -> Result<ArrayD<f64>> {
        let (_tmp, file) = open(bytes)?;
        let dataset = match file.dataset(name) {
            Ok(ds) => ds,
            Err(_) => {
                let names: Vec<String> = file
                    .member_names()
                    .map_err(h5_err)?
                    .into_iter()
                    .filter(|n| !n.starts_with('#'))
                    .collect();
                if !fallback || names.len() != 1 {
                    return Err(Error::MissingVariable(name.to_string()));
                }
                file.dataset(&names[0]).map_err(h5_err)?
            }
        };
        dataset.read_dyn::<f64>().map_err(h5_err)
    }
}

/// View a variable as a table: one row per measurement.
pub fn as_table(array: ArrayD<f64>) -> Result<Array2<f64>> {
    let array = match array.ndim() {
        1 => array.insert_axis(Axis(1)),
        2 => array,
        n => {
            return Err(Error::BadRequest(format!(
                "expected a 2-D table, got {} dimensions",
                n
            )))
        }
    };
    let table = array.into_dimensionality::<Ix2>()?;
    Ok(table.as_standard_layout().to_owned())
}

/// View a variable as an image stack.
///
/// MATLAB image stacks are `(height, width, frames)`; the result is
/// `(frames, height, width)` in standard layout. A plain matrix is a single
/// frame.
pub fn as_stack(array: ArrayD<f64>) -> Result<Array3<f64>> {
    let stack = match array.ndim() {
        2 => array.insert_axis(Axis(0)),
        3 => array.permuted_axes(IxDyn(&[2, 0, 1])),
        n => {
            return Err(Error::BadRequest(format!(
                "expected a 2-D or 3-D image stack, got {} dimensions",
                n
            )))
        }
    };
    let stack = stack.into_dimensionality::<Ix3>()?;
    Ok(stack.as_standard_layout().to_owned())
}

/// Builds small uncompressed MAT v5 files for tests.
#[cfg(test)]
pub mod testing {
    const MI_INT8: u32 = 1;
    const MI_INT32: u32 = 5;
    const MI_UINT32: u32 = 6;
    const MI_DOUBLE: u32 = 9;
    const MI_MATRIX: u32 = 14;
    const MX_DOUBLE_CLASS: u32 = 6;

    fn element(kind: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        out
    }

    /// `variables` are `(name, dims, column-major data)`.
    pub fn mat_v5(variables: &[(&str, &[usize], &[f64])]) -> Vec<u8> {
        let mut out = b"MATLAB 5.0 MAT-file, created by cellviz tests".to_vec();
        out.resize(116, b' ');
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&0x0100u16.to_le_bytes());
        out.extend_from_slice(b"IM");
        for (name, dims, data) in variables {
            let mut body = Vec::new();
            let mut flags = MX_DOUBLE_CLASS.to_le_bytes().to_vec();
            flags.extend_from_slice(&[0u8; 4]);
            body.extend(element(MI_UINT32, &flags));
            let dims: Vec<u8> = dims
                .iter()
                .flat_map(|&d| (d as i32).to_le_bytes().to_vec())
                .collect();
            body.extend(element(MI_INT32, &dims));
            body.extend(element(MI_INT8, name.as_bytes()));
            let values: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect();
            body.extend(element(MI_DOUBLE, &values));
            out.extend(element(MI_MATRIX, &body));
        }
        out
    }
}
