//! Element types and host-side staging.

use std::fmt;

use crate::error::{ComputeError, ComputeResult};

/// Element type tag of a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// Single precision floating point on the device.
    Float,
    /// Unsigned integer on the device.
    UInt,
}

impl ElementType {
    /// Host tag for floating point memory.
    pub const FLOAT_TAG: u64 = 0;
    /// Host tag for unsigned integer memory.
    pub const UINT_TAG: u64 = 1;

    /// Decode a host type tag.
    pub fn from_tag(tag: u64) -> ComputeResult<Self> {
        match tag {
            Self::FLOAT_TAG => Ok(ElementType::Float),
            Self::UINT_TAG => Ok(ElementType::UInt),
            other => Err(ComputeError::UnsupportedElementType(other)),
        }
    }

    /// Size in bytes of one element in the given layout.
    ///
    /// Linear unsigned buffers hold 64-bit values while image texels are
    /// 32 bits wide for both types.
    pub fn width(self, layout: Layout) -> usize {
        match (self, layout) {
            (ElementType::Float, _) => 4,
            (ElementType::UInt, Layout::Linear) => 8,
            (ElementType::UInt, Layout::Image) => 4,
        }
    }

    /// Single-channel image format used for this element type.
    pub fn image_format(self) -> ImageFormat {
        match self {
            ElementType::Float => ImageFormat::RFloat,
            ElementType::UInt => ImageFormat::RUInt32,
        }
    }
}

impl TryFrom<u64> for ElementType {
    type Error = ComputeError;

    fn try_from(tag: u64) -> Result<Self, Self::Error> {
        Self::from_tag(tag)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Float => write!(f, "float"),
            ElementType::UInt => write!(f, "uint"),
        }
    }
}

/// Memory layout of a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Linear buffer.
    Linear,
    /// Two-dimensional image.
    Image,
}

/// Single-channel image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// One 32-bit float channel (`CL_R`, `CL_FLOAT`).
    RFloat,
    /// One 32-bit unsigned channel (`CL_R`, `CL_UNSIGNED_INT32`).
    RUInt32,
}

impl ImageFormat {
    /// Bytes per texel.
    pub fn texel_size(self) -> usize {
        4
    }
}

/// Host value type that can be staged into device memory.
pub trait HostElement: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Device element type this host type maps to.
    const ELEMENT: ElementType;

    /// Encode host values into native device bytes.
    fn stage(values: &[Self], layout: Layout) -> ComputeResult<Vec<u8>>;

    /// Decode native device bytes back into host values.
    fn unstage(bytes: &[u8], layout: Layout) -> Vec<Self>;
}

impl HostElement for u64 {
    const ELEMENT: ElementType = ElementType::UInt;

    fn stage(values: &[Self], layout: Layout) -> ComputeResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(values.len() * Self::ELEMENT.width(layout));
        match layout {
            Layout::Linear => {
                for value in values {
                    bytes.extend_from_slice(&value.to_ne_bytes());
                }
            }
            Layout::Image => {
                for &value in values {
                    let texel = u32::try_from(value).map_err(|_| ComputeError::ValueOutOfRange {
                        value,
                        target: "u32",
                    })?;
                    bytes.extend_from_slice(&texel.to_ne_bytes());
                }
            }
        }
        Ok(bytes)
    }

    fn unstage(bytes: &[u8], layout: Layout) -> Vec<Self> {
        match layout {
            Layout::Linear => bytes
                .chunks_exact(8)
                .map(|chunk| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    u64::from_ne_bytes(raw)
                })
                .collect(),
            Layout::Image => bytes
                .chunks_exact(4)
                .map(|chunk| {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(chunk);
                    u32::from_ne_bytes(raw) as u64
                })
                .collect(),
        }
    }
}

impl HostElement for f64 {
    const ELEMENT: ElementType = ElementType::Float;

    fn stage(values: &[Self], _layout: Layout) -> ComputeResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for &value in values {
            bytes.extend_from_slice(&(value as f32).to_ne_bytes());
        }
        Ok(bytes)
    }

    fn unstage(bytes: &[u8], _layout: Layout) -> Vec<Self> {
        bytes
            .chunks_exact(4)
            .map(|chunk| {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(chunk);
                f32::from_ne_bytes(raw) as f64
            })
            .collect()
    }
}

/// Row-major two-dimensional host matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> Matrix<T> {
    /// Build a matrix from row-major data.
    pub fn from_row_major(rows: usize, cols: usize, data: Vec<T>) -> ComputeResult<Self> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(ComputeError::InvalidShape(format!(
                "{} elements cannot form a {}x{} matrix",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Build a matrix from a list of rows, which must all have the same length.
    pub fn from_rows(rows: &[Vec<T>]) -> ComputeResult<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|row| row.len() != cols) {
            return Err(ComputeError::InvalidShape(
                "matrix rows have different lengths".to_string(),
            ));
        }
        let data = rows.iter().flatten().copied().collect();
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element at `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.data.get(row * self.cols + col).copied()
    }

    /// Row-major element slice.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Split into a list of rows.
    pub fn to_rows(&self) -> Vec<Vec<T>> {
        if self.cols == 0 {
            return vec![Vec::new(); self.rows];
        }
        self.data.chunks(self.cols).map(|row| row.to_vec()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(ElementType::from_tag(0).unwrap(), ElementType::Float);
        assert_eq!(ElementType::from_tag(1).unwrap(), ElementType::UInt);
        assert_eq!(
            ElementType::from_tag(7),
            Err(ComputeError::UnsupportedElementType(7))
        );
    }

    #[test]
    fn test_widths() {
        assert_eq!(ElementType::UInt.width(Layout::Linear), 8);
        assert_eq!(ElementType::UInt.width(Layout::Image), 4);
        assert_eq!(ElementType::Float.width(Layout::Linear), 4);
    }

    #[test]
    fn test_uint_image_staging_rejects_wide_values() {
        let err = u64::stage(&[1, u64::from(u32::MAX) + 1], Layout::Image).unwrap_err();
        assert!(matches!(err, ComputeError::ValueOutOfRange { target: "u32", .. }));

        let bytes = u64::stage(&[7, 9], Layout::Image).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(u64::unstage(&bytes, Layout::Image), vec![7, 9]);
    }

    #[test]
    fn test_float_staging_narrows_to_f32() {
        let bytes = f64::stage(&[0.1, 2.5], Layout::Linear).unwrap();
        assert_eq!(bytes.len(), 8);
        let back = f64::unstage(&bytes, Layout::Linear);
        assert_eq!(back[0], 0.1f32 as f64);
        assert_eq!(back[1], 2.5);
    }

    #[test]
    fn test_matrix_shapes() {
        let m = Matrix::from_rows(&[vec![1u64, 2, 3], vec![4, 5, 6]]).unwrap();
        assert_eq!((m.rows(), m.cols()), (2, 3));
        assert_eq!(m.get(1, 0), Some(4));
        assert_eq!(m.as_slice(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(m.to_rows()[1], vec![4, 5, 6]);

        assert!(Matrix::from_rows(&[vec![1u64], vec![2, 3]]).is_err());
        assert!(Matrix::from_row_major(2, 2, vec![1.0f64; 3]).is_err());
    }
}
