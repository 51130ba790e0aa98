//! Shape and type bookkeeping for allocated memory objects.

use super::{ElementType, Layout};
use crate::error::{ComputeError, ComputeResult};

/// Fixed shape of a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryShape {
    /// Linear buffer of `len` elements.
    Linear {
        /// Element count.
        len: usize,
    },
    /// Two-dimensional image.
    Image {
        /// Row count (image height).
        rows: usize,
        /// Column count (image width).
        cols: usize,
    },
}

impl MemoryShape {
    /// Layout implied by the shape.
    pub fn layout(&self) -> Layout {
        match self {
            MemoryShape::Linear { .. } => Layout::Linear,
            MemoryShape::Image { .. } => Layout::Image,
        }
    }

    /// Total number of elements.
    pub fn element_count(&self) -> usize {
        match *self {
            MemoryShape::Linear { len } => len,
            MemoryShape::Image { rows, cols } => rows * cols,
        }
    }
}

/// Description of an allocated buffer or image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryDescriptor {
    /// Element type fixed at creation.
    pub element: ElementType,
    /// Shape fixed at creation.
    pub shape: MemoryShape,
}

impl MemoryDescriptor {
    /// Describe a linear buffer, rejecting empty allocations.
    pub fn linear(element: ElementType, len: usize) -> ComputeResult<Self> {
        if len == 0 {
            return Err(ComputeError::InvalidShape(
                "buffer length must be non-zero".to_string(),
            ));
        }
        element
            .width(Layout::Linear)
            .checked_mul(len)
            .ok_or_else(|| ComputeError::InvalidShape(format!("buffer length {} overflows", len)))?;
        Ok(Self {
            element,
            shape: MemoryShape::Linear { len },
        })
    }

    /// Describe a 2-D image, rejecting empty extents.
    pub fn image(element: ElementType, rows: usize, cols: usize) -> ComputeResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(ComputeError::InvalidShape(format!(
                "image extents must be non-zero, got {}x{}",
                rows, cols
            )));
        }
        rows.checked_mul(cols)
            .and_then(|n| n.checked_mul(element.width(Layout::Image)))
            .ok_or_else(|| {
                ComputeError::InvalidShape(format!("image {}x{} overflows", rows, cols))
            })?;
        Ok(Self {
            element,
            shape: MemoryShape::Image { rows, cols },
        })
    }

    /// Size of the allocation in bytes.
    pub fn byte_size(&self) -> usize {
        self.shape.element_count() * self.element.width(self.shape.layout())
    }

    /// Check a linear transfer of `len` elements of type `element`.
    pub fn check_linear(&self, element: ElementType, len: usize) -> ComputeResult<()> {
        self.check_element(element)?;
        match self.shape {
            MemoryShape::Linear { len: capacity } if len <= capacity => Ok(()),
            MemoryShape::Linear { len: capacity } => Err(ComputeError::InvalidShape(format!(
                "transfer of {} elements exceeds buffer length {}",
                len, capacity
            ))),
            MemoryShape::Image { .. } => Err(ComputeError::InvalidShape(
                "linear transfer on an image".to_string(),
            )),
        }
    }

    /// Check an image transfer with extents `rows x cols`.
    pub fn check_image(&self, element: ElementType, rows: usize, cols: usize) -> ComputeResult<()> {
        self.check_element(element)?;
        match self.shape {
            MemoryShape::Image { rows: r, cols: c } if r == rows && c == cols => Ok(()),
            MemoryShape::Image { rows: r, cols: c } => Err(ComputeError::InvalidShape(format!(
                "transfer extents {}x{} differ from image extents {}x{}",
                rows, cols, r, c
            ))),
            MemoryShape::Linear { .. } => Err(ComputeError::InvalidShape(
                "image transfer on a linear buffer".to_string(),
            )),
        }
    }

    fn check_element(&self, element: ElementType) -> ComputeResult<()> {
        if element != self.element {
            return Err(ComputeError::TypeMismatch {
                expected: self.element,
                found: element,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_sizes() {
        let buf = MemoryDescriptor::linear(ElementType::UInt, 10).unwrap();
        assert_eq!(buf.byte_size(), 80);

        let buf = MemoryDescriptor::linear(ElementType::Float, 10).unwrap();
        assert_eq!(buf.byte_size(), 40);

        let img = MemoryDescriptor::image(ElementType::UInt, 3, 5).unwrap();
        assert_eq!(img.byte_size(), 60);
    }

    #[test]
    fn test_empty_shapes_rejected() {
        assert!(MemoryDescriptor::linear(ElementType::Float, 0).is_err());
        assert!(MemoryDescriptor::image(ElementType::Float, 0, 4).is_err());
    }

    #[test]
    fn test_transfer_checks() {
        let buf = MemoryDescriptor::linear(ElementType::Float, 4).unwrap();
        assert!(buf.check_linear(ElementType::Float, 4).is_ok());
        assert!(buf.check_linear(ElementType::Float, 2).is_ok());
        assert!(buf.check_linear(ElementType::Float, 5).is_err());
        assert!(matches!(
            buf.check_linear(ElementType::UInt, 4),
            Err(ComputeError::TypeMismatch { .. })
        ));
        assert!(buf.check_image(ElementType::Float, 2, 2).is_err());

        let img = MemoryDescriptor::image(ElementType::UInt, 2, 3).unwrap();
        assert!(img.check_image(ElementType::UInt, 2, 3).is_ok());
        assert!(img.check_image(ElementType::UInt, 3, 2).is_err());
        assert!(img.check_linear(ElementType::UInt, 6).is_err());
    }
}
