//! Blob: N-dimensional array with paired data and gradient storage
//!
//! A `Blob` is the unit of data exchanged between layers. It carries a
//! `data` buffer (values) and a `diff` buffer (gradients) of identical size.
//! Both buffers are reference-counted so one blob can alias ("share") the
//! storage of another. Aliases never free storage independently: the
//! allocation lives until the last blob referring to it is dropped.
//!
//! Storage keeps its capacity across reshapes. A reshape that grows the
//! element count past the current capacity allocates fresh storage, which
//! detaches the blob from any aliases.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

type Storage = Rc<RefCell<Vec<f32>>>;

fn new_storage(len: usize) -> Storage {
    Rc::new(RefCell::new(vec![0.0f32; len]))
}

/// Tensor with value (`data`) and gradient (`diff`) storage.
///
/// # Example
///
/// ```
/// use rust_recurrent_networks::blob::Blob;
///
/// let mut a = Blob::new(&[2, 3]);
/// a.set_data(1.5);
///
/// let mut b = Blob::new(&[2, 3]);
/// b.share_data(&a);
/// assert_eq!(b.data()[5], 1.5);
/// assert!(b.shares_data_with(&a));
/// ```
pub struct Blob {
    shape: Vec<usize>,
    count: usize,
    data: Storage,
    diff: Storage,
}

impl Default for Blob {
    fn default() -> Self {
        Blob::new(&[0])
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("shape", &self.shape)
            .field("shared", &self.is_shared())
            .finish()
    }
}

impl Blob {
    /// Create a zero-filled blob. An empty shape denotes a scalar (count 1).
    pub fn new(shape: &[usize]) -> Self {
        let count = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            count,
            data: new_storage(count),
            diff: new_storage(count),
        }
    }

    /// Create a blob holding `values`; the gradient starts at zero.
    ///
    /// # Panics
    ///
    /// Panics if `values.len()` does not match the shape's element count.
    pub fn from_data(shape: &[usize], values: Vec<f32>) -> Self {
        let blob = Blob::new(shape);
        assert_eq!(
            values.len(),
            blob.count,
            "from_data: expected {} values for shape {:?}, got {}",
            blob.count,
            shape,
            values.len()
        );
        *blob.data.borrow_mut() = values;
        blob
    }

    /// Change the blob's shape.
    ///
    /// Returns `false` (and does nothing) when `shape` equals the current
    /// shape. Storage is reallocated only when the new element count exceeds
    /// the current capacity.
    pub fn reshape(&mut self, shape: &[usize]) -> bool {
        if self.shape == shape {
            return false;
        }
        let count: usize = shape.iter().product();
        if count > self.capacity() {
            self.data = new_storage(count);
            self.diff = new_storage(count);
        }
        self.shape = shape.to_vec();
        self.count = count;
        true
    }

    /// Reshape to match `other`'s shape.
    pub fn reshape_like(&mut self, other: &Blob) -> bool {
        let shape = other.shape.clone();
        self.reshape(&shape)
    }

    fn capacity(&self) -> usize {
        self.data.borrow().len().min(self.diff.borrow().len())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Size of a single axis. Negative indices count from the end.
    pub fn shape_at(&self, axis: isize) -> usize {
        self.shape[self.canonical_axis(axis)]
    }

    pub fn num_axes(&self) -> usize {
        self.shape.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Product of the dimensions in `start..end`.
    pub fn count_range(&self, start: usize, end: usize) -> usize {
        self.shape[start..end].iter().product()
    }

    /// Product of the dimensions from `start` to the last axis.
    pub fn count_from(&self, start: usize) -> usize {
        self.count_range(start, self.shape.len())
    }

    /// Map a possibly negative axis index into `0..num_axes`.
    ///
    /// # Panics
    ///
    /// Panics if the axis is out of range.
    pub fn canonical_axis(&self, axis: isize) -> usize {
        let n = self.shape.len() as isize;
        assert!(
            axis >= -n && axis < n,
            "axis {} out of range for blob with {} axes",
            axis,
            n
        );
        if axis < 0 {
            (axis + n) as usize
        } else {
            axis as usize
        }
    }

    /// Human readable shape, e.g. `"2 3 4 (24)"`.
    pub fn shape_string(&self) -> String {
        let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
        format!("{} ({})", dims.join(" "), self.count)
    }

    pub fn data(&self) -> Ref<'_, [f32]> {
        let n = self.count;
        Ref::map(self.data.borrow(), |v| &v[..n])
    }

    pub fn data_mut(&self) -> RefMut<'_, [f32]> {
        let n = self.count;
        RefMut::map(self.data.borrow_mut(), |v| &mut v[..n])
    }

    pub fn diff(&self) -> Ref<'_, [f32]> {
        let n = self.count;
        Ref::map(self.diff.borrow(), |v| &v[..n])
    }

    pub fn diff_mut(&self) -> RefMut<'_, [f32]> {
        let n = self.count;
        RefMut::map(self.diff.borrow_mut(), |v| &mut v[..n])
    }

    /// Snapshot of the values.
    pub fn data_vec(&self) -> Vec<f32> {
        self.data().to_vec()
    }

    /// Snapshot of the gradients.
    pub fn diff_vec(&self) -> Vec<f32> {
        self.diff().to_vec()
    }

    pub fn set_data(&self, value: f32) {
        self.data_mut().iter_mut().for_each(|v| *v = value);
    }

    pub fn set_diff(&self, value: f32) {
        self.diff_mut().iter_mut().for_each(|v| *v = value);
    }

    pub fn scale_diff(&self, factor: f32) {
        self.diff_mut().iter_mut().for_each(|v| *v *= factor);
    }

    /// Overwrite the values from a slice of matching length.
    pub fn copy_data_from_slice(&self, values: &[f32]) {
        self.data_mut().copy_from_slice(values);
    }

    /// Overwrite the gradients from a slice of matching length.
    pub fn copy_diff_from_slice(&self, values: &[f32]) {
        self.diff_mut().copy_from_slice(values);
    }

    /// Make this blob's `data` alias `other`'s `data`.
    ///
    /// # Panics
    ///
    /// Panics if the element counts differ.
    pub fn share_data(&mut self, other: &Blob) {
        assert_eq!(
            self.count, other.count,
            "share_data: count mismatch ({} vs {})",
            self.count, other.count
        );
        self.data = Rc::clone(&other.data);
    }

    /// Make this blob's `diff` alias `other`'s `diff`.
    ///
    /// # Panics
    ///
    /// Panics if the element counts differ.
    pub fn share_diff(&mut self, other: &Blob) {
        assert_eq!(
            self.count, other.count,
            "share_diff: count mismatch ({} vs {})",
            self.count, other.count
        );
        self.diff = Rc::clone(&other.diff);
    }

    /// A second handle onto the same shape and storage.
    pub fn alias(&self) -> Blob {
        Blob {
            shape: self.shape.clone(),
            count: self.count,
            data: Rc::clone(&self.data),
            diff: Rc::clone(&self.diff),
        }
    }

    /// Independent deep copy of shape, values and gradients.
    pub fn duplicate(&self) -> Blob {
        let blob = Blob::new(&self.shape);
        blob.data_mut().copy_from_slice(&self.data());
        blob.diff_mut().copy_from_slice(&self.diff());
        blob
    }

    pub fn shares_data_with(&self, other: &Blob) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    pub fn shares_diff_with(&self, other: &Blob) -> bool {
        Rc::ptr_eq(&self.diff, &other.diff)
    }

    /// Whether any other blob aliases this blob's data or diff storage.
    pub fn is_shared(&self) -> bool {
        Rc::strong_count(&self.data) > 1 || Rc::strong_count(&self.diff) > 1
    }

    /// Copy values (or gradients when `copy_diff`) from `source`.
    ///
    /// With `reshape` set the blob first takes `source`'s shape; otherwise
    /// the counts must already agree.
    pub fn copy_from(&mut self, source: &Blob, copy_diff: bool, reshape: bool) -> crate::Result<()> {
        if source.count != self.count || source.shape != self.shape {
            if reshape {
                self.reshape_like(source);
            } else if source.count != self.count {
                return Err(crate::NetError::ShapeMismatch(format!(
                    "copy_from: cannot copy {} into {} without reshape",
                    source.shape_string(),
                    self.shape_string()
                )));
            }
        }
        if copy_diff {
            if self.shares_diff_with(source) {
                return Ok(());
            }
            self.diff_mut().copy_from_slice(&source.diff());
        } else {
            if self.shares_data_with(source) {
                return Ok(());
            }
            self.data_mut().copy_from_slice(&source.data());
        }
        Ok(())
    }

    /// Sum of squared gradients, handy for logging.
    pub fn sumsq_diff(&self) -> f32 {
        self.diff().iter().map(|v| v * v).sum()
    }

    /// Sum of absolute values, handy for logging.
    pub fn asum_data(&self) -> f32 {
        self.data().iter().map(|v| v.abs()).sum()
    }
}
