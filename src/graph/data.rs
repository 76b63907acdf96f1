// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! External tensor storage and the slots that refer to it.
//!
//! Leaf nodes never own their data. The caller allocates a [`TensorData`]
//! and binds it to a leaf through its [`LeafHandle`]; the leaf keeps only a
//! weak reference. A compiled module upgrades that reference right before
//! each execution and releases it when the call returns, so callers may
//! rebind or mutate storage freely between executions.

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use super::{GraphError, NodeId};

pub(crate) type Storage = Rc<RefCell<Vec<f64>>>;

/// Caller-owned element storage for a leaf tensor.
///
/// Cloning a `TensorData` clones the handle, not the elements.
#[derive(Clone, Debug, Default)]
pub struct TensorData(Storage);

impl TensorData {
    pub fn new(values: Vec<f64>) -> Self {
        Self(Rc::new(RefCell::new(values)))
    }

    pub fn zeros(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the current elements.
    pub fn read(&self) -> Ref<'_, Vec<f64>> {
        self.0.borrow()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.0.borrow().clone()
    }

    pub fn get(&self, idx: usize) -> f64 {
        self.0.borrow()[idx]
    }

    pub fn set(&self, idx: usize, value: f64) {
        self.0.borrow_mut()[idx] = value;
    }

    /// Overwrite every element. Panics if the lengths differ.
    pub fn copy_from(&self, values: &[f64]) {
        self.0.borrow_mut().copy_from_slice(values);
    }

    /// True when both handles refer to the same storage.
    pub fn same_storage(&self, other: &TensorData) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn downgrade(&self) -> Weak<RefCell<Vec<f64>>> {
        Rc::downgrade(&self.0)
    }
}

impl From<Vec<f64>> for TensorData {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

/// Externally-owned data slot of a leaf node.
///
/// The slot is shared between the graph, any leaf handles, and every module
/// compiled from the graph, so a rebinding is observed by all of them.
#[derive(Clone, Default)]
pub struct DataSlot(Rc<RefCell<Option<Weak<RefCell<Vec<f64>>>>>>);

impl DataSlot {
    pub(crate) fn bind(&self, data: &TensorData) {
        *self.0.borrow_mut() = Some(data.downgrade());
    }

    pub fn unbind(&self) {
        self.0.borrow_mut().take();
    }

    /// True when storage is bound and still alive.
    pub fn is_bound(&self) -> bool {
        self.upgrade().is_some()
    }

    pub(crate) fn upgrade(&self) -> Option<Storage> {
        self.0.borrow().as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for DataSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSlot")
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// A leaf node together with its data slot.
#[derive(Clone, Debug)]
pub struct LeafHandle {
    id: NodeId,
    slot: DataSlot,
    len: usize,
}

impl LeafHandle {
    pub(crate) fn new(id: NodeId, slot: DataSlot, len: usize) -> Self {
        Self { id, slot, len }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Number of elements the bound storage must hold.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slot(&self) -> &DataSlot {
        &self.slot
    }

    /// Point the leaf at `data`. The caller keeps `data` alive; the leaf
    /// only holds a weak reference.
    pub fn bind(&self, data: &TensorData) -> Result<(), GraphError> {
        let found = data.len();
        if found != self.len {
            return Err(GraphError::SizeMismatch {
                node: self.id,
                expected: self.len,
                found,
            });
        }
        self.slot.bind(data);
        Ok(())
    }

    pub fn unbind(&self) {
        self.slot.unbind();
    }
}

impl From<&LeafHandle> for NodeId {
    fn from(handle: &LeafHandle) -> Self {
        handle.id
    }
}
