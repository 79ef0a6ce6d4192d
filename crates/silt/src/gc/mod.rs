//! Precise tracing garbage collector.
//!
//! Every managed allocation is owned by the collector and addressed through
//! an opaque [`Ref`] handle; null is the absence of a handle and is written
//! as zero wherever references live in raw memory (operand stack, locals,
//! struct fields, reference arrays).
//!
//! Reachability roots come in three flavours: counted roots (locals and
//! explicit host roots), counted persistent handles (host-held values with a
//! layout fixed at registration), and counted temporaries (values in flight
//! on an operand stack that a collection in mid-expression must not reclaim).
//!
//! Raw struct objects are plain byte buffers; the marker finds references
//! inside them through the type-layout registry, which maps a layout id to
//! the ordered byte offsets of the reference-valued fields.

use std::collections::HashMap;
use std::num::NonZeroU64;

use tracing::{debug, trace};

use crate::bytecode::ArrayKind;
use crate::error::ErrorKind;
use crate::module::REF_SIZE;

/// Allocation flags.
pub mod gc_flags {
    pub const NONE: u8 = 0;
    /// Track the new object as a temporary instead of a root.
    pub const TEMPORARY: u8 = 2;
}

const REACHABLE: u8 = 1;

/// Bytes charged for a managed string allocation.
const STR_COST: usize = std::mem::size_of::<String>();

/// Handle to a managed allocation. Handles are never reused within a
/// collector's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref(NonZeroU64);

impl Ref {
    #[must_use]
    pub fn bits(self) -> u64 {
        self.0.get()
    }

    /// Encode an optional reference as stack/memory bits; null is zero.
    #[must_use]
    pub fn to_bits(r: Option<Ref>) -> u64 {
        r.map_or(0, Ref::bits)
    }

    #[must_use]
    pub fn from_bits(bits: u64) -> Option<Ref> {
        NonZeroU64::new(bits).map(Ref)
    }
}

/// Kind of a managed allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Str,
    Raw,
    ArrayI8,
    ArrayI16,
    ArrayI32,
    ArrayI64,
    ArrayF32,
    ArrayF64,
    ArrayStr,
    ArrayRef,
}

impl GcKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Raw => "obj",
            Self::ArrayI8 => "array_i8",
            Self::ArrayI16 => "array_i16",
            Self::ArrayI32 => "array_i32",
            Self::ArrayI64 => "array_i64",
            Self::ArrayF32 => "array_f32",
            Self::ArrayF64 => "array_f64",
            Self::ArrayStr => "array_str",
            Self::ArrayRef => "array_ref",
        }
    }
}

#[derive(Debug)]
enum GcData {
    Str(String),
    Raw(Box<[u8]>),
    I8(Box<[i8]>),
    I16(Box<[i16]>),
    I32(Box<[i32]>),
    I64(Box<[i64]>),
    F32(Box<[f32]>),
    F64(Box<[f64]>),
    /// Str and ref arrays; elements are handle bits, zero for null.
    Handles(Box<[u64]>),
}

#[derive(Debug)]
struct GcObject {
    kind: GcKind,
    data: GcData,
    /// Struct layout for raw objects, element layout for ref arrays.
    layout_id: Option<usize>,
    /// Bytes charged against the allocation counters.
    size: usize,
    /// Requested alignment for raw objects (bookkeeping; buffers are owned).
    alignment: usize,
    flags: u8,
}

#[derive(Debug)]
struct PersistentEntry {
    layout_id: usize,
    count: usize,
}

fn gc_err(msg: impl Into<String>) -> ErrorKind {
    ErrorKind::Gc(msg.into())
}

/// The collector. One per [`crate::Context`].
#[derive(Debug)]
pub struct Gc {
    objects: HashMap<Ref, GcObject>,
    roots: HashMap<Ref, usize>,
    temporaries: HashMap<Ref, usize>,
    persistent: HashMap<Ref, PersistentEntry>,
    /// Layout id is the index; layouts are never removed.
    layouts: Vec<(String, Vec<usize>)>,
    next_handle: u64,
    allocated_bytes: usize,
    bytes_since_gc: usize,
    min_threshold: usize,
    threshold: usize,
    growth_factor: f64,
}

impl Default for Gc {
    fn default() -> Self {
        const MIB: usize = 1024 * 1024;
        Self::new(MIB, MIB, 2.0)
    }
}

impl Gc {
    #[must_use]
    pub fn new(min_threshold: usize, threshold: usize, growth_factor: f64) -> Self {
        Self {
            objects: HashMap::new(),
            roots: HashMap::new(),
            temporaries: HashMap::new(),
            persistent: HashMap::new(),
            layouts: Vec::new(),
            next_handle: 1,
            allocated_bytes: 0,
            bytes_since_gc: 0,
            min_threshold,
            threshold,
            growth_factor,
        }
    }

    /* ------------------------------------------------------------------ */
    /* allocation                                                         */
    /* ------------------------------------------------------------------ */

    /// Charge an allocation and run a collection cycle if the threshold is
    /// crossed. Called before the object is created, so the cycle never sees
    /// the half-built allocation.
    fn charge(&mut self, bytes: usize) {
        self.allocated_bytes += bytes;
        self.bytes_since_gc += bytes;
        if self.bytes_since_gc >= self.threshold {
            self.collect();
        }
    }

    fn insert(&mut self, object: GcObject, track: bool) -> Ref {
        let handle = Ref(NonZeroU64::new(self.next_handle).expect("handle counter starts at 1"));
        self.next_handle += 1;
        let flags = object.flags;
        self.objects.insert(handle, object);
        if track {
            if flags & gc_flags::TEMPORARY != 0 {
                self.add_temporary(Some(handle));
            } else {
                self.add_root(handle);
            }
        }
        handle
    }

    /// Allocate a managed string.
    pub fn alloc_str(&mut self, flags: u8) -> Ref {
        self.charge(STR_COST);
        trace!(target: "gc", "alloc str");
        self.insert(
            GcObject {
                kind: GcKind::Str,
                data: GcData::Str(String::new()),
                layout_id: None,
                size: STR_COST,
                alignment: std::mem::align_of::<String>(),
                flags,
            },
            true,
        )
    }

    /// Allocate an array of scalars or strings. String arrays are populated
    /// with fresh empty managed strings. Reference arrays need
    /// [`Gc::alloc_ref_array`] so that the element layout is known.
    pub fn alloc_array(&mut self, kind: ArrayKind, len: usize, flags: u8) -> Result<Ref, ErrorKind> {
        let (gc_kind, data, elem_size) = match kind {
            ArrayKind::I8 => (GcKind::ArrayI8, GcData::I8(vec![0; len].into()), 1),
            ArrayKind::I16 => (GcKind::ArrayI16, GcData::I16(vec![0; len].into()), 2),
            ArrayKind::I32 => (GcKind::ArrayI32, GcData::I32(vec![0; len].into()), 4),
            ArrayKind::I64 => (GcKind::ArrayI64, GcData::I64(vec![0; len].into()), 8),
            ArrayKind::F32 => (GcKind::ArrayF32, GcData::F32(vec![0.0; len].into()), 4),
            ArrayKind::F64 => (GcKind::ArrayF64, GcData::F64(vec![0.0; len].into()), 8),
            ArrayKind::Str => (
                GcKind::ArrayStr,
                GcData::Handles(vec![0; len].into()),
                REF_SIZE,
            ),
            ArrayKind::Ref => {
                return Err(gc_err(
                    "tried to create a reference array without an element layout",
                ));
            }
        };

        let size = len * elem_size;
        self.charge(size);
        trace!(target: "gc", kind = gc_kind.name(), len, "alloc array");
        let array = self.insert(
            GcObject {
                kind: gc_kind,
                data,
                layout_id: None,
                size,
                alignment: elem_size,
                flags,
            },
            true,
        );

        if kind == ArrayKind::Str {
            // The array is already tracked, so a cycle triggered by an
            // element allocation keeps the elements written so far alive.
            for i in 0..len {
                let s = self.alloc_str_untracked();
                if let GcData::Handles(elems) = &mut self
                    .objects
                    .get_mut(&array)
                    .expect("string array was just inserted")
                    .data
                {
                    elems[i] = s.bits();
                }
            }
        }

        Ok(array)
    }

    /// Allocate a raw struct object. Memory is zero-initialized.
    pub fn alloc_raw(
        &mut self,
        layout_id: usize,
        size: usize,
        alignment: usize,
        flags: u8,
    ) -> Result<Ref, ErrorKind> {
        if layout_id >= self.layouts.len() {
            return Err(gc_err(format!(
                "tried to create object with unknown type layout id {layout_id}"
            )));
        }
        self.charge(size);
        trace!(target: "gc", layout_id, size, alignment, "alloc raw");
        Ok(self.insert(
            GcObject {
                kind: GcKind::Raw,
                data: GcData::Raw(vec![0; size].into()),
                layout_id: Some(layout_id),
                size,
                alignment,
                flags,
            },
            true,
        ))
    }

    /// Allocate a reference array; the element layout id lets the marker
    /// walk into each element.
    pub fn alloc_ref_array(
        &mut self,
        element_layout_id: usize,
        len: usize,
        flags: u8,
    ) -> Result<Ref, ErrorKind> {
        if element_layout_id >= self.layouts.len() {
            return Err(gc_err(format!(
                "tried to create reference array with unknown type layout id {element_layout_id}"
            )));
        }
        let size = len * REF_SIZE;
        self.charge(size);
        trace!(target: "gc", element_layout_id, len, "alloc ref array");
        Ok(self.insert(
            GcObject {
                kind: GcKind::ArrayRef,
                data: GcData::Handles(vec![0; len].into()),
                layout_id: Some(element_layout_id),
                size,
                alignment: REF_SIZE,
                flags,
            },
            true,
        ))
    }

    /// String allocation that enters neither the root nor the temporary set
    /// (string array elements, reachable through their array).
    fn alloc_str_untracked(&mut self) -> Ref {
        self.charge(STR_COST);
        self.insert(
            GcObject {
                kind: GcKind::Str,
                data: GcData::Str(String::new()),
                layout_id: None,
                size: STR_COST,
                alignment: std::mem::align_of::<String>(),
                flags: gc_flags::NONE,
            },
            false,
        )
    }

    /* ------------------------------------------------------------------ */
    /* roots, temporaries, persistent handles                             */
    /* ------------------------------------------------------------------ */

    pub fn add_root(&mut self, r: Ref) {
        trace!(target: "gc", handle = r.bits(), "add root");
        *self.roots.entry(r).or_insert(0) += 1;
    }

    pub fn remove_root(&mut self, r: Ref) -> Result<(), ErrorKind> {
        trace!(target: "gc", handle = r.bits(), "remove root");
        match self.roots.get_mut(&r) {
            None => Err(gc_err(format!(
                "cannot remove root {:#x}: not in the root set",
                r.bits()
            ))),
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.roots.remove(&r);
                }
                Ok(())
            }
        }
    }

    /// Register a temporary. A no-op for null, which keeps the opcode
    /// implementations free of null checks.
    pub fn add_temporary(&mut self, r: Option<Ref>) {
        let Some(r) = r else { return };
        trace!(target: "gc", handle = r.bits(), "add temporary");
        *self.temporaries.entry(r).or_insert(0) += 1;
    }

    /// Drop a temporary refcount. Null-tolerant like [`Gc::add_temporary`].
    pub fn remove_temporary(&mut self, r: Option<Ref>) -> Result<(), ErrorKind> {
        let Some(r) = r else { return Ok(()) };
        trace!(target: "gc", handle = r.bits(), "remove temporary");
        match self.temporaries.get_mut(&r) {
            None => Err(gc_err(format!(
                "reference {:#x} does not exist in the temporary set",
                r.bits()
            ))),
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.temporaries.remove(&r);
                }
                Ok(())
            }
        }
    }

    /// Register a host-held handle. The layout id is fixed at first
    /// insertion and must name a registered layout.
    pub fn add_persistent(&mut self, r: Ref, layout_id: usize) -> Result<(), ErrorKind> {
        if layout_id >= self.layouts.len() {
            return Err(gc_err(format!(
                "no type layout registered for id {layout_id}"
            )));
        }
        trace!(target: "gc", handle = r.bits(), layout_id, "add persistent");
        self.persistent
            .entry(r)
            .or_insert(PersistentEntry {
                layout_id,
                count: 0,
            })
            .count += 1;
        Ok(())
    }

    pub fn remove_persistent(&mut self, r: Ref) -> Result<(), ErrorKind> {
        trace!(target: "gc", handle = r.bits(), "remove persistent");
        match self.persistent.get_mut(&r) {
            None => Err(gc_err(format!(
                "reference {:#x} does not exist in the persistent set",
                r.bits()
            ))),
            Some(entry) => {
                entry.count -= 1;
                if entry.count == 0 {
                    self.persistent.remove(&r);
                }
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn is_root(&self, r: Ref) -> bool {
        self.roots.contains_key(&r)
    }

    #[must_use]
    pub fn is_temporary(&self, r: Ref) -> bool {
        self.temporaries.contains_key(&r)
    }

    #[must_use]
    pub fn is_persistent(&self, r: Ref) -> bool {
        self.persistent.contains_key(&r)
    }

    /* ------------------------------------------------------------------ */
    /* collection                                                         */
    /* ------------------------------------------------------------------ */

    /// Run a full mark/sweep cycle and rescale the trigger threshold.
    pub fn collect(&mut self) {
        let before = self.objects.len();

        let mut worklist: Vec<Ref> = self
            .roots
            .keys()
            .chain(self.temporaries.keys())
            .chain(self.persistent.keys())
            .copied()
            .collect();

        while let Some(r) = worklist.pop() {
            // References into host-released or foreign memory are skipped,
            // not failed: the root multisets may momentarily hold handles
            // the collector does not own.
            let Some(object) = self.objects.get_mut(&r) else {
                continue;
            };
            if object.flags & REACHABLE != 0 {
                continue;
            }
            object.flags |= REACHABLE;

            match &object.data {
                GcData::Handles(elems) => {
                    worklist.extend(elems.iter().copied().filter_map(Ref::from_bits));
                }
                GcData::Raw(bytes) => {
                    let layout_id = object
                        .layout_id
                        .expect("raw objects always carry a layout id");
                    for &offset in &self.layouts[layout_id].1 {
                        let mut bits = [0u8; REF_SIZE];
                        bits.copy_from_slice(&bytes[offset..offset + REF_SIZE]);
                        if let Some(child) = Ref::from_bits(u64::from_le_bytes(bits)) {
                            worklist.push(child);
                        }
                    }
                }
                _ => {}
            }
        }

        let allocated = &mut self.allocated_bytes;
        self.objects.retain(|r, object| {
            if object.flags & REACHABLE != 0 {
                object.flags &= !REACHABLE;
                true
            } else {
                trace!(target: "gc", handle = r.bits(), kind = object.kind.name(), "collect");
                *allocated = allocated.saturating_sub(object.size);
                false
            }
        });

        self.bytes_since_gc = 0;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let scaled = (self.growth_factor * self.allocated_bytes as f64) as usize;
        self.threshold = scaled.max(self.min_threshold);

        debug!(
            target: "gc",
            before,
            after = self.objects.len(),
            allocated_bytes = self.allocated_bytes,
            threshold = self.threshold,
            "collection cycle"
        );
    }

    /// Free all managed memory and clear every root multiset.
    pub fn reset(&mut self) {
        debug!(target: "gc", objects = self.objects.len(), "reset");
        self.objects.clear();
        self.roots.clear();
        self.temporaries.clear();
        self.persistent.clear();
        self.allocated_bytes = 0;
        self.bytes_since_gc = 0;
    }

    /* ------------------------------------------------------------------ */
    /* type layouts                                                       */
    /* ------------------------------------------------------------------ */

    /// Register a layout under a fresh id. Fails if the name is taken.
    pub fn register_type_layout(
        &mut self,
        name: String,
        offsets: Vec<usize>,
    ) -> Result<usize, ErrorKind> {
        if self.layouts.iter().any(|(n, _)| *n == name) {
            return Err(gc_err(format!("layout for type '{name}' already registered")));
        }
        self.layouts.push((name, offsets));
        Ok(self.layouts.len() - 1)
    }

    /// Verify a layout against a previously registered one and return its
    /// id. Fails if the name is unknown or the layouts disagree.
    pub fn check_type_layout(&self, name: &str, offsets: &[usize]) -> Result<usize, ErrorKind> {
        let (id, (_, registered)) = self
            .layouts
            .iter()
            .enumerate()
            .find(|(_, (n, _))| n == name)
            .ok_or_else(|| gc_err(format!("layout for type '{name}' not found")))?;
        if registered != offsets {
            return Err(gc_err(format!(
                "a different layout was already registered for type '{name}'"
            )));
        }
        Ok(id)
    }

    pub fn layout_id(&self, name: &str) -> Result<usize, ErrorKind> {
        self.layouts
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| gc_err(format!("no type layout registered for '{name}'")))
    }

    /// Layout id of an object (raw objects and reference arrays).
    pub fn layout_id_of(&self, r: Ref) -> Result<usize, ErrorKind> {
        self.object(r)?
            .layout_id
            .ok_or_else(|| gc_err(format!("object {:#x} has no type layout", r.bits())))
    }

    pub fn layout_name(&self, layout_id: usize) -> Result<&str, ErrorKind> {
        self.layouts
            .get(layout_id)
            .map(|(n, _)| n.as_str())
            .ok_or_else(|| gc_err(format!("no type layout registered for id {layout_id}")))
    }

    /* ------------------------------------------------------------------ */
    /* introspection and typed access                                     */
    /* ------------------------------------------------------------------ */

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    #[must_use]
    pub fn bytes_since_gc(&self) -> usize {
        self.bytes_since_gc
    }

    #[must_use]
    pub fn threshold_bytes(&self) -> usize {
        self.threshold
    }

    fn object(&self, r: Ref) -> Result<&GcObject, ErrorKind> {
        self.objects.get(&r).ok_or_else(|| {
            gc_err(format!(
                "reference {:#x} does not exist in the object list",
                r.bits()
            ))
        })
    }

    fn object_mut(&mut self, r: Ref) -> Result<&mut GcObject, ErrorKind> {
        self.objects.get_mut(&r).ok_or_else(|| {
            gc_err(format!(
                "reference {:#x} does not exist in the object list",
                r.bits()
            ))
        })
    }

    pub fn kind_of(&self, r: Ref) -> Result<GcKind, ErrorKind> {
        Ok(self.object(r)?.kind)
    }

    /// Element count of any array object.
    pub fn array_len(&self, r: Ref) -> Result<usize, ErrorKind> {
        match &self.object(r)?.data {
            GcData::I8(v) => Ok(v.len()),
            GcData::I16(v) => Ok(v.len()),
            GcData::I32(v) => Ok(v.len()),
            GcData::I64(v) => Ok(v.len()),
            GcData::F32(v) => Ok(v.len()),
            GcData::F64(v) => Ok(v.len()),
            GcData::Handles(v) => Ok(v.len()),
            GcData::Str(_) | GcData::Raw(_) => {
                Err(gc_err(format!("object {:#x} is not an array", r.bits())))
            }
        }
    }

    pub fn string(&self, r: Ref) -> Result<&str, ErrorKind> {
        match &self.object(r)?.data {
            GcData::Str(s) => Ok(s),
            _ => Err(gc_err(format!("object {:#x} is not a string", r.bits()))),
        }
    }

    pub fn string_mut(&mut self, r: Ref) -> Result<&mut String, ErrorKind> {
        match &mut self.object_mut(r)?.data {
            GcData::Str(s) => Ok(s),
            _ => Err(gc_err(format!("object {:#x} is not a string", r.bits()))),
        }
    }

    pub fn raw(&self, r: Ref) -> Result<&[u8], ErrorKind> {
        match &self.object(r)?.data {
            GcData::Raw(bytes) => Ok(bytes),
            _ => Err(gc_err(format!("object {:#x} is not a raw object", r.bits()))),
        }
    }

    pub fn raw_mut(&mut self, r: Ref) -> Result<&mut [u8], ErrorKind> {
        match &mut self.object_mut(r)?.data {
            GcData::Raw(bytes) => Ok(bytes),
            _ => Err(gc_err(format!("object {:#x} is not a raw object", r.bits()))),
        }
    }

    /// Handle bits of a string or reference array.
    pub fn handles(&self, r: Ref) -> Result<&[u64], ErrorKind> {
        match &self.object(r)?.data {
            GcData::Handles(v) => Ok(v),
            _ => Err(gc_err(format!(
                "object {:#x} is not a reference array",
                r.bits()
            ))),
        }
    }

    pub fn handles_mut(&mut self, r: Ref) -> Result<&mut [u64], ErrorKind> {
        match &mut self.object_mut(r)?.data {
            GcData::Handles(v) => Ok(v),
            _ => Err(gc_err(format!(
                "object {:#x} is not a reference array",
                r.bits()
            ))),
        }
    }
}

macro_rules! scalar_array_accessors {
    ($($get:ident, $get_mut:ident, $variant:ident, $ty:ty;)*) => {
        impl Gc {
            $(
                pub fn $get(&self, r: Ref) -> Result<&[$ty], ErrorKind> {
                    match &self.object(r)?.data {
                        GcData::$variant(v) => Ok(v),
                        _ => Err(gc_err(format!(
                            concat!("object {:#x} is not an ", stringify!($ty), " array"),
                            r.bits()
                        ))),
                    }
                }

                pub fn $get_mut(&mut self, r: Ref) -> Result<&mut [$ty], ErrorKind> {
                    match &mut self.object_mut(r)?.data {
                        GcData::$variant(v) => Ok(v),
                        _ => Err(gc_err(format!(
                            concat!("object {:#x} is not an ", stringify!($ty), " array"),
                            r.bits()
                        ))),
                    }
                }
            )*
        }
    };
}

scalar_array_accessors! {
    i8_array, i8_array_mut, I8, i8;
    i16_array, i16_array_mut, I16, i16;
    i32_array, i32_array_mut, I32, i32;
    i64_array, i64_array_mut, I64, i64;
    f32_array, f32_array_mut, F32, f32;
    f64_array, f64_array_mut, F64, f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_string_survives_collection() {
        let mut gc = Gc::default();
        let s = gc.alloc_str(gc_flags::NONE);
        *gc.string_mut(s).unwrap() = "kept".into();
        gc.collect();
        assert_eq!(gc.string(s).unwrap(), "kept");
        gc.remove_root(s).unwrap();
        gc.collect();
        assert_eq!(gc.object_count(), 0);
        assert_eq!(gc.allocated_bytes(), 0);
    }

    #[test]
    fn test_temporary_survives_collection() {
        let mut gc = Gc::default();
        let s = gc.alloc_str(gc_flags::TEMPORARY);
        assert!(gc.is_temporary(s));
        assert!(!gc.is_root(s));
        gc.collect();
        assert_eq!(gc.object_count(), 1);
        gc.remove_temporary(Some(s)).unwrap();
        gc.collect();
        assert_eq!(gc.object_count(), 0);
    }

    #[test]
    fn test_null_temporary_is_noop() {
        let mut gc = Gc::default();
        gc.add_temporary(None);
        gc.remove_temporary(None).unwrap();
    }

    #[test]
    fn test_unknown_temporary_fails() {
        let mut gc = Gc::default();
        let s = gc.alloc_str(gc_flags::NONE);
        assert!(gc.remove_temporary(Some(s)).is_err());
    }

    #[test]
    fn test_root_refcount() {
        let mut gc = Gc::default();
        let s = gc.alloc_str(gc_flags::NONE);
        gc.add_root(s);
        gc.remove_root(s).unwrap();
        assert!(gc.is_root(s));
        gc.remove_root(s).unwrap();
        assert!(!gc.is_root(s));
        assert!(gc.remove_root(s).is_err());
    }

    #[test]
    fn test_raw_object_layout_walk() {
        let mut gc = Gc::default();
        let layout = gc
            .register_type_layout("test.pair".into(), vec![0, 8])
            .unwrap();

        let a = gc.alloc_str(gc_flags::NONE);
        gc.remove_root(a).unwrap();
        let b = gc.alloc_str(gc_flags::NONE);
        gc.remove_root(b).unwrap();

        let obj = gc.alloc_raw(layout, 16, 8, gc_flags::NONE).unwrap();
        let bytes = gc.raw_mut(obj).unwrap();
        bytes[0..8].copy_from_slice(&a.bits().to_le_bytes());
        bytes[8..16].copy_from_slice(&b.bits().to_le_bytes());

        gc.collect();
        assert_eq!(gc.object_count(), 3);

        // Clearing one field makes its target unreachable.
        gc.raw_mut(obj).unwrap()[8..16].copy_from_slice(&0u64.to_le_bytes());
        gc.collect();
        assert_eq!(gc.object_count(), 2);
        assert!(gc.string(a).is_ok());
        assert!(gc.string(b).is_err());
    }

    #[test]
    fn test_ref_array_marks_elements() {
        let mut gc = Gc::default();
        let layout = gc.register_type_layout("test.node".into(), vec![]).unwrap();
        let elem = gc.alloc_raw(layout, 8, 8, gc_flags::NONE).unwrap();
        gc.remove_root(elem).unwrap();

        let array = gc.alloc_ref_array(layout, 2, gc_flags::NONE).unwrap();
        gc.handles_mut(array).unwrap()[1] = elem.bits();

        gc.collect();
        assert_eq!(gc.object_count(), 2);
    }

    #[test]
    fn test_str_array_elements_reachable_through_array() {
        let mut gc = Gc::default();
        let array = gc.alloc_array(ArrayKind::Str, 3, gc_flags::NONE).unwrap();
        assert_eq!(gc.object_count(), 4);
        gc.collect();
        assert_eq!(gc.object_count(), 4);
        gc.remove_root(array).unwrap();
        gc.collect();
        assert_eq!(gc.object_count(), 0);
    }

    #[test]
    fn test_ref_array_without_layout_rejected() {
        let mut gc = Gc::default();
        assert!(gc.alloc_array(ArrayKind::Ref, 1, gc_flags::NONE).is_err());
    }

    #[test]
    fn test_raw_with_unknown_layout_rejected() {
        let mut gc = Gc::default();
        assert!(gc.alloc_raw(99, 8, 8, gc_flags::NONE).is_err());
    }

    #[test]
    fn test_persistent_keeps_object_alive() {
        let mut gc = Gc::default();
        let layout = gc.register_type_layout("test.s".into(), vec![]).unwrap();
        let obj = gc.alloc_raw(layout, 8, 8, gc_flags::NONE).unwrap();
        gc.remove_root(obj).unwrap();
        gc.add_persistent(obj, layout).unwrap();
        gc.collect();
        assert_eq!(gc.object_count(), 1);
        gc.remove_persistent(obj).unwrap();
        gc.collect();
        assert_eq!(gc.object_count(), 0);
    }

    #[test]
    fn test_layout_registry_laws() {
        let mut gc = Gc::default();
        let id = gc
            .register_type_layout("m.point".into(), vec![8, 16])
            .unwrap();
        assert_eq!(gc.layout_id("m.point").unwrap(), id);
        assert_eq!(gc.check_type_layout("m.point", &[8, 16]).unwrap(), id);
        assert!(gc.check_type_layout("m.point", &[8]).is_err());
        assert!(gc.check_type_layout("m.other", &[]).is_err());
        assert!(gc
            .register_type_layout("m.point".into(), vec![8, 16])
            .is_err());
        assert_eq!(gc.layout_name(id).unwrap(), "m.point");
    }

    #[test]
    fn test_threshold_triggers_collection() {
        let mut gc = Gc::new(64, 64, 2.0);
        // Unrooted garbage: everything allocated after the first object is
        // unreachable once the threshold-triggered cycle runs.
        let keep = gc.alloc_array(ArrayKind::I64, 4, gc_flags::NONE).unwrap();
        for _ in 0..8 {
            let r = gc.alloc_array(ArrayKind::I64, 4, gc_flags::NONE).unwrap();
            gc.remove_root(r).unwrap();
        }
        assert!(gc.object_count() < 9);
        assert!(gc.i64_array(keep).is_ok());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut gc = Gc::default();
        gc.alloc_str(gc_flags::NONE);
        gc.alloc_str(gc_flags::TEMPORARY);
        gc.reset();
        assert_eq!(gc.object_count(), 0);
        assert_eq!(gc.root_count(), 0);
        assert_eq!(gc.allocated_bytes(), 0);
    }
}
