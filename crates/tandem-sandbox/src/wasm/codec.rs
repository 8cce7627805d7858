//! Value codec between native Rust values and the guest calling convention.
//!
//! The engine only exchanges 64-bit stack slots and raw bytes in linear
//! memory. Every value kind has a fixed slot width known at registration
//! time:
//!
//! | Kind            | Param slots | Result slots | Notes                          |
//! |-----------------|-------------|--------------|--------------------------------|
//! | `i32` / `f32`   | 1           | 1            | 32-bit payload, zero-extended  |
//! | `i64` / `f64`   | 1           | 1            |                                |
//! | `Ptr<T>`        | 1           | 0            | result writes through address  |
//! | `Bytes`         | 2           | -            | (address, length), param only  |
//!
//! Memory values are little-endian, matching the wasm memory model.

use std::ops::Range;

use wasmtime::{Val, ValType};

use crate::error::{Result, SandboxError};

/// One operand-stack word.
pub type Slot = u64;

/// Scalar kinds that fit in a single slot and in linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    /// Signed 32-bit integer
    I32,
    /// Signed 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl ScalarKind {
    /// Size in linear memory.
    pub const fn size(self) -> usize {
        match self {
            ScalarKind::I32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::F64 => 8,
        }
    }

    /// Engine value type.
    pub fn val_type(self) -> ValType {
        match self {
            ScalarKind::I32 => ValType::I32,
            ScalarKind::I64 => ValType::I64,
            ScalarKind::F32 => ValType::F32,
            ScalarKind::F64 => ValType::F64,
        }
    }
}

/// Kind of one parameter or result in a host function signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Value passed directly in a slot
    Scalar(ScalarKind),
    /// Guest address of a value of the given kind
    Pointer(ScalarKind),
    /// Guest (address, length) byte range
    Bytes,
}

impl ValueKind {
    /// Slots this kind occupies as a parameter.
    pub const fn param_slots(self) -> usize {
        match self {
            ValueKind::Scalar(_) | ValueKind::Pointer(_) => 1,
            ValueKind::Bytes => 2,
        }
    }

    /// Slots this kind occupies in the return area.
    pub const fn result_slots(self) -> usize {
        match self {
            ValueKind::Scalar(_) => 1,
            ValueKind::Pointer(_) | ValueKind::Bytes => 0,
        }
    }

    /// Engine parameter types for this kind.
    pub fn param_types(self) -> Vec<ValType> {
        match self {
            ValueKind::Scalar(kind) => vec![kind.val_type()],
            ValueKind::Pointer(_) => vec![ValType::I32],
            ValueKind::Bytes => vec![ValType::I32, ValType::I32],
        }
    }

    /// Engine result types for this kind.
    pub fn result_types(self) -> Vec<ValType> {
        match self {
            ValueKind::Scalar(kind) => vec![kind.val_type()],
            ValueKind::Pointer(_) | ValueKind::Bytes => Vec::new(),
        }
    }
}

/// Bounds-checked view of a guest's linear memory for one host call.
pub struct GuestMemory<'a> {
    bytes: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    /// Wrap the memory bytes handed out by the engine.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// A memory of size zero, for guests that export none.
    pub fn empty() -> GuestMemory<'static> {
        GuestMemory { bytes: &mut [] }
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn range(&self, addr: u32, len: usize) -> Result<Range<usize>> {
        let start = addr as usize;
        start
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .map(|end| start..end)
            .ok_or(SandboxError::OutOfBounds {
                addr: addr as u64,
                len,
                size: self.bytes.len(),
            })
    }

    /// Borrow `len` bytes at `addr`.
    pub fn read(&self, addr: u32, len: usize) -> Result<&[u8]> {
        let range = self.range(addr, len)?;
        Ok(&self.bytes[range])
    }

    /// Copy `data` to `addr`.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let range = self.range(addr, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}

/// A native type that travels as one slot and can live in linear memory.
pub trait Scalar: Copy + Send + Sync + 'static {
    /// Kind tag
    const KIND: ScalarKind;

    /// Bit-reinterpret into a slot.
    fn to_slot(self) -> Slot;

    /// Bit-reinterpret out of a slot; high bits beyond the payload are ignored.
    fn from_slot(slot: Slot) -> Self;

    /// Decode from exactly `KIND.size()` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encode into exactly `KIND.size()` bytes, little-endian.
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_scalar {
    ($ty:ty, $kind:ident, |$v:ident| $to:expr, |$s:ident| $from:expr) => {
        impl Scalar for $ty {
            const KIND: ScalarKind = ScalarKind::$kind;

            fn to_slot(self) -> Slot {
                let $v = self;
                $to
            }

            fn from_slot(slot: Slot) -> Self {
                let $s = slot;
                $from
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }

        impl Param for $ty {
            const KIND: ValueKind = ValueKind::Scalar(ScalarKind::$kind);

            fn decode(slots: &[Slot], _memory: &GuestMemory<'_>) -> Result<Self> {
                first_slot(slots).map(<$ty as Scalar>::from_slot)
            }
        }

        impl ResultValue for $ty {
            const KIND: ValueKind = ValueKind::Scalar(ScalarKind::$kind);

            fn encode(self, slots: &mut [Slot], _memory: &mut GuestMemory<'_>) -> Result<()> {
                let slot = slots.first_mut().ok_or(SandboxError::SlotCount {
                    expected: 1,
                    actual: 0,
                })?;
                *slot = Scalar::to_slot(self);
                Ok(())
            }
        }

        impl Results for $ty {
            fn kinds() -> Vec<ValueKind> {
                vec![<$ty as ResultValue>::KIND]
            }

            fn encode(self, slots: &mut [Slot], memory: &mut GuestMemory<'_>) -> Result<()> {
                ResultValue::encode(self, slots, memory)
            }
        }
    };
}

impl_scalar!(i32, I32, |v| v as u32 as Slot, |s| s as u32 as i32);
impl_scalar!(i64, I64, |v| v as Slot, |s| s as i64);
impl_scalar!(f32, F32, |v| v.to_bits() as Slot, |s| f32::from_bits(s as u32));
impl_scalar!(f64, F64, |v| v.to_bits(), |s| f64::from_bits(s));

/// Encode a scalar for a direct export call.
pub fn encode<T: Scalar>(value: T) -> Slot {
    value.to_slot()
}

/// Decode a scalar returned by a direct export call.
pub fn decode<T: Scalar>(slot: Slot) -> T {
    T::from_slot(slot)
}

fn first_slot(slots: &[Slot]) -> Result<Slot> {
    slots.first().copied().ok_or(SandboxError::SlotCount {
        expected: 1,
        actual: 0,
    })
}

/// A host function parameter.
pub trait Param: Sized + Send + 'static {
    /// Kind tag, fixes the slot width
    const KIND: ValueKind;

    /// Decode from exactly `KIND.param_slots()` slots.
    fn decode(slots: &[Slot], memory: &GuestMemory<'_>) -> Result<Self>;
}

/// A single host function result.
pub trait ResultValue: Sized + Send + 'static {
    /// Kind tag, fixes the slot width
    const KIND: ValueKind;

    /// Encode into exactly `KIND.result_slots()` slots (or into memory).
    fn encode(self, slots: &mut [Slot], memory: &mut GuestMemory<'_>) -> Result<()>;
}

/// The full result list of a host function: `()`, one value, or a tuple.
pub trait Results: Sized + Send + 'static {
    /// Kinds in order.
    fn kinds() -> Vec<ValueKind>;

    /// Encode every result into the leading slots of the return area.
    fn encode(self, slots: &mut [Slot], memory: &mut GuestMemory<'_>) -> Result<()>;
}

/// A guest address paired with the value stored there.
///
/// As a parameter the pointee is read eagerly (and bounds-checked); as a
/// result the value is written back to the same address and no slot is
/// produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ptr<T> {
    addr: u32,
    value: T,
}

impl<T: Scalar> Ptr<T> {
    /// Pair an address with a value.
    pub fn new(addr: u32, value: T) -> Self {
        Self { addr, value }
    }

    /// Read the value at `addr`.
    pub fn load(addr: u32, memory: &GuestMemory<'_>) -> Result<Self> {
        let bytes = memory.read(addr, T::KIND.size())?;
        Ok(Self {
            addr,
            value: T::read_le(bytes),
        })
    }

    /// Write the value to its address.
    pub fn store(&self, memory: &mut GuestMemory<'_>) -> Result<()> {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..T::KIND.size()];
        self.value.write_le(buf);
        memory.write(self.addr, buf)
    }

    /// Guest address.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Value at the address.
    pub fn get(&self) -> T {
        self.value
    }

    /// Same address, new value.
    pub fn with(self, value: T) -> Self {
        Self { value, ..self }
    }
}

impl<T: Scalar> Param for Ptr<T> {
    const KIND: ValueKind = ValueKind::Pointer(T::KIND);

    fn decode(slots: &[Slot], memory: &GuestMemory<'_>) -> Result<Self> {
        let addr = first_slot(slots)? as u32;
        Ptr::load(addr, memory)
    }
}

impl<T: Scalar> ResultValue for Ptr<T> {
    const KIND: ValueKind = ValueKind::Pointer(T::KIND);

    fn encode(self, _slots: &mut [Slot], memory: &mut GuestMemory<'_>) -> Result<()> {
        self.store(memory)
    }
}

impl<T: Scalar> Results for Ptr<T> {
    fn kinds() -> Vec<ValueKind> {
        vec![<Self as ResultValue>::KIND]
    }

    fn encode(self, slots: &mut [Slot], memory: &mut GuestMemory<'_>) -> Result<()> {
        ResultValue::encode(self, slots, memory)
    }
}

/// A byte range copied out of guest memory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    /// Lossy UTF-8 view.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl Param for Bytes {
    const KIND: ValueKind = ValueKind::Bytes;

    fn decode(slots: &[Slot], memory: &GuestMemory<'_>) -> Result<Self> {
        match slots {
            [addr, len, ..] => {
                let bytes = memory.read(*addr as u32, *len as u32 as usize)?;
                Ok(Bytes(bytes.to_vec()))
            }
            _ => Err(SandboxError::SlotCount {
                expected: 2,
                actual: slots.len(),
            }),
        }
    }
}

impl Results for () {
    fn kinds() -> Vec<ValueKind> {
        Vec::new()
    }

    fn encode(self, _slots: &mut [Slot], _memory: &mut GuestMemory<'_>) -> Result<()> {
        Ok(())
    }
}

fn encode_next<R: ResultValue>(
    value: R,
    slots: &mut [Slot],
    offset: &mut usize,
    memory: &mut GuestMemory<'_>,
) -> Result<()> {
    let width = R::KIND.result_slots();
    let end = *offset + width;
    let actual = slots.len();
    let window = slots
        .get_mut(*offset..end)
        .ok_or(SandboxError::SlotCount { expected: end, actual })?;
    value.encode(window, memory)?;
    *offset = end;
    Ok(())
}

macro_rules! impl_results_tuple {
    ($($r:ident),+) => {
        impl<$($r: ResultValue),+> Results for ($($r,)+) {
            fn kinds() -> Vec<ValueKind> {
                vec![$($r::KIND),+]
            }

            #[allow(non_snake_case)]
            fn encode(self, slots: &mut [Slot], memory: &mut GuestMemory<'_>) -> Result<()> {
                let ($($r,)+) = self;
                let mut offset = 0;
                $(encode_next($r, slots, &mut offset, memory)?;)+
                Ok(())
            }
        }
    };
}

impl_results_tuple!(R1, R2);
impl_results_tuple!(R1, R2, R3);

/// Convert an engine value into a slot.
pub fn val_to_slot(val: &Val) -> Result<Slot> {
    match val {
        Val::I32(v) => Ok(*v as u32 as Slot),
        Val::I64(v) => Ok(*v as Slot),
        Val::F32(bits) => Ok(*bits as Slot),
        Val::F64(bits) => Ok(*bits),
        other => Err(SandboxError::UnsupportedValue(format!("{:?}", other))),
    }
}

/// Convert a slot into an engine value of the given type.
pub fn slot_to_val(ty: &ValType, slot: Slot) -> Result<Val> {
    match ty {
        ValType::I32 => Ok(Val::I32(slot as u32 as i32)),
        ValType::I64 => Ok(Val::I64(slot as i64)),
        ValType::F32 => Ok(Val::F32(slot as u32)),
        ValType::F64 => Ok(Val::F64(slot)),
        other => Err(SandboxError::UnsupportedValue(format!("{:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i32_slot_wraps_through_u32() {
        assert_eq!(encode(-1i32), 0xFFFF_FFFF);
        assert_eq!(decode::<i32>(0xFFFF_FFFF), -1);
        // High bits of the slot are not part of an i32 payload
        assert_eq!(decode::<i32>(0xDEAD_0000_0000_0007), 7);
    }

    #[test]
    fn test_float_slots_are_bit_patterns() {
        assert_eq!(encode(1.5f32), 1.5f32.to_bits() as u64);
        assert_eq!(decode::<f64>(encode(-0.25f64)), -0.25);
        assert!(decode::<f32>(encode(f32::NAN)).is_nan());
    }

    #[test]
    fn test_pointer_round_trip_through_memory() {
        let mut bytes = vec![0u8; 64];
        let mut memory = GuestMemory::new(&mut bytes);

        Ptr::new(8, -42i32).store(&mut memory).unwrap();
        Ptr::new(16, i64::MIN + 3).store(&mut memory).unwrap();

        assert_eq!(Ptr::<i32>::load(8, &memory).unwrap().get(), -42);
        assert_eq!(Ptr::<i64>::load(16, &memory).unwrap().get(), i64::MIN + 3);
        assert_eq!(memory.read(8, 4).unwrap(), &(-42i32).to_le_bytes());

        let moved = Ptr::<i32>::load(8, &memory).unwrap().with(7);
        assert_eq!(moved.addr(), 8);
        assert_eq!(moved.get(), 7);
    }

    #[test]
    fn test_pointer_out_of_bounds() {
        let mut bytes = vec![0u8; 16];
        let memory = GuestMemory::new(&mut bytes);

        // Last in-bounds i32
        assert!(Ptr::<i32>::load(12, &memory).is_ok());
        // Straddles the end
        let err = Ptr::<i32>::load(13, &memory).unwrap_err();
        assert!(matches!(err, SandboxError::OutOfBounds { addr: 13, len: 4, size: 16 }));
        // Address arithmetic must not wrap
        assert!(Ptr::<i64>::load(u32::MAX, &memory).is_err());
    }

    #[test]
    fn test_empty_memory_rejects_every_access() {
        let memory = GuestMemory::empty();
        assert_eq!(memory.size(), 0);
        assert!(memory.read(0, 1).is_err());
        assert!(memory.read(0, 0).is_ok());
    }

    #[test]
    fn test_kind_widths() {
        assert_eq!(<i32 as Param>::KIND.param_slots(), 1);
        assert_eq!(<Ptr<f64> as Param>::KIND, ValueKind::Pointer(ScalarKind::F64));
        assert_eq!(<Ptr<f64> as ResultValue>::KIND.result_slots(), 0);
        assert_eq!(Bytes::KIND.param_slots(), 2);
        assert_eq!(ValueKind::Bytes.param_types().len(), 2);
        assert!(ValueKind::Pointer(ScalarKind::I32).result_types().is_empty());
    }

    #[test]
    fn test_tuple_results_skip_pointer_slots() {
        let mut bytes = vec![0u8; 32];
        let mut memory = GuestMemory::new(&mut bytes);
        let mut slots = [0u64; 2];

        (7i32, Ptr::new(4, 9i32), 2.0f64)
            .encode(&mut slots, &mut memory)
            .unwrap();

        assert_eq!(decode::<i32>(slots[0]), 7);
        assert_eq!(decode::<f64>(slots[1]), 2.0);
        assert_eq!(Ptr::<i32>::load(4, &memory).unwrap().get(), 9);
    }

    #[test]
    fn test_val_conversion() {
        let slot = val_to_slot(&Val::I32(-5)).unwrap();
        assert_eq!(slot_to_val(&ValType::I32, slot).unwrap().i32(), Some(-5));
        let slot = val_to_slot(&Val::F64(3.5f64.to_bits())).unwrap();
        assert_eq!(slot_to_val(&ValType::F64, slot).unwrap().f64(), Some(3.5));
    }
}
