use crate::{*, error::*};
use bitflags::*;

// Record shapes of the Kotlin/Native runtime, 64-bit little-endian targets.
// These must match the runtime's RTTI generator for the revision below; a mismatch decodes garbage silently.
// Inspector::with_abi_marker checks ABI_REVISION against the marker in the target; Inspector::new trusts the caller.

pub const ABI_REVISION: i32 = 5;

pub const POINTER_SIZE: usize = 8;

// ObjHeader.typeInfoOrMeta_ low bits are used by the GC and must be cleared before following the pointer.
pub const OBJECT_TAG_MASK: usize = 0x3;

pub mod obj_header {
    pub const TYPE_INFO_OR_META: usize = 0;
    pub const SIZE: usize = 8;
}

// Header of primitive and reference arrays (and strings). Element data starts at SIZE, not right after `count`.
pub mod array_header {
    pub const TYPE_INFO_OR_META: usize = 0;
    pub const COUNT: usize = 8; // u32
    pub const SIZE: usize = 16;
}

// Meta object, reachable from a header whose typeInfoOrMeta_ doesn't point at a self-referencing TypeInfo.
pub mod meta_header {
    pub const TYPE_INFO: usize = 0;
    pub const FLAGS: usize = 8; // u32
    pub const SIZE: usize = 16;
}

pub mod type_info {
    pub const SELF: usize = 0;
    pub const EXTENDED_INFO: usize = 8;
    pub const UNUSED: usize = 16; // u32
    pub const INSTANCE_SIZE: usize = 20; // i32
    pub const SUPER_TYPE: usize = 24;
    pub const OBJ_OFFSETS: usize = 32;
    pub const OBJ_OFFSETS_COUNT: usize = 40; // i32
    pub const IMPLEMENTED_INTERFACES: usize = 48;
    pub const IMPLEMENTED_INTERFACES_COUNT: usize = 56; // i32
    pub const INTERFACE_TABLE_SIZE: usize = 60; // i32
    pub const INTERFACE_TABLE: usize = 64;
    pub const PACKAGE_NAME: usize = 72; // ObjHeader* of a kotlin.String
    pub const RELATIVE_NAME: usize = 80;
    pub const FLAGS: usize = 88; // i32
    pub const CLASS_ID: usize = 92; // i32
    pub const WRITABLE_INFO: usize = 96;
    pub const ASSOCIATED_OBJECTS: usize = 104;
    pub const PROCESS_OBJECT_IN_MARK: usize = 112;
    pub const INSTANCE_ALIGNMENT: usize = 120; // u32
    // vtable follows.
    pub const SIZE: usize = 128;
    pub const ALIGNMENT: usize = 8;
}

pub mod extended_type_info {
    // Number of fields, or negated RuntimeKind of the element for array types.
    pub const FIELDS_COUNT: usize = 0; // i32
    pub const FIELD_OFFSETS: usize = 8; // *const i32
    pub const FIELD_TYPES: usize = 16; // *const u8
    pub const FIELD_NAMES: usize = 24; // *const *const c_char
    pub const DEBUG_OPERATIONS_COUNT: usize = 32; // i32
    pub const DEBUG_OPERATIONS: usize = 40; // *const *const fn
    pub const SIZE: usize = 48;
}

pub mod interface_table_record {
    pub const ID: usize = 0; // i32
    pub const VTABLE_SIZE: usize = 4; // u32
    pub const VTABLE: usize = 8;
    pub const SIZE: usize = 16;
}

pub mod associated_object_record {
    pub const KEY: usize = 0; // *const TypeInfo; null terminates the table
    pub const FACTORY: usize = 8; // function pointer
    pub const SIZE: usize = 16;
}

pub const INVALID_INTERFACE_ID: i32 = 0;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Invalid = 0,
    Object = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    Float32 = 6,
    Float64 = 7,
    NativePtr = 8,
    Boolean = 9,
    Vector128 = 10,
}

// Indexed by RuntimeKind. -1 means "not a concrete kind".
pub static RUNTIME_KIND_SIZE: [i32; 11] = [-1, POINTER_SIZE as i32, 1, 2, 4, 8, 4, 8, POINTER_SIZE as i32, 1, 16];
pub static RUNTIME_KIND_ALIGNMENT: [i32; 11] = [-1, POINTER_SIZE as i32, 1, 2, 4, 8, 4, 8, POINTER_SIZE as i32, 1, 16];

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 11] = [RuntimeKind::Invalid, RuntimeKind::Object, RuntimeKind::Int8, RuntimeKind::Int16, RuntimeKind::Int32, RuntimeKind::Int64, RuntimeKind::Float32, RuntimeKind::Float64, RuntimeKind::NativePtr, RuntimeKind::Boolean, RuntimeKind::Vector128];

    pub fn from_code(code: i64) -> Result<RuntimeKind> {
        if code < 0 || code as usize >= Self::ALL.len() {
            return err!(UnrepresentableKind, "runtime kind code {} out of range", code);
        }
        Ok(Self::ALL[code as usize])
    }

    pub fn code(self) -> u8 { self as u8 }

    pub fn size(self) -> i32 { RUNTIME_KIND_SIZE[self as usize] }
    pub fn alignment(self) -> i32 { RUNTIME_KIND_ALIGNMENT[self as usize] }

    // Size for concrete kinds; error for Invalid.
    pub fn byte_size(self) -> Result<usize> {
        match self.size() {
            s if s > 0 => Ok(s as usize),
            _ => err!(UnrepresentableKind, "{} has no size", self.name()),
        }
    }

    pub fn is_reference(self) -> bool { self == RuntimeKind::Object }

    pub fn name(self) -> &'static str {
        match self {
            RuntimeKind::Invalid => "invalid",
            RuntimeKind::Object => "object",
            RuntimeKind::Int8 => "int8",
            RuntimeKind::Int16 => "int16",
            RuntimeKind::Int32 => "int32",
            RuntimeKind::Int64 => "int64",
            RuntimeKind::Float32 => "float32",
            RuntimeKind::Float64 => "float64",
            RuntimeKind::NativePtr => "native_ptr",
            RuntimeKind::Boolean => "boolean",
            RuntimeKind::Vector128 => "vector128",
        }
    }

    // Best guess at the element kind of a primitive array when the extended descriptor is missing.
    pub fn guess_primitive_by_size(size: usize) -> RuntimeKind {
        match size {
            1 => RuntimeKind::Int8,
            2 => RuntimeKind::Int16,
            4 => RuntimeKind::Int32,
            8 => RuntimeKind::Int64,
            16 => RuntimeKind::Vector128,
            _ => RuntimeKind::Invalid,
        }
    }
}

// Free-function form of the size/alignment tables, -1 for Invalid.
pub fn size(kind: RuntimeKind) -> i32 { kind.size() }
pub fn alignment(kind: RuntimeKind) -> i32 { kind.alignment() }

bitflags! { pub struct TypeFlags: u32 {
    const IMMUTABLE = 1 << 0;
    const ACYCLIC = 1 << 1;
    const INTERFACE = 1 << 2;
    const OBJC_DYNAMIC = 1 << 3;
    const LEAK_DETECTOR_CANDIDATE = 1 << 4;
    const SUSPEND_FUNCTION = 1 << 5;
    const HAS_FINALIZER = 1 << 6;
    const HAS_FREEZE_HOOK = 1 << 7;
    // Package name is available, e.g. for KClass.qualifiedName.
    const REFLECTION_SHOW_PKG_NAME = 1 << 8;
    // Relative name is available, e.g. for KClass.simpleName.
    const REFLECTION_SHOW_REL_NAME = 1 << 9;
}}

impl TypeFlags {
    // Prints known flags in form readable to the user.
    pub fn readable(&self) -> String {
        let names = [
            (TypeFlags::IMMUTABLE, "immutable"), (TypeFlags::ACYCLIC, "acyclic"), (TypeFlags::INTERFACE, "interface"),
            (TypeFlags::OBJC_DYNAMIC, "objc_dynamic"), (TypeFlags::LEAK_DETECTOR_CANDIDATE, "leak_detector_candidate"),
            (TypeFlags::SUSPEND_FUNCTION, "suspend_function"), (TypeFlags::HAS_FINALIZER, "has_finalizer"),
            (TypeFlags::HAS_FREEZE_HOOK, "has_freeze_hook"), (TypeFlags::REFLECTION_SHOW_PKG_NAME, "show_pkg_name"),
            (TypeFlags::REFLECTION_SHOW_REL_NAME, "show_rel_name")];
        let mut s = String::new();
        for (f, n) in names {
            if self.contains(f) {
                s.push_str(n);
                s.push_str(" | ");
            }
        }
        if !s.is_empty() {
            s.replace_range(s.len()-3.., "");
        }
        s
    }
}

// Per-instance flags stored in the meta object. Informational only.
bitflags! { pub struct MetaFlags: u32 {
    const NEVER_FROZEN = 1 << 0;
}}
